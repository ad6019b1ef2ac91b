//! Reconciler - one pass from a declaration to a result
//!
//! A pass picks exactly one path:
//! - destroyed phases drive every matched instance to termination
//! - `exact_count` sizes the population, then converges what remains
//! - matched instances (without a launch `count`) are converged in place
//! - otherwise new instances are launched
//!
//! Convergence applies the attribute diff to every member and then drives
//! the batch to the declared phase. `present` never transitions an
//! existing instance.

use crate::builder::CreationRequest;
use crate::context::ReconcileContext;
use crate::declaration::{InstanceAttributes, Population, ResourceDeclaration};
use crate::diff::{ChangeSet, DiffScope, diff};
use crate::error::Result;
use crate::lifecycle::{action_for, ensure_state};
use crate::matcher::{find, refresh, selector_for};
use crate::modify::apply;
use crate::population::{enforce_count, provision};
use crate::provider::Provider;
use crate::retry::LaunchReport;
use crate::types::{LifecycleTarget, LiveInstance};
use serde::Serialize;

/// Everything a pass did, or in dry-run would do
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationResult {
    pub changed: bool,
    pub message: String,
    /// The population after the pass (every matched instance for destroyed phases)
    pub instance_ids: Vec<String>,
    pub created_ids: Vec<String>,
    /// Instances modified or transitioned, excluding terminations
    pub changed_ids: Vec<String>,
    pub terminated_ids: Vec<String>,
    pub unchanged_ids: Vec<String>,
    pub instances: Vec<LiveInstance>,
    pub changes: Vec<ChangeSet>,
    /// Launch request, when the pass launched or would launch
    pub creation: Option<CreationRequest>,
    /// Subtype that actually launched
    pub launched_type: Option<String>,
    /// Timeouts and advisories
    pub warnings: Vec<String>,
}

impl ReconciliationResult {
    fn nothing_matched() -> Self {
        Self {
            message: "No matching instances found".to_string(),
            ..Default::default()
        }
    }
}

/// Run one reconciliation pass
///
/// Validation and query failures abort before any mutation. Partial batch
/// failures abort with both id lists; changes already applied are not
/// rolled back.
pub fn reconcile<P: Provider + ?Sized>(
    provider: &P,
    declaration: &ResourceDeclaration,
    ctx: &ReconcileContext<'_>,
) -> Result<ReconciliationResult> {
    declaration.validate()?;

    let selector = selector_for(provider, declaration)?;
    let existing = find(provider, &selector, declaration.state)?;
    log::info!(
        "Matched {} instance(s) for target {}{}",
        existing.len(),
        declaration.state,
        if ctx.dry_run { " (dry run)" } else { "" }
    );

    if declaration.state.is_destroyed() {
        return destroy(provider, ctx, declaration, existing);
    }

    match &declaration.population {
        Population::ExactCount(exact) => {
            reconcile_count(provider, ctx, declaration, &existing, *exact)
        }
        Population::Identifiers(_) if existing.is_empty() => {
            Ok(ReconciliationResult::nothing_matched())
        }
        Population::Identifiers(_) | Population::Unconstrained { count: None }
            if !existing.is_empty() =>
        {
            converge_existing(provider, ctx, declaration, &existing)
        }
        _ => launch_new(provider, ctx, declaration, &existing),
    }
}

fn destroy<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    declaration: &ResourceDeclaration,
    existing: Vec<LiveInstance>,
) -> Result<ReconciliationResult> {
    if existing.is_empty() {
        return Ok(ReconciliationResult::nothing_matched());
    }

    let report = ensure_state(
        provider,
        ctx,
        &declaration.wait,
        &existing,
        declaration.state,
    )?;
    report.check(action_for(declaration.state))?;

    let changed = report.is_changed();
    let message = match (changed, ctx.dry_run) {
        (false, _) => format!("{} instance(s) already terminated", existing.len()),
        (true, true) => "Would have terminated instances".to_string(),
        (true, false) => "Instances terminated".to_string(),
    };

    Ok(ReconciliationResult {
        changed,
        message,
        instance_ids: existing.iter().map(|i| i.id.clone()).collect(),
        terminated_ids: report.changed,
        unchanged_ids: report.unchanged,
        instances: report.instances,
        warnings: report.warnings,
        ..Default::default()
    })
}

fn reconcile_count<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    declaration: &ResourceDeclaration,
    existing: &[LiveInstance],
    exact: u32,
) -> Result<ReconciliationResult> {
    let outcome = enforce_count(provider, ctx, declaration, existing, exact)?;

    let mut population = outcome.kept.clone();
    let mut fresh = None;
    let mut result = ReconciliationResult {
        terminated_ids: outcome.terminated.clone(),
        warnings: outcome.warnings.clone(),
        ..Default::default()
    };

    if let Some(provisioned) = outcome.provisioned {
        result.created_ids = provisioned.ids();
        result.launched_type = provisioned.launched_type().map(str::to_string);
        result.changes = provisioned.changes.clone();
        result.creation = Some(provisioned.request);
        population.extend(provisioned.instances);
        fresh = provisioned.launch;
    }

    if !ctx.dry_run {
        let ids: Vec<String> = population.iter().map(|i| i.id.clone()).collect();
        population = refresh(provider, &ids)?;
    }

    let converged = converge(provider, ctx, declaration, &population, fresh.as_ref())?;
    result.merge_convergence(converged);

    let grew = result.creation.is_some();
    let shrank = !result.terminated_ids.is_empty();
    result.changed |= grew || shrank;
    result.message = match (grew, shrank, ctx.dry_run) {
        (true, _, true) => "Would have launched instances".to_string(),
        (true, _, false) => format!("Launched {} instance(s)", result.created_ids.len()),
        (_, true, true) => format!(
            "Would have terminated {}",
            result.terminated_ids.join(", ")
        ),
        (_, true, false) => "Successfully terminated instances".to_string(),
        _ if result.changed => "Instances updated".to_string(),
        _ => format!("{exact} instance(s) already {}, nothing to do", declaration.state),
    };
    Ok(result)
}

fn converge_existing<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    declaration: &ResourceDeclaration,
    existing: &[LiveInstance],
) -> Result<ReconciliationResult> {
    let mut result = ReconciliationResult::default();
    let converged = converge(provider, ctx, declaration, existing, None)?;
    result.merge_convergence(converged);
    result.message = if result.changed {
        "Instances updated".to_string()
    } else {
        format!(
            "{} instance(s) already {}, nothing to do",
            existing.len(),
            declaration.state
        )
    };
    Ok(result)
}

fn launch_new<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    declaration: &ResourceDeclaration,
    existing: &[LiveInstance],
) -> Result<ReconciliationResult> {
    let provisioned = provision(provider, ctx, declaration, existing.len())?;
    let created_ids = provisioned.ids();

    let mut instances = existing.to_vec();
    instances.extend(provisioned.instances.iter().cloned());

    Ok(ReconciliationResult {
        changed: true,
        message: if ctx.dry_run {
            "Would have launched instances".to_string()
        } else {
            format!("Launched {} instance(s)", created_ids.len())
        },
        instance_ids: instances.iter().map(|i| i.id.clone()).collect(),
        changed_ids: created_ids.clone(),
        created_ids,
        unchanged_ids: existing.iter().map(|i| i.id.clone()).collect(),
        instances,
        launched_type: provisioned.launched_type().map(str::to_string),
        changes: provisioned.changes,
        creation: Some(provisioned.request),
        warnings: provisioned.warnings,
        ..Default::default()
    })
}

/// What converging a batch did
#[derive(Debug, Default)]
struct Convergence {
    changed_ids: Vec<String>,
    unchanged_ids: Vec<String>,
    instances: Vec<LiveInstance>,
    changes: Vec<ChangeSet>,
    warnings: Vec<String>,
}

impl ReconciliationResult {
    fn merge_convergence(&mut self, converged: Convergence) {
        self.changed |= !converged.changed_ids.is_empty();
        self.instance_ids = converged.instances.iter().map(|i| i.id.clone()).collect();
        for id in &self.created_ids {
            if !self.instance_ids.contains(id) {
                self.instance_ids.push(id.clone());
            }
        }
        self.changed_ids = self.created_ids.clone();
        for id in converged.changed_ids {
            if !self.changed_ids.contains(&id) {
                self.changed_ids.push(id);
            }
        }
        self.unchanged_ids = converged
            .unchanged_ids
            .into_iter()
            .filter(|id| !self.created_ids.contains(id))
            .collect();
        self.instances = converged.instances;
        self.changes.extend(converged.changes);
        self.warnings.extend(converged.warnings);
    }
}

/// Diff, modify and transition every member of `instances`
///
/// Members launched by `fresh` are compared against the subtype that
/// actually launched rather than the declared one.
fn converge<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    declaration: &ResourceDeclaration,
    instances: &[LiveInstance],
    fresh: Option<&LaunchReport>,
) -> Result<Convergence> {
    let declared = &declaration.attributes;
    let resolved: Option<InstanceAttributes> = fresh.map(|f| f.resolved_attributes(declared));
    let mut out = Convergence::default();

    for instance in instances {
        let attributes = match (&resolved, fresh) {
            (Some(resolved), Some(fresh)) if fresh.contains(&instance.id) => resolved,
            _ => declared,
        };

        let set = diff(provider, instance, attributes, DiffScope::Full)?;
        for advisory in &set.advisories {
            log::warn!("{}: {}", instance.id, advisory);
            ctx.observer.on_advisory(&instance.id, advisory);
            out.warnings.push(format!("{}: {}", instance.id, advisory));
        }
        if set.is_empty() {
            continue;
        }

        out.warnings.extend(apply(
            provider,
            ctx,
            &declaration.wait,
            &set,
            declaration.state,
        )?);
        out.changed_ids.push(instance.id.clone());
        out.changes.push(set);
    }

    let ids: Vec<String> = instances.iter().map(|i| i.id.clone()).collect();
    out.instances = if ctx.dry_run {
        instances.to_vec()
    } else {
        refresh(provider, &ids)?
    };

    if declaration.state != LifecycleTarget::Present && !out.instances.is_empty() {
        let report = ensure_state(
            provider,
            ctx,
            &declaration.wait,
            &out.instances,
            declaration.state,
        )?;
        report.check(action_for(declaration.state))?;
        for id in report.changed {
            if !out.changed_ids.contains(&id) {
                out.changed_ids.push(id);
            }
        }
        out.warnings.extend(report.warnings);
        out.instances = report.instances;
    }

    out.unchanged_ids = ids
        .into_iter()
        .filter(|id| !out.changed_ids.contains(id))
        .collect();
    Ok(out)
}
