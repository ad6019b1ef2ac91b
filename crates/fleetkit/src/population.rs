//! Population reconciler - grows or shrinks a population to an exact count
//!
//! Growing launches the difference through the retry controller; shrinking
//! terminates the oldest members first. Convergence of the members that
//! remain is left to the caller.

use crate::builder::{CreationRequest, build};
use crate::context::ReconcileContext;
use crate::declaration::{ResourceDeclaration, WaitPolicy};
use crate::diff::{ChangeSet, DiffScope, diff};
use crate::error::Result;
use crate::lifecycle::{await_instances, ensure_state};
use crate::matcher::refresh;
use crate::modify::apply;
use crate::provider::Provider;
use crate::retry::{LaunchReport, launch};
use crate::types::{LifecycleTarget, LiveInstance, WaitCondition};

/// New members launched for a declaration
#[derive(Debug, Clone)]
pub struct Provisioned {
    /// What was (or in dry-run, would be) sent to the provider
    pub request: CreationRequest,
    /// `None` in dry-run
    pub launch: Option<LaunchReport>,
    /// Snapshots of the new members after post-launch handling
    pub instances: Vec<LiveInstance>,
    /// Post-launch changes applied to the new members
    pub changes: Vec<ChangeSet>,
    pub warnings: Vec<String>,
}

impl Provisioned {
    pub fn ids(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.id.clone()).collect()
    }

    pub fn launched_type(&self) -> Option<&str> {
        self.launch.as_ref().and_then(|l| l.launched_type.as_deref())
    }
}

/// Outcome of sizing a population
#[derive(Debug, Clone, Default)]
pub struct CountOutcome {
    /// Existing members that stay in the population
    pub kept: Vec<LiveInstance>,
    /// Members selected for termination, oldest first
    pub terminated: Vec<String>,
    pub provisioned: Option<Provisioned>,
    pub warnings: Vec<String>,
}

impl CountOutcome {
    pub fn is_changed(&self) -> bool {
        !self.terminated.is_empty() || self.provisioned.is_some()
    }
}

/// Split `existing` into the `surplus` oldest members and the rest
///
/// Members are ordered by launch time; ties are broken by id so the choice
/// is stable across passes.
pub fn select_victims(
    existing: &[LiveInstance],
    surplus: usize,
) -> (Vec<LiveInstance>, Vec<LiveInstance>) {
    let mut ordered = existing.to_vec();
    ordered.sort_by(|a, b| {
        a.launch_time
            .cmp(&b.launch_time)
            .then_with(|| a.id.cmp(&b.id))
    });
    let kept = ordered.split_off(surplus.min(ordered.len()));
    (ordered, kept)
}

/// Bring `existing` to exactly `exact_count` members
pub fn enforce_count<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    declaration: &ResourceDeclaration,
    existing: &[LiveInstance],
    exact_count: u32,
) -> Result<CountOutcome> {
    let current = existing.len();
    let target = exact_count as usize;

    if current == target {
        log::debug!("Population already has {target} member(s)");
        return Ok(CountOutcome {
            kept: existing.to_vec(),
            ..Default::default()
        });
    }

    if current < target {
        log::info!("Growing population from {current} to {target}");
        let provisioned = provision(provider, ctx, declaration, current)?;
        let warnings = provisioned.warnings.clone();
        return Ok(CountOutcome {
            kept: existing.to_vec(),
            terminated: Vec::new(),
            provisioned: Some(provisioned),
            warnings,
        });
    }

    let (victims, kept) = select_victims(existing, current - target);
    let victim_ids: Vec<String> = victims.iter().map(|i| i.id.clone()).collect();
    if ctx.dry_run {
        log::info!("Would terminate {}", victim_ids.join(", "));
    } else {
        log::info!(
            "Shrinking population from {current} to {target}: terminating {}",
            victim_ids.join(", ")
        );
    }

    // Victims are always awaited so the surviving count is settled
    let victim_wait = WaitPolicy {
        enabled: true,
        ..declaration.wait
    };
    let report = ensure_state(
        provider,
        ctx,
        &victim_wait,
        &victims,
        LifecycleTarget::Terminated,
    )?;
    report.check("terminate")?;

    Ok(CountOutcome {
        kept,
        terminated: report.changed,
        provisioned: None,
        warnings: report.warnings,
    })
}

/// Launch new members for `declaration`
///
/// New instances are awaited to exist, converged on what the launch
/// request could not set, and then brought to the declared phase. In
/// dry-run only the request is built.
pub fn provision<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    declaration: &ResourceDeclaration,
    current_count: usize,
) -> Result<Provisioned> {
    let request = build(provider, declaration, current_count)?;
    let label = request
        .instance_type
        .clone()
        .unwrap_or_else(|| "launch template".to_string());

    if ctx.dry_run {
        log::info!("Would launch {} instance(s) of {label}", request.count);
        ctx.observer.on_action("launch", &[]);
        return Ok(Provisioned {
            request,
            launch: None,
            instances: Vec::new(),
            changes: Vec::new(),
            warnings: Vec::new(),
        });
    }

    let report = launch(provider, ctx, &request)?;
    let ids = report.ids();
    ctx.observer.on_action("launch", &ids);

    let policy = &declaration.wait;
    let mut warnings = Vec::new();
    if report.fell_back {
        warnings.push(format!(
            "launched {} instead of {label}",
            report.launched_type.as_deref().unwrap_or("launch template")
        ));
    }

    let status = await_instances(provider, ctx, policy, &ids, WaitCondition::Exists, true)?;
    if let Some(err) = status.timeout_error(WaitCondition::Exists) {
        warnings.push(err.to_string());
    }

    let resolved = report.resolved_attributes(&declaration.attributes);
    let mut changes = Vec::new();
    for instance in refresh(provider, &ids)? {
        let set = diff(provider, &instance, &resolved, DiffScope::PostLaunch)?;
        if set.is_empty() {
            continue;
        }
        warnings.extend(apply(provider, ctx, policy, &set, declaration.state)?);
        changes.push(set);
    }

    let mut instances = refresh(provider, &ids)?;
    if declaration.state == LifecycleTarget::Stopped {
        let stopped = ensure_state(provider, ctx, policy, &instances, LifecycleTarget::Stopped)?;
        stopped.check("stop")?;
        warnings.extend(stopped.warnings);
        instances = stopped.instances;
    } else if policy.enabled {
        let condition = declaration.state.wait_condition();
        let status = await_instances(provider, ctx, policy, &ids, condition, false)?;
        if let Some(err) = status.timeout_error(condition) {
            warnings.push(err.to_string());
        }
        instances = refresh(provider, &ids)?;
    }

    Ok(Provisioned {
        request,
        launch: Some(report),
        instances,
        changes,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineSettings;
    use crate::declaration::{InstanceAttributes, Population};
    use crate::memory::{Call, MemoryProvider};
    use crate::types::InstanceState;
    use std::time::Duration;

    fn ctx(dry_run: bool) -> ReconcileContext<'static> {
        ReconcileContext::new(dry_run).with_settings(EngineSettings {
            poll_interval: Duration::from_secs(1),
            auth_retry_delay: Duration::from_secs(1),
        })
    }

    fn declaration(exact: u32) -> ResourceDeclaration {
        ResourceDeclaration::new(LifecycleTarget::Running)
            .with_population(Population::ExactCount(exact))
            .with_attributes(InstanceAttributes {
                name: Some("web".into()),
                image_id: Some("ami-1".into()),
                instance_type: Some("t3.micro".into()),
                ..Default::default()
            })
            .with_wait(WaitPolicy {
                enabled: true,
                timeout: Duration::from_secs(60),
            })
    }

    fn seed(cloud: &MemoryProvider, n: usize) -> Vec<LiveInstance> {
        let ids: Vec<String> = (0..n)
            .map(|_| cloud.seed_instance("web", InstanceState::Running))
            .collect();
        refresh(cloud, &ids).unwrap()
    }

    #[test]
    fn test_victims_are_oldest_first() {
        let cloud = MemoryProvider::with_default_network();
        let existing = seed(&cloud, 4);
        let mut shuffled = existing.clone();
        shuffled.reverse();

        let (victims, kept) = select_victims(&shuffled, 2);
        assert_eq!(victims[0].id, existing[0].id);
        assert_eq!(victims[1].id, existing[1].id);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_equal_count_changes_nothing() {
        let cloud = MemoryProvider::with_default_network();
        let existing = seed(&cloud, 2);
        let outcome = enforce_count(&cloud, &ctx(false), &declaration(2), &existing, 2).unwrap();
        assert!(!outcome.is_changed());
        assert_eq!(outcome.kept.len(), 2);
        assert!(
            !cloud
                .calls()
                .iter()
                .any(|c| matches!(c, Call::Terminate(_) | Call::Create { .. }))
        );
    }

    #[test]
    fn test_grow_launches_difference() {
        let cloud = MemoryProvider::with_default_network();
        let existing = seed(&cloud, 3);

        let outcome = enforce_count(&cloud, &ctx(false), &declaration(5), &existing, 5).unwrap();
        let provisioned = outcome.provisioned.unwrap();
        assert_eq!(provisioned.request.count, 2);
        assert_eq!(provisioned.instances.len(), 2);
        assert!(
            provisioned
                .instances
                .iter()
                .all(|i| i.state == InstanceState::Running)
        );
        assert_eq!(cloud.instance_ids().len(), 5);
    }

    #[test]
    fn test_shrink_terminates_oldest() {
        let cloud = MemoryProvider::with_default_network();
        let existing = seed(&cloud, 4);

        let outcome = enforce_count(&cloud, &ctx(false), &declaration(2), &existing, 2).unwrap();
        assert_eq!(outcome.terminated, vec![existing[0].id.clone(), existing[1].id.clone()]);
        assert_eq!(
            cloud.instance(&existing[0].id).unwrap().state,
            InstanceState::Terminated
        );
        assert!(outcome.kept.iter().all(|i| !outcome.terminated.contains(&i.id)));
    }

    #[test]
    fn test_shrink_waits_for_victims_without_wait_policy() {
        let cloud = MemoryProvider::with_default_network();
        let existing = seed(&cloud, 3);
        let decl = declaration(1).with_wait(WaitPolicy {
            enabled: false,
            timeout: Duration::from_secs(60),
        });

        let outcome = enforce_count(&cloud, &ctx(false), &decl, &existing, 1).unwrap();
        let victims = vec![existing[0].id.clone(), existing[1].id.clone()];
        assert_eq!(outcome.terminated, victims);
        assert!(
            victims
                .iter()
                .all(|id| cloud.instance(id).unwrap().state == InstanceState::Terminated)
        );
        assert!(
            cloud
                .calls()
                .iter()
                .any(|c| matches!(c, Call::Wait(_, WaitCondition::Terminated)))
        );
    }

    #[test]
    fn test_shrink_to_zero() {
        let cloud = MemoryProvider::with_default_network();
        let existing = seed(&cloud, 2);
        let outcome = enforce_count(&cloud, &ctx(false), &declaration(0), &existing, 0).unwrap();
        assert_eq!(outcome.terminated.len(), 2);
        assert!(outcome.kept.is_empty());
    }

    #[test]
    fn test_dry_run_reports_without_mutating() {
        let cloud = MemoryProvider::with_default_network();
        let existing = seed(&cloud, 3);

        let shrink = enforce_count(&cloud, &ctx(true), &declaration(1), &existing, 1).unwrap();
        assert_eq!(shrink.terminated.len(), 2);

        let grow = enforce_count(&cloud, &ctx(true), &declaration(6), &existing, 6).unwrap();
        let provisioned = grow.provisioned.unwrap();
        assert_eq!(provisioned.request.count, 3);
        assert!(provisioned.launch.is_none());

        assert!(!cloud.calls().iter().any(|c| matches!(
            c,
            Call::Terminate(_) | Call::Create { .. }
        )));
        assert_eq!(cloud.instance_ids().len(), 3);
    }

    #[test]
    fn test_stopped_target_stops_new_members() {
        let cloud = MemoryProvider::with_default_network();
        let mut decl = declaration(1);
        decl.state = LifecycleTarget::Stopped;

        let provisioned = provision(&cloud, &ctx(false), &decl, 0).unwrap();
        assert_eq!(provisioned.instances[0].state, InstanceState::Stopped);
    }
}
