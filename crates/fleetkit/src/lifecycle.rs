//! Lifecycle state machine - drives instances to a declared phase
//!
//! Instances in a transitional state are first awaited to the nearest
//! stable state the provider accepts the next transition from:
//!
//! | target     | pending          | stopping         | stopped / running |
//! |------------|------------------|------------------|-------------------|
//! | terminated | await running    | await stopped    | terminate         |
//! | stopped    | await running    | unchanged        | stop / unchanged  |
//! | running    | unchanged        | await stopped    | start / unchanged |

use crate::context::ReconcileContext;
use crate::declaration::WaitPolicy;
use crate::error::{Error, Result};
use crate::matcher::refresh;
use crate::provider::{Provider, WaitConfig, WaitStatus};
use crate::types::{InstanceState, LifecycleTarget, LiveInstance, WaitCondition};
use serde::{Deserialize, Serialize};

/// Outcome of driving a batch to a lifecycle phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionReport {
    /// Instances a transition was issued for
    pub changed: Vec<String>,
    /// Instances already in (or moving to) the target
    pub unchanged: Vec<String>,
    /// Instances the provider refused to transition
    pub failed: Vec<String>,
    /// Last provider failure message
    pub failure_reason: Option<String>,
    /// Snapshots after the transition
    pub instances: Vec<LiveInstance>,
    /// Waits that ran out of time
    pub warnings: Vec<String>,
}

impl TransitionReport {
    pub fn is_changed(&self) -> bool {
        !self.changed.is_empty()
    }

    /// Fail with both id lists when any instance failed to transition
    pub fn check(&self, action: &str) -> Result<()> {
        if self.failed.is_empty() {
            return Ok(());
        }
        Err(Error::PartialBatchFailure {
            action: action.to_string(),
            succeeded: self.changed.clone(),
            failed: self.failed.clone(),
            reason: self.failure_reason.clone().unwrap_or_default(),
        })
    }

    fn merge(&mut self, other: TransitionReport) {
        for id in other.changed {
            if !self.changed.contains(&id) {
                self.changed.push(id);
            }
        }
        self.unchanged.retain(|id| !self.changed.contains(id));
        for id in other.unchanged {
            if !self.changed.contains(&id) && !self.unchanged.contains(&id) {
                self.unchanged.push(id);
            }
        }
        self.failed.extend(other.failed);
        if other.failure_reason.is_some() {
            self.failure_reason = other.failure_reason;
        }
        self.instances = other.instances;
        self.warnings.extend(other.warnings);
    }
}

/// Verb used in messages and errors for a target phase
pub fn action_for(target: LifecycleTarget) -> &'static str {
    match target {
        LifecycleTarget::Stopped => "stop",
        LifecycleTarget::Terminated | LifecycleTarget::Absent => "terminate",
        LifecycleTarget::Restarted | LifecycleTarget::Rebooted => "restart",
        _ => "start",
    }
}

/// Block until `ids` meet `condition`
///
/// Skipped in dry-run, and when the policy disables waiting unless
/// `force` is set. A timeout is reported through the returned status,
/// never as an error.
pub fn await_instances<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    policy: &WaitPolicy,
    ids: &[String],
    condition: WaitCondition,
    force: bool,
) -> Result<WaitStatus> {
    if ids.is_empty() || ctx.dry_run || !(policy.enabled || force) {
        return Ok(WaitStatus::Skipped);
    }

    let config = WaitConfig {
        delay: ctx.settings.poll_interval,
        max_attempts: policy.max_attempts(ctx.settings.poll_interval),
    };

    ctx.observer.on_wait_start(ids, condition);
    let status = provider.wait(ids, condition, &config)?;
    ctx.observer.on_wait_end(condition, &status);

    if let Some(err) = status.timeout_error(condition) {
        log::warn!("{err}");
    }
    Ok(status)
}

/// Drive `instances` to `target`, handling the restart phases
///
/// Restarts stop every instance first and then start them again.
/// Per-instance provider rejections are collected in the report; call
/// [`TransitionReport::check`] to turn them into an error.
pub fn ensure_state<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    policy: &WaitPolicy,
    instances: &[LiveInstance],
    target: LifecycleTarget,
) -> Result<TransitionReport> {
    if !target.is_restart() {
        return change_state(provider, ctx, policy, instances, target);
    }

    let mut report = change_state(provider, ctx, policy, instances, LifecycleTarget::Stopped)?;
    if !report.failed.is_empty() {
        return Ok(report);
    }

    let stopped = if ctx.dry_run {
        instances.to_vec()
    } else {
        report.instances.clone()
    };
    let started = change_state(provider, ctx, policy, &stopped, target)?;
    report.merge(started);
    Ok(report)
}

/// One transition pass over a batch, in matched order
pub fn change_state<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    policy: &WaitPolicy,
    instances: &[LiveInstance],
    target: LifecycleTarget,
) -> Result<TransitionReport> {
    let desired = target.provider_state();
    let mut report = TransitionReport::default();

    for instance in instances {
        let id = &instance.id;
        let issue = match (desired, instance.state) {
            (InstanceState::Terminated, state) if state.is_destroyed() => false,
            (InstanceState::Terminated, InstanceState::Stopping) => {
                await_one(provider, ctx, policy, id, WaitCondition::Stopped)?;
                true
            }
            (InstanceState::Terminated | InstanceState::Stopped, InstanceState::Pending) => {
                await_one(provider, ctx, policy, id, WaitCondition::Running)?;
                true
            }
            (InstanceState::Terminated, _) => true,
            (InstanceState::Stopped, InstanceState::Running) => true,
            (InstanceState::Stopped, _) => false,
            (InstanceState::Running, InstanceState::Stopping) => {
                await_one(provider, ctx, policy, id, WaitCondition::Stopped)?;
                true
            }
            (InstanceState::Running, InstanceState::Stopped) => true,
            _ => false,
        };

        if !issue {
            report.unchanged.push(id.clone());
            continue;
        }

        if ctx.dry_run {
            report.changed.push(id.clone());
            continue;
        }

        let ids = std::slice::from_ref(id);
        let result = match desired {
            InstanceState::Terminated => provider.terminate(ids),
            InstanceState::Stopped => provider.stop(ids),
            _ => provider.start(ids),
        };

        match result {
            Ok(accepted) if accepted.contains(id) => {
                log::info!("{} {}", past_tense(desired), id);
                ctx.observer.on_action(action_for(target), ids);
                report.changed.push(id.clone());
            }
            Ok(_) => {
                report.failed.push(id.clone());
                report.failure_reason = Some(format!("{id} was not accepted by the provider"));
            }
            Err(err) => {
                log::warn!("Unable to {} {}: {}", action_for(target), id, err);
                report.failed.push(id.clone());
                report.failure_reason = Some(err.to_string());
            }
        }
    }

    if report.is_changed() {
        let ids: Vec<String> = report
            .changed
            .iter()
            .chain(report.unchanged.iter())
            .cloned()
            .collect();
        let condition = target.wait_condition();
        let status = await_instances(provider, ctx, policy, &ids, condition, false)?;
        if let Some(err) = status.timeout_error(condition) {
            report.warnings.push(err.to_string());
        }
    }

    let ids: Vec<String> = instances.iter().map(|i| i.id.clone()).collect();
    report.instances = if ctx.dry_run {
        instances.to_vec()
    } else {
        refresh(provider, &ids)?
    };
    Ok(report)
}

fn await_one<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    policy: &WaitPolicy,
    id: &str,
    condition: WaitCondition,
) -> Result<()> {
    let status = await_instances(
        provider,
        ctx,
        policy,
        std::slice::from_ref(&id.to_string()),
        condition,
        true,
    )?;
    if let WaitStatus::TimedOut { .. } = status {
        log::warn!("{id} did not reach {condition}; issuing the transition anyway");
    }
    Ok(())
}

fn past_tense(state: InstanceState) -> &'static str {
    match state {
        InstanceState::Terminated => "Terminated",
        InstanceState::Stopped => "Stopped",
        _ => "Started",
    }
}
