//! Applies a change set to one instance

use crate::context::ReconcileContext;
use crate::declaration::WaitPolicy;
use crate::diff::{AttributeChange, Change, ChangeSet};
use crate::error::Result;
use crate::lifecycle::{action_for, await_instances, ensure_state};
use crate::matcher::refresh;
use crate::provider::Provider;
use crate::types::{LifecycleTarget, WaitCondition};

/// Issue every change in `set`, in order
///
/// An instance-type change requires a stopped instance: the instance is
/// stopped, awaited, modified and then brought back to `restore`
/// (`present` restores to running). Returns warnings raised on the way.
pub fn apply<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    policy: &WaitPolicy,
    set: &ChangeSet,
    restore: LifecycleTarget,
) -> Result<Vec<String>> {
    let id = set.instance_id.as_str();
    let mut warnings = Vec::new();

    for change in &set.changes {
        if ctx.dry_run {
            log::info!("Would apply to {id}: {change}");
            continue;
        }

        log::info!("Applying to {id}: {change}");
        ctx.observer
            .on_action(&change.to_string(), std::slice::from_ref(&set.instance_id));

        match change {
            Change::Tags(tags) => provider.update_tags(id, tags)?,
            Change::MetadataOptions(options) => provider.modify_metadata_options(id, options)?,
            Change::Attribute(attribute @ AttributeChange::InstanceType(_)) => {
                warnings.extend(modify_instance_type(
                    provider, ctx, policy, id, attribute, restore,
                )?);
            }
            Change::Attribute(attribute) => provider.modify_attribute(id, attribute)?,
            Change::InstanceProfile { name } => provider.set_instance_profile(id, name)?,
            Change::AttachInterface {
                interface_id,
                device_index,
            } => provider.attach_network_interface(id, interface_id, *device_index)?,
        }
    }

    Ok(warnings)
}

fn modify_instance_type<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    policy: &WaitPolicy,
    id: &str,
    change: &AttributeChange,
    restore: LifecycleTarget,
) -> Result<Vec<String>> {
    let ids = [id.to_string()];
    let mut warnings = Vec::new();

    let current = refresh(provider, &ids)?;
    let stopped = ensure_state(provider, ctx, policy, &current, LifecycleTarget::Stopped)?;
    stopped.check("stop")?;
    warnings.extend(stopped.warnings);

    let status = await_instances(provider, ctx, policy, &ids, WaitCondition::Stopped, true)?;
    if let Some(err) = status.timeout_error(WaitCondition::Stopped) {
        warnings.push(err.to_string());
    }

    provider.modify_attribute(id, change)?;

    let target = match restore {
        LifecycleTarget::Present => LifecycleTarget::Running,
        other => other,
    };
    let current = refresh(provider, &ids)?;
    let restored = ensure_state(provider, ctx, policy, &current, target)?;
    restored.check(action_for(target))?;
    warnings.extend(restored.warnings);

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineSettings;
    use crate::diff::TagChange;
    use crate::memory::{Call, MemoryProvider};
    use crate::types::InstanceState;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn ctx(dry_run: bool) -> ReconcileContext<'static> {
        ReconcileContext::new(dry_run).with_settings(EngineSettings {
            poll_interval: Duration::from_secs(1),
            auth_retry_delay: Duration::from_secs(1),
        })
    }

    fn policy() -> WaitPolicy {
        WaitPolicy {
            enabled: true,
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_instance_type_change_stops_and_restores() {
        let cloud = MemoryProvider::with_default_network();
        let id = cloud.seed_instance("web", InstanceState::Running);
        let set = ChangeSet {
            instance_id: id.clone(),
            changes: vec![Change::Attribute(AttributeChange::InstanceType(
                "m5.large".into(),
            ))],
            advisories: Vec::new(),
        };

        apply(&cloud, &ctx(false), &policy(), &set, LifecycleTarget::Present).unwrap();

        let live = cloud.instance(&id).unwrap();
        assert_eq!(live.instance_type, "m5.large");
        assert_eq!(live.state, InstanceState::Running);

        let calls = cloud.calls();
        let stop = calls.iter().position(|c| *c == Call::Stop(vec![id.clone()]));
        let modify = calls
            .iter()
            .position(|c| matches!(c, Call::ModifyAttribute(i, _) if *i == id));
        let start = calls.iter().position(|c| *c == Call::Start(vec![id.clone()]));
        assert!(stop.unwrap() < modify.unwrap());
        assert!(modify.unwrap() < start.unwrap());
    }

    #[test]
    fn test_stopped_target_stays_stopped() {
        let cloud = MemoryProvider::with_default_network();
        let id = cloud.seed_instance("web", InstanceState::Running);
        let set = ChangeSet {
            instance_id: id.clone(),
            changes: vec![Change::Attribute(AttributeChange::InstanceType(
                "m5.large".into(),
            ))],
            advisories: Vec::new(),
        };

        apply(&cloud, &ctx(false), &policy(), &set, LifecycleTarget::Stopped).unwrap();
        assert_eq!(cloud.instance(&id).unwrap().state, InstanceState::Stopped);
    }

    #[test]
    fn test_dry_run_applies_nothing() {
        let cloud = MemoryProvider::with_default_network();
        let id = cloud.seed_instance("web", InstanceState::Running);
        let set = ChangeSet {
            instance_id: id.clone(),
            changes: vec![Change::Tags(TagChange {
                set: BTreeMap::from([("env".into(), "prod".into())]),
                unset: Vec::new(),
            })],
            advisories: Vec::new(),
        };

        apply(&cloud, &ctx(true), &policy(), &set, LifecycleTarget::Running).unwrap();
        assert!(cloud.instance(&id).unwrap().tags.get("env").is_none());
        assert!(!cloud.calls().iter().any(|c| matches!(c, Call::UpdateTags(..))));
    }
}
