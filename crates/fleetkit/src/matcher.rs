//! Matcher - finds the live population a declaration refers to

use crate::builder::default_subnet;
use crate::declaration::{Population, ResourceDeclaration};
use crate::error::Result;
use crate::provider::Provider;
use crate::types::{InstanceState, LifecycleTarget, LiveInstance};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Filter key for lifecycle states
pub const STATE_KEY: &str = "instance-state-name";

/// Key/value predicate set used to query the provider
///
/// Keys are stored in wire form: `snake_case` keys become `kebab-case`,
/// `tag:` keys are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFilter {
    entries: BTreeMap<String, Vec<String>>,
}

impl MatchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a filter key to its wire name
    pub fn wire_key(key: &str) -> String {
        if key.starts_with("tag:") {
            key.to_string()
        } else {
            key.replace('_', "-")
        }
    }

    /// Add (or replace) an entry
    pub fn insert(&mut self, key: &str, values: Vec<String>) {
        self.entries.insert(Self::wire_key(key), values);
    }

    pub fn with(mut self, key: &str, values: Vec<String>) -> Self {
        self.insert(key, values);
        self
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries.get(&Self::wire_key(key)).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&Self::wire_key(key))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Attach the lifecycle-state entry unless the caller supplied one
    ///
    /// Destroyed states are excluded unless the target itself is destroyed.
    pub fn with_lifecycle_states(mut self, target: LifecycleTarget) -> Self {
        if !self.contains(STATE_KEY) {
            let states: &[InstanceState] = if target.is_destroyed() {
                &InstanceState::ALL
            } else {
                &InstanceState::LIVE
            };
            self.insert(
                STATE_KEY,
                states.iter().map(|s| s.as_str().to_string()).collect(),
            );
        }
        self
    }
}

impl FromIterator<(String, Vec<String>)> for MatchFilter {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        let mut filter = MatchFilter::new();
        for (key, values) in iter {
            filter.insert(&key, values);
        }
        filter
    }
}

/// What to query the provider with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Query by identity
    Identifiers(Vec<String>),
    /// Query by predicate set
    Filter(MatchFilter),
    /// Nothing identifies an existing population; every pass launches
    Nothing,
}

/// Derive the selector for a declaration
///
/// Without explicit ids or raw filters, the population is defined by its
/// network location (subnet, attached interfaces, or the default subnet),
/// its `Name` tag and its image.
pub fn selector_for<P: Provider + ?Sized>(
    provider: &P,
    declaration: &ResourceDeclaration,
) -> Result<Selector> {
    if let Some(raw) = &declaration.filters {
        let filter: MatchFilter = raw.clone().into_iter().collect();
        return Ok(Selector::Filter(filter));
    }

    if let Population::Identifiers(ids) = &declaration.population {
        return Ok(Selector::Identifiers(ids.clone()));
    }

    let attrs = &declaration.attributes;
    let mut filter = MatchFilter::new();

    if attrs.launch_template.is_none() {
        if let Some(subnet_id) = &attrs.subnet_id {
            filter.insert("subnet-id", vec![subnet_id.clone()]);
        } else if !attrs.network_interfaces_ids.is_empty() {
            filter.insert(
                "network-interface.network-interface-id",
                attrs
                    .network_interfaces_ids
                    .iter()
                    .map(|eni| eni.id.clone())
                    .collect(),
            );
        } else {
            let subnet = default_subnet(provider, attrs.availability_zone.as_deref())?;
            filter.insert("subnet-id", vec![subnet.id]);
        }
    }

    if let Some(name) = attrs.name_tag() {
        filter.insert("tag:Name", vec![name.to_string()]);
    }

    if let Some(image_id) = attrs.resolved_image_id() {
        filter.insert("image-id", vec![image_id.to_string()]);
    }

    if filter.is_empty() {
        return Ok(Selector::Nothing);
    }

    Ok(Selector::Filter(filter))
}

/// Find the current population for a selector
///
/// Destroyed instances are left out unless `target` is a destroyed phase.
/// Provider failures are always surfaced.
pub fn find<P: Provider + ?Sized>(
    provider: &P,
    selector: &Selector,
    target: LifecycleTarget,
) -> Result<Vec<LiveInstance>> {
    let found = match selector {
        Selector::Nothing => return Ok(Vec::new()),
        Selector::Identifiers(ids) => {
            log::debug!("Matching instances by id: {}", ids.join(", "));
            provider
                .find_by_ids(ids)?
                .into_iter()
                .filter(|i| target.is_destroyed() || !i.state.is_destroyed())
                .collect::<Vec<_>>()
        }
        Selector::Filter(filter) => {
            let filter = filter.clone().with_lifecycle_states(target);
            log::debug!("Matching instances by filter: {:?}", filter);
            provider.find_by_filter(&filter)?
        }
    };

    log::debug!("Matched {} instance(s)", found.len());
    Ok(found)
}

/// Re-read a known set of instances, keeping their order
pub fn refresh<P: Provider + ?Sized>(provider: &P, ids: &[String]) -> Result<Vec<LiveInstance>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut found = provider.find_by_ids(ids)?;
    found.sort_by_key(|i| ids.iter().position(|id| *id == i.id));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::{InstanceAttributes, InterfaceAttachment, LaunchTemplateSpec};
    use crate::error::ErrorCategory;
    use crate::memory::{Fault, MemoryProvider, Operation};

    fn declaration(attributes: InstanceAttributes) -> ResourceDeclaration {
        ResourceDeclaration::new(LifecycleTarget::Running).with_attributes(attributes)
    }

    #[test]
    fn test_wire_keys() {
        assert_eq!(MatchFilter::wire_key("instance_state_name"), "instance-state-name");
        assert_eq!(MatchFilter::wire_key("tag:app_tier"), "tag:app_tier");
    }

    #[test]
    fn test_lifecycle_states_excluding_destroyed() {
        let filter = MatchFilter::new().with_lifecycle_states(LifecycleTarget::Running);
        let states = filter.get(STATE_KEY).unwrap();
        assert_eq!(states.len(), 4);
        assert!(!states.iter().any(|s| s == "terminated"));

        let filter = MatchFilter::new().with_lifecycle_states(LifecycleTarget::Absent);
        assert_eq!(filter.get(STATE_KEY).unwrap().len(), 6);
    }

    #[test]
    fn test_caller_state_filter_is_kept() {
        let filter = MatchFilter::new()
            .with(STATE_KEY, vec!["stopped".into()])
            .with_lifecycle_states(LifecycleTarget::Running);
        assert_eq!(filter.get(STATE_KEY).unwrap(), ["stopped".to_string()]);
    }

    #[test]
    fn test_selector_uses_default_subnet_name_and_image() {
        let cloud = MemoryProvider::with_default_network();
        let attrs = InstanceAttributes {
            name: Some("web".into()),
            image_id: Some("ami-1".into()),
            ..Default::default()
        };
        let selector = selector_for(&cloud, &declaration(attrs)).unwrap();
        let Selector::Filter(filter) = selector else {
            panic!("expected a filter selector");
        };
        assert_eq!(filter.get("subnet-id").unwrap(), ["subnet-a".to_string()]);
        assert_eq!(filter.get("tag:Name").unwrap(), ["web".to_string()]);
        assert_eq!(filter.get("image-id").unwrap(), ["ami-1".to_string()]);
    }

    #[test]
    fn test_selector_prefers_interface_ids_over_default_subnet() {
        let cloud = MemoryProvider::with_default_network();
        let attrs = InstanceAttributes {
            network_interfaces_ids: vec![InterfaceAttachment {
                id: "eni-9".into(),
                device_index: 0,
            }],
            ..Default::default()
        };
        let Selector::Filter(filter) = selector_for(&cloud, &declaration(attrs)).unwrap() else {
            panic!("expected a filter selector");
        };
        assert!(filter.get("subnet-id").is_none());
        assert_eq!(
            filter.get("network-interface.network-interface-id").unwrap(),
            ["eni-9".to_string()]
        );
    }

    #[test]
    fn test_selector_with_bare_launch_template_matches_nothing() {
        let cloud = MemoryProvider::with_default_network();
        let attrs = InstanceAttributes {
            launch_template: Some(LaunchTemplateSpec {
                name: Some("base".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            selector_for(&cloud, &declaration(attrs)).unwrap(),
            Selector::Nothing
        );
    }

    #[test]
    fn test_find_by_unknown_ids_is_empty() {
        let cloud = MemoryProvider::with_default_network();
        let found = find(
            &cloud,
            &Selector::Identifiers(vec!["i-404".into()]),
            LifecycleTarget::Running,
        )
        .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_find_skips_terminated_unless_targeted() {
        let cloud = MemoryProvider::with_default_network();
        let gone = cloud.seed_instance("web", InstanceState::Terminated);
        let live = cloud.seed_instance("web", InstanceState::Running);
        let selector = Selector::Identifiers(vec![gone.clone(), live.clone()]);

        let found = find(&cloud, &selector, LifecycleTarget::Running).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, live);

        let found = find(&cloud, &selector, LifecycleTarget::Terminated).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_find_surfaces_query_errors() {
        let cloud = MemoryProvider::with_default_network();
        cloud.fail_next(Operation::FindByFilter, Fault::Query("throttled".into()));
        let err = find(
            &cloud,
            &Selector::Filter(MatchFilter::new().with("tag:Name", vec!["web".into()])),
            LifecycleTarget::Running,
        )
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Query);
    }
}
