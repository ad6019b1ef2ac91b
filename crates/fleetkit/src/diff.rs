//! Diff engine - minimal in-place changes for a live instance
//!
//! Only an allow-list of mutable attributes is compared. An attribute the
//! declaration leaves unset is never touched, and attributes fixed at
//! launch produce advisories instead of changes.

use crate::builder::{default_subnet, discover_security_groups};
use crate::declaration::InstanceAttributes;
use crate::error::{Error, Result};
use crate::provider::Provider;
use crate::types::{LiveInstance, MetadataOptions, MutableAttribute};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Tag keys with this prefix belong to the provider and are never removed
pub const RESERVED_TAG_PREFIX: &str = "aws:";

/// New value for a mutable attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "attribute", content = "value", rename_all = "snake_case")]
pub enum AttributeChange {
    EbsOptimized(bool),
    TerminationProtection(bool),
    InstanceType(String),
    SecurityGroups(Vec<String>),
    SourceDestCheck(bool),
}

impl AttributeChange {
    pub fn attribute(&self) -> MutableAttribute {
        match self {
            Self::EbsOptimized(_) => MutableAttribute::EbsOptimized,
            Self::TerminationProtection(_) => MutableAttribute::DisableApiTermination,
            Self::InstanceType(_) => MutableAttribute::InstanceType,
            Self::SecurityGroups(_) => MutableAttribute::GroupSet,
            Self::SourceDestCheck(_) => MutableAttribute::SourceDestCheck,
        }
    }
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EbsOptimized(v) | Self::TerminationProtection(v) | Self::SourceDestCheck(v) => {
                write!(f, "{} = {v}", self.attribute())
            }
            Self::InstanceType(t) => write!(f, "{} = {t}", self.attribute()),
            Self::SecurityGroups(g) => write!(f, "{} = [{}]", self.attribute(), g.join(", ")),
        }
    }
}

/// Tags to set and tag keys to remove
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagChange {
    pub set: BTreeMap<String, String>,
    pub unset: Vec<String>,
}

impl TagChange {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }
}

/// One in-place modification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Tags(TagChange),
    /// Full options to send; declared values merged over live ones
    MetadataOptions(MetadataOptions),
    Attribute(AttributeChange),
    InstanceProfile { name: String },
    AttachInterface { interface_id: String, device_index: u32 },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tags(t) => {
                write!(f, "tags: {} set, {} removed", t.set.len(), t.unset.len())
            }
            Self::MetadataOptions(_) => f.write_str("metadata options"),
            Self::Attribute(a) => write!(f, "{a}"),
            Self::InstanceProfile { name } => write!(f, "instance profile = {name}"),
            Self::AttachInterface {
                interface_id,
                device_index,
            } => write!(f, "attach {interface_id} at device {device_index}"),
        }
    }
}

/// Ordered changes for one instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub instance_id: String,
    pub changes: Vec<Change>,
    /// Declared values that cannot be converged in place
    pub advisories: Vec<String>,
}

impl ChangeSet {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// The instance-type change, if any
    pub fn instance_type(&self) -> Option<&str> {
        self.changes.iter().find_map(|c| match c {
            Change::Attribute(AttributeChange::InstanceType(t)) => Some(t.as_str()),
            _ => None,
        })
    }
}

/// Which parts of the declaration a diff covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffScope {
    /// Everything that can be converged on an existing instance
    Full,
    /// Attributes a launch request may not have applied; skips
    /// `ebs_optimized` and everything set at launch (tags, profile)
    PostLaunch,
}

/// Compute the changes that converge `live` to `declared`
pub fn diff<P: Provider + ?Sized>(
    provider: &P,
    live: &LiveInstance,
    declared: &InstanceAttributes,
    scope: DiffScope,
) -> Result<ChangeSet> {
    let mut set = ChangeSet::new(&live.id);

    if scope == DiffScope::Full {
        if let Some(change) = diff_tags(live, declared) {
            set.changes.push(Change::Tags(change));
        }
        if let Some(options) = diff_metadata(live, declared) {
            set.changes.push(Change::MetadataOptions(options));
        }
    }

    diff_attributes(provider, live, declared, scope, &mut set)?;

    if scope == DiffScope::Full {
        if let Some(profile) = &declared.iam_instance_profile {
            if live.instance_profile.as_deref() != Some(profile.as_str()) {
                set.changes.push(Change::InstanceProfile {
                    name: profile.clone(),
                });
            }
        }

        for eni in &declared.network_interfaces_ids {
            if !live.network_interfaces.iter().any(|i| i.id == eni.id) {
                set.changes.push(Change::AttachInterface {
                    interface_id: eni.id.clone(),
                    device_index: eni.device_index,
                });
            }
        }

        immutable_advisories(live, declared, &mut set.advisories);
    }

    if !set.is_empty() {
        log::debug!(
            "{}: {}",
            live.id,
            set.changes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        );
    }
    Ok(set)
}

/// Tag delta; `None` when tags are not declared or already match
pub fn diff_tags(live: &LiveInstance, declared: &InstanceAttributes) -> Option<TagChange> {
    let (desired, purge) = declared.desired_tags()?;

    let set: BTreeMap<String, String> = desired
        .iter()
        .filter(|(k, v)| live.tags.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let unset: Vec<String> = if purge {
        live.tags
            .keys()
            .filter(|k| !desired.contains_key(*k) && !k.starts_with(RESERVED_TAG_PREFIX))
            .cloned()
            .collect()
    } else {
        Vec::new()
    };

    let change = TagChange { set, unset };
    (!change.is_empty()).then_some(change)
}

/// Metadata request when a declared key differs from the live value
pub fn diff_metadata(live: &LiveInstance, declared: &InstanceAttributes) -> Option<MetadataOptions> {
    let wanted = declared.metadata_options.as_ref()?;
    let current = &live.metadata_options;

    let differs = [
        field_differs(wanted.http_endpoint, current.http_endpoint),
        field_differs(wanted.http_tokens, current.http_tokens),
        field_differs(
            wanted.http_put_response_hop_limit,
            current.http_put_response_hop_limit,
        ),
        field_differs(wanted.http_protocol_ipv6, current.http_protocol_ipv6),
        field_differs(wanted.instance_metadata_tags, current.instance_metadata_tags),
    ]
    .into_iter()
    .any(|d| d);

    differs.then(|| current.merged_with(wanted))
}

fn field_differs<T: PartialEq>(wanted: Option<T>, current: Option<T>) -> bool {
    wanted.is_some() && wanted != current
}

fn diff_attributes<P: Provider + ?Sized>(
    provider: &P,
    live: &LiveInstance,
    declared: &InstanceAttributes,
    scope: DiffScope,
    set: &mut ChangeSet,
) -> Result<()> {
    if scope == DiffScope::Full {
        if let Some(wanted) = declared.ebs_optimized {
            if describe_flag(provider, &live.id, MutableAttribute::EbsOptimized)? != wanted {
                set.changes
                    .push(Change::Attribute(AttributeChange::EbsOptimized(wanted)));
            }
        }
    }

    if let Some(wanted) = declared.termination_protection {
        if describe_flag(provider, &live.id, MutableAttribute::DisableApiTermination)? != wanted {
            set.changes
                .push(Change::Attribute(AttributeChange::TerminationProtection(wanted)));
        }
    }

    if let Some(wanted) = &declared.instance_type {
        let current = provider.describe_attribute(&live.id, MutableAttribute::InstanceType)?;
        let current = current
            .as_text()
            .ok_or_else(|| unexpected(&live.id, MutableAttribute::InstanceType))?;
        if current != wanted {
            set.changes
                .push(Change::Attribute(AttributeChange::InstanceType(wanted.clone())));
        }
    }

    if let Some(groups) = diff_groups(provider, live, declared, set)? {
        set.changes
            .push(Change::Attribute(AttributeChange::SecurityGroups(groups)));
    }

    if let Some(wanted) = declared.source_dest_check {
        if describe_flag(provider, &live.id, MutableAttribute::SourceDestCheck)? != wanted {
            set.changes
                .push(Change::Attribute(AttributeChange::SourceDestCheck(wanted)));
        }
    }

    Ok(())
}

/// Resolved group ids to apply, when they differ from the live set
fn diff_groups<P: Provider + ?Sized>(
    provider: &P,
    live: &LiveInstance,
    declared: &InstanceAttributes,
    set: &mut ChangeSet,
) -> Result<Option<Vec<String>>> {
    let first = declared.network_interfaces.first();
    let names = match first.map(|i| &i.groups).filter(|g| !g.is_empty()) {
        Some(groups) => groups,
        None => &declared.security_groups,
    };
    if names.is_empty() {
        return Ok(None);
    }

    // TODO: modify groups per interface so multi-interface instances can converge
    if declared.network_interfaces.len() > 1 || live.is_multi_interface() {
        set.advisories.push(
            "skipping security group modification because the instance has multiple network interfaces"
                .to_string(),
        );
        return Ok(None);
    }

    let subnet_id = first
        .and_then(|i| i.subnet_id.clone())
        .or_else(|| declared.subnet_id.clone());
    let wanted = match (subnet_id, &live.vpc_id) {
        (Some(subnet_id), _) => discover_security_groups(provider, names, &subnet_id)?,
        (None, Some(vpc_id)) => provider.security_group_ids(names, vpc_id)?,
        (None, None) => {
            let subnet = default_subnet(provider, None)?;
            provider.security_group_ids(names, &subnet.vpc_id)?
        }
    };

    let current = provider.describe_attribute(&live.id, MutableAttribute::GroupSet)?;
    let current = current
        .as_groups()
        .ok_or_else(|| unexpected(&live.id, MutableAttribute::GroupSet))?;

    let wanted_set: BTreeSet<String> = wanted.iter().cloned().collect();
    Ok((&wanted_set != current).then_some(wanted))
}

fn immutable_advisories(live: &LiveInstance, declared: &InstanceAttributes, out: &mut Vec<String>) {
    if let Some(assign) = declared.assign_public_ip() {
        let has_public = live.public_dns_name.as_deref().is_some_and(|d| !d.is_empty());
        if assign != has_public {
            out.push(format!(
                "unable to change public IP assignment to {assign}; it is fixed at launch"
            ));
        }
    }

    if let Some(wanted) = declared.cpu_options {
        let current = live.cpu_options;
        if current.map(|c| c.core_count) != Some(wanted.core_count) {
            out.push(format!(
                "unable to change core_count to {}; it is fixed at launch",
                wanted.core_count
            ));
        }
        if current.map(|c| c.threads_per_core) != Some(wanted.threads_per_core) {
            out.push(format!(
                "unable to change threads_per_core to {}; it is fixed at launch",
                wanted.threads_per_core
            ));
        }
    }
}

fn describe_flag<P: Provider + ?Sized>(
    provider: &P,
    id: &str,
    attribute: MutableAttribute,
) -> Result<bool> {
    provider
        .describe_attribute(id, attribute)?
        .as_flag()
        .ok_or_else(|| unexpected(id, attribute))
}

fn unexpected(id: &str, attribute: MutableAttribute) -> Error {
    Error::query(
        "describe_attribute",
        format!("unexpected value for {attribute} on {id}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::{InterfaceAttachment, NetworkInterfaceSpec};
    use crate::memory::MemoryProvider;
    use crate::types::{CpuOptions, HttpTokens, InstanceState, Toggle};

    fn setup() -> (MemoryProvider, LiveInstance) {
        let cloud = MemoryProvider::with_default_network();
        let id = cloud.seed_instance("web", InstanceState::Running);
        let live = cloud.instance(&id).unwrap();
        (cloud, live)
    }

    #[test]
    fn test_undeclared_attributes_are_untouched() {
        let (cloud, live) = setup();
        let set = diff(&cloud, &live, &InstanceAttributes::default(), DiffScope::Full).unwrap();
        assert!(set.is_empty());
        assert!(set.advisories.is_empty());
    }

    #[test]
    fn test_single_difference_gives_single_change() {
        let (cloud, live) = setup();
        let declared = InstanceAttributes {
            instance_type: Some(live.instance_type.clone()),
            termination_protection: Some(true),
            ebs_optimized: Some(live.ebs_optimized),
            source_dest_check: Some(live.source_dest_check),
            ..Default::default()
        };
        let set = diff(&cloud, &live, &declared, DiffScope::Full).unwrap();
        assert_eq!(
            set.changes,
            vec![Change::Attribute(AttributeChange::TerminationProtection(true))]
        );
    }

    #[test]
    fn test_instance_type_change() {
        let (cloud, live) = setup();
        let declared = InstanceAttributes {
            instance_type: Some("m5.large".into()),
            ..Default::default()
        };
        let set = diff(&cloud, &live, &declared, DiffScope::Full).unwrap();
        assert_eq!(set.instance_type(), Some("m5.large"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_post_launch_skips_ebs_optimized_and_tags() {
        let (cloud, live) = setup();
        let declared = InstanceAttributes {
            ebs_optimized: Some(!live.ebs_optimized),
            tags: Some(BTreeMap::from([("env".into(), "prod".into())])),
            ..Default::default()
        };
        let set = diff(&cloud, &live, &declared, DiffScope::PostLaunch).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_tags_purge_keeps_reserved_keys() {
        let (_, mut live) = setup();
        live.tags.insert("old".into(), "x".into());
        live.tags
            .insert("aws:cloudformation:stack-name".into(), "s".into());
        let declared = InstanceAttributes {
            tags: Some(BTreeMap::from([
                ("Name".into(), "web".into()),
                ("env".into(), "prod".into()),
            ])),
            ..Default::default()
        };
        let change = diff_tags(&live, &declared).unwrap();
        assert_eq!(change.set.len(), 1);
        assert_eq!(change.unset, vec!["old".to_string()]);

        let keep = InstanceAttributes {
            purge_tags: false,
            ..declared
        };
        assert!(diff_tags(&live, &keep).unwrap().unset.is_empty());
    }

    #[test]
    fn test_name_alone_never_purges() {
        let (_, mut live) = setup();
        live.tags.insert("team".into(), "infra".into());
        let declared = InstanceAttributes {
            name: Some("web".into()),
            ..Default::default()
        };
        assert!(diff_tags(&live, &declared).is_none());
    }

    #[test]
    fn test_metadata_compares_declared_keys_only() {
        let (_, live) = setup();
        let same = InstanceAttributes {
            metadata_options: Some(MetadataOptions {
                http_endpoint: Some(Toggle::Enabled),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(diff_metadata(&live, &same).is_none());

        let stricter = InstanceAttributes {
            metadata_options: Some(MetadataOptions {
                http_tokens: Some(HttpTokens::Required),
                ..Default::default()
            }),
            ..Default::default()
        };
        let request = diff_metadata(&live, &stricter).unwrap();
        assert_eq!(request.http_tokens, Some(HttpTokens::Required));
        assert_eq!(request.http_endpoint, Some(Toggle::Enabled));
    }

    #[test]
    fn test_security_groups_resolved_and_compared() {
        let (cloud, live) = setup();
        let declared = InstanceAttributes {
            security_groups: vec!["db".into()],
            ..Default::default()
        };
        let set = diff(&cloud, &live, &declared, DiffScope::Full).unwrap();
        assert_eq!(
            set.changes,
            vec![Change::Attribute(AttributeChange::SecurityGroups(vec![
                "sg-db".into()
            ]))]
        );
    }

    #[test]
    fn test_multi_interface_groups_are_advisory() {
        let (cloud, live) = setup();
        let declared = InstanceAttributes {
            network_interfaces: vec![
                NetworkInterfaceSpec {
                    groups: vec!["db".into()],
                    ..Default::default()
                },
                NetworkInterfaceSpec {
                    device_index: 1,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let set = diff(&cloud, &live, &declared, DiffScope::Full).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.advisories.len(), 1);
    }

    #[test]
    fn test_immutable_attributes_only_advise() {
        let (cloud, live) = setup();
        let declared = InstanceAttributes {
            cpu_options: Some(CpuOptions {
                core_count: 8,
                threads_per_core: 1,
            }),
            network_interfaces: vec![NetworkInterfaceSpec {
                assign_public_ip: Some(true),
                ..Default::default()
            }],
            ..Default::default()
        };
        let set = diff(&cloud, &live, &declared, DiffScope::Full).unwrap();
        assert!(set.is_empty());
        assert!(set.advisories.iter().any(|a| a.contains("public IP")));
        assert!(set.advisories.iter().any(|a| a.contains("core_count")));
    }

    #[test]
    fn test_profile_and_interface_attachment() {
        let (cloud, live) = setup();
        let declared = InstanceAttributes {
            iam_instance_profile: Some("web-role".into()),
            network_interfaces_ids: vec![InterfaceAttachment {
                id: "eni-extra".into(),
                device_index: 1,
            }],
            ..Default::default()
        };
        let set = diff(&cloud, &live, &declared, DiffScope::Full).unwrap();
        assert_eq!(
            set.changes,
            vec![
                Change::InstanceProfile {
                    name: "web-role".into()
                },
                Change::AttachInterface {
                    interface_id: "eni-extra".into(),
                    device_index: 1
                }
            ]
        );
    }
}
