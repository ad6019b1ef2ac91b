//! Core types shared by every stage of a reconciliation pass

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Provider-side lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl InstanceState {
    /// States that still count as part of a population
    pub const LIVE: [InstanceState; 4] = [
        InstanceState::Pending,
        InstanceState::Running,
        InstanceState::Stopping,
        InstanceState::Stopped,
    ];

    /// Every state, including the destroyed ones
    pub const ALL: [InstanceState; 6] = [
        InstanceState::Pending,
        InstanceState::Running,
        InstanceState::Stopping,
        InstanceState::Stopped,
        InstanceState::ShuttingDown,
        InstanceState::Terminated,
    ];

    /// Wire name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        }
    }

    /// Parse a wire name
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    /// Whether the instance is between two stable states
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Pending | Self::Stopping | Self::ShuttingDown)
    }

    /// Whether the instance is being or has been torn down
    pub fn is_destroyed(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared lifecycle phase for a population
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleTarget {
    #[default]
    Present,
    Running,
    Started,
    Stopped,
    Restarted,
    Rebooted,
    Terminated,
    Absent,
}

impl LifecycleTarget {
    /// Provider state the population must end up in
    pub fn provider_state(&self) -> InstanceState {
        match self {
            Self::Present | Self::Running | Self::Started | Self::Restarted | Self::Rebooted => {
                InstanceState::Running
            }
            Self::Stopped => InstanceState::Stopped,
            Self::Terminated | Self::Absent => InstanceState::Terminated,
        }
    }

    /// Condition a wait for this phase blocks on
    pub fn wait_condition(&self) -> WaitCondition {
        match self {
            Self::Present => WaitCondition::Exists,
            Self::Started | Self::Restarted => WaitCondition::StatusOk,
            Self::Running | Self::Rebooted => WaitCondition::Running,
            Self::Stopped => WaitCondition::Stopped,
            Self::Terminated | Self::Absent => WaitCondition::Terminated,
        }
    }

    /// Whether the phase asks for the population to be destroyed
    pub fn is_destroyed(&self) -> bool {
        matches!(self, Self::Terminated | Self::Absent)
    }

    /// Whether the phase cycles instances through stopped and back
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::Restarted | Self::Rebooted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Running => "running",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Restarted => "restarted",
            Self::Rebooted => "rebooted",
            Self::Terminated => "terminated",
            Self::Absent => "absent",
        }
    }
}

impl fmt::Display for LifecycleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named composite condition a wait blocks on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitCondition {
    Exists,
    Running,
    Stopped,
    Terminated,
    StatusOk,
}

impl WaitCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exists => "instance-exists",
            Self::Running => "instance-running",
            Self::Stopped => "instance-stopped",
            Self::Terminated => "instance-terminated",
            Self::StatusOk => "instance-status-ok",
        }
    }

    /// Whether a single instance (or its absence) satisfies the condition
    pub fn is_met(&self, instance: Option<&LiveInstance>) -> bool {
        match (self, instance) {
            (Self::Terminated, None) => true,
            (_, None) => false,
            (Self::Exists, Some(_)) => true,
            (Self::Running, Some(i)) => i.state == InstanceState::Running,
            (Self::Stopped, Some(i)) => i.state == InstanceState::Stopped,
            (Self::Terminated, Some(i)) => i.state == InstanceState::Terminated,
            (Self::StatusOk, Some(i)) => {
                i.state == InstanceState::Running && i.status_checks_passed
            }
        }
    }
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two-valued provider switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    Enabled,
    Disabled,
}

/// Whether session tokens are required by the metadata service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpTokens {
    Optional,
    Required,
}

/// Instance metadata service options
///
/// Declared options leave unset fields as `None`; live instances carry
/// every field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataOptions {
    pub http_endpoint: Option<Toggle>,
    pub http_tokens: Option<HttpTokens>,
    pub http_put_response_hop_limit: Option<u8>,
    pub http_protocol_ipv6: Option<Toggle>,
    pub instance_metadata_tags: Option<Toggle>,
}

impl MetadataOptions {
    /// Options a freshly launched instance gets when nothing is declared
    pub fn provider_defaults() -> Self {
        Self {
            http_endpoint: Some(Toggle::Enabled),
            http_tokens: Some(HttpTokens::Optional),
            http_put_response_hop_limit: Some(1),
            http_protocol_ipv6: Some(Toggle::Disabled),
            instance_metadata_tags: Some(Toggle::Disabled),
        }
    }

    /// Overlay the declared (set) fields of `other` on top of `self`
    pub fn merged_with(&self, other: &MetadataOptions) -> MetadataOptions {
        MetadataOptions {
            http_endpoint: other.http_endpoint.or(self.http_endpoint),
            http_tokens: other.http_tokens.or(self.http_tokens),
            http_put_response_hop_limit: other
                .http_put_response_hop_limit
                .or(self.http_put_response_hop_limit),
            http_protocol_ipv6: other.http_protocol_ipv6.or(self.http_protocol_ipv6),
            instance_metadata_tags: other.instance_metadata_tags.or(self.instance_metadata_tags),
        }
    }
}

/// Core layout fixed at launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuOptions {
    pub core_count: u32,
    pub threads_per_core: u32,
}

/// A network interface attached to a live instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedInterface {
    pub id: String,
    pub device_index: u32,
    pub subnet_id: String,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub private_ip: Option<String>,
}

/// Snapshot of one instance as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveInstance {
    pub id: String,
    pub state: InstanceState,
    pub instance_type: String,
    #[serde(default)]
    pub image_id: Option<String>,
    pub launch_time: DateTime<Utc>,
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub network_interfaces: Vec<AttachedInterface>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default = "default_true")]
    pub source_dest_check: bool,
    #[serde(default)]
    pub ebs_optimized: bool,
    #[serde(default)]
    pub termination_protection: bool,
    #[serde(default)]
    pub metadata_options: MetadataOptions,
    #[serde(default)]
    pub instance_profile: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub cpu_options: Option<CpuOptions>,
    #[serde(default)]
    pub public_dns_name: Option<String>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub status_checks_passed: bool,
}

fn default_true() -> bool {
    true
}

impl LiveInstance {
    /// Value of the `Name` tag
    pub fn name(&self) -> Option<&str> {
        self.tags.get("Name").map(String::as_str)
    }

    /// Whether more than one interface is attached
    pub fn is_multi_interface(&self) -> bool {
        self.network_interfaces.len() > 1
    }
}

/// A virtual network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vpc {
    pub id: String,
    #[serde(default)]
    pub is_default: bool,
}

/// A network location inside a VPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub vpc_id: String,
    pub availability_zone: String,
    #[serde(default)]
    pub default_for_az: bool,
}

/// Attributes the diff engine is allowed to change in place
///
/// Each is read with a dedicated describe-attribute call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutableAttribute {
    InstanceType,
    EbsOptimized,
    DisableApiTermination,
    GroupSet,
    SourceDestCheck,
}

impl MutableAttribute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceType => "instanceType",
            Self::EbsOptimized => "ebsOptimized",
            Self::DisableApiTermination => "disableApiTermination",
            Self::GroupSet => "groupSet",
            Self::SourceDestCheck => "sourceDestCheck",
        }
    }
}

impl fmt::Display for MutableAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value returned by a describe-attribute call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    Text(String),
    Flag(bool),
    Groups(BTreeSet<String>),
}

impl AttributeValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_groups(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Groups(g) => Some(g),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(state: InstanceState) -> LiveInstance {
        LiveInstance {
            id: "i-1".into(),
            state,
            instance_type: "t3.micro".into(),
            image_id: None,
            launch_time: Utc::now(),
            vpc_id: None,
            subnet_id: None,
            availability_zone: None,
            network_interfaces: Vec::new(),
            security_groups: Vec::new(),
            source_dest_check: true,
            ebs_optimized: false,
            termination_protection: false,
            metadata_options: MetadataOptions::provider_defaults(),
            instance_profile: None,
            tags: BTreeMap::new(),
            cpu_options: None,
            public_dns_name: None,
            key_name: None,
            status_checks_passed: false,
        }
    }

    #[test]
    fn test_lifecycle_targets_map_to_provider_states() {
        assert_eq!(
            LifecycleTarget::Restarted.provider_state(),
            InstanceState::Running
        );
        assert_eq!(
            LifecycleTarget::Absent.provider_state(),
            InstanceState::Terminated
        );
        assert_eq!(LifecycleTarget::Started.wait_condition(), WaitCondition::StatusOk);
        assert_eq!(LifecycleTarget::Present.wait_condition(), WaitCondition::Exists);
        assert!(LifecycleTarget::Rebooted.is_restart());
    }

    #[test]
    fn test_state_wire_names_round_trip() {
        assert_eq!(
            InstanceState::from_wire("shutting-down"),
            Some(InstanceState::ShuttingDown)
        );
        assert_eq!(InstanceState::from_wire("exploded"), None);
    }

    #[test]
    fn test_wait_conditions() {
        let mut running = instance(InstanceState::Running);
        assert!(WaitCondition::Running.is_met(Some(&running)));
        assert!(!WaitCondition::StatusOk.is_met(Some(&running)));
        running.status_checks_passed = true;
        assert!(WaitCondition::StatusOk.is_met(Some(&running)));

        assert!(WaitCondition::Terminated.is_met(None));
        assert!(!WaitCondition::Exists.is_met(None));
        assert!(!WaitCondition::Stopped.is_met(Some(&instance(InstanceState::Stopping))));
    }

    #[test]
    fn test_metadata_merge_prefers_declared() {
        let live = MetadataOptions::provider_defaults();
        let declared = MetadataOptions {
            http_tokens: Some(HttpTokens::Required),
            ..Default::default()
        };
        let merged = live.merged_with(&declared);
        assert_eq!(merged.http_tokens, Some(HttpTokens::Required));
        assert_eq!(merged.http_endpoint, Some(Toggle::Enabled));
        assert_eq!(merged.http_put_response_hop_limit, Some(1));
    }
}
