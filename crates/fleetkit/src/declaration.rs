//! Declared desired state for an instance population
//!
//! A [`ResourceDeclaration`] is built once per pass and never mutated.
//! Documents on disk use the flat [`DeclarationDocument`] layout; the
//! conversion enforces the mutually exclusive option pairs.

use crate::error::{Error, Result};
use crate::types::{CpuOptions, LifecycleTarget, MetadataOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default wait timeout in seconds
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 600;

/// How the population is sized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Population {
    /// Converge whatever matches; launch `count` (default 1) only when
    /// nothing matches, or always when `count` is given
    Unconstrained { count: Option<u32> },
    /// Operate on exactly these instances
    Identifiers(Vec<String>),
    /// Grow or shrink the matched population to this size
    ExactCount(u32),
}

/// Whether and how long to wait for transitions to settle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub enabled: bool,
    pub timeout: Duration,
}

impl WaitPolicy {
    /// Number of polls that fit into the timeout at the given interval
    pub fn max_attempts(&self, interval: Duration) -> u32 {
        let interval = interval.as_millis().max(1);
        let attempts = self.timeout.as_millis() / interval;
        attempts.clamp(1, u128::from(u32::MAX)) as u32
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
        }
    }
}

/// Machine image to launch from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSpec {
    pub id: Option<String>,
    pub kernel: Option<String>,
    pub ramdisk: Option<String>,
}

/// Provider-side launch template reference
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchTemplateSpec {
    pub id: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
}

/// A secondary private address on a new interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateAddress {
    pub private_ip_address: String,
    #[serde(default)]
    pub primary: Option<bool>,
}

/// A network interface created alongside the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterfaceSpec {
    pub device_index: u32,
    pub subnet_id: Option<String>,
    pub assign_public_ip: Option<bool>,
    pub private_ip_address: Option<String>,
    pub private_ip_addresses: Vec<PrivateAddress>,
    pub ipv6_addresses: Vec<String>,
    pub delete_on_termination: bool,
    pub groups: Vec<String>,
    pub description: Option<String>,
}

impl Default for NetworkInterfaceSpec {
    fn default() -> Self {
        Self {
            device_index: 0,
            subnet_id: None,
            assign_public_ip: None,
            private_ip_address: None,
            private_ip_addresses: Vec::new(),
            ipv6_addresses: Vec::new(),
            delete_on_termination: true,
            groups: Vec::new(),
            description: None,
        }
    }
}

/// An existing interface to attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAttachment {
    pub id: String,
    #[serde(default)]
    pub device_index: u32,
}

/// Block-store volume settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EbsVolume {
    pub volume_size: Option<u32>,
    pub volume_type: Option<String>,
    pub iops: Option<u32>,
    pub throughput: Option<u32>,
    pub encrypted: Option<bool>,
    pub delete_on_termination: Option<bool>,
    pub snapshot_id: Option<String>,
    pub kms_key_id: Option<String>,
}

/// A block device mapping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSpec {
    pub device_name: String,
    pub ebs: Option<EbsVolume>,
    pub virtual_name: Option<String>,
    pub no_device: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tenancy {
    Default,
    Dedicated,
    Host,
}

/// Where the instance is placed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Placement {
    pub availability_zone: Option<String>,
    pub affinity: Option<String>,
    pub group_name: Option<String>,
    pub host_id: Option<String>,
    pub host_resource_group_arn: Option<String>,
    pub partition_number: Option<u32>,
    pub tenancy: Option<Tenancy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuCredits {
    Standard,
    Unlimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownBehavior {
    Stop,
    Terminate,
}

/// Declared instance attributes
///
/// Every field is optional; an unset field is never converged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceAttributes {
    pub name: Option<String>,
    pub image_id: Option<String>,
    pub image: Option<ImageSpec>,
    pub launch_template: Option<LaunchTemplateSpec>,
    pub instance_type: Option<String>,
    pub alternate_instance_types: Vec<String>,
    pub key_name: Option<String>,
    pub user_data: Option<String>,
    #[serde(alias = "vpc_subnet_id")]
    pub subnet_id: Option<String>,
    pub availability_zone: Option<String>,
    pub security_groups: Vec<String>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub network_interfaces_ids: Vec<InterfaceAttachment>,
    pub volumes: Vec<VolumeSpec>,
    pub tags: Option<BTreeMap<String, String>>,
    pub purge_tags: bool,
    pub placement: Option<Placement>,
    pub metadata_options: Option<MetadataOptions>,
    pub ebs_optimized: Option<bool>,
    pub termination_protection: Option<bool>,
    pub source_dest_check: Option<bool>,
    #[serde(alias = "instance_role")]
    pub iam_instance_profile: Option<String>,
    pub cpu_options: Option<CpuOptions>,
    pub detailed_monitoring: Option<bool>,
    pub cpu_credit_specification: Option<CpuCredits>,
    pub instance_initiated_shutdown_behavior: Option<ShutdownBehavior>,
    pub hibernation_options: bool,
    pub license_specifications: Vec<String>,
    pub additional_info: Option<String>,
}

impl Default for InstanceAttributes {
    fn default() -> Self {
        Self {
            name: None,
            image_id: None,
            image: None,
            launch_template: None,
            instance_type: None,
            alternate_instance_types: Vec::new(),
            key_name: None,
            user_data: None,
            subnet_id: None,
            availability_zone: None,
            security_groups: Vec::new(),
            network_interfaces: Vec::new(),
            network_interfaces_ids: Vec::new(),
            volumes: Vec::new(),
            tags: None,
            purge_tags: true,
            placement: None,
            metadata_options: None,
            ebs_optimized: None,
            termination_protection: None,
            source_dest_check: None,
            iam_instance_profile: None,
            cpu_options: None,
            detailed_monitoring: None,
            cpu_credit_specification: None,
            instance_initiated_shutdown_behavior: None,
            hibernation_options: false,
            license_specifications: Vec::new(),
            additional_info: None,
        }
    }
}

impl InstanceAttributes {
    /// Image id from either `image_id` or `image.id`
    pub fn resolved_image_id(&self) -> Option<&str> {
        self.image_id
            .as_deref()
            .or_else(|| self.image.as_ref().and_then(|i| i.id.as_deref()))
    }

    /// Value the `Name` tag should carry
    pub fn name_tag(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or_else(|| self.tags.as_ref().and_then(|t| t.get("Name")).map(String::as_str))
    }

    /// Tags to converge to and whether undeclared tags are purged
    ///
    /// A bare `name` without `tags` never purges.
    pub fn desired_tags(&self) -> Option<(BTreeMap<String, String>, bool)> {
        match (&self.tags, &self.name) {
            (None, None) => None,
            (None, Some(name)) => Some((BTreeMap::from([("Name".to_string(), name.clone())]), false)),
            (Some(tags), name) => {
                let mut tags = tags.clone();
                if let Some(name) = name {
                    tags.insert("Name".to_string(), name.clone());
                }
                Some((tags, self.purge_tags))
            }
        }
    }

    /// Copy with the instance type replaced by the one actually launched
    pub fn with_instance_type(&self, instance_type: &str) -> Self {
        Self {
            instance_type: Some(instance_type.to_string()),
            ..self.clone()
        }
    }

    /// Declared public-IP assignment, as seen from the first interface
    pub fn assign_public_ip(&self) -> Option<bool> {
        self.network_interfaces
            .first()
            .and_then(|i| i.assign_public_ip)
    }
}

/// A single filter value or a list of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValues {
    One(String),
    Many(Vec<String>),
}

impl FilterValues {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(v) => vec![v],
            Self::Many(v) => v,
        }
    }
}

/// On-disk layout of a declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeclarationDocument {
    pub state: LifecycleTarget,
    pub instance_ids: Vec<String>,
    pub count: Option<u32>,
    pub exact_count: Option<u32>,
    pub filters: Option<BTreeMap<String, FilterValues>>,
    pub wait: bool,
    pub wait_timeout: u64,
    #[serde(flatten)]
    pub attributes: InstanceAttributes,
}

impl Default for DeclarationDocument {
    fn default() -> Self {
        Self {
            state: LifecycleTarget::default(),
            instance_ids: Vec::new(),
            count: None,
            exact_count: None,
            filters: None,
            wait: true,
            wait_timeout: DEFAULT_WAIT_TIMEOUT_SECS,
            attributes: InstanceAttributes::default(),
        }
    }
}

/// The immutable input of a reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DeclarationDocument", into = "DeclarationDocument")]
pub struct ResourceDeclaration {
    pub state: LifecycleTarget,
    pub population: Population,
    pub attributes: InstanceAttributes,
    /// Raw filters that replace the derived match filter
    pub filters: Option<BTreeMap<String, Vec<String>>>,
    pub wait: WaitPolicy,
}

impl ResourceDeclaration {
    /// Declaration with no population constraint and default attributes
    pub fn new(state: LifecycleTarget) -> Self {
        Self {
            state,
            population: Population::Unconstrained { count: None },
            attributes: InstanceAttributes::default(),
            filters: None,
            wait: WaitPolicy::default(),
        }
    }

    pub fn with_population(mut self, population: Population) -> Self {
        self.population = population;
        self
    }

    pub fn with_attributes(mut self, attributes: InstanceAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_filters(mut self, filters: BTreeMap<String, Vec<String>>) -> Self {
        self.filters = Some(filters);
        self
    }

    /// Check option combinations that can never be satisfied together
    pub fn validate(&self) -> Result<()> {
        let attrs = &self.attributes;

        if let Population::Identifiers(ids) = &self.population {
            if ids.is_empty() {
                return Err(Error::validation("instance_ids must not be empty"));
            }
            if self.filters.is_some() {
                return Err(Error::validation(
                    "filters and instance_ids are mutually exclusive",
                ));
            }
        }
        if let Population::Unconstrained { count: Some(0) } = self.population {
            return Err(Error::validation("count must be at least 1"));
        }

        if !attrs.security_groups.is_empty() && !attrs.network_interfaces_ids.is_empty() {
            return Err(Error::validation(
                "security_groups and network_interfaces_ids are mutually exclusive",
            ));
        }
        if attrs.availability_zone.is_some() && attrs.subnet_id.is_some() {
            return Err(Error::validation(
                "availability_zone and subnet_id are mutually exclusive",
            ));
        }
        if attrs.image_id.is_some() && attrs.image.is_some() {
            return Err(Error::validation("image_id and image are mutually exclusive"));
        }
        if self.wait.enabled && self.wait.timeout.is_zero() {
            return Err(Error::validation("wait_timeout must be greater than zero"));
        }

        Ok(())
    }
}

impl TryFrom<DeclarationDocument> for ResourceDeclaration {
    type Error = Error;

    fn try_from(doc: DeclarationDocument) -> Result<Self> {
        let population = match (doc.exact_count, doc.count, doc.instance_ids.is_empty()) {
            (Some(_), Some(_), _) => {
                return Err(Error::validation("exact_count and count are mutually exclusive"));
            }
            (Some(_), None, false) => {
                return Err(Error::validation(
                    "exact_count and instance_ids are mutually exclusive",
                ));
            }
            (None, Some(_), false) => {
                return Err(Error::validation(
                    "count and instance_ids are mutually exclusive",
                ));
            }
            (Some(exact), None, true) => Population::ExactCount(exact),
            (None, count, true) => Population::Unconstrained { count },
            (None, None, false) => Population::Identifiers(doc.instance_ids),
        };

        let filters = doc.filters.map(|f| {
            f.into_iter()
                .map(|(k, v)| (k, v.into_vec()))
                .collect::<BTreeMap<_, _>>()
        });

        let declaration = ResourceDeclaration {
            state: doc.state,
            population,
            attributes: doc.attributes,
            filters,
            wait: WaitPolicy {
                enabled: doc.wait,
                timeout: Duration::from_secs(doc.wait_timeout),
            },
        };
        declaration.validate()?;
        Ok(declaration)
    }
}

impl From<ResourceDeclaration> for DeclarationDocument {
    fn from(decl: ResourceDeclaration) -> Self {
        let (instance_ids, count, exact_count) = match decl.population {
            Population::Unconstrained { count } => (Vec::new(), count, None),
            Population::Identifiers(ids) => (ids, None, None),
            Population::ExactCount(n) => (Vec::new(), None, Some(n)),
        };
        DeclarationDocument {
            state: decl.state,
            instance_ids,
            count,
            exact_count,
            filters: decl.filters.map(|f| {
                f.into_iter()
                    .map(|(k, v)| (k, FilterValues::Many(v)))
                    .collect()
            }),
            wait: decl.wait.enabled,
            wait_timeout: decl.wait.timeout.as_secs(),
            attributes: decl.attributes,
        }
    }
}
