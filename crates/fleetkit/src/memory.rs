//! In-memory simulated provider
//!
//! Holds networks, security groups, instance profiles and instances, and
//! simulates the provider's asynchronous transitions: every [`pause`]
//! advances each transitional instance one step, and a running instance
//! passes its status checks one step after it starts.
//!
//! It also supports the failure modes the engine has to survive: capacity
//! exhaustion per instance type, instance profiles that only become visible
//! after a number of launch attempts, instances that never settle, and
//! one-shot faults per operation. Every call is recorded in order.
//!
//! The cloud state serializes to JSON so a front end can keep it between
//! passes.
//!
//! [`pause`]: Provider::pause

use crate::builder::{CreationRequest, InterfaceRequest};
use crate::diff::{AttributeChange, TagChange};
use crate::error::{Error, Result};
use crate::matcher::MatchFilter;
use crate::provider::{Provider, WaitConfig, WaitStatus, poll};
use crate::types::{
    AttachedInterface, AttributeValue, InstanceState, LiveInstance, MetadataOptions,
    MutableAttribute, Subnet, Vpc, WaitCondition,
};
use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Instance type used when a launch template picks it
const TEMPLATE_INSTANCE_TYPE: &str = "t3.micro";
/// Image used when a launch template picks it
const TEMPLATE_IMAGE_ID: &str = "ami-template";

/// A security group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub vpc_id: String,
}

/// Persisted cloud contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudState {
    pub vpcs: Vec<Vpc>,
    pub subnets: Vec<Subnet>,
    pub security_groups: Vec<SecurityGroup>,
    pub instance_profiles: BTreeSet<String>,
    /// Instances in launch order
    pub instances: Vec<LiveInstance>,
    /// Idempotency token -> instances it launched
    pub tokens: BTreeMap<String, Vec<String>>,
    /// Instance types with no capacity
    pub exhausted_types: BTreeSet<String>,
    /// Instance profile -> launch attempts before it becomes visible
    pub propagating_profiles: BTreeMap<String, u32>,
    /// Instances that never leave their current state
    pub held: BTreeSet<String>,
    pub next_id: u64,
    pub last_launch: Option<DateTime<Utc>>,
}

/// Provider operations that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    FindByIds,
    FindByFilter,
    DescribeAttribute,
    Create,
    Start,
    Stop,
    Terminate,
    ModifyAttribute,
    ModifyMetadataOptions,
    UpdateTags,
    SetInstanceProfile,
    AttachNetworkInterface,
    DefaultVpc,
    DefaultSubnets,
    DescribeSubnet,
    SecurityGroupIds,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FindByIds => "find_by_ids",
            Self::FindByFilter => "find_by_filter",
            Self::DescribeAttribute => "describe_attribute",
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Terminate => "terminate",
            Self::ModifyAttribute => "modify_attribute",
            Self::ModifyMetadataOptions => "modify_metadata_options",
            Self::UpdateTags => "update_tags",
            Self::SetInstanceProfile => "set_instance_profile",
            Self::AttachNetworkInterface => "attach_network_interface",
            Self::DefaultVpc => "default_vpc",
            Self::DefaultSubnets => "default_subnets",
            Self::DescribeSubnet => "describe_subnet",
            Self::SecurityGroupIds => "security_group_ids",
        }
    }

    fn is_read(&self) -> bool {
        matches!(
            self,
            Self::FindByIds
                | Self::FindByFilter
                | Self::DescribeAttribute
                | Self::DefaultVpc
                | Self::DefaultSubnets
                | Self::DescribeSubnet
                | Self::SecurityGroupIds
        )
    }
}

/// A scripted failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Transport or authorization failure on a read
    Query(String),
    /// Provider rejection; for launches the text is the error code
    Provider(String),
}

/// A recorded provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FindByIds(Vec<String>),
    FindByFilter(MatchFilter),
    DescribeAttribute(String, MutableAttribute),
    Create {
        token: String,
        instance_type: Option<String>,
    },
    Start(Vec<String>),
    Stop(Vec<String>),
    Terminate(Vec<String>),
    ModifyAttribute(String, AttributeChange),
    ModifyMetadataOptions(String),
    UpdateTags(String, TagChange),
    SetInstanceProfile(String, String),
    AttachNetworkInterface(String, String),
    DefaultVpc,
    DefaultSubnets(String),
    DescribeSubnet(String),
    SecurityGroupIds(Vec<String>, String),
    Wait(Vec<String>, WaitCondition),
}

#[derive(Debug, Default)]
struct Inner {
    state: CloudState,
    faults: VecDeque<(Operation, Fault)>,
    calls: Vec<Call>,
    paused: Duration,
}

impl Inner {
    fn take_fault(&mut self, operation: Operation) -> Option<Fault> {
        let pos = self.faults.iter().position(|(op, _)| *op == operation)?;
        self.faults.remove(pos).map(|(_, fault)| fault)
    }

    /// Record the call and fail it if a fault is scripted
    fn enter(&mut self, operation: Operation, call: Call) -> Result<()> {
        self.calls.push(call);
        match self.take_fault(operation) {
            None => Ok(()),
            Some(Fault::Query(message)) => Err(Error::query(operation.as_str(), message)),
            Some(Fault::Provider(message)) if operation.is_read() => {
                Err(Error::query(operation.as_str(), message))
            }
            Some(Fault::Provider(message)) => Err(Error::provider(operation.as_str(), message)),
        }
    }

    fn instance(&self, id: &str) -> Option<&LiveInstance> {
        self.state.instances.iter().find(|i| i.id == id)
    }

    fn instance_mut(&mut self, id: &str) -> Result<&mut LiveInstance> {
        self.state
            .instances
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| not_found(id))
    }

    fn subnet(&self, id: &str) -> Option<&Subnet> {
        self.state.subnets.iter().find(|s| s.id == id)
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.state.next_id += 1;
        format!("{prefix}-{:08x}", self.state.next_id)
    }

    /// Launch times strictly increase so the age order is total
    fn next_launch_time(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let time = match self.state.last_launch {
            Some(last) if last >= now => last + TimeDelta::seconds(1),
            _ => now,
        };
        self.state.last_launch = Some(time);
        time
    }

    fn default_group(&self, vpc_id: &str) -> Option<String> {
        self.state
            .security_groups
            .iter()
            .find(|g| g.vpc_id == vpc_id && g.name == "default")
            .map(|g| g.id.clone())
    }

    fn advance(&mut self) {
        let held = self.state.held.clone();
        for instance in &mut self.state.instances {
            if held.contains(&instance.id) {
                continue;
            }
            match instance.state {
                InstanceState::Pending => instance.state = InstanceState::Running,
                InstanceState::Stopping => instance.state = InstanceState::Stopped,
                InstanceState::ShuttingDown => instance.state = InstanceState::Terminated,
                InstanceState::Running => instance.status_checks_passed = true,
                InstanceState::Stopped | InstanceState::Terminated => {}
            }
        }
    }

    fn transition(
        &mut self,
        ids: &[String],
        from: &[InstanceState],
        to: InstanceState,
    ) -> Result<Vec<String>> {
        let mut accepted = Vec::new();
        for id in ids {
            let instance = self.instance_mut(id)?;
            if instance.state == to {
                accepted.push(id.clone());
                continue;
            }
            if !from.contains(&instance.state) {
                return Err(Error::provider(
                    "transition",
                    format!(
                        "IncorrectInstanceState: {id} is {} and cannot become {to}",
                        instance.state
                    ),
                ));
            }
            instance.state = to;
            instance.status_checks_passed = false;
            accepted.push(id.clone());
        }
        Ok(accepted)
    }

    fn launch_one(
        &mut self,
        request: &CreationRequest,
        instance_type: Option<&str>,
    ) -> LiveInstance {
        let id = self.next_id("i");
        let launch_time = self.next_launch_time();

        let fallback_subnet = self
            .state
            .vpcs
            .iter()
            .find(|v| v.is_default)
            .and_then(|vpc| {
                self.state
                    .subnets
                    .iter()
                    .filter(|s| s.vpc_id == vpc.id && s.default_for_az)
                    .min_by(|a, b| a.availability_zone.cmp(&b.availability_zone))
            })
            .map(|s| s.id.clone())
            .unwrap_or_default();

        let mut interfaces = Vec::new();
        let mut public = false;
        for interface in &request.network_interfaces {
            match interface {
                InterfaceRequest::Existing { id, device_index } => {
                    interfaces.push(AttachedInterface {
                        id: id.clone(),
                        device_index: *device_index,
                        subnet_id: fallback_subnet.clone(),
                        security_groups: Vec::new(),
                        private_ip: None,
                    });
                }
                InterfaceRequest::New {
                    device_index,
                    subnet_id,
                    assign_public_ip,
                    private_ip_address,
                    groups,
                    ..
                } => {
                    public |= assign_public_ip.unwrap_or(false);
                    let eni = self.next_id("eni");
                    interfaces.push(AttachedInterface {
                        id: eni,
                        device_index: *device_index,
                        subnet_id: subnet_id.clone(),
                        security_groups: groups.clone(),
                        private_ip: private_ip_address.clone(),
                    });
                }
            }
        }
        interfaces.sort_by_key(|i| i.device_index);

        let subnet_id = interfaces
            .first()
            .map(|i| i.subnet_id.clone())
            .unwrap_or(fallback_subnet);
        let subnet = self.subnet(&subnet_id).cloned();
        let vpc_id = subnet.as_ref().map(|s| s.vpc_id.clone());

        let mut security_groups = interfaces
            .first()
            .map(|i| i.security_groups.clone())
            .unwrap_or_default();
        if security_groups.is_empty() {
            if let Some(group) = vpc_id.as_deref().and_then(|v| self.default_group(v)) {
                security_groups.push(group);
            }
        }

        let metadata_options = match &request.metadata_options {
            Some(declared) => MetadataOptions::provider_defaults().merged_with(declared),
            None => MetadataOptions::provider_defaults(),
        };

        LiveInstance {
            id: id.clone(),
            state: InstanceState::Pending,
            instance_type: instance_type.unwrap_or(TEMPLATE_INSTANCE_TYPE).to_string(),
            image_id: Some(
                request
                    .image_id
                    .clone()
                    .unwrap_or_else(|| TEMPLATE_IMAGE_ID.to_string()),
            ),
            launch_time,
            vpc_id,
            subnet_id: Some(subnet_id),
            availability_zone: subnet.map(|s| s.availability_zone),
            network_interfaces: interfaces,
            security_groups,
            source_dest_check: true,
            ebs_optimized: request.ebs_optimized.unwrap_or(false),
            termination_protection: request.termination_protection.unwrap_or(false),
            metadata_options,
            instance_profile: request.iam_instance_profile.clone(),
            tags: request.tags.clone(),
            cpu_options: request.cpu_options,
            public_dns_name: public.then(|| format!("{id}.compute.example")),
            key_name: request.key_name.clone(),
            status_checks_passed: false,
        }
    }
}

fn not_found(id: &str) -> Error {
    Error::provider(
        "lookup",
        format!("InvalidInstanceID.NotFound: the instance {id} does not exist"),
    )
}

fn matches_filter(instance: &LiveInstance, key: &str, values: &[String]) -> Result<bool> {
    let any = |candidate: Option<&str>| candidate.is_some_and(|c| values.iter().any(|v| v == c));

    let matched = if let Some(tag) = key.strip_prefix("tag:") {
        any(instance.tags.get(tag).map(String::as_str))
    } else {
        match key {
            "instance-state-name" => any(Some(instance.state.as_str())),
            "instance-id" => any(Some(&instance.id)),
            "instance-type" => any(Some(&instance.instance_type)),
            "image-id" => any(instance.image_id.as_deref()),
            "subnet-id" => any(instance.subnet_id.as_deref()),
            "vpc-id" => any(instance.vpc_id.as_deref()),
            "availability-zone" => any(instance.availability_zone.as_deref()),
            "network-interface.network-interface-id" => instance
                .network_interfaces
                .iter()
                .any(|i| any(Some(&i.id))),
            other => {
                return Err(Error::query(
                    "find_by_filter",
                    format!("InvalidParameterValue: unsupported filter '{other}'"),
                ));
            }
        }
    };
    Ok(matched)
}

/// Simulated provider
#[derive(Debug, Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
}

impl MemoryProvider {
    /// An empty cloud with no networks
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: CloudState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                ..Default::default()
            }),
        }
    }

    /// A cloud with a default VPC, three default subnets and a few groups
    pub fn with_default_network() -> Self {
        let subnet = |id: &str, vpc: &str, zone: &str, default: bool| Subnet {
            id: id.to_string(),
            vpc_id: vpc.to_string(),
            availability_zone: zone.to_string(),
            default_for_az: default,
        };
        let group = |id: &str, name: &str, vpc: &str| SecurityGroup {
            id: id.to_string(),
            name: name.to_string(),
            vpc_id: vpc.to_string(),
        };

        Self::from_state(CloudState {
            vpcs: vec![
                Vpc {
                    id: "vpc-default".into(),
                    is_default: true,
                },
                Vpc {
                    id: "vpc-app".into(),
                    is_default: false,
                },
            ],
            subnets: vec![
                subnet("subnet-c", "vpc-default", "us-east-1c", true),
                subnet("subnet-b", "vpc-default", "us-east-1b", true),
                subnet("subnet-a", "vpc-default", "us-east-1a", true),
                subnet("subnet-app", "vpc-app", "us-east-1a", false),
            ],
            security_groups: vec![
                group("sg-default", "default", "vpc-default"),
                group("sg-web", "web", "vpc-default"),
                group("sg-db", "db", "vpc-default"),
                group("sg-app", "app", "vpc-app"),
            ],
            instance_profiles: BTreeSet::from(["web-role".to_string()]),
            ..Default::default()
        })
    }

    /// Load a saved cloud, or start from the default network
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::with_default_network());
        }
        let content = std::fs::read_to_string(path)?;
        let state: CloudState = serde_json::from_str(&content)?;
        Ok(Self::from_state(state))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.lock().state)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CloudState {
        self.lock().state.clone()
    }

    /// Add a running-in-`state` instance named `name` in `subnet-a`
    pub fn seed_instance(&self, name: &str, state: InstanceState) -> String {
        let mut inner = self.lock();
        let id = inner.next_id("i");
        let launch_time = inner.next_launch_time();
        let eni = inner.next_id("eni");
        let groups = inner.default_group("vpc-default").into_iter().collect::<Vec<_>>();
        inner.state.instances.push(LiveInstance {
            id: id.clone(),
            state,
            instance_type: "t3.micro".into(),
            image_id: Some("ami-1".into()),
            launch_time,
            vpc_id: Some("vpc-default".into()),
            subnet_id: Some("subnet-a".into()),
            availability_zone: Some("us-east-1a".into()),
            network_interfaces: vec![AttachedInterface {
                id: eni,
                device_index: 0,
                subnet_id: "subnet-a".into(),
                security_groups: groups.clone(),
                private_ip: None,
            }],
            security_groups: groups,
            source_dest_check: true,
            ebs_optimized: false,
            termination_protection: false,
            metadata_options: MetadataOptions::provider_defaults(),
            instance_profile: None,
            tags: BTreeMap::from([("Name".to_string(), name.to_string())]),
            cpu_options: None,
            public_dns_name: None,
            key_name: None,
            status_checks_passed: state == InstanceState::Running,
        });
        id
    }

    /// Snapshot of one instance without recording a call
    pub fn instance(&self, id: &str) -> Option<LiveInstance> {
        self.lock().instance(id).cloned()
    }

    /// Every instance id, destroyed ones included, in launch order
    pub fn instance_ids(&self) -> Vec<String> {
        self.lock().state.instances.iter().map(|i| i.id.clone()).collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Total simulated time paused
    pub fn paused(&self) -> Duration {
        self.lock().paused
    }

    /// Fail the next call of `operation`
    pub fn fail_next(&self, operation: Operation, fault: Fault) {
        self.lock().faults.push_back((operation, fault));
    }

    /// Make launches of `instance_type` fail for lack of capacity
    pub fn exhaust_capacity(&self, instance_type: &str) {
        self.lock()
            .state
            .exhausted_types
            .insert(instance_type.to_string());
    }

    /// Register `profile`, hidden from the first `attempts` launches using it
    pub fn delay_instance_profile(&self, profile: &str, attempts: u32) {
        let mut inner = self.lock();
        inner.state.instance_profiles.insert(profile.to_string());
        inner
            .state
            .propagating_profiles
            .insert(profile.to_string(), attempts);
    }

    /// Freeze an instance in its current state
    pub fn hold(&self, id: &str) {
        self.lock().state.held.insert(id.to_string());
    }
}

impl Provider for MemoryProvider {
    fn find_by_ids(&self, ids: &[String]) -> Result<Vec<LiveInstance>> {
        let mut inner = self.lock();
        inner.enter(Operation::FindByIds, Call::FindByIds(ids.to_vec()))?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.instance(id).cloned())
            .collect())
    }

    fn find_by_filter(&self, filter: &MatchFilter) -> Result<Vec<LiveInstance>> {
        let mut inner = self.lock();
        inner.enter(Operation::FindByFilter, Call::FindByFilter(filter.clone()))?;

        let mut found = Vec::new();
        for instance in &inner.state.instances {
            let mut keep = true;
            for (key, values) in filter.iter() {
                if !matches_filter(instance, key, values)? {
                    keep = false;
                    break;
                }
            }
            if keep {
                found.push(instance.clone());
            }
        }
        Ok(found)
    }

    fn describe_attribute(&self, id: &str, attribute: MutableAttribute) -> Result<AttributeValue> {
        let mut inner = self.lock();
        inner.enter(
            Operation::DescribeAttribute,
            Call::DescribeAttribute(id.to_string(), attribute),
        )?;
        let live = inner
            .instance(id)
            .ok_or_else(|| Error::query("describe_attribute", not_found(id).to_string()))?;

        Ok(match attribute {
            MutableAttribute::InstanceType => AttributeValue::Text(live.instance_type.clone()),
            MutableAttribute::EbsOptimized => AttributeValue::Flag(live.ebs_optimized),
            MutableAttribute::DisableApiTermination => {
                AttributeValue::Flag(live.termination_protection)
            }
            MutableAttribute::GroupSet => {
                AttributeValue::Groups(live.security_groups.iter().cloned().collect())
            }
            MutableAttribute::SourceDestCheck => AttributeValue::Flag(live.source_dest_check),
        })
    }

    fn create(
        &self,
        request: &CreationRequest,
        instance_type: Option<&str>,
    ) -> Result<Vec<LiveInstance>> {
        let mut inner = self.lock();
        inner.calls.push(Call::Create {
            token: request.client_token.clone(),
            instance_type: instance_type.map(str::to_string),
        });
        let label = instance_type.unwrap_or(TEMPLATE_INSTANCE_TYPE);

        if let Some(ids) = inner.state.tokens.get(&request.client_token).cloned() {
            return Ok(ids
                .iter()
                .filter_map(|id| inner.instance(id).cloned())
                .collect());
        }

        if let Some(fault) = inner.take_fault(Operation::Create) {
            let message = match &fault {
                Fault::Query(m) | Fault::Provider(m) => m.clone(),
            };
            return Err(Error::from_launch_code(&message, &message, label));
        }

        if let Some(profile) = &request.iam_instance_profile {
            let remaining = inner.state.propagating_profiles.get(profile).copied();
            match remaining {
                Some(n) if n > 0 => {
                    inner
                        .state
                        .propagating_profiles
                        .insert(profile.clone(), n - 1);
                    return Err(Error::from_launch_code(
                        "InvalidParameterValue",
                        &format!("Value ({profile}) for parameter iamInstanceProfile.name is invalid. Invalid IAM Instance Profile name"),
                        label,
                    ));
                }
                Some(_) => {
                    inner.state.propagating_profiles.remove(profile);
                }
                None if !inner.state.instance_profiles.contains(profile) => {
                    return Err(Error::from_launch_code(
                        "InvalidParameterValue",
                        &format!("Value ({profile}) for parameter iamInstanceProfile.name is invalid. Invalid IAM Instance Profile name"),
                        label,
                    ));
                }
                None => {}
            }
        }

        if inner.state.exhausted_types.contains(label) {
            return Err(Error::from_launch_code(
                "InsufficientInstanceCapacity",
                &format!("We currently do not have sufficient {label} capacity in the requested Availability Zone"),
                label,
            ));
        }

        let mut launched = Vec::new();
        for _ in 0..request.count.max(1) {
            let instance = inner.launch_one(request, instance_type);
            inner.state.instances.push(instance.clone());
            launched.push(instance);
        }
        let ids = launched.iter().map(|i| i.id.clone()).collect();
        inner
            .state
            .tokens
            .insert(request.client_token.clone(), ids);
        Ok(launched)
    }

    fn start(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut inner = self.lock();
        inner.enter(Operation::Start, Call::Start(ids.to_vec()))?;
        inner.transition(ids, &[InstanceState::Stopped], InstanceState::Pending)
    }

    fn stop(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut inner = self.lock();
        inner.enter(Operation::Stop, Call::Stop(ids.to_vec()))?;
        inner.transition(ids, &[InstanceState::Running], InstanceState::Stopping)
    }

    fn terminate(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut inner = self.lock();
        inner.enter(Operation::Terminate, Call::Terminate(ids.to_vec()))?;
        for id in ids {
            if inner.instance_mut(id)?.termination_protection {
                return Err(Error::provider(
                    "terminate",
                    format!("OperationNotPermitted: {id} has termination protection enabled"),
                ));
            }
        }
        inner.transition(
            ids,
            &[InstanceState::Running, InstanceState::Stopped],
            InstanceState::ShuttingDown,
        )
    }

    fn modify_attribute(&self, id: &str, change: &AttributeChange) -> Result<()> {
        let mut inner = self.lock();
        inner.enter(
            Operation::ModifyAttribute,
            Call::ModifyAttribute(id.to_string(), change.clone()),
        )?;
        let instance = inner.instance_mut(id)?;
        match change {
            AttributeChange::InstanceType(t) => {
                if instance.state != InstanceState::Stopped {
                    return Err(Error::provider(
                        "modify_attribute",
                        format!("IncorrectInstanceState: {id} must be stopped to change its type"),
                    ));
                }
                instance.instance_type = t.clone();
            }
            AttributeChange::EbsOptimized(v) => instance.ebs_optimized = *v,
            AttributeChange::TerminationProtection(v) => instance.termination_protection = *v,
            AttributeChange::SourceDestCheck(v) => instance.source_dest_check = *v,
            AttributeChange::SecurityGroups(groups) => {
                instance.security_groups = groups.clone();
                if let Some(primary) = instance.network_interfaces.first_mut() {
                    primary.security_groups = groups.clone();
                }
            }
        }
        Ok(())
    }

    fn modify_metadata_options(&self, id: &str, options: &MetadataOptions) -> Result<()> {
        let mut inner = self.lock();
        inner.enter(
            Operation::ModifyMetadataOptions,
            Call::ModifyMetadataOptions(id.to_string()),
        )?;
        let instance = inner.instance_mut(id)?;
        instance.metadata_options = instance.metadata_options.merged_with(options);
        Ok(())
    }

    fn update_tags(&self, id: &str, change: &TagChange) -> Result<()> {
        let mut inner = self.lock();
        inner.enter(
            Operation::UpdateTags,
            Call::UpdateTags(id.to_string(), change.clone()),
        )?;
        let instance = inner.instance_mut(id)?;
        for key in &change.unset {
            instance.tags.remove(key);
        }
        instance
            .tags
            .extend(change.set.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn set_instance_profile(&self, id: &str, profile: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.enter(
            Operation::SetInstanceProfile,
            Call::SetInstanceProfile(id.to_string(), profile.to_string()),
        )?;
        if !inner.state.instance_profiles.contains(profile) {
            return Err(Error::provider(
                "set_instance_profile",
                format!("NoSuchEntity: instance profile {profile} cannot be found"),
            ));
        }
        inner.instance_mut(id)?.instance_profile = Some(profile.to_string());
        Ok(())
    }

    fn attach_network_interface(
        &self,
        id: &str,
        interface_id: &str,
        device_index: u32,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.enter(
            Operation::AttachNetworkInterface,
            Call::AttachNetworkInterface(id.to_string(), interface_id.to_string()),
        )?;
        let instance = inner.instance_mut(id)?;
        if instance
            .network_interfaces
            .iter()
            .any(|i| i.device_index == device_index)
        {
            return Err(Error::provider(
                "attach_network_interface",
                format!("InvalidParameterValue: device index {device_index} is in use on {id}"),
            ));
        }
        let subnet_id = instance.subnet_id.clone().unwrap_or_default();
        instance.network_interfaces.push(AttachedInterface {
            id: interface_id.to_string(),
            device_index,
            subnet_id,
            security_groups: Vec::new(),
            private_ip: None,
        });
        Ok(())
    }

    fn default_vpc(&self) -> Result<Option<Vpc>> {
        let mut inner = self.lock();
        inner.enter(Operation::DefaultVpc, Call::DefaultVpc)?;
        Ok(inner.state.vpcs.iter().find(|v| v.is_default).cloned())
    }

    fn default_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>> {
        let mut inner = self.lock();
        inner.enter(
            Operation::DefaultSubnets,
            Call::DefaultSubnets(vpc_id.to_string()),
        )?;
        Ok(inner
            .state
            .subnets
            .iter()
            .filter(|s| s.vpc_id == vpc_id && s.default_for_az)
            .cloned()
            .collect())
    }

    fn describe_subnet(&self, subnet_id: &str) -> Result<Option<Subnet>> {
        let mut inner = self.lock();
        inner.enter(
            Operation::DescribeSubnet,
            Call::DescribeSubnet(subnet_id.to_string()),
        )?;
        Ok(inner.subnet(subnet_id).cloned())
    }

    fn security_group_ids(&self, names: &[String], vpc_id: &str) -> Result<Vec<String>> {
        let mut inner = self.lock();
        inner.enter(
            Operation::SecurityGroupIds,
            Call::SecurityGroupIds(names.to_vec(), vpc_id.to_string()),
        )?;
        names
            .iter()
            .map(|name| {
                inner
                    .state
                    .security_groups
                    .iter()
                    .find(|g| g.vpc_id == vpc_id && (g.id == *name || g.name == *name))
                    .map(|g| g.id.clone())
                    .ok_or_else(|| {
                        Error::query(
                            "security_group_ids",
                            format!("InvalidGroup.NotFound: {name} in {vpc_id}"),
                        )
                    })
            })
            .collect()
    }

    fn pause(&self, duration: Duration) {
        let mut inner = self.lock();
        inner.paused += duration;
        inner.advance();
    }

    fn wait(
        &self,
        ids: &[String],
        condition: WaitCondition,
        config: &WaitConfig,
    ) -> Result<WaitStatus> {
        self.lock()
            .calls
            .push(Call::Wait(ids.to_vec(), condition));
        poll(self, ids, condition, config)
    }
}
