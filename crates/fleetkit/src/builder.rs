//! Launch request builder - turns a declaration into a provider-facing creation request

use crate::declaration::{
    CpuCredits, EbsVolume, ImageSpec, InstanceAttributes, LaunchTemplateSpec, NetworkInterfaceSpec,
    Placement, Population, PrivateAddress, ResourceDeclaration, ShutdownBehavior, VolumeSpec,
};
use crate::error::{Error, Result};
use crate::provider::Provider;
use crate::types::{CpuOptions, MetadataOptions, Subnet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// gp3 baseline when iops is omitted
pub const GP3_DEFAULT_IOPS: u32 = 3000;
/// gp3 baseline when throughput is omitted
pub const GP3_DEFAULT_THROUGHPUT: u32 = 125;

/// A network interface in a creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InterfaceRequest {
    /// Attach an interface that already exists
    Existing { id: String, device_index: u32 },
    /// Create an interface together with the instance
    New {
        device_index: u32,
        subnet_id: String,
        #[serde(default)]
        assign_public_ip: Option<bool>,
        #[serde(default)]
        private_ip_address: Option<String>,
        #[serde(default)]
        private_ip_addresses: Vec<PrivateAddress>,
        #[serde(default)]
        ipv6_addresses: Vec<String>,
        delete_on_termination: bool,
        /// Security group ids, already resolved
        #[serde(default)]
        groups: Vec<String>,
        #[serde(default)]
        description: Option<String>,
    },
}

impl InterfaceRequest {
    pub fn device_index(&self) -> u32 {
        match self {
            Self::Existing { device_index, .. } | Self::New { device_index, .. } => *device_index,
        }
    }
}

/// The full payload handed to [`Provider::create`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationRequest {
    /// Idempotency token, shared by every attempt of this request
    pub client_token: String,
    /// Primary subtype; `None` defers to the launch template
    pub instance_type: Option<String>,
    pub alternate_instance_types: Vec<String>,
    pub count: u32,
    pub image_id: Option<String>,
    pub kernel_id: Option<String>,
    pub ramdisk_id: Option<String>,
    pub launch_template: Option<LaunchTemplateSpec>,
    pub key_name: Option<String>,
    pub user_data: Option<String>,
    pub network_interfaces: Vec<InterfaceRequest>,
    pub block_devices: Vec<VolumeSpec>,
    /// Applied to the instance and its volumes
    pub tags: BTreeMap<String, String>,
    pub iam_instance_profile: Option<String>,
    pub placement: Option<Placement>,
    pub detailed_monitoring: bool,
    pub cpu_credits: Option<CpuCredits>,
    pub shutdown_behavior: Option<ShutdownBehavior>,
    pub termination_protection: Option<bool>,
    pub ebs_optimized: Option<bool>,
    pub hibernation: bool,
    pub cpu_options: Option<CpuOptions>,
    pub metadata_options: Option<MetadataOptions>,
    pub license_specifications: Vec<String>,
    pub additional_info: Option<String>,
}

impl CreationRequest {
    /// Subtypes to try, in order
    ///
    /// A request without an explicit subtype has a single candidate that
    /// leaves the choice to the launch template.
    pub fn candidates(&self) -> Vec<Option<String>> {
        match &self.instance_type {
            None => vec![None],
            Some(primary) => std::iter::once(primary.clone())
                .chain(
                    self.alternate_instance_types
                        .iter()
                        .filter(|t| *t != primary)
                        .cloned(),
                )
                .map(Some)
                .collect(),
        }
    }
}

/// Number of instances a launch for this declaration creates
fn launch_count(declaration: &ResourceDeclaration, current_count: usize) -> Result<u32> {
    match &declaration.population {
        Population::Unconstrained { count } => Ok(count.unwrap_or(1)),
        Population::ExactCount(target) => {
            let current = u32::try_from(current_count).unwrap_or(u32::MAX);
            match target.checked_sub(current) {
                Some(n) if n > 0 => Ok(n),
                _ => Err(Error::validation(format!(
                    "nothing to launch: exact_count {target} with {current_count} existing"
                ))),
            }
        }
        Population::Identifiers(_) => Err(Error::validation(
            "instances cannot be launched for a fixed set of instance_ids",
        )),
    }
}

/// Build the creation request for a declaration
///
/// `current_count` is the size of the matched population; it only matters
/// for exact-count declarations. A fresh idempotency token is generated on
/// every call.
pub fn build<P: Provider + ?Sized>(
    provider: &P,
    declaration: &ResourceDeclaration,
    current_count: usize,
) -> Result<CreationRequest> {
    let attrs = &declaration.attributes;

    let (image_id, kernel_id, ramdisk_id) = resolve_image(attrs);
    if image_id.is_none() && attrs.launch_template.is_none() {
        return Err(Error::validation(
            "an image_id or image.id is required to launch, or use a launch_template",
        ));
    }
    if let Some(template) = &attrs.launch_template {
        if template.id.is_none() && template.name.is_none() {
            return Err(Error::validation(
                "launch_template requires either an id or a name",
            ));
        }
    }
    if attrs.instance_type.is_none() && attrs.launch_template.is_none() {
        return Err(Error::validation(
            "at least one of instance_type and launch_template is required to launch",
        ));
    }

    if attrs.hibernation_options && !volumes_support_hibernation(&attrs.volumes) {
        return Err(Error::validation(
            "hibernation requires every volume to be an encrypted EBS volume",
        ));
    }

    let count = launch_count(declaration, current_count)?;
    validate_network(attrs, count)?;

    // Interfaces first: the default subnet they resolve feeds group discovery
    let network_interfaces = build_interfaces(provider, attrs)?;
    let block_devices = build_volumes(&attrs.volumes);

    let mut tags = attrs.tags.clone().unwrap_or_default();
    if let Some(name) = &attrs.name {
        tags.insert("Name".to_string(), name.clone());
    }

    let request = CreationRequest {
        client_token: uuid::Uuid::new_v4().simple().to_string(),
        instance_type: attrs.instance_type.clone(),
        alternate_instance_types: attrs.alternate_instance_types.clone(),
        count,
        image_id,
        kernel_id,
        ramdisk_id,
        launch_template: attrs.launch_template.clone(),
        key_name: attrs.key_name.clone(),
        user_data: attrs.user_data.clone(),
        network_interfaces,
        block_devices,
        tags,
        iam_instance_profile: attrs.iam_instance_profile.clone(),
        placement: attrs.placement.clone(),
        detailed_monitoring: attrs.detailed_monitoring.unwrap_or(false),
        cpu_credits: attrs.cpu_credit_specification,
        shutdown_behavior: attrs.instance_initiated_shutdown_behavior,
        termination_protection: attrs.termination_protection,
        ebs_optimized: attrs.ebs_optimized,
        hibernation: attrs.hibernation_options,
        cpu_options: attrs.cpu_options,
        metadata_options: attrs.metadata_options.clone(),
        license_specifications: attrs.license_specifications.clone(),
        additional_info: attrs.additional_info.clone(),
    };

    log::debug!(
        "Built creation request for {} instance(s), token {}",
        request.count,
        request.client_token
    );
    Ok(request)
}

fn resolve_image(attrs: &InstanceAttributes) -> (Option<String>, Option<String>, Option<String>) {
    if let Some(id) = &attrs.image_id {
        return (Some(id.clone()), None, None);
    }
    match &attrs.image {
        Some(ImageSpec { id, kernel, ramdisk }) => (id.clone(), kernel.clone(), ramdisk.clone()),
        None => (None, None, None),
    }
}

fn volumes_support_hibernation(volumes: &[VolumeSpec]) -> bool {
    volumes
        .iter()
        .all(|v| v.ebs.as_ref().and_then(|e| e.encrypted).unwrap_or(false))
}

/// Reject interface layouts the provider would refuse or resolve ambiguously
pub fn validate_network(attrs: &InstanceAttributes, count: u32) -> Result<()> {
    let interfaces = &attrs.network_interfaces;
    let total = interfaces.len() + attrs.network_interfaces_ids.len();

    if total > 1 && interfaces.iter().any(|i| i.assign_public_ip == Some(true)) {
        return Err(Error::validation(
            "assign_public_ip cannot be true with multiple network interfaces",
        ));
    }

    for interface in interfaces {
        let primaries = interface
            .private_ip_addresses
            .iter()
            .filter(|a| a.primary == Some(true))
            .count();
        if primaries > 1 {
            return Err(Error::validation(
                "only one primary private IP address can be specified per network interface",
            ));
        }
    }

    if count > 1 {
        let checks: [(&str, fn(&NetworkInterfaceSpec) -> bool); 3] = [
            ("private_ip_address", |i| i.private_ip_address.is_some()),
            ("private_ip_addresses", |i| !i.private_ip_addresses.is_empty()),
            ("ipv6_addresses", |i| !i.ipv6_addresses.is_empty()),
        ];
        for (option, is_set) in checks {
            if interfaces.iter().any(is_set) {
                return Err(Error::validation(format!(
                    "{option} cannot be specified when launching more than one instance"
                )));
            }
        }
    }

    Ok(())
}

fn build_interfaces<P: Provider + ?Sized>(
    provider: &P,
    attrs: &InstanceAttributes,
) -> Result<Vec<InterfaceRequest>> {
    let mut requests: Vec<InterfaceRequest> = attrs
        .network_interfaces_ids
        .iter()
        .map(|eni| InterfaceRequest::Existing {
            id: eni.id.clone(),
            device_index: eni.device_index,
        })
        .collect();

    if !attrs.network_interfaces.is_empty() {
        for spec in &attrs.network_interfaces {
            requests.push(new_interface(provider, attrs, spec)?);
        }
    } else if attrs.network_interfaces_ids.is_empty() && attrs.launch_template.is_none() {
        requests.push(new_interface(provider, attrs, &NetworkInterfaceSpec::default())?);
    }

    Ok(requests)
}

fn new_interface<P: Provider + ?Sized>(
    provider: &P,
    attrs: &InstanceAttributes,
    spec: &NetworkInterfaceSpec,
) -> Result<InterfaceRequest> {
    let subnet_id = match spec.subnet_id.as_ref().or(attrs.subnet_id.as_ref()) {
        Some(id) => id.clone(),
        None => default_subnet(provider, attrs.availability_zone.as_deref())?.id,
    };

    let names = if spec.groups.is_empty() {
        &attrs.security_groups
    } else {
        &spec.groups
    };
    let groups = if names.is_empty() {
        Vec::new()
    } else {
        discover_security_groups(provider, names, &subnet_id)?
    };

    Ok(InterfaceRequest::New {
        device_index: spec.device_index,
        subnet_id,
        assign_public_ip: spec.assign_public_ip.filter(|assign| *assign),
        private_ip_address: spec.private_ip_address.clone(),
        private_ip_addresses: spec.private_ip_addresses.clone(),
        ipv6_addresses: spec.ipv6_addresses.clone(),
        delete_on_termination: spec.delete_on_termination,
        groups,
        description: spec.description.clone(),
    })
}

/// Resolve security group names to ids within the subnet's parent VPC
pub fn discover_security_groups<P: Provider + ?Sized>(
    provider: &P,
    names: &[String],
    subnet_id: &str,
) -> Result<Vec<String>> {
    let subnet = provider.describe_subnet(subnet_id)?.ok_or_else(|| {
        Error::validation(format!(
            "could not find subnet {subnet_id} to associate security groups"
        ))
    })?;
    provider.security_group_ids(names, &subnet.vpc_id)
}

/// Pick the account's default subnet
///
/// Uses the default VPC's default-for-zone subnets. The subnet in
/// `availability_zone` wins when there is one; otherwise the subnets are
/// sorted by zone and the first is taken.
pub fn default_subnet<P: Provider + ?Sized>(
    provider: &P,
    availability_zone: Option<&str>,
) -> Result<Subnet> {
    let vpc = provider.default_vpc()?.ok_or_else(|| {
        Error::validation("no default VPC could be found; a subnet_id is required")
    })?;

    let mut subnets = provider.default_subnets(&vpc.id)?;
    if let Some(zone) = availability_zone {
        if let Some(pos) = subnets.iter().position(|s| s.availability_zone == zone) {
            return Ok(subnets.swap_remove(pos));
        }
    }

    subnets.sort_by(|a, b| a.availability_zone.cmp(&b.availability_zone));
    subnets.into_iter().next().ok_or_else(|| {
        Error::validation(format!(
            "no default subnet could be found in {}; a subnet_id is required",
            vpc.id
        ))
    })
}

/// Fill in the gp3 baseline for volumes that omit it
pub fn build_volumes(volumes: &[VolumeSpec]) -> Vec<VolumeSpec> {
    volumes
        .iter()
        .map(|volume| {
            let ebs = volume.ebs.as_ref().map(|ebs| {
                if ebs.volume_type.as_deref() == Some("gp3") {
                    EbsVolume {
                        iops: ebs.iops.filter(|v| *v > 0).or(Some(GP3_DEFAULT_IOPS)),
                        throughput: ebs.throughput.or(Some(GP3_DEFAULT_THROUGHPUT)),
                        ..ebs.clone()
                    }
                } else {
                    ebs.clone()
                }
            });
            VolumeSpec {
                ebs,
                ..volume.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::InterfaceAttachment;
    use crate::error::ErrorCategory;
    use crate::memory::{Call, Fault, MemoryProvider, Operation};
    use crate::types::LifecycleTarget;

    fn web() -> InstanceAttributes {
        InstanceAttributes {
            name: Some("web".into()),
            image_id: Some("ami-1".into()),
            instance_type: Some("t3.micro".into()),
            ..Default::default()
        }
    }

    fn declaration(attributes: InstanceAttributes) -> ResourceDeclaration {
        ResourceDeclaration::new(LifecycleTarget::Running).with_attributes(attributes)
    }

    #[test]
    fn test_requires_image_or_template() {
        let cloud = MemoryProvider::with_default_network();
        let attrs = InstanceAttributes {
            image_id: None,
            ..web()
        };
        let err = build(&cloud, &declaration(attrs), 0).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(cloud.calls().is_empty(), "validation must precede provider calls");
    }

    #[test]
    fn test_requires_instance_type_or_template() {
        let cloud = MemoryProvider::with_default_network();
        let attrs = InstanceAttributes {
            instance_type: None,
            ..web()
        };
        let err = build(&cloud, &declaration(attrs), 0).unwrap_err();
        assert!(err.to_string().contains("instance_type"));
        assert!(cloud.calls().is_empty(), "validation must precede provider calls");
    }

    #[test]
    fn test_missing_instance_type_wins_over_network_lookup() {
        let cloud = MemoryProvider::with_default_network();
        let attrs = InstanceAttributes {
            instance_type: None,
            security_groups: vec!["does-not-exist".into()],
            ..web()
        };
        let err = build(&cloud, &declaration(attrs), 0).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(cloud.calls().is_empty());
    }

    #[test]
    fn test_default_subnet_lookup_failure_is_surfaced() {
        let cloud = MemoryProvider::with_default_network();
        cloud.fail_next(
            Operation::DefaultSubnets,
            Fault::Query("RequestLimitExceeded".into()),
        );
        let err = build(&cloud, &declaration(web()), 0).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Query);
        assert!(err.to_string().contains("default_subnets"));
        assert!(!cloud.calls().iter().any(|c| matches!(c, Call::Create { .. })));
    }

    #[test]
    fn test_launch_template_needs_id_or_name() {
        let cloud = MemoryProvider::with_default_network();
        let attrs = InstanceAttributes {
            launch_template: Some(LaunchTemplateSpec {
                version: Some("3".into()),
                ..Default::default()
            }),
            ..web()
        };
        assert!(build(&cloud, &declaration(attrs), 0).is_err());
    }

    #[test]
    fn test_default_subnet_sorted_by_zone() {
        let cloud = MemoryProvider::with_default_network();
        let subnet = default_subnet(&cloud, None).unwrap();
        assert_eq!(subnet.availability_zone, "us-east-1a");

        let subnet = default_subnet(&cloud, Some("us-east-1b")).unwrap();
        assert_eq!(subnet.id, "subnet-b");

        let subnet = default_subnet(&cloud, Some("eu-west-9z")).unwrap();
        assert_eq!(subnet.id, "subnet-a");
    }

    #[test]
    fn test_missing_default_vpc() {
        let cloud = MemoryProvider::new();
        let err = default_subnet(&cloud, None).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_single_interface_uses_default_subnet_and_groups() {
        let cloud = MemoryProvider::with_default_network();
        let attrs = InstanceAttributes {
            security_groups: vec!["web".into()],
            ..web()
        };
        let request = build(&cloud, &declaration(attrs), 0).unwrap();
        assert_eq!(request.count, 1);
        assert_eq!(request.tags.get("Name").map(String::as_str), Some("web"));
        match &request.network_interfaces[..] {
            [InterfaceRequest::New {
                subnet_id, groups, ..
            }] => {
                assert_eq!(subnet_id, "subnet-a");
                assert_eq!(groups, &vec!["sg-web".to_string()]);
            }
            other => panic!("unexpected interfaces: {other:?}"),
        }
    }

    #[test]
    fn test_existing_interfaces_are_attached_verbatim() {
        let cloud = MemoryProvider::with_default_network();
        let attrs = InstanceAttributes {
            network_interfaces_ids: vec![InterfaceAttachment {
                id: "eni-1".into(),
                device_index: 0,
            }],
            ..web()
        };
        let request = build(&cloud, &declaration(attrs), 0).unwrap();
        assert_eq!(
            request.network_interfaces,
            vec![InterfaceRequest::Existing {
                id: "eni-1".into(),
                device_index: 0
            }]
        );
    }

    #[test]
    fn test_exact_count_launches_difference() {
        let cloud = MemoryProvider::with_default_network();
        let decl = declaration(web()).with_population(Population::ExactCount(5));
        assert_eq!(build(&cloud, &decl, 3).unwrap().count, 2);
        assert!(build(&cloud, &decl, 5).is_err());
    }

    #[test]
    fn test_multiple_public_ips_rejected() {
        let attrs = InstanceAttributes {
            network_interfaces: vec![
                NetworkInterfaceSpec {
                    assign_public_ip: Some(true),
                    ..Default::default()
                },
                NetworkInterfaceSpec {
                    device_index: 1,
                    ..Default::default()
                },
            ],
            ..web()
        };
        assert!(validate_network(&attrs, 1).is_err());
    }

    #[test]
    fn test_single_primary_address_per_interface() {
        let address = |ip: &str| PrivateAddress {
            private_ip_address: ip.into(),
            primary: Some(true),
        };
        let attrs = InstanceAttributes {
            network_interfaces: vec![NetworkInterfaceSpec {
                private_ip_addresses: vec![address("10.0.0.5"), address("10.0.0.6")],
                ..Default::default()
            }],
            ..web()
        };
        let err = validate_network(&attrs, 1).unwrap_err();
        assert!(err.to_string().contains("primary"));
    }

    #[test]
    fn test_private_addresses_need_single_instance() {
        let attrs = InstanceAttributes {
            network_interfaces: vec![NetworkInterfaceSpec {
                private_ip_address: Some("10.0.0.5".into()),
                ..Default::default()
            }],
            ..web()
        };
        assert!(validate_network(&attrs, 1).is_ok());
        let err = validate_network(&attrs, 2).unwrap_err();
        assert!(err.to_string().contains("private_ip_address"));
    }

    #[test]
    fn test_gp3_defaults() {
        let volumes = vec![VolumeSpec {
            device_name: "/dev/sda1".into(),
            ebs: Some(EbsVolume {
                volume_type: Some("gp3".into()),
                volume_size: Some(20),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let built = build_volumes(&volumes);
        let ebs = built[0].ebs.as_ref().unwrap();
        assert_eq!(ebs.iops, Some(GP3_DEFAULT_IOPS));
        assert_eq!(ebs.throughput, Some(GP3_DEFAULT_THROUGHPUT));
    }

    #[test]
    fn test_hibernation_requires_encryption() {
        let cloud = MemoryProvider::with_default_network();
        let attrs = InstanceAttributes {
            hibernation_options: true,
            volumes: vec![VolumeSpec {
                device_name: "/dev/sda1".into(),
                ebs: Some(EbsVolume::default()),
                ..Default::default()
            }],
            ..web()
        };
        assert!(build(&cloud, &declaration(attrs), 0).is_err());
    }

    #[test]
    fn test_tokens_differ_between_builds() {
        let cloud = MemoryProvider::with_default_network();
        let decl = declaration(web());
        let a = build(&cloud, &decl, 0).unwrap();
        let b = build(&cloud, &decl, 0).unwrap();
        assert_ne!(a.client_token, b.client_token);
    }

    #[test]
    fn test_candidates_in_declared_order() {
        let cloud = MemoryProvider::with_default_network();
        let attrs = InstanceAttributes {
            alternate_instance_types: vec!["t3.small".into(), "t3.micro".into(), "t3a.micro".into()],
            ..web()
        };
        let request = build(&cloud, &declaration(attrs), 0).unwrap();
        assert_eq!(
            request.candidates(),
            vec![
                Some("t3.micro".to_string()),
                Some("t3.small".to_string()),
                Some("t3a.micro".to_string())
            ]
        );
    }
}
