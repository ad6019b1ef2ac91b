//! Provider trait - the compute API the engine drives
//!
//! The engine never talks to a network transport directly. Everything it
//! reads or mutates goes through this trait, which allows us to:
//! - Plug in a real cloud client
//! - Run against the in-memory [`crate::memory::MemoryProvider`]
//! - Record and assert call order in tests

use crate::builder::CreationRequest;
use crate::diff::{AttributeChange, TagChange};
use crate::error::{Error, Result};
use crate::matcher::MatchFilter;
use crate::types::{
    AttributeValue, LiveInstance, MetadataOptions, MutableAttribute, Subnet, Vpc, WaitCondition,
};
use std::time::Duration;

/// Poll settings for a single wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// Delay between polls
    pub delay: Duration,
    /// Number of polls before giving up
    pub max_attempts: u32,
}

/// Outcome of a wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    /// Every instance met the condition
    Satisfied,
    /// The timeout elapsed with these instances still short of the condition
    TimedOut { pending: Vec<String> },
    /// No wait was performed (dry-run, or waiting disabled)
    Skipped,
}

impl WaitStatus {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied)
    }

    /// The timeout as an error value, for reporting as a warning
    pub fn timeout_error(&self, condition: WaitCondition) -> Option<Error> {
        match self {
            Self::TimedOut { pending } => Some(Error::TransitionTimeout {
                ids: pending.clone(),
                condition: condition.to_string(),
            }),
            _ => None,
        }
    }
}

/// Compute provider operations consumed by the engine
///
/// Calls are synchronous. Batch mutations return the ids the provider
/// accepted.
pub trait Provider {
    /// Describe instances by id; unknown ids are omitted, not an error
    fn find_by_ids(&self, ids: &[String]) -> Result<Vec<LiveInstance>>;

    /// Describe instances matching every filter entry
    fn find_by_filter(&self, filter: &MatchFilter) -> Result<Vec<LiveInstance>>;

    /// Read an attribute that is only exposed through a dedicated call
    fn describe_attribute(&self, id: &str, attribute: MutableAttribute) -> Result<AttributeValue>;

    /// Launch `request.count` instances of `instance_type`
    ///
    /// `None` leaves the instance type to the launch template.
    fn create(
        &self,
        request: &CreationRequest,
        instance_type: Option<&str>,
    ) -> Result<Vec<LiveInstance>>;

    fn start(&self, ids: &[String]) -> Result<Vec<String>>;

    fn stop(&self, ids: &[String]) -> Result<Vec<String>>;

    fn terminate(&self, ids: &[String]) -> Result<Vec<String>>;

    fn modify_attribute(&self, id: &str, change: &AttributeChange) -> Result<()>;

    fn modify_metadata_options(&self, id: &str, options: &MetadataOptions) -> Result<()>;

    fn update_tags(&self, id: &str, change: &TagChange) -> Result<()>;

    /// Associate an instance profile, replacing any existing association
    fn set_instance_profile(&self, id: &str, profile: &str) -> Result<()>;

    fn attach_network_interface(&self, id: &str, interface_id: &str, device_index: u32)
    -> Result<()>;

    fn default_vpc(&self) -> Result<Option<Vpc>>;

    /// Available default-for-zone subnets of a VPC
    fn default_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>>;

    fn describe_subnet(&self, subnet_id: &str) -> Result<Option<Subnet>>;

    /// Resolve security group names (or ids) to ids within a VPC
    fn security_group_ids(&self, names: &[String], vpc_id: &str) -> Result<Vec<String>>;

    /// Let time pass between polls
    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Block until every id meets `condition` or the attempts run out
    fn wait(
        &self,
        ids: &[String],
        condition: WaitCondition,
        config: &WaitConfig,
    ) -> Result<WaitStatus> {
        poll(self, ids, condition, config)
    }
}

/// Poll `find_by_ids` until every id meets `condition`
///
/// All ids are checked together with one describe call per poll, with a
/// [`Provider::pause`] between polls.
pub fn poll<P: Provider + ?Sized>(
    provider: &P,
    ids: &[String],
    condition: WaitCondition,
    config: &WaitConfig,
) -> Result<WaitStatus> {
    let mut pending: Vec<String> = ids.to_vec();
    let attempts = config.max_attempts.max(1);

    for attempt in 0..attempts {
        let found = provider.find_by_ids(ids)?;
        pending = ids
            .iter()
            .filter(|id| !condition.is_met(found.iter().find(|i| &i.id == *id)))
            .cloned()
            .collect();

        if pending.is_empty() {
            return Ok(WaitStatus::Satisfied);
        }

        log::trace!(
            "Waiting for {} ({}/{}): {} pending",
            condition,
            attempt + 1,
            attempts,
            pending.len()
        );
        if attempt + 1 < attempts {
            provider.pause(config.delay);
        }
    }

    Ok(WaitStatus::TimedOut { pending })
}
