//! Creation retry controller - capacity-aware launch across candidate types
//!
//! Every attempt of a request reuses its idempotency token, so a retry the
//! provider already honored returns the original instances instead of
//! launching duplicates.

use crate::builder::CreationRequest;
use crate::context::ReconcileContext;
use crate::declaration::InstanceAttributes;
use crate::error::{Error, ErrorCategory, Result};
use crate::provider::Provider;
use crate::types::LiveInstance;

/// Classified result of one launch attempt
#[derive(Debug)]
pub enum AttemptOutcome {
    Launched(Vec<LiveInstance>),
    /// No capacity for the candidate; try the next one
    CapacityExhausted(Error),
    /// Identity not yet visible; retry the same candidate once
    TransientAuth(Error),
    /// Anything else; give up
    Fatal(Error),
}

impl AttemptOutcome {
    pub fn classify(result: Result<Vec<LiveInstance>>) -> Self {
        match result {
            Ok(instances) => Self::Launched(instances),
            Err(err) => match err.category() {
                ErrorCategory::Capacity => Self::CapacityExhausted(err),
                ErrorCategory::TransientAuth => Self::TransientAuth(err),
                _ => Self::Fatal(err),
            },
        }
    }
}

/// What a successful launch produced
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub instances: Vec<LiveInstance>,
    /// Subtype actually launched; `None` when the launch template chose
    pub launched_type: Option<String>,
    /// Whether an alternate subtype had to be used
    pub fell_back: bool,
    /// Number of create calls issued
    pub attempts: u32,
}

impl LaunchReport {
    pub fn ids(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.id.clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.iter().any(|i| i.id == id)
    }

    /// Declared attributes with the instance type that actually launched
    pub fn resolved_attributes(&self, declared: &InstanceAttributes) -> InstanceAttributes {
        match &self.launched_type {
            Some(launched) => declared.with_instance_type(launched),
            None => declared.clone(),
        }
    }
}

/// Launch `request`, falling back through its candidate subtypes
///
/// Capacity failures advance to the next candidate; the last one is
/// returned when every candidate is exhausted. An authorization failure is
/// retried once on the same candidate after the configured delay. Every
/// other failure is returned immediately.
pub fn launch<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ReconcileContext<'_>,
    request: &CreationRequest,
) -> Result<LaunchReport> {
    let candidates = request.candidates();
    let primary = request.instance_type.as_deref().unwrap_or("launch template");
    let mut attempts = 0;
    let mut last_capacity: Option<Error> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        let instance_type = candidate.as_deref();
        let label = instance_type.unwrap_or("launch template");

        attempts += 1;
        let mut outcome = AttemptOutcome::classify(provider.create(request, instance_type));

        if let AttemptOutcome::TransientAuth(err) = outcome {
            log::warn!(
                "{err}; retrying {label} in {}s",
                ctx.settings.auth_retry_delay.as_secs()
            );
            provider.pause(ctx.settings.auth_retry_delay);
            attempts += 1;
            outcome = match AttemptOutcome::classify(provider.create(request, instance_type)) {
                AttemptOutcome::TransientAuth(err) => AttemptOutcome::Fatal(err),
                other => other,
            };
        }

        match outcome {
            AttemptOutcome::Launched(instances) => {
                let fell_back = index > 0;
                if fell_back {
                    log::warn!(
                        "Launched with alternate instance type {label} after {primary} had no capacity"
                    );
                }
                log::info!(
                    "Launched {} instance(s) of {label}",
                    instances.len()
                );
                return Ok(LaunchReport {
                    instances,
                    launched_type: candidate.clone(),
                    fell_back,
                    attempts,
                });
            }
            AttemptOutcome::CapacityExhausted(err) => {
                if let Some(next) = candidates.get(index + 1) {
                    let next = next.as_deref().unwrap_or("launch template");
                    log::warn!("{err}; trying {next}");
                    ctx.observer.on_fallback(label, next, &err.to_string());
                }
                last_capacity = Some(err);
            }
            AttemptOutcome::TransientAuth(err) | AttemptOutcome::Fatal(err) => return Err(err),
        }
    }

    Err(last_capacity.unwrap_or_else(|| Error::validation("no instance type to launch")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use crate::context::EngineSettings;
    use crate::declaration::ResourceDeclaration;
    use crate::memory::{Call, Fault, MemoryProvider, Operation};
    use crate::types::LifecycleTarget;
    use std::time::Duration;

    fn ctx() -> ReconcileContext<'static> {
        ReconcileContext::new(false).with_settings(EngineSettings {
            poll_interval: Duration::from_secs(1),
            auth_retry_delay: Duration::from_secs(10),
        })
    }

    fn request(cloud: &MemoryProvider, alternates: &[&str]) -> CreationRequest {
        let attrs = InstanceAttributes {
            name: Some("web".into()),
            image_id: Some("ami-1".into()),
            instance_type: Some("m5.large".into()),
            alternate_instance_types: alternates.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let decl = ResourceDeclaration::new(LifecycleTarget::Running).with_attributes(attrs);
        build(cloud, &decl, 0).unwrap()
    }

    fn creates(cloud: &MemoryProvider) -> Vec<(String, Option<String>)> {
        cloud
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Create {
                    token,
                    instance_type,
                } => Some((token, instance_type)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_primary_launches() {
        let cloud = MemoryProvider::with_default_network();
        let req = request(&cloud, &["m5a.large"]);
        let report = launch(&cloud, &ctx(), &req).unwrap();
        assert_eq!(report.launched_type.as_deref(), Some("m5.large"));
        assert!(!report.fell_back);
        assert_eq!(report.attempts, 1);
    }

    #[test]
    fn test_falls_back_on_capacity_with_same_token() {
        let cloud = MemoryProvider::with_default_network();
        cloud.exhaust_capacity("m5.large");
        let req = request(&cloud, &["m5a.large", "m6i.large"]);

        let report = launch(&cloud, &ctx(), &req).unwrap();
        assert_eq!(report.launched_type.as_deref(), Some("m5a.large"));
        assert!(report.fell_back);
        assert_eq!(report.instances[0].instance_type, "m5a.large");

        let attempts = creates(&cloud);
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|(token, _)| *token == req.client_token));

        let resolved = report.resolved_attributes(&InstanceAttributes {
            instance_type: Some("m5.large".into()),
            ..Default::default()
        });
        assert_eq!(resolved.instance_type.as_deref(), Some("m5a.large"));
    }

    #[test]
    fn test_all_candidates_exhausted() {
        let cloud = MemoryProvider::with_default_network();
        for t in ["m5.large", "m5a.large", "m6i.large"] {
            cloud.exhaust_capacity(t);
        }
        let req = request(&cloud, &["m5a.large", "m6i.large"]);

        let err = launch(&cloud, &ctx(), &req).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Capacity);
        assert!(err.to_string().contains("m6i.large"));
        assert_eq!(creates(&cloud).len(), 3);
        assert!(cloud.instance_ids().is_empty());
    }

    #[test]
    fn test_auth_failure_retries_same_type_once() {
        let cloud = MemoryProvider::with_default_network();
        cloud.delay_instance_profile("web-role", 1);
        let mut req = request(&cloud, &["m5a.large"]);
        req.iam_instance_profile = Some("web-role".into());

        let report = launch(&cloud, &ctx(), &req).unwrap();
        assert_eq!(report.launched_type.as_deref(), Some("m5.large"));
        assert_eq!(report.attempts, 2);
        assert_eq!(cloud.paused(), Duration::from_secs(10));

        let attempts = creates(&cloud);
        assert_eq!(attempts[0], attempts[1]);
    }

    #[test]
    fn test_auth_retry_hitting_capacity_advances() {
        let cloud = MemoryProvider::with_default_network();
        cloud.delay_instance_profile("web-role", 1);
        cloud.exhaust_capacity("m5.large");
        let mut req = request(&cloud, &["m5a.large"]);
        req.iam_instance_profile = Some("web-role".into());

        let report = launch(&cloud, &ctx(), &req).unwrap();
        assert_eq!(report.launched_type.as_deref(), Some("m5a.large"));
        assert_eq!(report.attempts, 3);
    }

    #[test]
    fn test_persistent_auth_failure_is_fatal() {
        let cloud = MemoryProvider::with_default_network();
        cloud.delay_instance_profile("web-role", 5);
        let mut req = request(&cloud, &["m5a.large"]);
        req.iam_instance_profile = Some("web-role".into());

        let err = launch(&cloud, &ctx(), &req).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::TransientAuth);
        assert_eq!(creates(&cloud).len(), 2);
    }

    #[test]
    fn test_other_errors_fail_fast() {
        let cloud = MemoryProvider::with_default_network();
        cloud.fail_next(
            Operation::Create,
            Fault::Provider("InvalidAMIID.NotFound".into()),
        );
        let req = request(&cloud, &["m5a.large"]);

        let err = launch(&cloud, &ctx(), &req).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Fatal);
        assert_eq!(creates(&cloud).len(), 1);
    }
}
