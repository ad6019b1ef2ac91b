//! Pass context and observer traits
//!
//! These let the engine report progress without depending on a specific
//! terminal UI.

use crate::provider::WaitStatus;
use crate::types::WaitCondition;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default delay between wait polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Default delay before retrying a launch rejected for an unknown instance profile
pub const DEFAULT_AUTH_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Engine tuning knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Delay between polls while waiting for a condition
    pub poll_interval: Duration,
    /// Delay before the single in-place retry of a launch
    pub auth_retry_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            auth_retry_delay: DEFAULT_AUTH_RETRY_DELAY,
        }
    }
}

/// Receives notable events during a pass
///
/// Every method has a no-op default so implementors only override what
/// they render.
pub trait Observer {
    /// Called before blocking on a wait
    fn on_wait_start(&self, _ids: &[String], _condition: WaitCondition) {}

    /// Called when a wait returns
    fn on_wait_end(&self, _condition: WaitCondition, _status: &WaitStatus) {}

    /// Called when a mutation is issued (or would be, in dry-run)
    fn on_action(&self, _action: &str, _ids: &[String]) {}

    /// Called when a launch falls back to an alternate instance type
    fn on_fallback(&self, _from: &str, _to: &str, _reason: &str) {}

    /// Called for non-fatal advisories about a single instance
    fn on_advisory(&self, _id: &str, _message: &str) {}
}

/// Observer that ignores every event
pub struct NoObserver;

impl Observer for NoObserver {}

/// Context passed through every stage of a pass
pub struct ReconcileContext<'a> {
    /// Compute and report changes without issuing provider mutations
    pub dry_run: bool,
    /// Engine tuning
    pub settings: EngineSettings,
    /// Event sink
    pub observer: &'a dyn Observer,
}

impl<'a> ReconcileContext<'a> {
    /// Create a context with default settings and no observer
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            settings: EngineSettings::default(),
            observer: &NoObserver,
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn Observer) -> Self {
        self.observer = observer;
        self
    }
}
