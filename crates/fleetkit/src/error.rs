//! Error types for reconciliation passes.
//!
//! Errors are categorized so the engine can decide locally whether a
//! failure is retried (across alternate instance types, or in place after
//! an authorization-propagation delay) or surfaced to the caller.

use thiserror::Error;

/// Categories of engine errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Declaration is internally inconsistent
    Validation,
    /// Read-path provider failure
    Query,
    /// No capacity for the requested instance type
    Capacity,
    /// A just-created identity reference is not yet visible
    TransientAuth,
    /// A wait exceeded its timeout
    Timeout,
    /// Some resources in a batch failed to transition
    PartialBatch,
    /// Anything else the provider rejected
    Fatal,
}

impl ErrorCategory {
    /// Whether the next alternate instance type should be tried.
    pub fn advances_candidate(&self) -> bool {
        matches!(self, Self::Capacity)
    }

    /// Whether the same launch should be retried once after a short delay.
    pub fn retries_in_place(&self) -> bool {
        matches!(self, Self::TransientAuth)
    }

    /// Whether the pass can continue after this error (it is reported as a warning).
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Validation => "Invalid declaration",
            Self::Query => "Provider query failed",
            Self::Capacity => "Insufficient instance capacity",
            Self::TransientAuth => "Identity not yet visible to the provider",
            Self::Timeout => "Timed out waiting for instances",
            Self::PartialBatch => "Some instances failed to transition",
            Self::Fatal => "Provider rejected the request",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Validation => "Fix the declaration and run again",
            Self::Query => "Check credentials and connectivity, then run again",
            Self::Capacity => "Declare alternate instance types or try another zone",
            Self::TransientAuth => "Wait for the instance profile to propagate and run again",
            Self::Timeout => "Run again to confirm the final state",
            Self::PartialBatch => "Inspect the failed instances and run again",
            Self::Fatal => "Check the error details for more information",
        }
    }
}

/// Errors that can occur during a reconciliation pass.
#[derive(Debug, Error)]
pub enum Error {
    /// The declaration is internally inconsistent
    #[error("invalid declaration: {message}")]
    Validation {
        /// What is wrong with the declaration
        message: String,
    },

    /// A read-path call to the provider failed
    #[error("provider query '{operation}' failed: {message}")]
    ProviderQuery {
        /// Provider operation that failed
        operation: String,
        /// Provider error message
        message: String,
    },

    /// No capacity exists for the requested instance type
    #[error("insufficient capacity for instance type {instance_type}: {message}")]
    CapacityExhausted {
        /// Instance type that could not be launched
        instance_type: String,
        /// Provider error message
        message: String,
    },

    /// A freshly created identity reference is not yet visible
    #[error("transient authorization failure: {message}")]
    TransientAuthorization {
        /// Provider error message
        message: String,
    },

    /// Instances did not reach a condition before the wait timed out
    #[error("instances {} did not reach {condition} in time", .ids.join(", "))]
    TransitionTimeout {
        /// Instances that were still pending
        ids: Vec<String>,
        /// Condition being waited for
        condition: String,
    },

    /// Some resources in a batch failed while others succeeded
    #[error("unable to {action} instances {}: {reason}", .failed.join(", "))]
    PartialBatchFailure {
        /// Action being applied to the batch
        action: String,
        /// Instances the action succeeded for
        succeeded: Vec<String>,
        /// Instances the action failed for
        failed: Vec<String>,
        /// Last provider failure reason
        reason: String,
    },

    /// Any other provider rejection
    #[error("provider call '{operation}' failed: {message}")]
    Provider {
        /// Provider operation that failed
        operation: String,
        /// Provider error message
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// Build a read-path provider error.
    pub fn query(operation: &str, message: impl Into<String>) -> Self {
        Error::ProviderQuery {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Build a fatal provider error.
    pub fn provider(operation: &str, message: impl Into<String>) -> Self {
        Error::Provider {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation { .. } => ErrorCategory::Validation,
            Error::ProviderQuery { .. } => ErrorCategory::Query,
            Error::CapacityExhausted { .. } => ErrorCategory::Capacity,
            Error::TransientAuthorization { .. } => ErrorCategory::TransientAuth,
            Error::TransitionTimeout { .. } => ErrorCategory::Timeout,
            Error::PartialBatchFailure { .. } => ErrorCategory::PartialBatch,
            _ => ErrorCategory::Fatal,
        }
    }

    /// Classify a raw provider error code for a launch attempt.
    ///
    /// Codes follow the provider's wire naming; unknown codes are fatal.
    pub fn from_launch_code(code: &str, message: &str, instance_type: &str) -> Self {
        if code == "InsufficientInstanceCapacity" {
            return Error::CapacityExhausted {
                instance_type: instance_type.to_string(),
                message: message.to_string(),
            };
        }

        if message.contains("Invalid IAM Instance Profile") {
            return Error::TransientAuthorization {
                message: message.to_string(),
            };
        }

        Error::Provider {
            operation: "create".to_string(),
            message: format!("{code}: {message}"),
        }
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;
