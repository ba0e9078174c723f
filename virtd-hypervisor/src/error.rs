//! Error types for the reconciliation engine.

use thiserror::Error;
use tracing::warn;

/// Errors that can occur while reconciling machines and networks.
#[derive(Error, Debug)]
pub enum VirtdError {
    /// Failed to open a connection to the hypervisor.
    #[error("Failed to connect to the hypervisor at {uri}: {reason}")]
    ConnectionFailed {
        uri: String,
        reason: String,
        /// Remediation hint for the operator, when the failure kind is known.
        hint: Option<String>,
    },

    /// The hypervisor library is too old for the calls we make.
    #[error("libvirt {required} or newer is required at the target host (found {found})")]
    UnsupportedVersion { found: String, required: String },

    /// Building, inspecting, creating or uploading the disk image failed.
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// The hypervisor rejected a domain or network definition.
    #[error("Failed to register definition with the hypervisor: {0}")]
    DefineFailed(String),

    /// A domain, pool, volume or network lookup missed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A single item of a batch failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A change needs reboot or recreate permission that was not granted.
    #[error("Change not permitted: {0}")]
    Policy(String),

    /// A hypervisor call failed.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// The desired definition is malformed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// XML generation/parsing error.
    #[error("XML error: {0}")]
    Xml(String),

    /// Persisted state could not be read, written or is inconsistent.
    #[error("State error: {0}")]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VirtdError {
    /// Whether this error must abort the reconciliation that raised it.
    ///
    /// Lookup misses, validation failures and policy skips are reported as
    /// warnings and the remaining steps continue.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            VirtdError::NotFound(_) | VirtdError::Validation(_) | VirtdError::Policy(_)
        )
    }

    /// Remediation hint attached to a connection failure, if any.
    pub fn hint(&self) -> Option<&str> {
        match self {
            VirtdError::ConnectionFailed { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }
}

impl From<quick_xml::Error> for VirtdError {
    fn from(e: quick_xml::Error) -> Self {
        VirtdError::Xml(e.to_string())
    }
}

impl From<serde_json::Error> for VirtdError {
    fn from(e: serde_json::Error) -> Self {
        VirtdError::State(e.to_string())
    }
}

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, VirtdError>;

/// Outcome of an operation whose failure is expected and tolerated.
///
/// Detaching an interface that is already gone, or deleting a DHCP host
/// entry that was removed out of band, must not abort a reconciliation.
/// Wrapping such calls in `BestEffort` keeps the tolerated failure visible
/// instead of discarding it.
#[must_use]
#[derive(Debug)]
pub enum BestEffort<T> {
    Done(T),
    Ignored(VirtdError),
}

impl<T> BestEffort<T> {
    /// Whether the operation succeeded.
    pub fn is_done(&self) -> bool {
        matches!(self, BestEffort::Done(_))
    }

    /// Log an ignored failure and return the value on success.
    pub fn log_ignored(self, what: &str) -> Option<T> {
        match self {
            BestEffort::Done(value) => Some(value),
            BestEffort::Ignored(e) => {
                warn!(error = %e, "{} failed; ignoring", what);
                None
            }
        }
    }
}

impl<T> From<Result<T>> for BestEffort<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => BestEffort::Done(value),
            Err(e) => BestEffort::Ignored(e),
        }
    }
}

/// Run a fallible step whose failure is tolerated.
pub fn best_effort<T>(result: Result<T>) -> BestEffort<T> {
    BestEffort::from(result)
}
