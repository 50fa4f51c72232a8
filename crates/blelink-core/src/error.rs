//! Error types for blelink-core.
//!
//! Every fallible operation returns [`Error`]. The variants follow one
//! taxonomy, exposed through [`Error::category`]:
//!
//! | Category | Raised | Example |
//! |----------|--------|---------|
//! | [`ErrorCategory::Precondition`] | synchronously, before any native call | connect while already connected |
//! | [`ErrorCategory::Capability`] | synchronously | write to a read-only characteristic |
//! | [`ErrorCategory::Native`] | through the operation handle | GATT status 0x85 |
//! | [`ErrorCategory::Timeout`] | through the operation handle | no callback within the timeout |
//! | [`ErrorCategory::Cancelled`] | through the operation handle | cancellation token fired |
//! | [`ErrorCategory::UnexpectedTransition`] | to the failure sink only | late "connected" callback |
//! | [`ErrorCategory::Lookup`] | synchronously | no characteristic with that UUID |
//!
//! A timeout or cancellation releases the caller but does not undo the native
//! side effect. The native completion may still arrive later; it is then
//! handled as an orphan completion (see [`crate::operation`]).
//!
//! ## Retrying
//!
//! Timeouts and native failures are usually transient and worth retrying.
//! Precondition and capability errors are not: fix the call site instead.
//!
//! ```ignore
//! match characteristic.read().await {
//!     Ok(value) => println!("{:02x?}", value),
//!     Err(e) if e.is_retryable() => { /* try again later */ }
//!     Err(e) => return Err(e),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::entity::{EntityKey, OperationKind};

/// Errors returned by blelink operations.
///
/// `Clone` because one resolved outcome is delivered to every caller that
/// joined the same in-flight operation.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The entity is not in a state that allows the operation.
    #[error("{entity}: {violation}")]
    Precondition {
        /// Entity the operation was called on.
        entity: EntityKey,
        /// Which precondition failed.
        violation: Violation,
    },

    /// The characteristic does not support the operation.
    #[error("{entity} does not support {capability}")]
    Unsupported {
        /// Characteristic the operation was called on.
        entity: EntityKey,
        /// Missing capability.
        capability: Capability,
    },

    /// The native stack reported a failure.
    #[error("{operation} on {entity} failed: {error}")]
    Native {
        /// Entity the operation ran on.
        entity: EntityKey,
        /// Operation that failed.
        operation: OperationKind,
        /// Error reported by the platform.
        error: NativeError,
    },

    /// No completion arrived within the timeout.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: OperationKind,
        /// The timeout duration.
        duration: Duration,
    },

    /// The caller's cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// The entity was disposed while the operation was pending.
    #[error("{entity} was disposed")]
    Disposed {
        /// The disposed entity.
        entity: EntityKey,
    },

    /// A native completion arrived that contradicts the tracked state.
    #[error("Unexpected {operation} completion on {entity}: {detail}")]
    UnexpectedTransition {
        /// Entity that received the completion.
        entity: EntityKey,
        /// Operation the completion belongs to.
        operation: OperationKind,
        /// What happened.
        detail: String,
    },

    /// Nothing matched a lookup.
    #[error("Not found: {what}")]
    NotFound {
        /// Description of the lookup.
        what: String,
    },

    /// More than one element matched a single-element lookup.
    #[error("Expected one match for {what}, found {count}")]
    MultipleFound {
        /// Description of the lookup.
        what: String,
        /// Number of matches.
        count: usize,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed data from the device.
    #[error(transparent)]
    Parse(#[from] blelink_types::ParseError),
}

/// Failed precondition of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Violation {
    AlreadyConnected,
    NotConnected,
    AlreadyRunning,
    NotRunning,
    RadioOff,
    /// Another operation that excludes this one is in flight.
    Busy,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::NotConnected => write!(f, "not connected"),
            Self::AlreadyRunning => write!(f, "already running"),
            Self::NotRunning => write!(f, "not running"),
            Self::RadioOff => write!(f, "radio is not powered on"),
            Self::Busy => write!(f, "busy with a conflicting operation"),
        }
    }
}

/// Characteristic capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Write,
    Listen,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Listen => write!(f, "notify/indicate"),
        }
    }
}

/// Failure reported by a native transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    /// Platform status code, when the platform reports one (e.g. ATT error code).
    pub status: Option<u16>,
    /// Human readable description.
    pub message: String,
}

impl NativeError {
    /// Failure without a status code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Failure carrying a platform status code.
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status 0x{:02X})", self.message, status),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for NativeError {}

/// Coarse classification of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Precondition,
    Capability,
    Native,
    Timeout,
    Cancelled,
    UnexpectedTransition,
    Lookup,
    Config,
    Data,
}

impl Error {
    /// Create a precondition error.
    pub fn precondition(entity: &EntityKey, violation: Violation) -> Self {
        Self::Precondition {
            entity: entity.clone(),
            violation,
        }
    }

    /// Create a capability error.
    pub fn unsupported(entity: &EntityKey, capability: Capability) -> Self {
        Self::Unsupported {
            entity: entity.clone(),
            capability,
        }
    }

    /// Wrap a native failure with operation context.
    pub fn native(entity: &EntityKey, operation: OperationKind, error: NativeError) -> Self {
        Self::Native {
            entity: entity.clone(),
            operation,
            error,
        }
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: OperationKind, duration: Duration) -> Self {
        Self::Timeout {
            operation,
            duration,
        }
    }

    /// Create a disposed error.
    pub fn disposed(entity: &EntityKey) -> Self {
        Self::Disposed {
            entity: entity.clone(),
        }
    }

    /// Create an unexpected transition report.
    pub fn unexpected(
        entity: &EntityKey,
        operation: OperationKind,
        detail: impl Into<String>,
    ) -> Self {
        Self::UnexpectedTransition {
            entity: entity.clone(),
            operation,
            detail: detail.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Precondition { .. } => ErrorCategory::Precondition,
            Self::Unsupported { .. } => ErrorCategory::Capability,
            Self::Native { .. } => ErrorCategory::Native,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Cancelled | Self::Disposed { .. } => ErrorCategory::Cancelled,
            Self::UnexpectedTransition { .. } => ErrorCategory::UnexpectedTransition,
            Self::NotFound { .. } | Self::MultipleFound { .. } => ErrorCategory::Lookup,
            Self::InvalidConfig(_) => ErrorCategory::Config,
            Self::Parse(_) => ErrorCategory::Data,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Native | ErrorCategory::Timeout
        )
    }

    /// The precondition violation, if this is a precondition error.
    pub fn violation(&self) -> Option<Violation> {
        match self {
            Self::Precondition { violation, .. } => Some(*violation),
            _ => None,
        }
    }
}

/// Result type alias using blelink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;

    fn key() -> EntityKey {
        EntityKey::new(EntityKind::Device, "AA:BB:CC:DD:EE:FF")
    }

    #[test]
    fn test_error_display() {
        let err = Error::precondition(&key(), Violation::NotConnected);
        assert_eq!(err.to_string(), "device AA:BB:CC:DD:EE:FF: not connected");

        let err = Error::timeout(OperationKind::Connect, Duration::from_secs(5));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("5s"));

        let err = Error::native(
            &key(),
            OperationKind::Read,
            NativeError::with_status(0x05, "insufficient authentication"),
        );
        assert!(err.to_string().contains("insufficient authentication"));
        assert!(err.to_string().contains("status 0x05"));

        let err = Error::MultipleFound {
            what: "characteristic 0x2a19".into(),
            count: 2,
        };
        assert!(err.to_string().contains("found 2"));
    }

    #[test]
    fn test_native_error_without_status() {
        let err = NativeError::new("link lost");
        assert_eq!(err.to_string(), "link lost");
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::unsupported(&key(), Capability::Write).category(),
            ErrorCategory::Capability
        );
        assert_eq!(
            Error::unexpected(&key(), OperationKind::Connect, "late").category(),
            ErrorCategory::UnexpectedTransition
        );
        assert_eq!(Error::Cancelled.category(), ErrorCategory::Cancelled);
        assert_eq!(
            Error::not_found("x").category(),
            ErrorCategory::Lookup
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::timeout(OperationKind::Read, Duration::from_secs(1)).is_retryable());
        assert!(Error::native(&key(), OperationKind::Read, NativeError::new("x")).is_retryable());
        assert!(!Error::precondition(&key(), Violation::Busy).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: Error = blelink_types::ParseError::InvalidValue("bad".into()).into();
        assert_eq!(err.category(), ErrorCategory::Data);
        assert!(err.to_string().contains("bad"));
    }
}
