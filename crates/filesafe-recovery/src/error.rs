//! Error types for the recovery subsystem.
//!
//! Providers report failures as [`FileOpError`], which always carries an
//! [`ErrorKind`]. The retry policy, circuit breaker and fallback router react
//! only to that classification, never to the message text.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::journal::RollbackResult;
use crate::tracker::ErrorContext;

/// Result type alias for recovery operations.
pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Classification of a failed file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network blip or timeout; retryable.
    Transient,
    /// Provider asked us to slow down; retryable with a larger backoff.
    RateLimited,
    /// The target is down or unreachable; triggers fallback routing and a breaker trip.
    TargetUnavailable,
    /// Authentication or validation failure; never retried, never rerouted.
    Permanent,
    /// Journal or logic invariant violation; fatal to the operation.
    Internal,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::Transient,
        ErrorKind::RateLimited,
        ErrorKind::TargetUnavailable,
        ErrorKind::Permanent,
        ErrorKind::Internal,
    ];

    /// Kinds that no configuration can make retryable.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ErrorKind::Permanent | ErrorKind::Internal)
    }

    /// Whether a failure of this kind says something about target health.
    pub fn counts_against_target(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::RateLimited | ErrorKind::TargetUnavailable
        )
    }

    /// Stable lowercase name, used in logs and the error sink.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::TargetUnavailable => "target_unavailable",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure raised by a [`crate::provider::FileProvider`] call
/// or by a compensating action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct FileOpError {
    /// Classification driving retry, breaker and fallback decisions.
    pub kind: ErrorKind,
    /// Human readable detail, never inspected by the recovery logic.
    pub message: String,
    /// Provider hint for how long to wait before retrying (rate limiting).
    pub retry_after: Option<Duration>,
}

impl FileOpError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// A retryable network or timeout failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// A rate-limit rejection, optionally with a provider supplied wait hint.
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorKind::RateLimited, message)
        }
    }

    /// The target cannot serve requests right now.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TargetUnavailable, message)
    }

    /// An authentication or validation failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    /// An invariant violation inside the subsystem.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// A per-attempt deadline expired.
    pub fn timed_out(timeout: Duration) -> Self {
        Self::transient(format!("attempt timed out after {}ms", timeout.as_millis()))
    }
}

impl From<std::io::Error> for FileOpError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            Io::TimedOut
            | Io::Interrupted
            | Io::WouldBlock
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::BrokenPipe
            | Io::UnexpectedEof => ErrorKind::Transient,
            Io::NotFound | Io::PermissionDenied | Io::InvalidInput | Io::InvalidData => {
                ErrorKind::Permanent
            }
            _ => ErrorKind::TargetUnavailable,
        };
        Self::new(kind, err.to_string())
    }
}

/// Errors raised by the operation journal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JournalError {
    /// An entry with this operation id already exists.
    #[error("operation {operation_id} already journaled")]
    DuplicateOperation {
        /// The offending operation id.
        operation_id: String,
    },

    /// No entry exists for this operation id.
    #[error("operation {operation_id} not found in journal")]
    UnknownOperation {
        /// The missing operation id.
        operation_id: String,
    },

    /// A step with the same name was already recorded for this operation.
    #[error("step '{step}' already recorded for operation {operation_id}")]
    DuplicateStep {
        /// The operation id.
        operation_id: String,
        /// The step name recorded twice.
        step: String,
    },

    /// The operation is not in a state that allows the requested action.
    #[error("operation {operation_id} is {status}, cannot {action}")]
    InvalidState {
        /// The operation id.
        operation_id: String,
        /// The current status name.
        status: &'static str,
        /// The rejected action.
        action: &'static str,
    },

    /// Encoding or decoding a journal snapshot failed.
    #[error("journal serialization error: {reason}")]
    Serialization {
        /// Description of the error.
        reason: String,
    },
}

impl From<JournalError> for FileOpError {
    fn from(err: JournalError) -> Self {
        FileOpError::internal(err.to_string())
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is outside its permitted range.
    #[error("invalid option {field}: {reason}")]
    Invalid {
        /// The option name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The file extension is neither `toml` nor `json`.
    #[error("unsupported config file extension: {0}")]
    UnsupportedFormat(String),

    /// Reading the file failed.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing the file failed.
    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Terminal errors returned by [`crate::manager::RecoveryManager::execute`].
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The target's breaker is open and no fallback target is available.
    #[error("circuit open for target '{target}'")]
    CircuitOpen {
        /// The rejected target.
        target: String,
    },

    /// The target has no registered provider.
    #[error("no provider registered for target '{target}'")]
    UnknownTarget {
        /// The unknown target.
        target: String,
    },

    /// Retries, reroutes and rollback are exhausted.
    #[error("operation {operation_id} failed after {attempts} attempts: {last_error} ({rollback})")]
    Terminal {
        /// The failed operation.
        operation_id: String,
        /// Total provider calls made across all targets.
        attempts: u32,
        /// The last recorded failure.
        last_error: Box<ErrorContext>,
        /// Outcome of compensating the journaled steps.
        rollback: RollbackResult,
        /// Targets tried, in order.
        targets_tried: Vec<String>,
    },

    /// The caller cancelled the operation; journaled steps were rolled back.
    #[error("operation {operation_id} cancelled: {reason}")]
    Cancelled {
        /// The cancelled operation.
        operation_id: String,
        /// Why it was cancelled.
        reason: crate::cancel::CancelReason,
        /// Outcome of compensating the journaled steps.
        rollback: RollbackResult,
    },

    /// The journal rejected the operation before any provider call.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl RecoveryError {
    /// The classification of the underlying failure, if there is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RecoveryError::Terminal { last_error, .. } => Some(last_error.kind),
            RecoveryError::CircuitOpen { .. } => Some(ErrorKind::TargetUnavailable),
            RecoveryError::Journal(_) => Some(ErrorKind::Internal),
            RecoveryError::UnknownTarget { .. } | RecoveryError::Cancelled { .. } => None,
        }
    }

    /// The rollback outcome, when journaled steps were compensated.
    pub fn rollback(&self) -> Option<&RollbackResult> {
        match self {
            RecoveryError::Terminal { rollback, .. } | RecoveryError::Cancelled { rollback, .. } => {
                Some(rollback)
            }
            _ => None,
        }
    }
}
