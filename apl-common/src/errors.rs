//! Error taxonomy for appliance lifecycle operations.
//!
//! Errors are layered the same way the code is: the command channel and the
//! relational store each have their own enum, the wait primitive wraps the
//! predicate's error type, and [`ApplianceError`] is what lifecycle
//! operations hand back to callers.
//!
//! | Kind          | Raised by                         | Recoverable |
//! |---------------|-----------------------------------|-------------|
//! | `Timeout`     | the wait primitive                | caller decides |
//! | `Lifecycle`   | named operations with bad status  | caller decides |
//! | `Consistency` | local bookkeeping (appliance stack) | never        |
//! | `Aborted`     | channel timeout in a long command | never        |

use std::convert::Infallible;
use std::time::Duration;
use thiserror::Error;

use crate::appliance::ProviderError;
use crate::config::ConfigError;

/// Errors raised by a remote command channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The SSH session could not be established.
    #[error("SSH connection to {host} failed: {message}")]
    Connect { host: String, message: String },

    /// The channel itself timed out (distinct from a command failing).
    #[error("SSH channel to {host} timed out after {timeout:?} running `{command}`")]
    Timeout {
        host: String,
        command: String,
        timeout: Duration,
    },

    /// Copying a file to or from the remote host failed.
    #[error("File transfer {from} -> {to} failed: {message}")]
    Transfer {
        from: String,
        to: String,
        message: String,
    },

    /// An HTTP request got no response at all.
    #[error("HTTP request to {url} failed: {message}")]
    Http { url: String, message: String },

    /// The interactive shell failed or closed unexpectedly.
    #[error("Interactive channel error: {0}")]
    Interactive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Whether this is a socket/channel timeout rather than a command failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors raised by the remote relational store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Table not found: {0}")]
    MissingTable(String),

    #[error("Invalid SQL identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Query against {table} failed (exit {status}): {output}")]
    QueryFailed {
        table: String,
        status: i32,
        output: String,
    },

    #[error("Failed to decode row from {table}: {message}")]
    Decode { table: String, message: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Errors raised by [`crate::wait::WaitFor`].
#[derive(Debug, Error)]
pub enum WaitError<E> {
    /// The predicate never converged within the budget.
    #[error("Timed out after {elapsed:?} (budget {timeout:?}) waiting for {message}")]
    Timeout {
        message: String,
        elapsed: Duration,
        timeout: Duration,
    },

    /// The predicate failed and exceptions were not being handled.
    #[error("Predicate for {message} failed: {source}")]
    Predicate {
        message: String,
        #[source]
        source: E,
    },
}

/// Top-level error for appliance lifecycle operations.
#[derive(Debug, Error)]
pub enum ApplianceError {
    /// A bounded wait exceeded its budget.
    #[error("Timed out after {elapsed:?} waiting for {message}")]
    Timeout { message: String, elapsed: Duration },

    /// A named operation observed an unexpected exit status.
    #[error("{operation} failed on {address}: {output}")]
    Lifecycle {
        operation: String,
        address: String,
        output: String,
    },

    /// Local bookkeeping invariant violated. Always a caller defect.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// A long-running remote command lost its channel; the run cannot continue.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// The operation is not available for this appliance.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid appliance address: {0}")]
    Address(String),

    #[error("Invalid settings document: {0}")]
    Settings(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApplianceError {
    /// Build a lifecycle error carrying the captured remote output.
    pub fn lifecycle(
        operation: impl Into<String>,
        address: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::Lifecycle {
            operation: operation.into(),
            address: address.into(),
            output: output.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Remote output captured by a failed lifecycle operation.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            Self::Lifecycle { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl From<Infallible> for ApplianceError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

impl<E> From<WaitError<E>> for ApplianceError
where
    E: Into<ApplianceError>,
{
    fn from(err: WaitError<E>) -> Self {
        match err {
            WaitError::Timeout {
                message, elapsed, ..
            } => Self::Timeout { message, elapsed },
            WaitError::Predicate { source, .. } => source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_error_carries_output() {
        let err = ApplianceError::lifecycle("start evmserverd", "10.0.0.5", "unit not found");
        assert_eq!(err.captured_output(), Some("unit not found"));
        let text = err.to_string();
        assert!(text.contains("start evmserverd"));
        assert!(text.contains("10.0.0.5"));
        assert!(text.contains("unit not found"));
    }

    #[test]
    fn test_wait_timeout_maps_to_appliance_timeout() {
        let err: WaitError<Infallible> = WaitError::Timeout {
            message: "appliance.is_ssh_running".into(),
            elapsed: Duration::from_secs(12),
            timeout: Duration::from_secs(10),
        };
        let mapped = ApplianceError::from(err);
        assert!(mapped.is_timeout());
        assert!(mapped.to_string().contains("appliance.is_ssh_running"));
    }

    #[test]
    fn test_wait_predicate_error_unwraps_source() {
        let err: WaitError<ApplianceError> = WaitError::Predicate {
            message: "db".into(),
            source: ApplianceError::Consistency("boom".into()),
        };
        assert!(matches!(
            ApplianceError::from(err),
            ApplianceError::Consistency(_)
        ));
    }

    #[test]
    fn test_channel_timeout_is_distinct() {
        let timeout = ChannelError::Timeout {
            host: "a".into(),
            command: "yum update".into(),
            timeout: Duration::from_secs(1),
        };
        let connect = ChannelError::Connect {
            host: "a".into(),
            message: "refused".into(),
        };
        assert!(timeout.is_timeout());
        assert!(!connect.is_timeout());
    }
}
