//! Custom error types for the bench console.
//!
//! `BenchError` is the single error type returned by every library operation.
//! It groups into four families:
//!
//! - **Instrument-facing**: `Transport`, `Protocol`, `Safety`. These come back from
//!   drivers and transports. A `Protocol` failure leaves the instrument in an
//!   unknown state; a `Safety` failure is raised before anything is transmitted.
//! - **Operator input**: `Capability`, `UnknownResource`, `ResourceBusy`,
//!   `RecorderState`, `MissingVariable`, `UnknownAlias`, `UnknownSequence`, `Usage`.
//!   The interpreter reports these and keeps running.
//! - **Aggregates**: `SafeStateFailed` and `ReplayAborted` wrap the failures of
//!   best-effort and sequenced operations.
//! - **Ambient**: `Config`, `ConfigLoad`, `Io`, `Persistence`, `NoTransport`.
//!
//! Every variant maps to a fieldless [`ErrorKind`], which is what command history
//! stores alongside the rendered message.

use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

/// Errors raised by the bench console.
#[derive(Error, Debug)]
pub enum BenchError {
    /// The resource could not be reached or did not answer in time.
    #[error("transport error on {resource}: {source}")]
    Transport {
        /// Resource the exchange was addressed to.
        resource: String,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// The instrument answered with something that could not be interpreted.
    #[error("protocol error from {resource}: {message}")]
    Protocol {
        /// Resource that produced the response.
        resource: String,
        /// What was wrong with it.
        message: String,
    },

    /// A requested value lies outside the instrument's declared or configured bounds.
    #[error("safety limit: {0}")]
    Safety(String),

    /// The bound instrument does not declare a capability that handles the verb.
    #[error("'{alias}' does not support '{verb}'")]
    Capability {
        /// Alias the verb was sent to.
        alias: String,
        /// The rejected verb.
        verb: String,
    },

    /// The resource id is not in the latest discovery catalog.
    #[error("unknown resource '{0}' (run `scan` to refresh the catalog)")]
    UnknownResource(String),

    /// Another alias or session holds the resource exclusively.
    #[error("resource {resource} is busy (held by '{holder}')")]
    ResourceBusy {
        /// The contended resource id.
        resource: String,
        /// Owner of the existing lock.
        holder: String,
    },

    /// Recording or replay was asked for in the wrong state: nested or
    /// mismatched `record`, or a sequence replaying itself.
    #[error("recorder: {0}")]
    RecorderState(String),

    /// Replay placeholders with neither a supplied value nor a default.
    #[error("missing variable(s): {}", .0.join(", "))]
    MissingVariable(Vec<String>),

    /// No driver is bound under the alias.
    #[error("no instrument bound to alias '{0}'")]
    UnknownAlias(String),

    /// No sequence is stored under the name.
    #[error("no recorded sequence named '{0}'")]
    UnknownSequence(String),

    /// Malformed command line or argument.
    #[error("{0}")]
    Usage(String),

    /// A replay stopped at its first failing step.
    #[error("replay of '{sequence}' stopped at step {step}: {source}")]
    ReplayAborted {
        /// Name of the sequence being replayed.
        sequence: String,
        /// One-based index of the failing step.
        step: usize,
        /// The failure itself.
        #[source]
        source: Box<BenchError>,
    },

    /// Safe state could not be reached on every instrument.
    #[error("safe state failed on {}", summarize(.0))]
    SafeStateFailed(Vec<(String, BenchError)>),

    /// The configuration loaded but holds invalid values.
    #[error("configuration error: {0}")]
    Config(String),

    /// The configuration file or environment could not be parsed.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(#[from] figment::Error),

    /// File system failure outside a transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The sequence store or measurement log could not be encoded or decoded.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The build has no backend for any configured transport.
    #[error("no transport backend is available in this build")]
    NoTransport,
}

fn summarize(failures: &[(String, BenchError)]) -> String {
    failures
        .iter()
        .map(|(alias, err)| format!("{alias} ({err})"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl BenchError {
    /// Wrap a transport failure with the resource it happened on.
    pub fn transport(resource: impl Into<String>, source: TransportError) -> Self {
        BenchError::Transport {
            resource: resource.into(),
            source,
        }
    }

    /// Build a protocol error for a response that failed to parse.
    pub fn protocol(resource: impl Into<String>, message: impl Into<String>) -> Self {
        BenchError::Protocol {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Classification stored in command history.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BenchError::Transport { .. } => ErrorKind::Transport,
            BenchError::Protocol { .. } => ErrorKind::Protocol,
            BenchError::Safety(_) => ErrorKind::Safety,
            BenchError::Capability { .. } => ErrorKind::Capability,
            BenchError::UnknownResource(_) => ErrorKind::UnknownResource,
            BenchError::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            BenchError::RecorderState(_) => ErrorKind::RecorderState,
            BenchError::MissingVariable(_) => ErrorKind::MissingVariable,
            BenchError::UnknownAlias(_) => ErrorKind::UnknownAlias,
            BenchError::UnknownSequence(_) => ErrorKind::UnknownSequence,
            BenchError::Usage(_) => ErrorKind::Usage,
            BenchError::ReplayAborted { source, .. } => source.kind(),
            BenchError::SafeStateFailed(_) => ErrorKind::SafeState,
            BenchError::Config(_) | BenchError::ConfigLoad(_) => ErrorKind::Config,
            BenchError::Io(_) => ErrorKind::Io,
            BenchError::Persistence(_) => ErrorKind::Persistence,
            BenchError::NoTransport => ErrorKind::NoTransport,
        }
    }

    /// Whether the failure came from the operator's input rather than the bench.
    pub fn is_operator_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Capability
                | ErrorKind::UnknownResource
                | ErrorKind::ResourceBusy
                | ErrorKind::RecorderState
                | ErrorKind::MissingVariable
                | ErrorKind::UnknownAlias
                | ErrorKind::UnknownSequence
                | ErrorKind::Usage
        )
    }
}

impl From<csv::Error> for BenchError {
    fn from(err: csv::Error) -> Self {
        let message = err.to_string();
        match err.into_kind() {
            csv::ErrorKind::Io(e) => BenchError::Io(e),
            _ => BenchError::Persistence(message),
        }
    }
}

impl From<serde_json::Error> for BenchError {
    fn from(err: serde_json::Error) -> Self {
        BenchError::Persistence(err.to_string())
    }
}

/// Fieldless classification of a [`BenchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// [`BenchError::Transport`]
    Transport,
    /// [`BenchError::Protocol`]
    Protocol,
    /// [`BenchError::Safety`]
    Safety,
    /// [`BenchError::Capability`]
    Capability,
    /// [`BenchError::UnknownResource`]
    UnknownResource,
    /// [`BenchError::ResourceBusy`]
    ResourceBusy,
    /// [`BenchError::RecorderState`]
    RecorderState,
    /// [`BenchError::MissingVariable`]
    MissingVariable,
    /// [`BenchError::UnknownAlias`]
    UnknownAlias,
    /// [`BenchError::UnknownSequence`]
    UnknownSequence,
    /// [`BenchError::Usage`]
    Usage,
    /// [`BenchError::SafeStateFailed`]
    SafeState,
    /// [`BenchError::Config`] and [`BenchError::ConfigLoad`]
    Config,
    /// [`BenchError::Io`]
    Io,
    /// [`BenchError::Persistence`]
    Persistence,
    /// [`BenchError::NoTransport`]
    NoTransport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "TransportError",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::Safety => "SafetyError",
            ErrorKind::Capability => "CapabilityError",
            ErrorKind::UnknownResource => "UnknownResourceError",
            ErrorKind::ResourceBusy => "ResourceBusyError",
            ErrorKind::RecorderState => "RecorderStateError",
            ErrorKind::MissingVariable => "MissingVariableError",
            ErrorKind::UnknownAlias => "UnknownAliasError",
            ErrorKind::UnknownSequence => "UnknownSequenceError",
            ErrorKind::Usage => "UsageError",
            ErrorKind::SafeState => "SafeStateError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Io => "IoError",
            ErrorKind::Persistence => "PersistenceError",
            ErrorKind::NoTransport => "NoTransportError",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn replay_abort_reports_inner_kind() {
        let err = BenchError::ReplayAborted {
            sequence: "ramp".into(),
            step: 2,
            source: Box::new(BenchError::Safety("7 V exceeds 6 V".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Safety);
        assert!(err.to_string().contains("step 2"));
    }

    #[test]
    fn safe_state_failure_lists_every_alias() {
        let err = BenchError::SafeStateFailed(vec![
            (
                "psu".into(),
                BenchError::transport(
                    "gpib:GPIB0::5::INSTR",
                    TransportError::Timeout(Duration::from_millis(5)),
                ),
            ),
            ("awg".into(), BenchError::protocol("usb_tmc:X", "garbled")),
        ]);
        let message = err.to_string();
        assert!(message.contains("psu"));
        assert!(message.contains("awg"));
        assert_eq!(err.kind(), ErrorKind::SafeState);
    }

    #[test]
    fn operator_errors_are_classified() {
        assert!(BenchError::UnknownAlias("x".into()).is_operator_error());
        assert!(BenchError::MissingVariable(vec!["f".into()]).is_operator_error());
        assert!(!BenchError::Safety("over".into()).is_operator_error());
        assert!(!BenchError::NoTransport.is_operator_error());
    }

    #[test]
    fn kind_display_uses_error_names() {
        assert_eq!(ErrorKind::ResourceBusy.to_string(), "ResourceBusyError");
        assert_eq!(ErrorKind::Capability.to_string(), "CapabilityError");
    }
}
