use crate::mode::AssistMode;
use thiserror::Error;

/// Invalid or unreadable assist configuration. Rejected before the loop starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),
}

/// Virtual controller failures. Fatal to the Active mode.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("virtual gamepad not present: {0}")]
    NotPresent(#[source] std::io::Error),

    #[error("stick report rejected: {0}")]
    Rejected(#[source] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition: cannot {request} while {from:?}")]
pub struct InvalidTransition {
    pub from: AssistMode,
    pub request: &'static str,
}

/// Outcome of a rejected or partly completed mode command.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error(transparent)]
    Invalid(#[from] InvalidTransition),

    /// The mode changed but the neutral report did not reach the device; it
    /// is retried every tick.
    #[error("now {to}, but neutral report not delivered: {source}")]
    NeutralNotDelivered {
        to: AssistMode,
        #[source]
        source: DriverError,
    },
}

/// Conditions that end the control loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("detector failed {failures} consecutive ticks, last error: {last}")]
    DetectorFailed { failures: u32, last: DetectorError },
}
