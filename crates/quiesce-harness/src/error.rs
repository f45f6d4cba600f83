//! Errors surfaced by the harness.

use thiserror::Error;

use quiesce_core::ConfigError;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{0} must be positive")]
    ZeroCount(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A scenario thread died on a contract violation or a failed check.
    #[error("thread '{thread}' panicked: {message}")]
    Panicked { thread: String, message: String },
    /// The workload ran but a guarantee did not hold.
    #[error("{0}")]
    Violation(String),
}

impl HarnessError {
    /// Whether this error means the code under test misbehaved, as opposed
    /// to the harness being unable to run it.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Violation(_) | Self::Panicked { .. })
    }
}
