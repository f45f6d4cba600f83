//! Runtime configuration.
//!
//! Read from the environment:
//! - `QUIESCE_CPUS`: number of simulated CPUs. Defaults to the host's
//!   available parallelism, clamped to `1..=64`.
//! - `QUIESCE_DEFER_CAPACITY`: slots per deferred-callback buffer. Defaults
//!   to 2000.
//! - `QUIESCE_IDLE_FLUSH_MS`: if set to a positive number of milliseconds, an
//!   idle reclamation agent with pending callbacks starts a cycle after that
//!   long even when nobody nudged it. `0`, `off`, `none` and `disabled` turn it
//!   off, which is the default.

use std::num::NonZeroUsize;
use std::time::Duration;

use thiserror::Error;

pub const CPUS_ENV: &str = "QUIESCE_CPUS";
pub const DEFER_CAPACITY_ENV: &str = "QUIESCE_DEFER_CAPACITY";
pub const IDLE_FLUSH_ENV: &str = "QUIESCE_IDLE_FLUSH_MS";

/// Slots per deferred-callback buffer unless configured otherwise.
pub const DEFAULT_DEFER_CAPACITY: usize = 2000;

/// Upper bound on simulated CPUs.
pub const MAX_CPUS: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    NotAPositiveInteger { var: &'static str, value: String },
    #[error("{var}={value} is out of range (1..={max})")]
    OutOfRange {
        var: &'static str,
        value: usize,
        max: usize,
    },
    #[error("{var} must be a number of milliseconds or `off`, got {value:?}")]
    BadInterval { var: &'static str, value: String },
}

/// Sizing of a [`Machine`](crate::Machine) and its reclamation domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub cpus: usize,
    pub defer_capacity: usize,
    pub idle_flush: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cpus: host_cpus(),
            defer_capacity: DEFAULT_DEFER_CAPACITY,
            idle_flush: None,
        }
    }
}

impl SyncConfig {
    /// Parse the process environment strictly.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`SyncConfig::from_env`], falling back to defaults (with a
    /// warning) when a variable is malformed.
    #[must_use]
    pub fn from_env_or_default() -> Self {
        Self::from_env().unwrap_or_else(|err| {
            log::warn!("ignoring sync configuration: {err}");
            Self::default()
        })
    }

    /// Parse from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(CPUS_ENV) {
            let cpus = parse_positive(CPUS_ENV, &raw)?;
            if cpus > MAX_CPUS {
                return Err(ConfigError::OutOfRange {
                    var: CPUS_ENV,
                    value: cpus,
                    max: MAX_CPUS,
                });
            }
            config.cpus = cpus;
        }
        if let Some(raw) = lookup(DEFER_CAPACITY_ENV) {
            config.defer_capacity = parse_positive(DEFER_CAPACITY_ENV, &raw)?;
        }
        if let Some(raw) = lookup(IDLE_FLUSH_ENV) {
            config.idle_flush = parse_interval(&raw)?;
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    #[must_use]
    pub fn with_defer_capacity(mut self, capacity: usize) -> Self {
        self.defer_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_idle_flush(mut self, interval: Option<Duration>) -> Self {
        self.idle_flush = interval;
        self
    }
}

fn host_cpus() -> usize {
    std::thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .clamp(1, MAX_CPUS)
}

fn parse_positive(var: &'static str, raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::NotAPositiveInteger {
            var,
            value: raw.to_owned(),
        }),
    }
}

fn parse_interval(raw: &str) -> Result<Option<Duration>, ConfigError> {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "" | "0" | "off" | "none" | "disabled" => Ok(None),
        _ => trimmed
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::BadInterval {
                var: IDLE_FLUSH_ENV,
                value: raw.to_owned(),
            }),
    }
}
