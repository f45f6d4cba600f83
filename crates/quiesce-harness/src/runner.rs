//! Scenario runner: sizes the machine, times each scenario, and turns its
//! result into a report.

use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use serde_json::{Value, json};

use quiesce_core::SyncConfig;
use quiesce_core::config::{CPUS_ENV, ConfigError, MAX_CPUS};

use crate::error::HarnessError;
use crate::scenario::{Scenario, Workload};
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

/// Result of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub outcome: Outcome,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub details: Value,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }

    /// Failed or could not run. Skips are not failures.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Fail | Outcome::Error)
    }

    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        millis(self.duration)
    }

    fn level(&self) -> LogLevel {
        match self.outcome {
            Outcome::Pass => LogLevel::Info,
            Outcome::Skip => LogLevel::Warn,
            Outcome::Fail | Outcome::Error => LogLevel::Error,
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(millis(*duration))
}

/// Runs scenarios on machines sized by one [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    workload: Workload,
}

impl ScenarioRunner {
    /// Validate the sizing up front so scenarios never see an impossible
    /// machine.
    pub fn new(config: SyncConfig, iterations: u32) -> Result<Self, HarnessError> {
        if config.cpus == 0 {
            return Err(HarnessError::ZeroCount("cpus"));
        }
        if config.cpus > MAX_CPUS {
            return Err(ConfigError::OutOfRange {
                var: CPUS_ENV,
                value: config.cpus,
                max: MAX_CPUS,
            }
            .into());
        }
        if config.defer_capacity == 0 {
            return Err(HarnessError::ZeroCount("defer capacity"));
        }
        if iterations == 0 {
            return Err(HarnessError::ZeroCount("iterations"));
        }
        Ok(Self {
            workload: Workload { config, iterations },
        })
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.workload.config
    }

    #[must_use]
    pub fn iterations(&self) -> u32 {
        self.workload.iterations
    }

    /// Run one scenario to completion.
    pub fn run(&self, scenario: Scenario) -> ScenarioReport {
        let cpus = self.workload.config.cpus;
        let needed = scenario.min_cpus();
        if cpus < needed {
            log::warn!("skipping {scenario}: needs {needed} cpus, machine has {cpus}");
            return ScenarioReport {
                name: scenario.name().to_string(),
                outcome: Outcome::Skip,
                duration: Duration::ZERO,
                details: json!({ "reason": format!("needs at least {needed} cpus") }),
            };
        }

        log::info!(
            "running {scenario} on {cpus} cpus, {} iterations",
            self.workload.iterations
        );
        let started = Instant::now();
        let result = scenario.execute(&self.workload);
        let duration = started.elapsed();
        let (outcome, details) = match result {
            Ok(details) => (Outcome::Pass, details),
            Err(err) => {
                log::error!("{scenario}: {err}");
                let outcome = if err.is_failure() {
                    Outcome::Fail
                } else {
                    Outcome::Error
                };
                (outcome, json!({ "error": err.to_string() }))
            }
        };
        ScenarioReport {
            name: scenario.name().to_string(),
            outcome,
            duration,
            details,
        }
    }

    /// Run one scenario, bracketing it with `scenario_start` and
    /// `scenario_finish` log entries.
    pub fn run_logged(
        &self,
        scenario: Scenario,
        emitter: &mut LogEmitter,
    ) -> std::io::Result<ScenarioReport> {
        emitter.emit_entry(
            LogEntry::new("", LogLevel::Info, "scenario_start")
                .with_scenario(scenario)
                .with_sizing(self.workload.config.cpus, self.workload.iterations),
        )?;
        let report = self.run(scenario);
        emitter.emit_entry(
            LogEntry::new("", report.level(), "scenario_finish")
                .with_scenario(scenario)
                .with_sizing(self.workload.config.cpus, self.workload.iterations)
                .with_outcome(report.outcome)
                .with_duration_ms(report.duration_ms())
                .with_details(report.details.clone()),
        )?;
        Ok(report)
    }

    /// Run `scenarios` in order, logging the whole run.
    pub fn run_all(
        &self,
        scenarios: &[Scenario],
        emitter: &mut LogEmitter,
    ) -> std::io::Result<Vec<ScenarioReport>> {
        let config = &self.workload.config;
        emitter.emit_entry(
            LogEntry::new("", LogLevel::Info, "run_start")
                .with_sizing(config.cpus, self.workload.iterations)
                .with_details(json!({
                    "scenarios": scenarios.iter().map(|s| s.name()).collect::<Vec<_>>(),
                    "defer_capacity": config.defer_capacity,
                    "idle_flush_ms": config.idle_flush.map(millis),
                })),
        )?;
        let started = Instant::now();
        let mut reports = Vec::with_capacity(scenarios.len());
        for &scenario in scenarios {
            reports.push(self.run_logged(scenario, emitter)?);
        }
        let count = |outcome: Outcome| reports.iter().filter(|r| r.outcome == outcome).count();
        let failed = reports.iter().any(ScenarioReport::is_failure);
        emitter.emit_entry(
            LogEntry::new(
                "",
                if failed { LogLevel::Error } else { LogLevel::Info },
                "run_finish",
            )
            .with_duration_ms(millis(started.elapsed()))
            .with_details(json!({
                "pass": count(Outcome::Pass),
                "fail": count(Outcome::Fail),
                "skip": count(Outcome::Skip),
                "error": count(Outcome::Error),
            })),
        )?;
        emitter.flush()?;
        Ok(reports)
    }
}
