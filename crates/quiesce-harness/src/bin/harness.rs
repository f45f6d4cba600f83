//! CLI entrypoint for the quiesce stress harness.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{ArgAction, Parser, Subcommand};

use quiesce_core::SyncConfig;
use quiesce_harness::structured_log::{LogEmitter, validate_log_file};
use quiesce_harness::{Scenario, ScenarioRunner};

/// Stress tooling for the quiesce synchronization layer.
#[derive(Debug, Parser)]
#[command(name = "quiesce-harness")]
#[command(about = "Stress scenarios for wait-morphing condvars and RCU")]
struct Cli {
    /// Print diagnostics to stderr (repeat for more detail).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the available scenarios.
    List,
    /// Run scenarios and report their outcomes.
    Run {
        /// Scenario to run; repeat for several. Runs all when omitted.
        #[arg(long = "scenario")]
        scenarios: Vec<Scenario>,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Simulated CPUs (defaults to QUIESCE_CPUS or host parallelism).
        #[arg(long)]
        cpus: Option<usize>,
        /// Iterations per scenario.
        #[arg(long, default_value_t = 10)]
        iterations: u32,
        /// Slots per deferred-callback buffer (defaults to
        /// QUIESCE_DEFER_CAPACITY or 2000).
        #[arg(long)]
        defer_capacity: Option<usize>,
        /// Run identifier used in trace ids.
        #[arg(long)]
        run_id: Option<String>,
        /// Print the reports as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        /// Structured JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
}

/// Writes `log` records from the core to stderr.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let thread = std::thread::current();
            eprintln!(
                "[{:>5}] {} {}: {}",
                record.level(),
                thread.name().unwrap_or("-"),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn default_run_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    format!("run-{secs}-{}", std::process::id())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::List => {
            for scenario in Scenario::ALL {
                println!(
                    "{:<14} (>= {} cpus)  {}",
                    scenario.name(),
                    scenario.min_cpus(),
                    scenario.summary()
                );
            }
        }
        Command::Run {
            scenarios,
            log,
            cpus,
            iterations,
            defer_capacity,
            run_id,
            json,
        } => {
            let mut config = SyncConfig::from_env()?;
            if let Some(cpus) = cpus {
                config = config.with_cpus(cpus);
            }
            if let Some(capacity) = defer_capacity {
                config = config.with_defer_capacity(capacity);
            }
            let runner = ScenarioRunner::new(config, iterations)?;
            let scenarios = if scenarios.is_empty() {
                Scenario::ALL.to_vec()
            } else {
                scenarios
            };
            let run_id = run_id.unwrap_or_else(default_run_id);
            let mut emitter = match &log {
                Some(path) => LogEmitter::to_file(path, "quiesce", &run_id)?,
                None => LogEmitter::to_writer(std::io::sink(), "quiesce", &run_id),
            };

            eprintln!(
                "Running {} scenario(s) on {} cpus, {} iterations each",
                scenarios.len(),
                runner.config().cpus,
                runner.iterations()
            );
            let reports = runner.run_all(&scenarios, &mut emitter)?;
            for report in &reports {
                eprintln!(
                    "{:<14} {:<5} {:>7} ms",
                    report.name,
                    report.outcome.as_str(),
                    report.duration_ms()
                );
                if report.is_failure()
                    && let Some(error) = report.details.get("error").and_then(|e| e.as_str())
                {
                    eprintln!("    {error}");
                }
            }
            if let Some(path) = &log {
                eprintln!("Structured log written to {}", path.display());
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            }

            let failed = reports.iter().filter(|r| r.is_failure()).count();
            if failed > 0 {
                return Err(format!("{failed} scenario(s) failed").into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(format!(
                    "{} validation error(s) in {} line(s) of {}",
                    errors.len(),
                    lines,
                    log.display()
                )
                .into());
            }
            eprintln!("{}: {lines} valid line(s)", log.display());
        }
    }

    Ok(())
}
