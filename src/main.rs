//! pipeflow — entry point
//!
//! Progress lines and the final summary go to stdout. Tracing logs go to
//! stderr.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use pipeflow::backend::{self, DispatchError};
use pipeflow::config::{ConfigOverrides, ManagerConfig, Mode};
use pipeflow::graph::CycleError;
use pipeflow::init::{self, InitOptions, MissingInputError};
use pipeflow::manager::{self, LockRefused, OperatorAbort};
use pipeflow::model;
use pipeflow::paths::LogDir;
use pipeflow::runner;

#[derive(Debug, Parser)]
#[command(name = "pipeflow")]
#[command(about = "Dependency-ordered batch pipeline manager", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a pipeline to completion.
    Run {
        /// Pipeline declaration file (TOML, one [[job]] table per job).
        pipeline: PathBuf,

        /// Log directory owned by this pipeline.
        #[arg(long)]
        logs: PathBuf,

        /// Execution backend.
        #[arg(long, value_enum, default_value_t = Mode::Session)]
        mode: Mode,

        /// Concurrency cap (default: 1 for batch, unbounded otherwise).
        #[arg(long)]
        max_queued: Option<usize>,

        /// Idle sleep between loop iterations, in seconds.
        #[arg(long)]
        time_between_checks: Option<f64>,

        /// Emit a liveness dot after this many idle iterations.
        #[arg(long)]
        nb_checks_per_point: Option<u64>,

        /// Prologue injected into generated backend scripts.
        #[arg(long)]
        shell_options: Option<String>,

        /// Passed verbatim to qsub.
        #[arg(long)]
        qsub_options: Option<String>,

        /// Command used by backend scripts to start the job runner
        /// (default: this executable).
        #[arg(long)]
        runner_command: Option<String>,

        /// Force-rerun jobs whose name contains this substring (repeatable).
        #[arg(long = "restart", value_name = "SUBSTRING", action = clap::ArgAction::Append)]
        restart: Vec<String>,

        /// Detach the manager itself through the backend and return.
        #[arg(long)]
        detach: bool,

        /// Take over a stale lock without prompting.
        #[arg(long)]
        yes: bool,
    },

    /// [Internal] Execute one job and write its tag files — not for direct use.
    #[command(name = "_runner", hide = true)]
    Runner {
        #[arg(long)]
        logs: PathBuf,

        /// Job name.
        job: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout stays readable progress output.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("pipeflow: {}: {e:#}", error_kind(&e));
            std::process::exit(2);
        }
    }
}

/// Label the manager-level error kinds for the stderr report.
fn error_kind(e: &anyhow::Error) -> &'static str {
    if e.is::<CycleError>() {
        "dependency cycle"
    } else if e.is::<MissingInputError>() {
        "missing input"
    } else if e.is::<DispatchError>() {
        "dispatch failure"
    } else if e.is::<OperatorAbort>() {
        "operator abort"
    } else if e.is::<LockRefused>() {
        "lock refused"
    } else {
        "error"
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            pipeline,
            logs,
            mode,
            max_queued,
            time_between_checks,
            nb_checks_per_point,
            shell_options,
            qsub_options,
            runner_command,
            restart,
            detach,
            yes,
        } => {
            let jobs = model::load_pipeline(&pipeline)?;
            let cfg = ManagerConfig::resolve(
                mode,
                ConfigOverrides {
                    max_queued,
                    time_between_checks,
                    nb_checks_per_point,
                    shell_options,
                    qsub_options,
                    runner_command,
                    assume_yes: yes,
                },
            )?;
            let log_dir = LogDir::new(&logs);
            init::initialize(&log_dir, jobs, &InitOptions { restart: restart.clone() })?;

            if detach {
                let reinvoke = reinvoke_args(&pipeline, &logs, &cfg, &restart);
                backend::detach_manager(&cfg, &log_dir, &reinvoke)?;
                println!(
                    "Manager detached through the {} backend; follow {} for progress.",
                    cfg.mode.as_str(),
                    log_dir.history_path().display()
                );
                return Ok(0);
            }

            let summary = manager::run(&log_dir, &cfg)?;
            Ok(if summary.failed > 0 { 1 } else { 0 })
        }

        Command::Runner { logs, job } => {
            let log_dir = LogDir::new(&logs);
            let success = runner::run_job(&log_dir, &job)?;
            Ok(if success { 0 } else { 1 })
        }
    }
}

/// Arguments for the detached manager: same run, no `--detach`, and `--yes`
/// because a background manager cannot answer a lock prompt.
fn reinvoke_args(
    pipeline: &PathBuf,
    logs: &PathBuf,
    cfg: &ManagerConfig,
    restart: &[String],
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        pipeline.display().to_string(),
        "--logs".to_string(),
        logs.display().to_string(),
        "--mode".to_string(),
        cfg.mode.as_str().to_string(),
        "--yes".to_string(),
    ];
    if cfg.max_queued != usize::MAX {
        args.push("--max-queued".to_string());
        args.push(cfg.max_queued.to_string());
    }
    args.push("--time-between-checks".to_string());
    args.push(cfg.time_between_checks.to_string());
    if cfg.nb_checks_per_point != u64::MAX {
        args.push("--nb-checks-per-point".to_string());
        args.push(cfg.nb_checks_per_point.to_string());
    }
    if !cfg.shell_options.is_empty() {
        args.push("--shell-options".to_string());
        args.push(cfg.shell_options.clone());
    }
    if !cfg.qsub_options.is_empty() {
        args.push("--qsub-options".to_string());
        args.push(cfg.qsub_options.clone());
    }
    if let Some(runner_cmd) = &cfg.runner_command {
        args.push("--runner-command".to_string());
        args.push(runner_cmd.clone());
    }
    for sub in restart {
        args.push("--restart".to_string());
        args.push(sub.clone());
    }
    args
}
