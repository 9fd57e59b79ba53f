//! Backend dispatch: turn a submit request into actual process execution.
//!
//! All three strategies share one contract: cause the job runner to execute
//! and report through tag files. `session` runs the job in-process and
//! blocks; `batch` and `qsub` generate a wrapper script under `tmp/` and
//! hand it to the external queue, returning immediately. The wrapper ends
//! with `touch <job>.exit` so the manager can tell a dead wrapper from a
//! queued one.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

use crate::config::{ManagerConfig, Mode};
use crate::paths::{LogDir, Tag};
use crate::runner;

/// The backend submission command itself failed; fatal to the manager.
#[derive(Debug)]
pub struct DispatchError {
    pub job: String,
    pub backend: &'static str,
    pub detail: String,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "submission of job {} via {} failed: {}",
            self.job, self.backend, self.detail
        )
    }
}

impl std::error::Error for DispatchError {}

/// Result of a submit call.
#[derive(Debug)]
pub enum Dispatch {
    /// The job ran to completion in-process (`session`).
    Completed { success: bool },
    /// The job was handed to an external queue; tag files will tell.
    Queued,
}

/// Submit one job through the configured backend.
pub fn submit(cfg: &ManagerConfig, logs: &LogDir, job: &str) -> Result<Dispatch> {
    match cfg.mode {
        Mode::Session => match runner::run_job(logs, job) {
            Ok(success) => Ok(Dispatch::Completed { success }),
            Err(e) => {
                // The runner already left a failed verdict; contain it.
                warn!(job, error = %format!("{e:#}"), "runner error");
                Ok(Dispatch::Completed { success: false })
            }
        },
        Mode::Batch => {
            let script = write_script(cfg, logs, job)?;
            run_submission(
                job,
                "at",
                Command::new("at").arg("-f").arg(&script).arg("now"),
            )?;
            Ok(Dispatch::Queued)
        }
        Mode::Qsub => {
            let script = write_script(cfg, logs, job)?;
            let mut cmd = Command::new("qsub");
            cmd.arg("-e")
                .arg(logs.eqsub_path(job))
                .arg("-o")
                .arg(logs.oqsub_path(job))
                .arg("-N")
                .arg(qsub_name(job));
            if !cfg.qsub_options.is_empty() {
                cmd.args(cfg.qsub_options.split_whitespace());
            }
            cmd.arg(&script);
            run_submission(job, "qsub", &mut cmd)?;
            Ok(Dispatch::Queued)
        }
    }
}

/// Run a queue submission command; non-zero exit or a spawn failure is a
/// `DispatchError`.
fn run_submission(job: &str, backend: &'static str, cmd: &mut Command) -> Result<()> {
    debug!(job, backend, "submitting");
    let output = cmd.output().map_err(|e| DispatchError {
        job: job.to_string(),
        backend,
        detail: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(DispatchError {
            job: job.to_string(),
            backend,
            detail: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
        .into());
    }
    Ok(())
}

/// Cluster schedulers truncate or reject long job names; fifteen characters
/// is the portable limit.
fn qsub_name(job: &str) -> String {
    format!("pf_{job}").chars().take(15).collect()
}

/// Generate the wrapper script for `batch`/`qsub` dispatch.
fn write_script(cfg: &ManagerConfig, logs: &LogDir, job: &str) -> Result<PathBuf> {
    let runner_cmd = match &cfg.runner_command {
        Some(c) => c.clone(),
        None => std::env::current_exe()
            .context("resolve current executable")?
            .display()
            .to_string(),
    };
    let script = logs.script_path(job);
    let mut body = String::from("#!/bin/sh\n");
    if !cfg.shell_options.is_empty() {
        body.push_str(&cfg.shell_options);
        body.push('\n');
    }
    body.push_str(&format!(
        "{runner_cmd} _runner --logs {} {} >> {} 2>&1\n",
        quote(logs.root()),
        shell_quote(job),
        quote(&logs.log_path(job)),
    ));
    body.push_str(&format!(
        "touch {}\n",
        quote(&logs.tag_path(job, Tag::Exit))
    ));
    std::fs::write(&script, body)
        .with_context(|| format!("write backend script {}", script.display()))?;
    make_executable(&script)?;
    Ok(script)
}

/// Resubmit the manager itself through the backend (`--detach`), so the
/// terminal can be released while the pipeline runs.
pub fn detach_manager(cfg: &ManagerConfig, logs: &LogDir, reinvoke: &[String]) -> Result<()> {
    let exe = std::env::current_exe().context("resolve current executable")?;
    let script = logs.tmp_dir().join("manager.sh");
    let manager_log = logs.tmp_dir().join("manager.log");
    let mut body = String::from("#!/bin/sh\n");
    if !cfg.shell_options.is_empty() {
        body.push_str(&cfg.shell_options);
        body.push('\n');
    }
    let args: Vec<String> = reinvoke.iter().map(|a| shell_quote(a)).collect();
    body.push_str(&format!(
        "{} {} >> {} 2>&1\n",
        quote(&exe),
        args.join(" "),
        quote(&manager_log),
    ));
    std::fs::write(&script, body)
        .with_context(|| format!("write manager script {}", script.display()))?;
    make_executable(&script)?;
    match cfg.mode {
        Mode::Qsub => {
            let mut cmd = Command::new("qsub");
            cmd.arg("-e")
                .arg(logs.tmp_dir().join("manager.eqsub"))
                .arg("-o")
                .arg(logs.tmp_dir().join("manager.oqsub"))
                .arg("-N")
                .arg("pf_manager");
            if !cfg.qsub_options.is_empty() {
                cmd.args(cfg.qsub_options.split_whitespace());
            }
            cmd.arg(&script);
            run_submission("manager", "qsub", &mut cmd)
        }
        Mode::Session | Mode::Batch => run_submission(
            "manager",
            "at",
            Command::new("at").arg("-f").arg(&script).arg("now"),
        ),
    }
}

/// After a wrapper died without a runner verdict, fold whatever the queue
/// captured into the job's own log so the evidence sits in one place.
pub fn absorb_backend_logs(logs: &LogDir, job: &str) -> Result<()> {
    let log_path = logs.log_path(job);
    let mut log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open job log {}", log_path.display()))?;
    writeln!(
        log,
        "\n***** The backend wrapper exited without a runner verdict *****"
    )?;
    for (label, path) in [
        ("qsub stdout", logs.oqsub_path(job)),
        ("qsub stderr", logs.eqsub_path(job)),
    ] {
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        writeln!(log, "***** {label} ({}) *****", path.display())?;
        log.write_all(contents.as_bytes())?;
        if !contents.ends_with('\n') {
            writeln!(log)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn quote(path: &Path) -> String {
    shell_quote(&path.display().to_string())
}

/// Single-quote a string for /bin/sh.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOverrides;

    fn cfg(mode: Mode) -> ManagerConfig {
        ManagerConfig::resolve(
            mode,
            ConfigOverrides {
                runner_command: Some("/opt/pipeflow/bin/pipeflow".into()),
                shell_options: Some("export PATH=/opt/tools:$PATH".into()),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn script_redirects_and_touches_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = LogDir::new(tmp.path());
        logs.ensure().unwrap();
        let script = write_script(&cfg(Mode::Batch), &logs, "stage_a").unwrap();
        let body = std::fs::read_to_string(&script).unwrap();
        assert!(body.starts_with("#!/bin/sh\n"));
        assert!(body.contains("export PATH=/opt/tools:$PATH"));
        assert!(body.contains("_runner"));
        assert!(body.contains("stage_a.log' 2>&1"));
        assert!(body.trim_end().ends_with("stage_a.exit'"));
    }

    #[test]
    fn qsub_name_is_truncated_to_fifteen() {
        assert_eq!(qsub_name("short"), "pf_short");
        let name = qsub_name("a_very_long_job_name_indeed");
        assert_eq!(name.chars().count(), 15);
        assert!(name.starts_with("pf_"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn absorb_appends_qsub_captures_under_banners() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = LogDir::new(tmp.path());
        logs.ensure().unwrap();
        std::fs::write(logs.log_path("j"), "job output\n").unwrap();
        std::fs::write(logs.oqsub_path("j"), "queue said hi\n").unwrap();
        std::fs::write(logs.eqsub_path("j"), "queue complained").unwrap();
        absorb_backend_logs(&logs, "j").unwrap();
        let log = std::fs::read_to_string(logs.log_path("j")).unwrap();
        assert!(log.starts_with("job output\n"));
        assert!(log.contains("without a runner verdict"));
        assert!(log.contains("queue said hi"));
        assert!(log.contains("queue complained\n"));
    }
}
