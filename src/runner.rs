//! The job runner: executes one job's command and reports through tag files.
//!
//! The runner is the only writer of its own `.running`/`.finished`/`.failed`
//! tags. It is reached two ways: in-process for the `session` backend, and
//! through the hidden `_runner` sub-command from generated `batch`/`qsub`
//! scripts.

use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::info;

use crate::model::JobDeclaration;
use crate::paths::{self, LogDir, Tag, now_stamp};

/// Poll interval while the child runs.
const POLL: Duration = Duration::from_millis(200);
/// Cadence of the per-job heartbeat touch.
const HEARTBEAT_EVERY: Duration = Duration::from_secs(5);

/// Execute one job to completion. Returns whether the job succeeded; the
/// verdict is also written to the job's tag files, so observers that only
/// see the filesystem reach the same conclusion.
pub fn run_job(logs: &LogDir, job: &str) -> Result<bool> {
    match run_job_inner(logs, job) {
        Ok(success) => Ok(success),
        Err(e) => {
            // Even a runner that cannot start must leave a verdict, or the
            // manager would wait on this job forever.
            let _ = std::fs::write(
                logs.tag_path(job, Tag::Failed),
                format!("{}\nrunner error: {e:#}\n", now_stamp()),
            );
            let _ = paths::remove_if_present(&logs.tag_path(job, Tag::Running));
            Err(e)
        }
    }
}

fn run_job_inner(logs: &LogDir, job: &str) -> Result<bool> {
    let payload_path = logs.payload_path(job);
    let raw = std::fs::read(&payload_path)
        .with_context(|| format!("read job payload {}", payload_path.display()))?;
    let decl: JobDeclaration = serde_json::from_slice(&raw)
        .with_context(|| format!("parse job payload {}", payload_path.display()))?;

    // Fresh start: no verdict from a previous attempt may survive.
    paths::remove_if_present(&logs.tag_path(job, Tag::Finished))?;
    paths::remove_if_present(&logs.tag_path(job, Tag::Failed))?;
    paths::touch(&logs.tag_path(job, Tag::Running))?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs.log_path(job))
        .with_context(|| format!("open job log {}", logs.log_path(job).display()))?;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&decl.command)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file.try_clone().context("clone log handle")?))
        .stderr(Stdio::from(log_file))
        .spawn()
        .with_context(|| format!("spawn command for job {job}"))?;

    let pid = child.id();
    info!(job, pid, "job command started");

    let kill_tag = logs.tag_path(job, Tag::Kill);
    let mut last_heartbeat = Instant::now();
    let _ = paths::touch(&logs.tag_path(job, Tag::Heartbeat));
    let mut killed = false;

    let status = loop {
        if let Some(status) = child.try_wait().context("wait for job command")? {
            break status;
        }
        if last_heartbeat.elapsed() >= HEARTBEAT_EVERY {
            let _ = paths::touch(&logs.tag_path(job, Tag::Heartbeat));
            last_heartbeat = Instant::now();
        }
        if !killed && kill_tag.exists() {
            info!(job, pid, "kill tag observed, sending SIGTERM");
            send_term(pid);
            killed = true;
        }
        std::thread::sleep(POLL);
    };

    let success = status.success() && !killed;
    if success {
        std::fs::write(
            logs.tag_path(job, Tag::Finished),
            format!("{}\nexit code 0\n", now_stamp()),
        )?;
    } else {
        let detail = if killed {
            "killed on request".to_string()
        } else {
            match status.code() {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        };
        std::fs::write(
            logs.tag_path(job, Tag::Failed),
            format!("{}\n{detail}\n", now_stamp()),
        )?;
    }
    paths::remove_if_present(&logs.tag_path(job, Tag::Running))?;
    paths::remove_if_present(&logs.tag_path(job, Tag::Heartbeat))?;
    info!(job, success, "job command finished");
    Ok(success)
}

#[cfg(unix)]
fn send_term(pid: u32) {
    // SAFETY: kill(2) is safe to call with any pid and a valid signal
    // number. ESRCH just means the child is already gone.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
}

#[cfg(not(unix))]
fn send_term(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::status::{JobStatus, read_status};

    fn prepare(command: &str) -> (tempfile::TempDir, LogDir) {
        let tmp = tempfile::tempdir().unwrap();
        let logs = LogDir::new(tmp.path());
        logs.ensure().unwrap();
        let decl = JobDeclaration {
            name: "j".into(),
            command: command.into(),
            files_in: vec![],
            files_out: vec![],
            opts: serde_json::Value::Null,
        };
        std::fs::write(
            logs.payload_path("j"),
            serde_json::to_vec_pretty(&decl).unwrap(),
        )
        .unwrap();
        (tmp, logs)
    }

    #[test]
    fn successful_command_leaves_finished_tag() {
        let (_tmp, logs) = prepare("echo out-line");
        assert!(run_job(&logs, "j").unwrap());
        assert_eq!(read_status(&logs, "j"), JobStatus::Finished);
        assert!(!logs.tag_path("j", Tag::Running).exists());
        let log = std::fs::read_to_string(logs.log_path("j")).unwrap();
        assert!(log.contains("out-line"));
    }

    #[test]
    fn failing_command_records_exit_code() {
        let (_tmp, logs) = prepare("exit 3");
        assert!(!run_job(&logs, "j").unwrap());
        assert_eq!(read_status(&logs, "j"), JobStatus::Failed);
        let tag = std::fs::read_to_string(logs.tag_path("j", Tag::Failed)).unwrap();
        assert!(tag.contains("exit code 3"));
    }

    #[test]
    fn missing_payload_still_leaves_a_verdict() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = LogDir::new(tmp.path());
        logs.ensure().unwrap();
        assert!(run_job(&logs, "absent").is_err());
        assert_eq!(read_status(&logs, "absent"), JobStatus::Failed);
    }

    #[test]
    fn kill_tag_interrupts_a_long_command() {
        let (_tmp, logs) = prepare("sleep 30");
        crate::paths::touch(&logs.tag_path("j", Tag::Kill)).unwrap();
        let started = std::time::Instant::now();
        assert!(!run_job(&logs, "j").unwrap());
        assert!(started.elapsed() < Duration::from_secs(10));
        let tag = std::fs::read_to_string(logs.tag_path("j", Tag::Failed)).unwrap();
        assert!(tag.contains("killed"));
    }
}
