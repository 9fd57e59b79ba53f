//! Job status resolution from tag files.
//!
//! The reader is side-effect free: it only stats files in the log directory.
//! Priority (first match wins): finished → failed → exit → running →
//! submitted → none.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::paths::{LogDir, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    None,
    Submitted,
    Running,
    Finished,
    Failed,
    /// Backend wrapper exited without a runner verdict; intermediate state
    /// seen with queue backends, promoted to `Failed` by the manager.
    Exit,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::None => "none",
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Exit => "exit",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

/// Resolve the current status of `job` by inspecting its tag files.
pub fn read_status(logs: &LogDir, job: &str) -> JobStatus {
    if verdict_present(&logs.tag_path(job, Tag::Finished)) {
        JobStatus::Finished
    } else if verdict_present(&logs.tag_path(job, Tag::Failed)) {
        JobStatus::Failed
    } else if logs.tag_path(job, Tag::Exit).exists() {
        JobStatus::Exit
    } else if logs.tag_path(job, Tag::Running).exists() {
        JobStatus::Running
    } else if logs.script_path(job).exists() {
        // The generated script is the durable submission side effect; the
        // runner has not started yet.
        JobStatus::Submitted
    } else {
        JobStatus::None
    }
}

/// A verdict tag counts only once it is non-empty or at least one second
/// old. A backend may have created the file but not yet flushed its content;
/// treating it as absent for one poll avoids acting on a partial write.
fn verdict_present(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if meta.len() > 0 {
        return true;
    }
    meta.modified()
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_none_or(|age| age >= Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::touch;

    fn logs() -> (tempfile::TempDir, LogDir) {
        let tmp = tempfile::tempdir().unwrap();
        let logs = LogDir::new(tmp.path());
        logs.ensure().unwrap();
        (tmp, logs)
    }

    #[test]
    fn no_tags_means_none() {
        let (_tmp, logs) = logs();
        assert_eq!(read_status(&logs, "j"), JobStatus::None);
    }

    #[test]
    fn finished_wins_over_everything() {
        let (_tmp, logs) = logs();
        for tag in Tag::ALL {
            touch(&logs.tag_path("j", tag)).unwrap();
        }
        assert_eq!(read_status(&logs, "j"), JobStatus::Finished);
    }

    #[test]
    fn failed_wins_over_running() {
        let (_tmp, logs) = logs();
        touch(&logs.tag_path("j", Tag::Running)).unwrap();
        touch(&logs.tag_path("j", Tag::Failed)).unwrap();
        assert_eq!(read_status(&logs, "j"), JobStatus::Failed);
    }

    #[test]
    fn exit_without_verdict_is_reported() {
        let (_tmp, logs) = logs();
        touch(&logs.tag_path("j", Tag::Exit)).unwrap();
        assert_eq!(read_status(&logs, "j"), JobStatus::Exit);
    }

    #[test]
    fn script_alone_means_submitted() {
        let (_tmp, logs) = logs();
        touch(&logs.script_path("j")).unwrap();
        assert_eq!(read_status(&logs, "j"), JobStatus::Submitted);
    }

    #[test]
    fn empty_fresh_verdict_is_ignored() {
        let (_tmp, logs) = logs();
        // Simulate a tag created but not yet flushed: empty and brand new.
        std::fs::write(logs.tag_path("j", Tag::Finished), b"").unwrap();
        touch(&logs.tag_path("j", Tag::Running)).unwrap();
        assert_eq!(read_status(&logs, "j"), JobStatus::Running);
    }
}
