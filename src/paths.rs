//! Log-directory naming and tag-file primitives.
//!
//! Everything the manager and the job runners exchange lives in a single log
//! directory; file presence is the serialization boundary between them. This
//! module only defines the canonical names and the create/delete/exists
//! primitives; it never interprets tag contents.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};

/// Current time as an RFC 3339 UTC string (second precision).
pub fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Per-job tag files. The runner writes `running`/`finished`/`failed`, the
/// backend wrapper writes `exit`, the manager writes `kill`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Running,
    Finished,
    Failed,
    Exit,
    Kill,
    Heartbeat,
}

impl Tag {
    pub const ALL: [Tag; 6] = [
        Tag::Running,
        Tag::Finished,
        Tag::Failed,
        Tag::Exit,
        Tag::Kill,
        Tag::Heartbeat,
    ];

    /// File extension appended to the job name.
    pub fn ext(self) -> &'static str {
        match self {
            Tag::Running => "running",
            Tag::Finished => "finished",
            Tag::Failed => "failed",
            Tag::Exit => "exit",
            Tag::Kill => "kill",
            Tag::Heartbeat => "heartbeat",
        }
    }
}

/// Create (or overwrite) a tag file with the current timestamp as content.
pub fn touch(path: &Path) -> Result<()> {
    std::fs::write(path, now_stamp()).with_context(|| format!("touch {}", path.display()))
}

/// Remove a file if it exists; returns whether anything was removed.
pub fn remove_if_present(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

/// Write a file through a temporary sibling plus rename, so readers never
/// observe a half-written artifact.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp-write");
    std::fs::write(&tmp, contents).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} into place", path.display()))?;
    Ok(())
}

/// Handle to a pipeline's log directory.
#[derive(Debug, Clone)]
pub struct LogDir {
    root: PathBuf,
}

impl LogDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LogDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the log directory and its `tmp/` script directory.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(self.tmp_dir())
            .with_context(|| format!("create log directory {}", self.root.display()))
    }

    // ---------- Per-pipeline files ----------

    /// Canonical pipeline declaration plus analyzed graph.
    pub fn pipe_path(&self) -> PathBuf {
        self.root.join("PIPE.json")
    }

    /// Manager-alive marker; exactly one manager owns a log directory.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("PIPE.lock")
    }

    /// Operator-requested shutdown; touched externally.
    pub fn kill_path(&self) -> PathBuf {
        self.root.join("PIPE.kill")
    }

    /// Touched periodically while the manager is alive.
    pub fn heartbeat_path(&self) -> PathBuf {
        self.root.join("heartbeat")
    }

    /// Append-only event log.
    pub fn news_path(&self) -> PathBuf {
        self.root.join("news_feed.csv")
    }

    /// Human-readable session history.
    pub fn history_path(&self) -> PathBuf {
        self.root.join("PIPE_history.txt")
    }

    /// Generated backend scripts live here.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    // ---------- Per-job files ----------

    /// Runner payload: the job's declaration, serialized.
    pub fn payload_path(&self, job: &str) -> PathBuf {
        self.root.join(format!("{job}.json"))
    }

    /// Combined stdout/stderr capture of the job.
    pub fn log_path(&self, job: &str) -> PathBuf {
        self.root.join(format!("{job}.log"))
    }

    pub fn tag_path(&self, job: &str, tag: Tag) -> PathBuf {
        self.root.join(format!("{job}.{}", tag.ext()))
    }

    /// Generated backend script for `batch`/`qsub` dispatch.
    pub fn script_path(&self, job: &str) -> PathBuf {
        self.tmp_dir().join(format!("{job}.sh"))
    }

    /// qsub stdout capture.
    pub fn oqsub_path(&self, job: &str) -> PathBuf {
        self.root.join(format!("{job}.oqsub"))
    }

    /// qsub stderr capture.
    pub fn eqsub_path(&self, job: &str) -> PathBuf {
        self.root.join(format!("{job}.eqsub"))
    }

    // ---------- Composite cleanups ----------

    /// Remove every tag file of a job.
    pub fn clear_tags(&self, job: &str) -> Result<()> {
        for tag in Tag::ALL {
            remove_if_present(&self.tag_path(job, tag))?;
        }
        Ok(())
    }

    /// Remove the leftovers of an unfinished run: tags, log, backend captures
    /// and the generated script. The payload is left alone (the initializer
    /// rewrites it).
    pub fn clear_stale(&self, job: &str) -> Result<()> {
        self.clear_tags(job)?;
        remove_if_present(&self.log_path(job))?;
        remove_if_present(&self.oqsub_path(job))?;
        remove_if_present(&self.eqsub_path(job))?;
        remove_if_present(&self.script_path(job))?;
        Ok(())
    }

    /// Remove every file belonging to a job, payload included. Used for
    /// orphans that no longer appear in the declared pipeline.
    pub fn clear_job_files(&self, job: &str) -> Result<()> {
        self.clear_stale(job)?;
        remove_if_present(&self.payload_path(job))?;
        Ok(())
    }
}
