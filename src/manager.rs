//! The execution supervisor: lock ownership, heartbeat, and the
//! observe/submit loop that drives a materialized pipeline to completion.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use ulid::Ulid;

use crate::backend::{self, Dispatch};
use crate::config::ManagerConfig;
use crate::graph;
use crate::model::PipeSpec;
use crate::paths::{self, LogDir, Tag, now_stamp};
use crate::report::{Event, History, NewsFeed, Summary};
use crate::sched::Scheduler;
use crate::status::{JobStatus, read_status};

/// The operator asked for a shutdown (`PIPE.kill` touched or `PIPE.lock`
/// removed) while jobs were still in flight.
#[derive(Debug)]
pub struct OperatorAbort;

impl std::fmt::Display for OperatorAbort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipeline execution interrupted on operator request")
    }
}

impl std::error::Error for OperatorAbort {}

/// A live lock was found and the user declined to take it over.
#[derive(Debug)]
pub struct LockRefused(pub PathBuf);

impl std::fmt::Display for LockRefused {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "log directory is owned by another manager (lock {})",
            self.0.display()
        )
    }
}

impl std::error::Error for LockRefused {}

/// Contents of `PIPE.lock`.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    session: String,
    pid: u32,
    user: String,
    host: String,
    started_at: String,
}

impl LockInfo {
    fn current(session: &str) -> Self {
        LockInfo {
            session: session.to_string(),
            pid: std::process::id(),
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".into()),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into()),
            started_at: now_stamp(),
        }
    }
}

/// Holds `PIPE.lock` for the lifetime of the manager; released on every exit
/// path, panic included.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(logs: &LogDir, info: &LockInfo, assume_yes: bool) -> Result<LockGuard> {
        let path = logs.lock_path();
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut f) => {
                    f.write_all(&serde_json::to_vec_pretty(info)?)
                        .with_context(|| format!("write lock {}", path.display()))?;
                    info!(lock = %path.display(), "lock acquired");
                    return Ok(LockGuard { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if assume_yes || confirm_takeover(&path)? {
                        paths::remove_if_present(&path)?;
                        continue;
                    }
                    return Err(LockRefused(path).into());
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("create lock {}", path.display()));
                }
            }
        }
    }

    /// The operator may delete the lock to request a shutdown.
    fn is_held(&self) -> bool {
        self.path.exists()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Describe the lock holder and ask on stderr whether to take over. Reading
/// EOF (non-interactive invocation) declines.
fn confirm_takeover(path: &PathBuf) -> Result<bool> {
    let holder = std::fs::read(path)
        .ok()
        .and_then(|raw| serde_json::from_slice::<LockInfo>(&raw).ok());
    match holder {
        Some(h) => eprintln!(
            "A manager already owns this log directory (session {}, pid {} on {}, since {}).",
            h.session, h.pid, h.host, h.started_at
        ),
        None => eprintln!(
            "A lock file {} exists but cannot be read.",
            path.display()
        ),
    }
    eprint!("Treat it as stale and take over? [y/N] ");
    std::io::stderr().flush().ok();
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("read lock takeover answer")?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Cadence of the manager heartbeat touch.
const HEARTBEAT_EVERY: Duration = Duration::from_secs(5);

/// Background thread touching the `heartbeat` file so external monitors can
/// detect manager death.
struct Heartbeat {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Heartbeat {
    fn start(logs: &LogDir) -> Heartbeat {
        let path = logs.heartbeat_path();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let _ = paths::touch(&path);
            let mut last = Instant::now();
            while !stop_flag.load(Ordering::Relaxed) {
                if last.elapsed() >= HEARTBEAT_EVERY {
                    let _ = paths::touch(&path);
                    last = Instant::now();
                }
                std::thread::sleep(Duration::from_millis(250));
            }
        });
        Heartbeat {
            stop,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Run the manager over an initialized log directory until the pipeline
/// drains. Returns the outcome summary; per-job failures are contained and
/// reported through it, manager-level errors abort.
pub fn run(logs: &LogDir, cfg: &ManagerConfig) -> Result<Summary> {
    let spec = PipeSpec::load(&logs.pipe_path())?;
    let analysis = graph::analyze(&spec.jobs)?;
    let names = analysis.order;
    let already_finished: Vec<bool> = names
        .iter()
        .map(|n| read_status(logs, n) == JobStatus::Finished)
        .collect();
    let finished_before = already_finished.iter().filter(|&&f| f).count();
    let sched = Scheduler::new(analysis.graph, &already_finished);

    let session = Ulid::new().to_string();
    let lock_info = LockInfo::current(&session);
    let lock = LockGuard::acquire(logs, &lock_info, cfg.assume_yes)?;
    let history = History::open(logs);
    history.append(&format!(
        "session {session} started: mode {}, {} jobs ({} already finished)",
        cfg.mode.as_str(),
        names.len(),
        finished_before
    ))?;
    let heartbeat = Heartbeat::start(logs);

    let mut driver = Driver {
        logs,
        cfg,
        lock: &lock,
        news: NewsFeed::open(logs),
        history: &history,
        seen_running: vec![false; names.len()],
        first_failed: None,
        names,
        sched,
    };
    let outcome = driver.drive();
    heartbeat.stop();

    let summary = driver.summary();
    print!("{summary}");
    match outcome {
        Ok(()) => {
            history.append(&format!(
                "session {session} ended: {} finished, {} failed, {} skipped",
                summary.finished, summary.failed, summary.skipped
            ))?;
            Ok(summary)
        }
        Err(e) => {
            history.append(&format!("session {session} aborted: {e:#}"))?;
            Err(e)
        }
    }
}

struct Driver<'a> {
    logs: &'a LogDir,
    cfg: &'a ManagerConfig,
    lock: &'a LockGuard,
    names: Vec<String>,
    sched: Scheduler,
    news: NewsFeed,
    history: &'a History,
    seen_running: Vec<bool>,
    first_failed: Option<usize>,
}

impl Driver<'_> {
    /// One observation/submission loop, cooperative and single-threaded.
    fn drive(&mut self) -> Result<()> {
        let mut idle: u64 = 0;
        let mut printed_dots = false;
        loop {
            if self.logs.kill_path().exists() || !self.lock.is_held() {
                if printed_dots {
                    println!();
                }
                return self.abort();
            }

            let mut changed = false;

            // Observe every dispatched job and advance the masks.
            for j in self.sched.running_indices() {
                let name = self.names[j].clone();
                match read_status(self.logs, &name) {
                    JobStatus::Finished => {
                        self.sched.mark_finished(j);
                        self.record(&name, Event::Finished)?;
                        changed = true;
                    }
                    JobStatus::Failed => {
                        self.fail(j)?;
                        changed = true;
                    }
                    JobStatus::Exit => {
                        // The wrapper died before the runner could leave a
                        // verdict; keep the queue captures with the job log
                        // and treat it as a failure.
                        backend::absorb_backend_logs(self.logs, &name)?;
                        self.history
                            .append(&format!("job {name}: backend wrapper crashed"))?;
                        self.fail(j)?;
                        changed = true;
                    }
                    JobStatus::Running => {
                        if !self.seen_running[j] {
                            self.seen_running[j] = true;
                            self.news.append(&name, Event::Running)?;
                            changed = true;
                        }
                    }
                    JobStatus::Submitted | JobStatus::None => {
                        // Still waiting in the external queue.
                    }
                }
            }

            // Submit runnable jobs while below the concurrency cap.
            while self.sched.queued() < self.cfg.max_queued
                && let Some(k) = self.sched.next_runnable()
            {
                let name = self.names[k].clone();
                self.sched.mark_submitted(k);
                self.record(&name, Event::Submitted)?;
                match backend::submit(self.cfg, self.logs, &name)? {
                    Dispatch::Queued => {}
                    Dispatch::Completed { success } => {
                        if success {
                            self.sched.mark_finished(k);
                            self.record(&name, Event::Finished)?;
                        } else {
                            self.fail(k)?;
                        }
                    }
                }
                changed = true;
            }

            if self.sched.is_drained() {
                break;
            }

            if changed {
                idle = 0;
            } else {
                idle += 1;
                if idle.is_multiple_of(self.cfg.nb_checks_per_point) {
                    print!(".");
                    std::io::stdout().flush().ok();
                    printed_dots = true;
                }
            }
            if self.cfg.time_between_checks > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(self.cfg.time_between_checks));
            }
        }
        if printed_dots {
            println!();
        }
        debug!("pipeline drained");
        Ok(())
    }

    /// A job failed: cascade-skip its descendants and record everything.
    fn fail(&mut self, j: usize) -> Result<()> {
        let name = self.names[j].clone();
        self.first_failed.get_or_insert(j);
        let skipped = self.sched.mark_failed(j);
        self.record(&name, Event::Failed)?;
        self.history.append(&format!(
            "job {name} failed; see {}",
            self.logs.log_path(&name).display()
        ))?;
        for k in skipped {
            self.history.append(&format!(
                "job {} skipped: depends on failed job {name}",
                self.names[k]
            ))?;
        }
        Ok(())
    }

    /// Append to the news feed and emit the one-line stdout report.
    fn record(&mut self, name: &str, event: Event) -> Result<()> {
        self.news.append(name, event)?;
        println!(
            "{} - The job {name} has {} ({} jobs in queue).",
            now_stamp(),
            event.verb(),
            self.sched.queued()
        );
        Ok(())
    }

    /// Operator shutdown: signal every running job, then bail out.
    fn abort(&mut self) -> Result<()> {
        for j in self.sched.running_indices() {
            let _ = paths::touch(&self.logs.tag_path(&self.names[j], Tag::Kill));
        }
        self.history
            .append("operator shutdown requested; kill tags written for running jobs")?;
        Err(OperatorAbort.into())
    }

    fn summary(&self) -> Summary {
        Summary {
            finished: self.sched.count_finished(),
            failed: self.sched.count_failed(),
            skipped: self.sched.count_skipped(),
            first_failed_log: self
                .first_failed
                .map(|j| self.logs.log_path(&self.names[j])),
        }
    }
}
