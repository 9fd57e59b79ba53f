//! Pipeline initialization: materialize the analyzed graph to disk and
//! reconcile a previous run against the newly submitted declaration.
//!
//! Reconciliation decides which previously-finished jobs must run again: a
//! job restarts when its declaration changed structurally or when its name
//! matches one of the user's restart substrings, and the restart set is
//! closed under descendants (re-running a producer invalidates every
//! transitive consumer). Orphans, jobs present on disk but absent from the
//! new declaration, have all their files deleted.

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::Path;

use crate::graph;
use crate::model::{JobDeclaration, PipeSpec};
use crate::paths::{LogDir, remove_if_present, write_atomic};
use crate::status::{JobStatus, read_status};

/// A required input has no producer and does not exist on disk.
#[derive(Debug)]
pub struct MissingInputError {
    pub job: String,
    pub files: Vec<String>,
}

impl std::fmt::Display for MissingInputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "job {} requires missing input file(s): {}",
            self.job,
            self.files.join(", ")
        )
    }
}

impl std::error::Error for MissingInputError {}

#[derive(Debug, Default)]
pub struct InitOptions {
    /// Force-rerun jobs whose name contains any of these substrings.
    pub restart: Vec<String>,
}

/// What reconciliation decided, for the session history.
#[derive(Debug)]
pub struct InitReport {
    pub restarted: Vec<String>,
    pub orphans: Vec<String>,
    /// Jobs kept as finished from a previous run.
    pub finished_kept: usize,
}

/// Analyze, pre-flight, reconcile and materialize a pipeline declaration.
///
/// Analysis and pre-flight run before anything touches the log directory,
/// so a rejected pipeline leaves no trace behind.
pub fn initialize(logs: &LogDir, jobs: Vec<JobDeclaration>, opts: &InitOptions) -> Result<InitReport> {
    let analysis = graph::analyze(&jobs)?;
    preflight(&jobs)?;
    logs.ensure()?;

    // A kill request left behind by a previous session must not abort the
    // new one before it starts.
    remove_if_present(&logs.kill_path())?;

    let n = jobs.len();
    let previous = PipeSpec::load(&logs.pipe_path()).ok();
    let mut restart = vec![false; n];
    let mut orphans = Vec::new();

    if let Some(prev) = &previous {
        for old in &prev.jobs {
            match analysis.index.get(&old.name) {
                Some(&j) => {
                    if jobs[j] != *old {
                        restart[j] = true;
                    }
                }
                None => {
                    logs.clear_job_files(&old.name)?;
                    orphans.push(old.name.clone());
                }
            }
        }
    }

    for pattern in &opts.restart {
        if pattern.is_empty() {
            continue;
        }
        for (j, job) in jobs.iter().enumerate() {
            if job.name.contains(pattern.as_str()) {
                restart[j] = true;
            }
        }
    }

    // Close under descendants.
    for j in 0..n {
        if restart[j] {
            for d in analysis.graph.descendants(j) {
                restart[d] = true;
            }
        }
    }

    // Restarted jobs must read as never-run.
    let mut restarted = Vec::new();
    for (j, job) in jobs.iter().enumerate() {
        if restart[j] {
            logs.clear_stale(&job.name)?;
            restarted.push(job.name.clone());
        }
    }

    // Every job that is not finished loses the leftovers of unfinished
    // runs: stale running tags, failed verdicts (retried by default), logs,
    // wrapper scripts and queue captures.
    let mut finished_kept = 0;
    for job in &jobs {
        if read_status(logs, &job.name) == JobStatus::Finished {
            finished_kept += 1;
        } else {
            logs.clear_stale(&job.name)?;
        }
    }

    let spec = PipeSpec {
        jobs,
        deps: analysis.deps,
    };
    spec.store(&logs.pipe_path())?;
    for job in &spec.jobs {
        if read_status(logs, &job.name) != JobStatus::Finished {
            write_atomic(
                &logs.payload_path(&job.name),
                &serde_json::to_vec_pretty(job)?,
            )?;
        }
    }

    Ok(InitReport {
        restarted,
        orphans,
        finished_kept,
    })
}

/// Every input not produced by any job in the pipeline must already exist.
fn preflight(jobs: &[JobDeclaration]) -> Result<()> {
    let produced: BTreeSet<String> = jobs.iter().flat_map(JobDeclaration::outputs).collect();
    for job in jobs {
        let missing: Vec<String> = job
            .inputs()
            .into_iter()
            .filter(|f| !produced.contains(f) && !Path::new(f).exists())
            .collect();
        if !missing.is_empty() {
            return Err(MissingInputError {
                job: job.name.clone(),
                files: missing,
            }
            .into());
        }
    }
    Ok(())
}
