//! Manager configuration: backend selection and loop tuning.
//!
//! Every knob is resolved to a concrete value before the scheduler loop
//! starts; unbounded settings use the integer maximum rather than a
//! sentinel.

use anyhow::Result;

/// Backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Execute jobs in the current process, one at a time.
    Session,
    /// Hand jobs to the local one-shot `at` queue.
    Batch,
    /// Submit jobs to a cluster scheduler (SGE/PBS `qsub`).
    Qsub,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Session => "session",
            Mode::Batch => "batch",
            Mode::Qsub => "qsub",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unset CLI options; `resolve` fills in the per-mode defaults.
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub max_queued: Option<usize>,
    pub time_between_checks: Option<f64>,
    pub nb_checks_per_point: Option<u64>,
    pub shell_options: Option<String>,
    pub qsub_options: Option<String>,
    pub runner_command: Option<String>,
    pub assume_yes: bool,
}

/// Fully resolved manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub mode: Mode,
    /// Concurrency cap on dispatched jobs.
    pub max_queued: usize,
    /// Idle sleep between loop iterations, in seconds.
    pub time_between_checks: f64,
    /// Emit a liveness dot after this many idle iterations.
    pub nb_checks_per_point: u64,
    /// Prologue injected into generated backend scripts.
    pub shell_options: String,
    /// Passed verbatim to `qsub`.
    pub qsub_options: String,
    /// Command invoked by backend scripts to start the job runner;
    /// defaults to the current executable.
    pub runner_command: Option<String>,
    /// Take over a stale lock without prompting.
    pub assume_yes: bool,
}

impl ManagerConfig {
    pub fn resolve(mode: Mode, o: ConfigOverrides) -> Result<Self> {
        let max_queued = o.max_queued.unwrap_or(match mode {
            Mode::Batch => 1,
            Mode::Session | Mode::Qsub => usize::MAX,
        });
        if max_queued == 0 {
            anyhow::bail!("max_queued must be at least 1");
        }
        let time_between_checks = o.time_between_checks.unwrap_or(match mode {
            Mode::Session => 0.0,
            Mode::Batch | Mode::Qsub => 10.0,
        });
        // A NaN or infinite sleep would silently never be honored; the
        // configuration must be concrete before the loop starts.
        if !time_between_checks.is_finite() || time_between_checks < 0.0 {
            anyhow::bail!(
                "time_between_checks must be a finite non-negative number of seconds, got {time_between_checks}"
            );
        }
        let nb_checks_per_point = o.nb_checks_per_point.unwrap_or(match mode {
            Mode::Session => u64::MAX,
            Mode::Batch | Mode::Qsub => 6,
        });
        Ok(ManagerConfig {
            mode,
            max_queued,
            time_between_checks,
            nb_checks_per_point: nb_checks_per_point.max(1),
            shell_options: o.shell_options.unwrap_or_default(),
            qsub_options: o.qsub_options.unwrap_or_default(),
            runner_command: o.runner_command,
            assume_yes: o.assume_yes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_defaults() {
        let cfg = ManagerConfig::resolve(Mode::Batch, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.max_queued, 1);
        assert_eq!(cfg.time_between_checks, 10.0);
        assert_eq!(cfg.nb_checks_per_point, 6);
    }

    #[test]
    fn session_defaults_are_unbounded() {
        let cfg = ManagerConfig::resolve(Mode::Session, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.max_queued, usize::MAX);
        assert_eq!(cfg.time_between_checks, 0.0);
    }

    #[test]
    fn nan_sleep_is_rejected() {
        let o = ConfigOverrides {
            time_between_checks: Some(f64::NAN),
            ..Default::default()
        };
        assert!(ManagerConfig::resolve(Mode::Qsub, o).is_err());
    }

    #[test]
    fn zero_cap_is_rejected() {
        let o = ConfigOverrides {
            max_queued: Some(0),
            ..Default::default()
        };
        assert!(ManagerConfig::resolve(Mode::Batch, o).is_err());
    }
}
