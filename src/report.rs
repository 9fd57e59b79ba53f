//! The append-only news feed, the session history, and the terminal summary.
//!
//! `news_feed.csv` is the authoritative audit trail; the human-readable
//! stdout log is derivative. Lines have the shape `"<job> , <event>"`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

use crate::paths::{LogDir, now_stamp};

/// Field separator inside a news line.
const FIELD_SEP: &str = " , ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Submitted,
    Running,
    Finished,
    Failed,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Submitted => "submitted",
            Event::Running => "running",
            Event::Finished => "finished",
            Event::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Event> {
        match s {
            "submitted" => Some(Event::Submitted),
            "running" => Some(Event::Running),
            "finished" => Some(Event::Finished),
            "failed" => Some(Event::Failed),
            _ => None,
        }
    }

    /// Verb for the one-line stdout report.
    pub fn verb(self) -> &'static str {
        match self {
            Event::Submitted => "been submitted",
            Event::Running => "started running",
            Event::Finished => "finished",
            Event::Failed => "failed",
        }
    }
}

/// Append-only writer over `news_feed.csv`.
#[derive(Debug)]
pub struct NewsFeed {
    path: PathBuf,
}

impl NewsFeed {
    pub fn open(logs: &LogDir) -> Self {
        NewsFeed {
            path: logs.news_path(),
        }
    }

    pub fn append(&self, job: &str, event: Event) -> Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open news feed {}", self.path.display()))?;
        writeln!(f, "{job}{FIELD_SEP}{}", event.as_str())
            .with_context(|| format!("append to news feed {}", self.path.display()))?;
        Ok(())
    }
}

/// Tail-reader over a news feed. Keeps a byte offset so repeated polls never
/// rescan the file, and only consumes complete (newline-terminated) lines;
/// a partially written last line is left for the next poll.
#[derive(Debug)]
pub struct NewsCursor {
    path: PathBuf,
    offset: u64,
}

impl NewsCursor {
    pub fn new(logs: &LogDir) -> Self {
        NewsCursor {
            path: logs.news_path(),
            offset: 0,
        }
    }

    /// Events appended since the last poll.
    pub fn poll(&mut self) -> Result<Vec<(String, Event)>> {
        let data = match std::fs::read(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("read news feed {}", self.path.display()));
            }
        };
        if (data.len() as u64) < self.offset {
            // Feed was truncated behind our back; start over.
            self.offset = 0;
        }
        let fresh = &data[self.offset as usize..];
        // Consume up to the last complete line.
        let Some(end) = fresh.iter().rposition(|&b| b == b'\n') else {
            return Ok(vec![]);
        };
        let consumed = &fresh[..=end];
        self.offset += consumed.len() as u64;

        let text = String::from_utf8_lossy(consumed);
        let mut events = Vec::new();
        for line in text.lines() {
            let Some((job, event)) = line.split_once(FIELD_SEP) else {
                continue;
            };
            if let Some(event) = Event::parse(event.trim()) {
                events.push((job.trim().to_string(), event));
            }
        }
        Ok(events)
    }
}

/// Appends timestamped lines to `PIPE_history.txt`.
#[derive(Debug)]
pub struct History {
    path: PathBuf,
}

impl History {
    pub fn open(logs: &LogDir) -> Self {
        History {
            path: logs.history_path(),
        }
    }

    pub fn append(&self, message: &str) -> Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open history {}", self.path.display()))?;
        writeln!(f, "{} - {message}", now_stamp())?;
        Ok(())
    }
}

/// Per-job outcome counts reported at termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub finished: usize,
    pub failed: usize,
    /// Jobs never run because an ancestor failed.
    pub skipped: usize,
    /// Log path of the first failed job, for investigation.
    pub first_failed_log: Option<PathBuf>,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Pipeline done: {} finished, {} failed, {} skipped.",
            self.finished, self.failed, self.skipped
        )?;
        if let Some(log) = &self.first_failed_log {
            writeln!(f, "First failure log: {}", log.display())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, LogDir) {
        let tmp = tempfile::tempdir().unwrap();
        let logs = LogDir::new(tmp.path());
        logs.ensure().unwrap();
        (tmp, logs)
    }

    #[test]
    fn append_then_poll_round_trips() {
        let (_tmp, logs) = setup();
        let feed = NewsFeed::open(&logs);
        let mut cursor = NewsCursor::new(&logs);
        feed.append("a", Event::Submitted).unwrap();
        feed.append("a", Event::Finished).unwrap();
        let events = cursor.poll().unwrap();
        assert_eq!(
            events,
            vec![
                ("a".to_string(), Event::Submitted),
                ("a".to_string(), Event::Finished),
            ]
        );
        // Nothing new on a second poll.
        assert!(cursor.poll().unwrap().is_empty());
    }

    #[test]
    fn cursor_resumes_without_rescanning() {
        let (_tmp, logs) = setup();
        let feed = NewsFeed::open(&logs);
        let mut cursor = NewsCursor::new(&logs);
        feed.append("a", Event::Submitted).unwrap();
        assert_eq!(cursor.poll().unwrap().len(), 1);
        feed.append("b", Event::Submitted).unwrap();
        let events = cursor.poll().unwrap();
        assert_eq!(events, vec![("b".to_string(), Event::Submitted)]);
    }

    #[test]
    fn partial_trailing_line_is_left_for_next_poll() {
        let (_tmp, logs) = setup();
        let feed = NewsFeed::open(&logs);
        let mut cursor = NewsCursor::new(&logs);
        feed.append("a", Event::Submitted).unwrap();
        // Simulate a writer mid-line.
        std::fs::OpenOptions::new()
            .append(true)
            .open(logs.news_path())
            .unwrap()
            .write_all(b"b , sub")
            .unwrap();
        assert_eq!(cursor.poll().unwrap().len(), 1);
        std::fs::OpenOptions::new()
            .append(true)
            .open(logs.news_path())
            .unwrap()
            .write_all(b"mitted\n")
            .unwrap();
        let events = cursor.poll().unwrap();
        assert_eq!(events, vec![("b".to_string(), Event::Submitted)]);
    }

    #[test]
    fn missing_feed_polls_empty() {
        let (_tmp, logs) = setup();
        let mut cursor = NewsCursor::new(&logs);
        assert!(cursor.poll().unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let (_tmp, logs) = setup();
        std::fs::write(logs.news_path(), "garbage line\na , finished\n").unwrap();
        let mut cursor = NewsCursor::new(&logs);
        let events = cursor.poll().unwrap();
        assert_eq!(events, vec![("a".to_string(), Event::Finished)]);
    }
}
