//! Pipeline declarations and the materialized pipe spec.
//!
//! A pipeline file is TOML with an ordered array of `[[job]]` tables:
//!
//! ```toml
//! [[job]]
//! name = "motion"
//! command = "correct --in /data/raw.nii --out /data/mc.nii"
//! files_in = ["/data/raw.nii"]
//! files_out = ["/data/mc.nii"]
//!
//! [[job]]
//! name = "smooth"
//! command = "smooth --in /data/mc.nii --out /data/sm.nii"
//! files_in = ["/data/mc.nii"]
//! files_out = ["/data/sm.nii"]
//! opts = { fwhm = 6 }
//! ```
//!
//! Declaration order is preserved and becomes the canonical job order used
//! as the index space for all scheduler masks.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Placeholder file identifier: a declared slot carrying this token (or an
/// empty string) names no artifact and is ignored by dependency analysis and
/// pre-flight checks.
pub const OMITTED: &str = "gb_niak_omitted";

/// Job names that would collide with per-pipeline files in the log directory.
const RESERVED_NAMES: [&str; 4] = ["PIPE", "heartbeat", "news_feed", "tmp"];

/// One job: a command plus its declared input and output file sets.
/// Immutable once initialized; structural equality drives reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDeclaration {
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_in: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_out: Vec<String>,
    /// Opaque payload forwarded to the runner.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub opts: serde_json::Value,
}

impl JobDeclaration {
    /// Input file set after trimming and placeholder filtering.
    pub fn inputs(&self) -> BTreeSet<String> {
        clean_files(&self.files_in)
    }

    /// Output file set after trimming and placeholder filtering.
    pub fn outputs(&self) -> BTreeSet<String> {
        clean_files(&self.files_out)
    }
}

/// Trim, drop placeholders, deduplicate.
fn clean_files(raw: &[String]) -> BTreeSet<String> {
    raw.iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty() && *f != OMITTED)
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Deserialize)]
struct PipelineFile {
    #[serde(rename = "job", default)]
    jobs: Vec<JobDeclaration>,
}

/// Parse a TOML pipeline declaration file and validate job names.
pub fn load_pipeline(path: &Path) -> Result<Vec<JobDeclaration>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read pipeline file {}", path.display()))?;
    let file: PipelineFile = toml::from_str(&raw)
        .with_context(|| format!("parse pipeline file {}", path.display()))?;
    validate_names(&file.jobs)?;
    Ok(file.jobs)
}

fn validate_names(jobs: &[JobDeclaration]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for job in jobs {
        let name = job.name.as_str();
        if name.is_empty() {
            anyhow::bail!("job with empty name");
        }
        if name.contains(['/', '\\']) || name.chars().any(char::is_whitespace) {
            anyhow::bail!("job name {name:?} contains path separators or whitespace");
        }
        if RESERVED_NAMES.contains(&name) {
            anyhow::bail!("job name {name:?} is reserved for pipeline files");
        }
        if !seen.insert(name) {
            anyhow::bail!("duplicate job name {name:?}");
        }
    }
    Ok(())
}

/// Materialized pipeline: declarations plus the analyzed dependency mapping.
/// Written to `PIPE.json` by the initializer, read-only during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeSpec {
    pub jobs: Vec<JobDeclaration>,
    /// consumer → producer → files carried along that edge.
    pub deps: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl PipeSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read(path).with_context(|| format!("read pipe spec {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("parse pipe spec {}", path.display()))
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_vec_pretty(self)?;
        crate::paths::write_atomic(path, &contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn placeholders_and_whitespace_are_filtered() {
        let job = JobDeclaration {
            name: "j".into(),
            command: "true".into(),
            files_in: vec![
                " /a/x ".into(),
                String::new(),
                OMITTED.into(),
                "/a/x".into(),
            ],
            files_out: vec![],
            opts: serde_json::Value::Null,
        };
        let inputs = job.inputs();
        assert_eq!(inputs.len(), 1);
        assert!(inputs.contains("/a/x"));
    }

    #[test]
    fn pipeline_file_preserves_declaration_order() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
[[job]]
name = "b"
command = "true"

[[job]]
name = "a"
command = "true"
opts = {{ level = 3 }}
"#
        )
        .unwrap();
        let jobs = load_pipeline(f.path()).unwrap();
        assert_eq!(jobs[0].name, "b");
        assert_eq!(jobs[1].name, "a");
        assert_eq!(jobs[1].opts["level"], 3);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            "[[job]]\nname = \"a\"\ncommand = \"true\"\n[[job]]\nname = \"a\"\ncommand = \"true\"\n"
        )
        .unwrap();
        assert!(load_pipeline(f.path()).is_err());
    }

    #[test]
    fn reserved_names_are_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "[[job]]\nname = \"PIPE\"\ncommand = \"true\"\n").unwrap();
        assert!(load_pipeline(f.path()).is_err());
    }

    #[test]
    fn empty_pipeline_is_allowed() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let jobs = load_pipeline(f.path()).unwrap();
        assert!(jobs.is_empty());
    }

    #[test]
    fn structural_equality_sees_opts_changes() {
        let a = JobDeclaration {
            name: "j".into(),
            command: "true".into(),
            files_in: vec![],
            files_out: vec![],
            opts: serde_json::json!({"level": 1}),
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.opts = serde_json::json!({"level": 2});
        assert_ne!(a, b);
    }
}
