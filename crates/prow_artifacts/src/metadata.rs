//! Side-car files written next to a job's artifacts.
//!
//! `started.json` and `finished.json` are first-write-wins;
//! `prowjob.json` is overwritten on every update. Clone records and the
//! plain-text logs are written by the clone/upload collaborator; the
//! types live here so both sides agree on the shape.

use std::collections::BTreeMap;

use prow_api::types::ProwJob;
use serde::{Deserialize, Serialize};

pub const STARTED_JSON: &str = "started.json";
pub const FINISHED_JSON: &str = "finished.json";
pub const PROWJOB_JSON: &str = "prowjob.json";
pub const CLONE_RECORDS_JSON: &str = "clone-records.json";
pub const CLONE_LOG_TXT: &str = "clone-log.txt";
/// The clone log doubles as the build log when cloning fails.
pub const BUILD_LOG_TXT: &str = "build-log.txt";

/// Value of `metadata.uploader` in records written by this system.
pub const UPLOADER_NAME: &str = "crier";

/// First record written for an attempt. Written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Started {
    /// Unix seconds.
    pub timestamp: i64,
    /// Comma-separated pull numbers, for quick scanning in listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<String>,
    /// org/repo -> refs text (`baseRef[:baseSHA][,N:SHA[:ref]]*`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub repos: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_version: Option<String>,
}

impl Started {
    pub fn from_job(job: &ProwJob) -> Started {
        let timestamp = job
            .status
            .pending_time
            .unwrap_or(job.status.start_time)
            .timestamp();
        let mut repos = BTreeMap::new();
        let mut pull = None;
        let mut repo_version = None;
        for refs in job.spec.refs.iter().chain(job.spec.extra_refs.iter()) {
            repos.insert(refs.org_repo(), refs.to_string());
        }
        if let Some(refs) = &job.spec.refs {
            if !refs.pulls.is_empty() {
                pull = Some(
                    refs.pulls
                        .iter()
                        .map(|p| p.number.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                );
            }
            if !refs.base_sha.is_empty() {
                repo_version = Some(refs.base_sha.clone());
            }
        }
        Started {
            timestamp,
            pull,
            repos,
            metadata: BTreeMap::from([("uploader".to_string(), UPLOADER_NAME.to_string())]),
            repo_version,
        }
    }
}

/// Terminal record for an attempt. Written once, on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Finished {
    /// Unix seconds.
    pub timestamp: i64,
    pub passed: bool,
    /// The terminal state string.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Finished {
    pub fn from_job(job: &ProwJob) -> Finished {
        let timestamp = job
            .status
            .completion_time
            .unwrap_or(job.status.start_time)
            .timestamp();
        Finished {
            timestamp,
            passed: job.status.state == prow_api::types::ProwJobState::Success,
            result: job.status.state.to_string(),
            metadata: BTreeMap::from([("uploader".to_string(), UPLOADER_NAME.to_string())]),
        }
    }
}

/// One command run while materializing a clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CloneCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured clone-operation log, one entry per refs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CloneRecord {
    pub refs: prow_api::types::Refs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CloneCommand>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_sha: Option<String>,
}
