//! ProwJob record and lifecycle types.
//!
//! These are the canonical definitions used across all crates; the wire
//! format (persistence and CLI) is the serde encoding of [`ProwJob`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decoration::{DecorationConfig, DecorationError};
use crate::rerun::{RerunAuthConfig, RerunAuthError};

/// Wire kind for every ProwJob object.
pub const KIND: &str = "ProwJob";
/// Wire apiVersion for every ProwJob object.
pub const API_VERSION: &str = "prow.k8s.io/v1";
/// Cluster alias used when the spec names none.
pub const DEFAULT_CLUSTER_ALIAS: &str = "default";

// ============================================================================
// Canonical Enums
// ============================================================================

/// Job type - what kind of source-code event scheduled the job.
/// This is the CANONICAL definition - use this everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProwJobType {
    /// Runs against a pull request before merge
    #[default]
    Presubmit,
    /// Runs against a branch after merge
    Postsubmit,
    /// Runs on a timer, no triggering change
    Periodic,
    /// Runs against a set of pull requests together
    Batch,
}

impl ProwJobType {
    pub const ALL: &'static [ProwJobType] = &[
        ProwJobType::Presubmit,
        ProwJobType::Postsubmit,
        ProwJobType::Periodic,
        ProwJobType::Batch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProwJobType::Presubmit => "presubmit",
            ProwJobType::Postsubmit => "postsubmit",
            ProwJobType::Periodic => "periodic",
            ProwJobType::Batch => "batch",
        }
    }

    /// Only presubmits and batches are subject to supersession.
    pub fn can_be_superseded(&self) -> bool {
        matches!(self, ProwJobType::Presubmit | ProwJobType::Batch)
    }
}

impl fmt::Display for ProwJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProwJobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "presubmit" => Ok(ProwJobType::Presubmit),
            "postsubmit" => Ok(ProwJobType::Postsubmit),
            "periodic" => Ok(ProwJobType::Periodic),
            "batch" => Ok(ProwJobType::Batch),
            _ => Err(format!("Invalid prow job type: '{}'", s)),
        }
    }
}

/// Job lifecycle state.
/// This is the CANONICAL definition - use this everywhere.
///
/// Valid transitions:
///
/// ```text
/// triggered -> pending -> success | failure | error | aborted
/// triggered -> aborted   (supersession or user cancel)
/// triggered -> error     (validation failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProwJobState {
    /// Job created but not yet scheduled onto an execution backend
    #[default]
    Triggered,
    /// Execution backend has picked the job up
    Pending,
    /// Payload ran and passed
    Success,
    /// Payload ran and failed
    Failure,
    /// Job was cancelled before completion
    Aborted,
    /// Unrecoverable pre-execution fault
    Error,
}

impl ProwJobState {
    pub const ALL: &'static [ProwJobState] = &[
        ProwJobState::Triggered,
        ProwJobState::Pending,
        ProwJobState::Success,
        ProwJobState::Failure,
        ProwJobState::Aborted,
        ProwJobState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProwJobState::Triggered => "triggered",
            ProwJobState::Pending => "pending",
            ProwJobState::Success => "success",
            ProwJobState::Failure => "failure",
            ProwJobState::Aborted => "aborted",
            ProwJobState::Error => "error",
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProwJobState::Success
                | ProwJobState::Failure
                | ProwJobState::Aborted
                | ProwJobState::Error
        )
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: ProwJobState) -> bool {
        if *self == next {
            return false;
        }
        match self {
            ProwJobState::Triggered => matches!(
                next,
                ProwJobState::Pending | ProwJobState::Aborted | ProwJobState::Error
            ),
            ProwJobState::Pending => matches!(
                next,
                ProwJobState::Success
                    | ProwJobState::Failure
                    | ProwJobState::Error
                    | ProwJobState::Aborted
            ),
            _ => false,
        }
    }
}

impl fmt::Display for ProwJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProwJobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "triggered" => Ok(ProwJobState::Triggered),
            "pending" => Ok(ProwJobState::Pending),
            "success" => Ok(ProwJobState::Success),
            "failure" => Ok(ProwJobState::Failure),
            "aborted" => Ok(ProwJobState::Aborted),
            "error" => Ok(ProwJobState::Error),
            _ => Err(format!("Invalid prow job state: '{}'", s)),
        }
    }
}

// ============================================================================
// Refs and Pulls
// ============================================================================

/// One pull request inside a [`Refs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pull {
    pub number: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    pub sha: String,
    /// Git fetch ref for the pull head, when the provider vends one.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub head_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_link: Option<String>,
}

/// Source location a job runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Refs {
    pub org: String,
    pub repo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_sha: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pulls: Vec<Pull>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_link: Option<String>,
}

impl Refs {
    pub fn org_repo(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }
}

/// Text form: `baseRef[:baseSHA][,N:SHA[:ref]]*`.
impl fmt::Display for Refs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_ref)?;
        if !self.base_sha.is_empty() {
            write!(f, ":{}", self.base_sha)?;
        }
        for pull in &self.pulls {
            write!(f, ",{}:{}", pull.number, pull.sha)?;
            if let Some(head_ref) = &pull.head_ref {
                write!(f, ":{}", head_ref)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// ProwJob
// ============================================================================

/// Identity metadata, k8s object style. `resource_version` is the
/// compare-and-set token vended by the store; everyone else treats it as
/// opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(
        default,
        rename = "resourceVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_version: Option<String>,
}

/// Per-sink overrides declared on the job itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReporterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackReporterConfig>,
}

/// Slack overrides on a single job: a channel of its own and, optionally,
/// a narrower state set than the sink-wide one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SlackReporterConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub job_states_to_report: Vec<ProwJobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_template: Option<String>,
}

/// Declarative half of a ProwJob. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProwJobSpec {
    #[serde(rename = "type")]
    pub job_type: ProwJobType,
    /// Opaque tag naming which backend executes the payload.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub job: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Refs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_refs: Vec<Refs>,
    /// When false, reporting sinks must skip this job entirely.
    #[serde(default)]
    pub report: bool,
    /// External status identifier used by code-review reporters.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    /// Literal command a user would type to re-trigger this job.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rerun_command: String,
    /// 0 means uncapped.
    #[serde(default)]
    pub max_concurrency: u32,
    /// If set, eviction transitions to `error`; otherwise the execution
    /// backend creates a new attempt.
    #[serde(default)]
    pub error_on_eviction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoration_config: Option<DecorationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter_config: Option<ReporterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerun_auth_config: Option<RerunAuthConfig>,
    /// Visibility hint for dashboards.
    #[serde(default)]
    pub hidden: bool,
}

impl ProwJobSpec {
    /// Creation-time validation. Never retried (spec errors are permanent).
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.job.is_empty() {
            return Err(ValidationError::MissingJobName);
        }
        match self.job_type {
            ProwJobType::Presubmit | ProwJobType::Postsubmit => {
                if self.refs.is_none() {
                    return Err(ValidationError::MissingRefs(self.job_type));
                }
            }
            ProwJobType::Periodic | ProwJobType::Batch => {}
        }
        if let Some(decoration) = &self.decoration_config {
            decoration.validate()?;
        }
        if let Some(rerun_auth) = &self.rerun_auth_config {
            rerun_auth.validate()?;
        }
        Ok(())
    }
}

/// Mutable half of a ProwJob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProwJobStatus {
    pub state: ProwJobState,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    /// Set iff the state has ever been `pending`.
    #[serde(default, rename = "pendingTime", skip_serializing_if = "Option::is_none")]
    pub pending_time: Option<DateTime<Utc>>,
    /// Set iff the state is terminal.
    #[serde(
        default,
        rename = "completionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Externally-vended execution identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub build_id: String,
    /// Sink name -> last state reported to that sink. This is how
    /// at-most-once-per-state reporting is enforced.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prev_report_states: BTreeMap<String, ProwJobState>,
}

impl Default for ProwJobStatus {
    fn default() -> Self {
        Self {
            state: ProwJobState::Triggered,
            start_time: Utc::now(),
            pending_time: None,
            completion_time: None,
            description: String::new(),
            url: String::new(),
            build_id: String::new(),
            prev_report_states: BTreeMap::new(),
        }
    }
}

/// The core record: one scheduled CI work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProwJob {
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default = "default_api_version", rename = "apiVersion")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: ProwJobSpec,
    #[serde(default)]
    pub status: ProwJobStatus,
}

fn default_kind() -> String {
    KIND.to_string()
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

impl ProwJob {
    /// Stamp a fresh job: `triggered`, started now.
    pub fn new(metadata: ObjectMeta, spec: ProwJobSpec) -> Self {
        Self {
            kind: default_kind(),
            api_version: default_api_version(),
            metadata,
            spec,
            status: ProwJobStatus::default(),
        }
    }

    /// Whether `completionTime` is set.
    pub fn complete(&self) -> bool {
        self.status.completion_time.is_some()
    }

    /// Set `completionTime` to now. Idempotent: an already-complete job
    /// keeps its original completion time.
    pub fn set_complete(&mut self) {
        if self.status.completion_time.is_none() {
            self.status.completion_time = Some(Utc::now());
        }
    }

    /// `spec.cluster`, or `"default"` when the spec names none.
    pub fn cluster_alias(&self) -> &str {
        if self.spec.cluster.is_empty() {
            DEFAULT_CLUSTER_ALIAS
        } else {
            &self.spec.cluster
        }
    }
}

/// Creation-time spec faults. Surfaced immediately, never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("job name must not be empty")]
    MissingJobName,
    #[error("{0} jobs require refs")]
    MissingRefs(ProwJobType),
    #[error(transparent)]
    Decoration(#[from] DecorationError),
    #[error(transparent)]
    RerunAuth(#[from] RerunAuthError),
}
