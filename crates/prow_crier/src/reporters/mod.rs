//! Reporter sink contract.
//!
//! Every sink implements [`Reporter`]; the reconciler is parameterized by
//! exactly one. Sinks classify their failures so the reconciler can
//! decide retry vs. forget.

use std::time::Duration;

use prow_api::types::ProwJob;
use thiserror::Error;

use crate::shutdown::ShutdownSignal;

pub mod gcs;
pub mod github;
pub mod slack;

/// Per-call context: the shutdown signal and the external-call deadline.
#[derive(Clone)]
pub struct ReportContext {
    pub shutdown: ShutdownSignal,
    pub timeout: Duration,
}

impl ReportContext {
    /// Bail out with [`ReportError::Shutdown`] once shutdown is
    /// observed; callers must not record progress afterwards.
    pub fn check_shutdown(&self) -> Result<(), ReportError> {
        if self.shutdown.triggered() {
            Err(ReportError::Shutdown)
        } else {
            Ok(())
        }
    }
}

/// What a successful report acknowledged.
pub struct ReportOutcome {
    /// Jobs whose state-report should be recorded. Typically just the
    /// reported job; a sink may acknowledge several related jobs
    /// atomically.
    pub jobs: Vec<ProwJob>,
    /// Ask the reconciler to come back later instead of recording now.
    pub requeue_after: Option<Duration>,
}

impl ReportOutcome {
    pub fn acknowledged(job: ProwJob) -> Self {
        Self {
            jobs: vec![job],
            requeue_after: None,
        }
    }

    pub fn requeue_after(after: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            requeue_after: Some(after),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    /// The job cannot be reported as specified; never retried.
    #[error("invalid report request: {0}")]
    Validation(String),
    /// Network or upstream 5xx; retried up to the configured budget.
    #[error("transient report failure: {0}")]
    Transient(#[source] anyhow::Error),
    /// Cancellation observed in flight; no progress recorded.
    #[error("report cancelled during shutdown")]
    Shutdown,
}

pub trait Reporter: Send + Sync {
    /// Unique sink identifier, used as the key in `prev_report_states`.
    fn name(&self) -> &'static str;

    /// Pure predicate over the job. `spec.report == false` is already
    /// handled by the reconciler.
    fn should_report(&self, job: &ProwJob) -> bool;

    /// Effectful delivery; may read external state.
    fn report(&self, ctx: &ReportContext, job: &ProwJob) -> Result<ReportOutcome, ReportError>;
}
