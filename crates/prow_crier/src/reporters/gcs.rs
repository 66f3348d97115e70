//! Artifact-metadata sink: writes the side-car JSON blobs under the
//! job's artifact path.
//!
//! `started.json` and `finished.json` are create-if-absent so restarts
//! and re-reports stay idempotent; `prowjob.json` tracks every update.

use std::sync::Arc;

use anyhow::Context as _;
use prow_api::types::ProwJob;
use prow_artifacts::metadata::{Finished, Started, FINISHED_JSON, PROWJOB_JSON, STARTED_JSON};
use prow_artifacts::path::path_for_job;
use prow_artifacts::writer::ObjectWriter;
use tracing::debug;

use super::{ReportContext, ReportError, ReportOutcome, Reporter};

pub const REPORTER_NAME: &str = "gcs-reporter";

pub struct GcsReporter {
    writer: Arc<dyn ObjectWriter>,
}

impl GcsReporter {
    pub fn new(writer: Arc<dyn ObjectWriter>) -> Self {
        Self { writer }
    }

    fn write_json(
        &self,
        base: &prow_api::storage::StoragePath,
        name: &str,
        data: &[u8],
        overwrite: bool,
    ) -> Result<(), ReportError> {
        self.writer
            .write(&base.join(name), data, overwrite)
            .with_context(|| format!("Failed to write {name}"))
            .map(|_| ())
            .map_err(ReportError::Transient)
    }
}

impl Reporter for GcsReporter {
    fn name(&self) -> &'static str {
        REPORTER_NAME
    }

    /// Only jobs with a vended build ID have an artifact path. Build IDs
    /// are treated as set-once; this never flips back to false.
    fn should_report(&self, job: &ProwJob) -> bool {
        !job.status.build_id.is_empty()
    }

    fn report(&self, ctx: &ReportContext, job: &ProwJob) -> Result<ReportOutcome, ReportError> {
        ctx.check_shutdown()?;

        let gcs = match job
            .spec
            .decoration_config
            .as_ref()
            .and_then(|decoration| decoration.gcs_configuration.as_ref())
        {
            Some(gcs) => gcs,
            None => {
                // No destination configured: nothing to do, not an error.
                debug!(job = %job.spec.job, "job has no artifact destination, skipping");
                return Ok(ReportOutcome::acknowledged(job.clone()));
            }
        };
        let base = path_for_job(gcs, &job.spec, &job.status.build_id)
            .map_err(|err| ReportError::Validation(err.to_string()))?;

        let started = serde_json::to_vec_pretty(&Started::from_job(job))
            .map_err(|err| ReportError::Validation(err.to_string()))?;
        self.write_json(&base, STARTED_JSON, &started, false)?;

        ctx.check_shutdown()?;
        let prowjob = serde_json::to_vec_pretty(job)
            .map_err(|err| ReportError::Validation(err.to_string()))?;
        self.write_json(&base, PROWJOB_JSON, &prowjob, true)?;

        if job.complete() {
            ctx.check_shutdown()?;
            let finished = serde_json::to_vec_pretty(&Finished::from_job(job))
                .map_err(|err| ReportError::Validation(err.to_string()))?;
            self.write_json(&base, FINISHED_JSON, &finished, false)?;
        }

        Ok(ReportOutcome::acknowledged(job.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownSignal;
    use prow_api::decoration::{DecorationConfig, GcsConfiguration, PathStrategy};
    use prow_api::types::{ObjectMeta, ProwJobSpec, ProwJobState, ProwJobType};
    use prow_artifacts::writer::InMemoryObjectWriter;
    use std::time::Duration;

    fn ctx() -> ReportContext {
        ReportContext {
            shutdown: ShutdownSignal::new(),
            timeout: Duration::from_secs(20),
        }
    }

    fn decorated_job(name: &str) -> ProwJob {
        let mut job = ProwJob::new(
            ObjectMeta {
                name: name.to_string(),
                namespace: "prowjobs".to_string(),
                ..ObjectMeta::default()
            },
            ProwJobSpec {
                job_type: ProwJobType::Periodic,
                job: name.to_string(),
                report: true,
                decoration_config: Some(DecorationConfig {
                    gcs_configuration: Some(GcsConfiguration {
                        bucket: "gs://prow-artifacts".to_string(),
                        path_strategy: Some(PathStrategy::Explicit),
                        ..GcsConfiguration::default()
                    }),
                    ..DecorationConfig::default()
                }),
                ..ProwJobSpec::default()
            },
        );
        job.status.build_id = "1001".to_string();
        job
    }

    #[test]
    fn test_should_report_requires_build_id() {
        let reporter = GcsReporter::new(Arc::new(InMemoryObjectWriter::new()));
        let mut job = decorated_job("foo");
        assert!(reporter.should_report(&job));
        job.status.build_id = String::new();
        assert!(!reporter.should_report(&job));
    }

    #[test]
    fn test_report_writes_started_and_prowjob() {
        let writer = Arc::new(InMemoryObjectWriter::new());
        let reporter = GcsReporter::new(writer.clone());
        let job = decorated_job("foo");

        reporter.report(&ctx(), &job).unwrap();
        let base = "gs://prow-artifacts/logs/foo/1001";
        assert!(writer.get(&format!("{base}/started.json")).is_some());
        assert!(writer.get(&format!("{base}/prowjob.json")).is_some());
        // Not complete yet: no finished record.
        assert!(writer.get(&format!("{base}/finished.json")).is_none());
    }

    #[test]
    fn test_report_overwrites_prowjob_but_not_started() {
        let writer = Arc::new(InMemoryObjectWriter::new());
        let reporter = GcsReporter::new(writer.clone());
        let mut job = decorated_job("foo");

        reporter.report(&ctx(), &job).unwrap();
        let base = "gs://prow-artifacts/logs/foo/1001";
        let started_first = writer.get(&format!("{base}/started.json")).unwrap();
        let prowjob_first = writer.get(&format!("{base}/prowjob.json")).unwrap();

        job.status.state = ProwJobState::Pending;
        job.status.pending_time = Some(chrono::Utc::now());
        reporter.report(&ctx(), &job).unwrap();

        // started.json is first-write-wins; prowjob.json tracks updates.
        assert_eq!(
            writer.get(&format!("{base}/started.json")).unwrap(),
            started_first
        );
        assert_ne!(
            writer.get(&format!("{base}/prowjob.json")).unwrap(),
            prowjob_first
        );
    }

    #[test]
    fn test_report_writes_finished_on_completion() {
        let writer = Arc::new(InMemoryObjectWriter::new());
        let reporter = GcsReporter::new(writer.clone());
        let mut job = decorated_job("foo");
        job.status.state = ProwJobState::Success;
        job.set_complete();

        reporter.report(&ctx(), &job).unwrap();
        let finished = writer
            .get("gs://prow-artifacts/logs/foo/1001/finished.json")
            .unwrap();
        let parsed: Finished = serde_json::from_slice(&finished).unwrap();
        assert!(parsed.passed);
        assert_eq!(parsed.result, "success");
    }

    #[test]
    fn test_missing_destination_skips_silently() {
        let writer = Arc::new(InMemoryObjectWriter::new());
        let reporter = GcsReporter::new(writer.clone());
        let mut job = decorated_job("foo");
        job.spec.decoration_config = None;

        let outcome = reporter.report(&ctx(), &job).unwrap();
        assert_eq!(outcome.jobs.len(), 1);
        assert!(writer.is_empty());
    }

    #[test]
    fn test_triggered_shutdown_stops_the_report() {
        let reporter = GcsReporter::new(Arc::new(InMemoryObjectWriter::new()));
        let job = decorated_job("foo");
        let stopping = ReportContext {
            shutdown: ShutdownSignal::new(),
            timeout: Duration::from_secs(20),
        };
        stopping.shutdown.trigger();
        assert!(matches!(
            reporter.report(&stopping, &job),
            Err(ReportError::Shutdown)
        ));
    }
}
