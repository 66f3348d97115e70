//! Building ProwJob specs from triggered job definitions.

use prow_api::jobs::Presubmit;
use prow_api::types::{ProwJobSpec, ProwJobType, Refs};

/// The spec for one triggered pre-submit, ready to be persisted as a
/// ProwJob record.
pub fn presubmit_spec(job: &Presubmit, refs: Refs) -> ProwJobSpec {
    ProwJobSpec {
        job_type: ProwJobType::Presubmit,
        job: job.name.clone(),
        report: !job.skip_report,
        context: job.context.clone(),
        rerun_command: job.rerun_command.clone(),
        refs: Some(refs),
        ..ProwJobSpec::default()
    }
}
