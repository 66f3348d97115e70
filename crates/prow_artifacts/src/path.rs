//! Bijection between a ProwJob identity and its object-store path.

use prow_api::decoration::{GcsConfiguration, PathStrategy};
use prow_api::storage::{PathError, StoragePath};
use prow_api::types::{ProwJobSpec, ProwJobType};

/// The path segment for a job's (org, repo) under the given strategy.
/// An empty return means the segment is omitted entirely.
pub fn repo_segment(
    strategy: PathStrategy,
    default_org: &str,
    default_repo: &str,
    org: &str,
    repo: &str,
) -> String {
    match strategy {
        PathStrategy::Explicit => format!("{org}_{repo}"),
        PathStrategy::Single => {
            if org == default_org && repo == default_repo {
                String::new()
            } else {
                format!("{org}_{repo}")
            }
        }
        PathStrategy::Legacy => {
            if org == default_org {
                repo.to_string()
            } else {
                format!("{org}_{repo}")
            }
        }
    }
}

/// The leading segment reflecting the job type.
pub fn kind_segment(job_type: ProwJobType) -> &'static str {
    match job_type {
        ProwJobType::Presubmit | ProwJobType::Batch => "pr-logs",
        ProwJobType::Postsubmit | ProwJobType::Periodic => "logs",
    }
}

/// Resolve the destination for one job attempt:
/// `[path_prefix/]<kind-segment>/<repo-segment>/<job>/<build-id>`.
///
/// Pure: same inputs, same output. The repo segment is dropped for jobs
/// without refs (periodics) and for the default org/repo under the
/// `single` strategy.
pub fn path_for_job(
    gcs: &GcsConfiguration,
    spec: &ProwJobSpec,
    build_id: &str,
) -> Result<StoragePath, PathError> {
    let mut destination = StoragePath::parse(&gcs.bucket)?;
    if !gcs.path_prefix.is_empty() {
        destination = destination.join(&gcs.path_prefix);
    }
    destination = destination.join(kind_segment(spec.job_type));
    if let Some(refs) = &spec.refs {
        let strategy = gcs.path_strategy.unwrap_or(PathStrategy::Explicit);
        let segment = repo_segment(
            strategy,
            &gcs.default_org,
            &gcs.default_repo,
            &refs.org,
            &refs.repo,
        );
        if !segment.is_empty() {
            destination = destination.join(&segment);
        }
    }
    Ok(destination.join(&spec.job).join(build_id))
}
