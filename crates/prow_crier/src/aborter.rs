//! Supersession aborter: marks older duplicates of active jobs as
//! aborted. The execution backend observes the `aborted` state and
//! performs the actual cancellation and completion.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use blake3::Hasher;
use prow_api::types::{ProwJob, ProwJobSpec, ProwJobState, Refs};
use tracing::{info, warn};

use crate::reporters::github;
use crate::store::{JobKey, ProwJobStore, StoreError};

/// Status description stamped on superseded jobs.
pub const SUPERSEDED_DESCRIPTION: &str = "Superseded by a newer run of the same job.";

const ABORT_CONFLICT_RETRIES: u32 = 5;
const ABORT_CONFLICT_BACKOFF_MS: u64 = 25;

const SEP: u8 = 0x1f;

fn hash_parts(parts: &[String]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// One refs component: org/repo plus the refs text with pulls sorted
/// ascending by number, so permutations of the same pull set collapse.
/// Base SHAs and pull SHAs stay in, so a new push changes the identity.
fn refs_component(tag: &str, refs: &Refs) -> String {
    let mut sorted = refs.clone();
    sorted.pulls.sort_by_key(|pull| pull.number);
    format!("{tag} {}/{}@{}", refs.org, refs.repo, sorted)
}

/// Duplicate identity digest: job type, job name, refs (if any), and
/// each element of `extra_refs`, sorted and hashed.
pub fn supersession_key(spec: &ProwJobSpec) -> String {
    let mut components = vec![spec.job_type.to_string(), spec.job.clone()];
    if let Some(refs) = &spec.refs {
        components.push(refs_component("refs", refs));
    }
    for refs in &spec.extra_refs {
        components.push(refs_component("extra", refs));
    }
    components.sort();
    hash_parts(&components)
}

/// Abort all jobs in `jobs` that have a newer duplicate, without marking
/// them complete. Only presubmits and batches are considered; completed
/// jobs are skipped. Returns how many jobs were aborted.
///
/// Operates on the caller-provided slice: one pass tracking the index of
/// the currently-latest job per identity, no global lock required.
pub fn terminate_older_jobs(store: &dyn ProwJobStore, jobs: &[ProwJob]) -> Result<usize> {
    let mut latest: HashMap<String, usize> = HashMap::new();
    let mut to_abort: Vec<usize> = Vec::new();
    for (index, job) in jobs.iter().enumerate() {
        if !job.spec.job_type.can_be_superseded() || job.complete() {
            continue;
        }
        let key = supersession_key(&job.spec);
        match latest.entry(key) {
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if jobs[current].status.start_time < job.status.start_time {
                    to_abort.push(current);
                    entry.insert(index);
                } else {
                    to_abort.push(index);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(index);
            }
        }
    }

    for &index in &to_abort {
        abort_job(store, &jobs[index])?;
    }
    Ok(to_abort.len())
}

fn abort_job(store: &dyn ProwJobStore, job: &ProwJob) -> Result<()> {
    let key = JobKey::of(job);
    for attempt in 0..ABORT_CONFLICT_RETRIES {
        let Some(mut fresh) = store.get(&key)? else {
            return Ok(());
        };
        // The aborter may only transition non-terminal states.
        if fresh.complete() || fresh.status.state.is_terminal() {
            return Ok(());
        }
        fresh.status.state = ProwJobState::Aborted;
        fresh.status.description = SUPERSEDED_DESCRIPTION.to_string();
        // The code-review sink must not emit a stale prior-state report
        // for a job that was never worth reporting again.
        fresh
            .status
            .prev_report_states
            .insert(github::REPORTER_NAME.to_string(), ProwJobState::Aborted);
        match store.update_status(&fresh) {
            Ok(_) => {
                info!(job = %key, "aborted superseded job");
                return Ok(());
            }
            Err(StoreError::Conflict { .. }) => {
                std::thread::sleep(Duration::from_millis(
                    ABORT_CONFLICT_BACKOFF_MS * (attempt as u64 + 1),
                ));
            }
            Err(err) => return Err(err.into()),
        }
    }
    warn!(job = %key, "giving up aborting superseded job after repeated conflicts");
    Ok(())
}
