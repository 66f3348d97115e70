//! ProwJob store seam.
//!
//! A ProwJob is exclusively owned by the persistence store; everyone else
//! holds short-lived read copies and mutates through a compare-and-set
//! status update keyed by the object's resource version. The in-memory
//! implementation backs local mode and the tests; a real backend slots in
//! behind the same trait.

use std::collections::HashMap;
use std::fmt;
use std::sync::{mpsc, Mutex};

use prow_api::types::{ProwJob, ProwJobState, ValidationError};
use thiserror::Error;

/// Namespace/name work unit key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(job: &ProwJob) -> Self {
        Self::new(job.metadata.namespace.clone(), job.metadata.name.clone())
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller's copy is stale; re-fetch and re-attempt.
    #[error("resource version conflict on {key}: expected {expected:?}, stored {stored:?}")]
    Conflict {
        key: JobKey,
        expected: Option<String>,
        stored: Option<String>,
    },
    #[error("prowjob {0} not found")]
    NotFound(JobKey),
    /// Terminal states are frozen; illegal lifecycle steps are rejected.
    #[error("invalid state transition {from} -> {to} for {key}")]
    InvalidTransition {
        key: JobKey,
        from: ProwJobState,
        to: ProwJobState,
    },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub trait ProwJobStore: Send + Sync {
    /// Point-in-time read. `Ok(None)` when the job does not exist.
    fn get(&self, key: &JobKey) -> Result<Option<ProwJob>, StoreError>;

    /// All stored jobs, ordered by key.
    fn list(&self) -> Result<Vec<ProwJob>, StoreError>;

    /// Validate and persist a new job; the store stamps the first
    /// resource version.
    fn create(&self, job: ProwJob) -> Result<ProwJob, StoreError>;

    /// Compare-and-set status update. The job's `resourceVersion` must
    /// match the stored one or [`StoreError::Conflict`] is returned.
    fn update_status(&self, job: &ProwJob) -> Result<ProwJob, StoreError>;

    /// Watch stream of add/update events as keys. Delete is irrelevant:
    /// terminal jobs linger.
    fn subscribe(&self) -> mpsc::Receiver<JobKey>;
}

struct StoreInner {
    jobs: HashMap<JobKey, ProwJob>,
    next_version: u64,
    watchers: Vec<mpsc::Sender<JobKey>>,
}

/// In-memory store with resource versions and watch channels.
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                jobs: HashMap::new(),
                next_version: 1,
                watchers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("store lock poisoned")
    }
}

fn notify(inner: &mut StoreInner, key: &JobKey) {
    inner.watchers.retain(|watcher| watcher.send(key.clone()).is_ok());
}

impl ProwJobStore for InMemoryStore {
    fn get(&self, key: &JobKey) -> Result<Option<ProwJob>, StoreError> {
        Ok(self.lock().jobs.get(key).cloned())
    }

    fn list(&self) -> Result<Vec<ProwJob>, StoreError> {
        let inner = self.lock();
        let mut jobs: Vec<ProwJob> = inner.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| JobKey::of(a).cmp(&JobKey::of(b)));
        Ok(jobs)
    }

    fn create(&self, mut job: ProwJob) -> Result<ProwJob, StoreError> {
        job.spec.validate()?;
        let mut inner = self.lock();
        let key = JobKey::of(&job);
        let version = inner.next_version;
        inner.next_version += 1;
        job.metadata.resource_version = Some(version.to_string());
        inner.jobs.insert(key.clone(), job.clone());
        notify(&mut inner, &key);
        Ok(job)
    }

    fn update_status(&self, job: &ProwJob) -> Result<ProwJob, StoreError> {
        let mut inner = self.lock();
        let key = JobKey::of(job);
        let version = inner.next_version;
        let stored = inner
            .jobs
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if stored.metadata.resource_version != job.metadata.resource_version {
            return Err(StoreError::Conflict {
                key,
                expected: job.metadata.resource_version.clone(),
                stored: stored.metadata.resource_version.clone(),
            });
        }
        // Terminal states are frozen; everything else is the execution
        // backend's business.
        let from = stored.status.state;
        let to = job.status.state;
        if from.is_terminal() && from != to {
            return Err(StoreError::InvalidTransition { key, from, to });
        }
        stored.status = job.status.clone();
        stored.metadata.resource_version = Some(version.to_string());
        let updated = stored.clone();
        inner.next_version += 1;
        notify(&mut inner, &key);
        Ok(updated)
    }

    fn subscribe(&self) -> mpsc::Receiver<JobKey> {
        let (sender, receiver) = mpsc::channel();
        self.lock().watchers.push(sender);
        receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prow_api::types::{ObjectMeta, ProwJobSpec, ProwJobType};

    fn job(name: &str) -> ProwJob {
        ProwJob::new(
            ObjectMeta {
                name: name.to_string(),
                namespace: "prowjobs".to_string(),
                ..ObjectMeta::default()
            },
            ProwJobSpec {
                job_type: ProwJobType::Periodic,
                job: name.to_string(),
                report: true,
                ..ProwJobSpec::default()
            },
        )
    }

    #[test]
    fn test_create_stamps_resource_version() {
        let store = InMemoryStore::new();
        let created = store.create(job("foo")).unwrap();
        assert!(created.metadata.resource_version.is_some());
        let fetched = store
            .get(&JobKey::new("prowjobs", "foo"))
            .unwrap()
            .unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn test_create_rejects_invalid_spec() {
        let store = InMemoryStore::new();
        let mut bad = job("foo");
        bad.spec.job = String::new();
        assert!(matches!(
            store.create(bad),
            Err(StoreError::Invalid(ValidationError::MissingJobName))
        ));
    }

    #[test]
    fn test_update_status_detects_conflict() {
        let store = InMemoryStore::new();
        let created = store.create(job("foo")).unwrap();

        let mut first = created.clone();
        first.status.description = "one".to_string();
        store.update_status(&first).unwrap();

        // Second writer still holds the original resource version.
        let mut second = created;
        second.status.description = "two".to_string();
        assert!(matches!(
            store.update_status(&second),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn test_update_status_freezes_terminal_states() {
        let store = InMemoryStore::new();
        let created = store.create(job("foo")).unwrap();
        let mut updated = created;
        updated.status.state = ProwJobState::Pending;
        let stored = store.update_status(&updated).unwrap();

        let mut finished = stored;
        finished.status.state = ProwJobState::Success;
        finished.status.completion_time = Some(chrono::Utc::now());
        let stored = store.update_status(&finished).unwrap();

        // Success is terminal: no further state change is accepted.
        let mut flipped = stored;
        flipped.status.state = ProwJobState::Failure;
        assert!(matches!(
            store.update_status(&flipped),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_subscribe_sees_creates_and_updates() {
        let store = InMemoryStore::new();
        let events = store.subscribe();
        let created = store.create(job("foo")).unwrap();
        let mut updated = created;
        updated.status.description = "moved".to_string();
        store.update_status(&updated).unwrap();

        let key = JobKey::new("prowjobs", "foo");
        assert_eq!(events.try_recv().unwrap(), key);
        assert_eq!(events.try_recv().unwrap(), key);
    }
}
