//! Code-review status sink.
//!
//! Sets a commit status keyed by `spec.context` for presubmit and
//! postsubmit jobs, and maintains one summary comment per pull request
//! listing failed jobs with their rerun commands. Comment mutations on a
//! given (org, repo, pull) are serialized by a per-PR mutex so concurrent
//! reconciles of sibling jobs do not race.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use prow_api::types::{ProwJob, ProwJobState, ProwJobType, Refs};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ReportContext, ReportError, ReportOutcome, Reporter};
use crate::store::ProwJobStore;

pub const REPORTER_NAME: &str = "github-reporter";

/// Marker embedded in the summary comment so stale copies can be found
/// and deleted.
const COMMENT_TAG: &str = "<!-- crier report -->";

/// Upstream failures that retrying cannot fix; matched structurally when
/// the client classifies them, by substring for legacy platforms.
const KNOWN_UNRECOVERABLE: [&str; 2] = ["max statuses reached", "commit not found"];

/// Sweep cadence for the per-PR lock map.
pub const LOCK_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum CodeReviewError {
    /// The platform rejected the request.
    #[error("{message}")]
    Upstream { message: String, unrecoverable: bool },
    /// Network-level failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl CodeReviewError {
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            CodeReviewError::Upstream {
                unrecoverable: true,
                ..
            } => true,
            CodeReviewError::Upstream { message, .. } => KNOWN_UNRECOVERABLE
                .iter()
                .any(|needle| message.contains(needle)),
            CodeReviewError::Transport(_) => false,
        }
    }
}

/// Commit status as the review platform models it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitStatus {
    pub state: &'static str,
    pub context: String,
    pub description: String,
    pub target_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewComment {
    pub id: u64,
    pub author: String,
    pub body: String,
}

/// Narrow platform contract. The concrete client is an external
/// collaborator; tests use fakes.
pub trait CodeReviewClient: Send + Sync {
    fn bot_name(&self) -> &str;
    fn create_status(
        &self,
        org: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), CodeReviewError>;
    fn list_comments(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<ReviewComment>, CodeReviewError>;
    fn create_comment(
        &self,
        org: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), CodeReviewError>;
    fn delete_comment(&self, org: &str, repo: &str, id: u64) -> Result<(), CodeReviewError>;
}

type PullId = (String, String, u64);

/// Mapping from (org, repo, pull) to a lock. Inserts use a
/// read-then-upgrade pattern; the periodic sweep acquires and releases
/// each entry before deleting it, so no routine ever holds a removed
/// lock.
pub struct PullLocks {
    map: RwLock<HashMap<PullId, Arc<Mutex<()>>>>,
}

impl Default for PullLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl PullLocks {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn entry(&self, org: &str, repo: &str, number: u64) -> Arc<Mutex<()>> {
        let key = (org.to_string(), repo.to_string(), number);
        {
            let map = self.map.read().expect("pull lock map poisoned");
            if let Some(lock) = map.get(&key) {
                return Arc::clone(lock);
            }
        }
        let mut map = self.map.write().expect("pull lock map poisoned");
        Arc::clone(map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Drop every entry, acquiring each lock once so an in-flight holder
    /// finishes first. Returns how many entries were removed.
    pub fn sweep(&self) -> usize {
        let mut map = self.map.write().expect("pull lock map poisoned");
        for lock in map.values() {
            drop(lock.lock().expect("pull lock poisoned"));
        }
        let removed = map.len();
        map.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("pull lock map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct GithubReporter {
    client: Arc<dyn CodeReviewClient>,
    store: Arc<dyn ProwJobStore>,
    /// Only report jobs executed by this agent, when set.
    report_agent: Option<String>,
    locks: PullLocks,
}

impl GithubReporter {
    pub fn new(
        client: Arc<dyn CodeReviewClient>,
        store: Arc<dyn ProwJobStore>,
        report_agent: Option<String>,
    ) -> Self {
        Self {
            client,
            store,
            report_agent,
            locks: PullLocks::new(),
        }
    }

    pub fn locks(&self) -> &PullLocks {
        &self.locks
    }

    fn swallow_unrecoverable(
        &self,
        job: &ProwJob,
        result: Result<(), CodeReviewError>,
    ) -> Result<(), ReportError> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_unrecoverable() => {
                // Treat as reported so the retry budget is not wasted on
                // force-pushed or over-full commits.
                debug!(job = %job.spec.job, error = %err, "swallowing unrecoverable upstream error");
                Ok(())
            }
            Err(err) => Err(ReportError::Transient(err.into())),
        }
    }

    fn update_pull_comment(&self, refs: &Refs, number: u64) -> Result<(), CodeReviewError> {
        // Latest completed attempt per context across all sibling jobs on
        // this pull.
        let mut latest: HashMap<String, ProwJob> = HashMap::new();
        let siblings = self
            .store
            .list()
            .map_err(|err| CodeReviewError::Transport(err.into()))?;
        for job in siblings {
            if job.spec.job_type != ProwJobType::Presubmit
                || !job.spec.report
                || !job.complete()
                || !self.agent_matches(&job)
            {
                continue;
            }
            let Some(job_refs) = &job.spec.refs else {
                continue;
            };
            if job_refs.org != refs.org
                || job_refs.repo != refs.repo
                || !job_refs.pulls.iter().any(|pull| pull.number == number)
            {
                continue;
            }
            match latest.entry(job.spec.context.clone()) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    if entry.get().status.start_time < job.status.start_time {
                        entry.insert(job);
                    }
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(job);
                }
            }
        }

        let mut failed: Vec<&ProwJob> = latest
            .values()
            .filter(|job| {
                matches!(
                    job.status.state,
                    ProwJobState::Failure | ProwJobState::Error
                )
            })
            .collect();
        failed.sort_by(|a, b| a.spec.context.cmp(&b.spec.context));

        // Delete stale copies of our comment, then recreate it only when
        // failures remain.
        let comments = self.client.list_comments(&refs.org, &refs.repo, number)?;
        for comment in comments {
            if comment.author == self.client.bot_name() && comment.body.contains(COMMENT_TAG) {
                self.client
                    .delete_comment(&refs.org, &refs.repo, comment.id)?;
            }
        }
        if failed.is_empty() {
            return Ok(());
        }

        let mut body = format!(
            "{COMMENT_TAG}\n{failed_count} of {total} completed jobs failed:\n\n\
             | Test name | Details | Rerun command |\n|---|---|---|\n",
            failed_count = failed.len(),
            total = latest.len(),
        );
        for job in &failed {
            body.push_str(&format!(
                "| {} | [link]({}) | `{}` |\n",
                job.spec.context, job.status.url, job.spec.rerun_command
            ));
        }
        body.push_str("\nUse `/retest` to rerun all failed jobs.\n");
        self.client
            .create_comment(&refs.org, &refs.repo, number, &body)
    }

    fn agent_matches(&self, job: &ProwJob) -> bool {
        match &self.report_agent {
            Some(agent) => job.spec.agent == *agent,
            None => true,
        }
    }
}

/// Map a job state onto the platform's commit-status vocabulary.
fn status_state(state: ProwJobState) -> &'static str {
    match state {
        ProwJobState::Triggered | ProwJobState::Pending => "pending",
        ProwJobState::Success => "success",
        ProwJobState::Failure | ProwJobState::Aborted => "failure",
        ProwJobState::Error => "error",
    }
}

fn status_description(job: &ProwJob) -> String {
    if !job.status.description.is_empty() {
        return job.status.description.clone();
    }
    match job.status.state {
        ProwJobState::Triggered => "Job triggered.".to_string(),
        ProwJobState::Pending => "Job is running.".to_string(),
        ProwJobState::Success => "Job succeeded.".to_string(),
        ProwJobState::Failure => "Job failed.".to_string(),
        ProwJobState::Aborted => "Job aborted.".to_string(),
        ProwJobState::Error => "Job errored.".to_string(),
    }
}

impl Reporter for GithubReporter {
    fn name(&self) -> &'static str {
        REPORTER_NAME
    }

    fn should_report(&self, job: &ProwJob) -> bool {
        matches!(
            job.spec.job_type,
            ProwJobType::Presubmit | ProwJobType::Postsubmit
        ) && job.spec.refs.is_some()
            && self.agent_matches(job)
    }

    fn report(&self, ctx: &ReportContext, job: &ProwJob) -> Result<ReportOutcome, ReportError> {
        ctx.check_shutdown()?;

        let refs = job
            .spec
            .refs
            .as_ref()
            .ok_or_else(|| ReportError::Validation("job has no refs to report against".into()))?;
        if job.spec.context.is_empty() {
            return Err(ReportError::Validation(
                "job has no context to report under".into(),
            ));
        }
        let sha = match job.spec.job_type {
            ProwJobType::Presubmit => {
                &refs
                    .pulls
                    .first()
                    .ok_or_else(|| {
                        ReportError::Validation("presubmit job has no pulls".into())
                    })?
                    .sha
            }
            _ => &refs.base_sha,
        };

        let status = CommitStatus {
            state: status_state(job.status.state),
            context: job.spec.context.clone(),
            description: status_description(job),
            target_url: if job.status.url.is_empty() {
                None
            } else {
                Some(job.status.url.clone())
            },
        };
        info!(
            job = %job.spec.job,
            context = %status.context,
            state = status.state,
            "setting commit status"
        );
        let result = self
            .client
            .create_status(&refs.org, &refs.repo, sha, &status);
        self.swallow_unrecoverable(job, result)?;

        // Presubmits additionally maintain the per-pull summary comment,
        // serialized per (org, repo, pull).
        if job.spec.job_type == ProwJobType::Presubmit && job.complete() {
            let number = refs
                .pulls
                .first()
                .map(|pull| pull.number)
                .unwrap_or_default();
            let entry = self.locks.entry(&refs.org, &refs.repo, number);
            let _held = entry.lock().expect("pull lock poisoned");
            ctx.check_shutdown()?;
            let result = self.update_pull_comment(refs, number);
            self.swallow_unrecoverable(job, result)?;
        }

        Ok(ReportOutcome::acknowledged(job.clone()))
    }
}

/// Run the hourly lock sweep until shutdown.
pub fn spawn_lock_sweeper(
    reporter: Arc<GithubReporter>,
    shutdown: crate::shutdown::ShutdownSignal,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while shutdown.sleep_unless_triggered(LOCK_SWEEP_INTERVAL) {
            let removed = reporter.locks.sweep();
            if removed > 0 {
                warn!(removed, "swept per-pull comment locks");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownSignal;
    use crate::store::InMemoryStore;
    use prow_api::types::{ObjectMeta, ProwJobSpec, Pull};

    #[derive(Default)]
    struct FakeClient {
        statuses: Mutex<Vec<(String, CommitStatus)>>,
        comments: Mutex<Vec<ReviewComment>>,
        deleted: Mutex<Vec<u64>>,
        next_comment_id: Mutex<u64>,
        fail_status_with: Mutex<Option<CodeReviewError>>,
    }

    impl FakeClient {
        fn set_status_error(&self, err: CodeReviewError) {
            *self.fail_status_with.lock().unwrap() = Some(err);
        }
    }

    impl CodeReviewClient for FakeClient {
        fn bot_name(&self) -> &str {
            "ci-bot"
        }

        fn create_status(
            &self,
            _org: &str,
            _repo: &str,
            sha: &str,
            status: &CommitStatus,
        ) -> Result<(), CodeReviewError> {
            if let Some(err) = self.fail_status_with.lock().unwrap().take() {
                return Err(err);
            }
            self.statuses
                .lock()
                .unwrap()
                .push((sha.to_string(), status.clone()));
            Ok(())
        }

        fn list_comments(
            &self,
            _org: &str,
            _repo: &str,
            _number: u64,
        ) -> Result<Vec<ReviewComment>, CodeReviewError> {
            Ok(self.comments.lock().unwrap().clone())
        }

        fn create_comment(
            &self,
            _org: &str,
            _repo: &str,
            _number: u64,
            body: &str,
        ) -> Result<(), CodeReviewError> {
            let mut next_id = self.next_comment_id.lock().unwrap();
            *next_id += 1;
            self.comments.lock().unwrap().push(ReviewComment {
                id: *next_id,
                author: "ci-bot".to_string(),
                body: body.to_string(),
            });
            Ok(())
        }

        fn delete_comment(&self, _org: &str, _repo: &str, id: u64) -> Result<(), CodeReviewError> {
            self.comments.lock().unwrap().retain(|c| c.id != id);
            self.deleted.lock().unwrap().push(id);
            Ok(())
        }
    }

    fn ctx() -> ReportContext {
        ReportContext {
            shutdown: ShutdownSignal::new(),
            timeout: Duration::from_secs(20),
        }
    }

    fn presubmit(name: &str, context: &str, state: ProwJobState) -> ProwJob {
        let mut job = ProwJob::new(
            ObjectMeta {
                name: name.to_string(),
                namespace: "prowjobs".to_string(),
                ..ObjectMeta::default()
            },
            ProwJobSpec {
                job_type: ProwJobType::Presubmit,
                agent: "kubernetes".to_string(),
                job: name.to_string(),
                report: true,
                context: context.to_string(),
                rerun_command: format!("/test {name}"),
                refs: Some(Refs {
                    org: "org".to_string(),
                    repo: "repo".to_string(),
                    base_ref: "master".to_string(),
                    base_sha: "base".to_string(),
                    pulls: vec![Pull {
                        number: 7,
                        sha: "headsha".to_string(),
                        ..Pull::default()
                    }],
                    base_link: None,
                }),
                ..ProwJobSpec::default()
            },
        );
        job.status.state = state;
        if state.is_terminal() {
            job.set_complete();
        }
        job
    }

    fn reporter_with(
        client: Arc<FakeClient>,
        store: Arc<InMemoryStore>,
    ) -> GithubReporter {
        GithubReporter::new(client, store, Some("kubernetes".to_string()))
    }

    #[test]
    fn test_should_report_scope() {
        let reporter = reporter_with(Arc::default(), Arc::new(InMemoryStore::new()));
        let job = presubmit("unit", "ci/unit", ProwJobState::Triggered);
        assert!(reporter.should_report(&job));

        let mut periodic = job.clone();
        periodic.spec.job_type = ProwJobType::Periodic;
        assert!(!reporter.should_report(&periodic));

        let mut wrong_agent = job.clone();
        wrong_agent.spec.agent = "jenkins".to_string();
        assert!(!reporter.should_report(&wrong_agent));

        let mut no_refs = job;
        no_refs.spec.refs = None;
        assert!(!reporter.should_report(&no_refs));
    }

    #[test]
    fn test_status_state_mapping() {
        assert_eq!(status_state(ProwJobState::Triggered), "pending");
        assert_eq!(status_state(ProwJobState::Pending), "pending");
        assert_eq!(status_state(ProwJobState::Success), "success");
        assert_eq!(status_state(ProwJobState::Failure), "failure");
        assert_eq!(status_state(ProwJobState::Aborted), "failure");
        assert_eq!(status_state(ProwJobState::Error), "error");
    }

    #[test]
    fn test_report_sets_status_on_pull_head() {
        let client = Arc::new(FakeClient::default());
        let reporter = reporter_with(client.clone(), Arc::new(InMemoryStore::new()));
        let job = presubmit("unit", "ci/unit", ProwJobState::Pending);

        reporter.report(&ctx(), &job).unwrap();
        let statuses = client.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].0, "headsha");
        assert_eq!(statuses[0].1.context, "ci/unit");
        assert_eq!(statuses[0].1.state, "pending");
    }

    #[test]
    fn test_postsubmit_uses_base_sha() {
        let client = Arc::new(FakeClient::default());
        let reporter = reporter_with(client.clone(), Arc::new(InMemoryStore::new()));
        let mut job = presubmit("deploy", "ci/deploy", ProwJobState::Success);
        job.spec.job_type = ProwJobType::Postsubmit;

        reporter.report(&ctx(), &job).unwrap();
        assert_eq!(client.statuses.lock().unwrap()[0].0, "base");
    }

    #[test]
    fn test_unrecoverable_errors_are_swallowed() {
        let client = Arc::new(FakeClient::default());
        let reporter = reporter_with(client.clone(), Arc::new(InMemoryStore::new()));
        let job = presubmit("unit", "ci/unit", ProwJobState::Pending);

        client.set_status_error(CodeReviewError::Upstream {
            message: "max statuses reached for this SHA and context".to_string(),
            unrecoverable: false,
        });
        assert!(reporter.report(&ctx(), &job).is_ok());

        client.set_status_error(CodeReviewError::Upstream {
            message: "commit not found".to_string(),
            unrecoverable: false,
        });
        assert!(reporter.report(&ctx(), &job).is_ok());

        client.set_status_error(CodeReviewError::Upstream {
            message: "rate limited".to_string(),
            unrecoverable: false,
        });
        assert!(matches!(
            reporter.report(&ctx(), &job),
            Err(ReportError::Transient(_))
        ));
    }

    #[test]
    fn test_completed_presubmit_comments_on_failures() {
        let client = Arc::new(FakeClient::default());
        let store = Arc::new(InMemoryStore::new());
        let failed = presubmit("unit", "ci/unit", ProwJobState::Failure);
        store.create(failed.clone()).unwrap();
        store
            .create(presubmit("lint", "ci/lint", ProwJobState::Success))
            .unwrap();

        let reporter = reporter_with(client.clone(), store);
        reporter.report(&ctx(), &failed).unwrap();

        let comments = client.comments.lock().unwrap();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].body.contains("1 of 2 completed jobs failed"));
        assert!(comments[0].body.contains("/test unit"));
        assert!(!comments[0].body.contains("/test lint"));
    }

    #[test]
    fn test_all_green_deletes_stale_comment() {
        let client = Arc::new(FakeClient::default());
        let store = Arc::new(InMemoryStore::new());
        let passed = presubmit("unit", "ci/unit", ProwJobState::Success);
        store.create(passed.clone()).unwrap();

        // A stale failure comment from an earlier attempt.
        client.comments.lock().unwrap().push(ReviewComment {
            id: 1,
            author: "ci-bot".to_string(),
            body: format!("{COMMENT_TAG}\nold failures"),
        });
        // Someone else's comment must survive.
        client.comments.lock().unwrap().push(ReviewComment {
            id: 2,
            author: "human".to_string(),
            body: "lgtm".to_string(),
        });

        let reporter = reporter_with(client.clone(), store);
        reporter.report(&ctx(), &passed).unwrap();

        let comments = client.comments.lock().unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].author, "human");
        assert_eq!(*client.deleted.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_pull_locks_sweep() {
        let locks = PullLocks::new();
        let first = locks.entry("org", "repo", 1);
        let again = locks.entry("org", "repo", 1);
        assert!(Arc::ptr_eq(&first, &again));
        locks.entry("org", "repo", 2);
        assert_eq!(locks.len(), 2);
        assert_eq!(locks.sweep(), 2);
        assert!(locks.is_empty());
    }
}
