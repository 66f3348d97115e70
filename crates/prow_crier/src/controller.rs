//! Single-resource reconcile loop: watch ProwJobs, dispatch to the one
//! reporter sink this controller owns, record progress in
//! `prev_report_states`.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};

use crate::config::ConfigGetter;
use crate::reporters::{ReportContext, ReportError, Reporter};
use crate::shutdown::ShutdownSignal;
use crate::store::{JobKey, ProwJobStore, StoreError};
use crate::workqueue::WorkQueue;

/// Default worker count per controller.
pub const DEFAULT_NUM_WORKERS: usize = 4;
/// Hard worker cap.
pub const HARD_MAX_WORKERS: usize = 8;

/// Deadline for the startup cache sync.
const SYNC_DEADLINE: Duration = Duration::from_secs(30);
/// Conflict-retry attempts for one status patch.
const PATCH_CONFLICT_RETRIES: u32 = 8;
/// Base backoff between conflict retries.
const PATCH_CONFLICT_BACKOFF_MS: u64 = 25;
/// Poll interval while waiting for the lister to reflect a patch.
const LISTER_POLL_INTERVAL_MS: u64 = 50;
/// Give up waiting for the lister after this long.
const LISTER_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// What one reconcile pass decided.
#[derive(Debug, PartialEq, Eq)]
enum ReconcileOutcome {
    /// Nothing to do for this key (missing, non-reporting, or already
    /// reported).
    Skip,
    /// Reported and recorded.
    Reported,
    /// The sink asked to be called again later.
    RequeueAfter(Duration),
}

/// Totals from a one-shot pass over the whole store.
#[derive(Debug, Default)]
pub struct RunOnceSummary {
    pub reported: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Controller {
    store: Arc<dyn ProwJobStore>,
    reporter: Arc<dyn Reporter>,
    queue: Arc<WorkQueue<JobKey>>,
    config: ConfigGetter,
    shutdown: ShutdownSignal,
    num_workers: usize,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ProwJobStore>,
        reporter: Arc<dyn Reporter>,
        config: ConfigGetter,
        num_workers: usize,
        shutdown: ShutdownSignal,
    ) -> Self {
        let num_workers = if num_workers == 0 {
            DEFAULT_NUM_WORKERS
        } else {
            num_workers.min(HARD_MAX_WORKERS)
        };
        Self {
            store,
            reporter,
            queue: Arc::new(WorkQueue::new()),
            config,
            shutdown,
            num_workers,
        }
    }

    pub fn reporter_name(&self) -> &'static str {
        self.reporter.name()
    }

    /// Full cache sync before starting workers; fail fast when the store
    /// is not reachable within the deadline.
    fn wait_for_sync(&self) -> Result<Vec<JobKey>> {
        let deadline = Instant::now() + SYNC_DEADLINE;
        loop {
            match self.store.list() {
                Ok(jobs) => return Ok(jobs.iter().map(JobKey::of).collect()),
                Err(err) => {
                    if Instant::now() >= deadline {
                        bail!("cache sync did not complete within {SYNC_DEADLINE:?}: {err}");
                    }
                    warn!(error = %err, "cache sync not ready, retrying");
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
        }
    }

    /// Run until the shutdown signal triggers: sync, start N workers,
    /// forward watch events into the queue, then drain and join.
    pub fn run(&self) -> Result<()> {
        let initial = self
            .wait_for_sync()
            .with_context(|| format!("{} controller failed to sync", self.reporter.name()))?;
        let events = self.store.subscribe();
        for key in initial {
            self.queue.add(key);
        }
        info!(
            reporter = self.reporter.name(),
            workers = self.num_workers,
            "controller synced, starting workers"
        );

        std::thread::scope(|scope| {
            for index in 0..self.num_workers {
                scope.spawn(move || self.worker_loop(index));
            }
            // Forward watch events until shutdown, then drain the queue.
            self.forward_events(events);
            self.queue.shut_down();
        });
        info!(reporter = self.reporter.name(), "controller stopped");
        Ok(())
    }

    fn forward_events(&self, events: mpsc::Receiver<JobKey>) {
        loop {
            if self.shutdown.triggered() {
                return;
            }
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(key) => self.queue.add(key),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn worker_loop(&self, index: usize) {
        debug!(reporter = self.reporter.name(), index, "worker started");
        while let Some(key) = self.queue.get() {
            self.process(&key);
            self.queue.done(&key);
        }
        debug!(reporter = self.reporter.name(), index, "worker exiting");
    }

    /// One queue-driven pass over a key, applying the retry policy.
    fn process(&self, key: &JobKey) {
        match self.reconcile(key) {
            Ok(ReconcileOutcome::Skip) | Ok(ReconcileOutcome::Reported) => {
                // Any success resets the retry counter.
                self.queue.forget(key);
            }
            Ok(ReconcileOutcome::RequeueAfter(after)) => {
                self.queue.add_after(key.clone(), after);
            }
            Err(ReportError::Shutdown) => {
                // No progress recorded; the job re-enters after restart.
                debug!(key = %key, "reconcile interrupted by shutdown");
            }
            Err(ReportError::Validation(message)) => {
                warn!(key = %key, message, "permanent report failure, not retrying");
                self.queue.forget(key);
            }
            Err(ReportError::Transient(err)) => {
                let retry_limit = (self.config)().retry_limit();
                if self.queue.requeues(key) < retry_limit {
                    debug!(key = %key, error = %err, "transient report failure, requeueing");
                    self.queue.add_rate_limited(key.clone());
                } else {
                    error!(
                        key = %key,
                        error = %err,
                        retry_limit,
                        "giving up on key after repeated failures"
                    );
                    self.queue.forget(key);
                }
            }
        }
    }

    /// The reconcile loop body from the design: read, filter, dedupe by
    /// `prev_report_states`, report, record.
    fn reconcile(&self, key: &JobKey) -> Result<ReconcileOutcome, ReportError> {
        let job = match self.store.get(key) {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(ReconcileOutcome::Skip),
            Err(err) => return Err(ReportError::Transient(err.into())),
        };
        if !job.spec.report || !self.reporter.should_report(&job) {
            return Ok(ReconcileOutcome::Skip);
        }
        if job.status.prev_report_states.get(self.reporter.name()) == Some(&job.status.state) {
            debug!(key = %key, state = %job.status.state, "state already reported, skipping");
            return Ok(ReconcileOutcome::Skip);
        }

        let ctx = ReportContext {
            shutdown: self.shutdown.clone(),
            timeout: (self.config)().report_timeout(),
        };
        info!(
            key = %key,
            reporter = self.reporter.name(),
            state = %job.status.state,
            "reporting job state"
        );
        let outcome = self.reporter.report(&ctx, &job)?;
        if let Some(after) = outcome.requeue_after {
            return Ok(ReconcileOutcome::RequeueAfter(after));
        }
        for acked in &outcome.jobs {
            self.record_report(acked)?;
        }
        Ok(ReconcileOutcome::Reported)
    }

    /// Read-modify-write `prev_report_states[sink] = state` with conflict
    /// retry, then block until the lister reflects the write so a quick
    /// re-enqueue does not double-report.
    fn record_report(&self, acked: &prow_api::types::ProwJob) -> Result<(), ReportError> {
        let key = JobKey::of(acked);
        let reported_state = acked.status.state;

        let mut attempt = 0;
        loop {
            let fresh = match self.store.get(&key) {
                Ok(Some(job)) => job,
                // Deleted while reporting: nothing to record.
                Ok(None) => return Ok(()),
                Err(err) => return Err(ReportError::Transient(err.into())),
            };
            if fresh.status.prev_report_states.get(self.reporter.name()) == Some(&reported_state) {
                break;
            }
            let mut patched = fresh;
            patched
                .status
                .prev_report_states
                .insert(self.reporter.name().to_string(), reported_state);
            match self.store.update_status(&patched) {
                Ok(_) => break,
                Err(StoreError::Conflict { .. }) => {
                    // Conflicts retry with a fresh read and do not count
                    // against the transient budget.
                    attempt += 1;
                    if attempt >= PATCH_CONFLICT_RETRIES {
                        return Err(ReportError::Transient(anyhow::anyhow!(
                            "patch conflict on {key} persisted after {attempt} attempts"
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(
                        PATCH_CONFLICT_BACKOFF_MS * attempt as u64,
                    ));
                }
                Err(err) => return Err(ReportError::Transient(err.into())),
            }
        }

        // Bounded poll until the write is visible; a timeout escalates to
        // the transient path.
        let deadline = Instant::now() + LISTER_POLL_TIMEOUT;
        loop {
            match self.store.get(&key) {
                Ok(None) => return Ok(()),
                Ok(Some(job))
                    if job.status.prev_report_states.get(self.reporter.name())
                        == Some(&reported_state) =>
                {
                    return Ok(());
                }
                Ok(Some(_)) => {}
                Err(err) => return Err(ReportError::Transient(err.into())),
            }
            if Instant::now() >= deadline {
                return Err(ReportError::Transient(anyhow::anyhow!(
                    "lister did not observe report-state patch for {key} within {LISTER_POLL_TIMEOUT:?}"
                )));
            }
            if !self
                .shutdown
                .sleep_unless_triggered(Duration::from_millis(LISTER_POLL_INTERVAL_MS))
            {
                return Err(ReportError::Shutdown);
            }
        }
    }

    /// One synchronous pass over every stored job, for `--run-once`.
    pub fn run_once(&self) -> Result<RunOnceSummary> {
        let keys = self.wait_for_sync()?;
        let mut summary = RunOnceSummary::default();
        for key in keys {
            match self.reconcile(&key) {
                Ok(ReconcileOutcome::Reported) => summary.reported += 1,
                Ok(ReconcileOutcome::Skip) | Ok(ReconcileOutcome::RequeueAfter(_)) => {
                    summary.skipped += 1
                }
                Err(ReportError::Shutdown) => break,
                Err(err) => {
                    error!(key = %key, error = %err, "report failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Enqueue a key by hand (embedders and tests).
    pub fn enqueue(&self, key: JobKey) {
        self.queue.add(key);
    }
}
