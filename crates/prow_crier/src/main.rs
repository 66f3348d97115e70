//! Prow Crier binary.
//!
//! Runs one reconciler per enabled reporter sink over the job store,
//! plus the periodic supersession aborter. Local mode uses the
//! in-memory store, seeded from a ProwJob JSON file; real deployments
//! embed the controllers against their own store backend.
//!
//! Usage:
//!     prow-crier --jobs-file jobs.json --storage-root /var/lib/prow/artifacts
//!     prow-crier --jobs-file jobs.json --slack-webhook https://hooks.slack.example/T00/B00 --run-once

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use prow_artifacts::writer::FsObjectWriter;
use prow_crier::aborter::terminate_older_jobs;
use prow_crier::config::{ConfigAgent, CrierConfig};
use prow_crier::controller::Controller;
use prow_crier::reporters::gcs::GcsReporter;
use prow_crier::reporters::slack::{SlackClient, SlackReporter, WebhookClient};
use prow_crier::shutdown::ShutdownSignal;
use prow_crier::store::{InMemoryStore, ProwJobStore};

/// Seconds between config file reloads.
const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    name = "prow-crier",
    about = "Reports ProwJob state changes to external sinks"
)]
struct Args {
    /// Crier config file (JSON); reloaded periodically
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed the store with ProwJobs from this JSON file (array of jobs)
    #[arg(long)]
    jobs_file: Option<PathBuf>,

    /// Worker threads per reporter controller
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Enable the artifact-metadata sink, writing under this directory
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Enable the chat sink, posting through this webhook URL
    #[arg(long, env = "SLACK_WEBHOOK_URL")]
    slack_webhook: Option<String>,

    /// Log instead of posting to external services
    #[arg(long)]
    dry_run: bool,

    /// One pass over the store per enabled sink, then exit
    #[arg(long)]
    run_once: bool,

    /// With --run-once, exit 0 even when some reports failed
    #[arg(long)]
    keep_going: bool,

    /// Seconds between supersession passes; 0 disables the aborter
    #[arg(long, default_value_t = 30)]
    abort_interval: u64,

    /// Also write logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Verbose console logging
    #[arg(long, short)]
    verbose: bool,
}

/// Stands in when the chat sink is enabled for dry runs only.
struct DisabledSlackClient;

impl SlackClient for DisabledSlackClient {
    fn post(&self, _channel: &str, _message: &str) -> Result<()> {
        bail!("slack posting is disabled; pass --slack-webhook")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = prow_logging::init_logging(prow_logging::LogConfig {
        app_name: "prow-crier",
        verbose: args.verbose,
        log_dir: args.log_dir.clone(),
    })?;

    let config_agent = Arc::new(match &args.config {
        Some(path) => ConfigAgent::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ConfigAgent::with_config(CrierConfig::default()),
    });

    let store = Arc::new(InMemoryStore::new());
    if let Some(path) = &args.jobs_file {
        let seeded = seed_jobs(store.as_ref(), path)?;
        info!(count = seeded, path = %path.display(), "seeded job store");
    }

    let shutdown = ShutdownSignal::new();
    let controllers = build_controllers(&args, &config_agent, &store, &shutdown)?;
    if controllers.is_empty() {
        bail!("no reporter sinks enabled; pass --storage-root and/or --slack-webhook");
    }

    if args.run_once {
        return run_once(&args, &store, controllers);
    }

    let mut handles = Vec::new();
    for controller in controllers {
        handles.push(std::thread::spawn(move || {
            if let Err(err) = controller.run() {
                error!(error = %err, "controller exited with error");
            }
        }));
    }
    if args.abort_interval > 0 {
        let store = Arc::clone(&store);
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(args.abort_interval);
        handles.push(std::thread::spawn(move || {
            abort_loop(store, shutdown, interval)
        }));
    }
    if args.config.is_some() {
        handles.push(config_agent.start_reload_thread(shutdown.clone(), CONFIG_RELOAD_INTERVAL));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    info!("shutdown signal received, draining");
    shutdown.trigger();
    for handle in handles {
        if handle.join().is_err() {
            warn!("a worker thread panicked during shutdown");
        }
    }
    Ok(())
}

fn build_controllers(
    args: &Args,
    config_agent: &Arc<ConfigAgent>,
    store: &Arc<InMemoryStore>,
    shutdown: &ShutdownSignal,
) -> Result<Vec<Controller>> {
    let mut controllers = Vec::new();
    let store_handle: Arc<dyn ProwJobStore> = Arc::clone(store) as Arc<dyn ProwJobStore>;

    if let Some(root) = &args.storage_root {
        let writer = Arc::new(FsObjectWriter::new(root.clone()));
        controllers.push(Controller::new(
            Arc::clone(&store_handle),
            Arc::new(GcsReporter::new(writer)),
            config_agent.getter(),
            args.workers,
            shutdown.clone(),
        ));
    }

    let slack_configured = config_agent.config().slack.is_some();
    if let Some(url) = &args.slack_webhook {
        let client: Arc<dyn SlackClient> = Arc::new(WebhookClient::new(
            url.clone(),
            config_agent.config().report_timeout(),
        )?);
        controllers.push(Controller::new(
            Arc::clone(&store_handle),
            Arc::new(SlackReporter::new(
                config_agent.getter(),
                client,
                args.dry_run,
            )),
            config_agent.getter(),
            args.workers,
            shutdown.clone(),
        ));
    } else if args.dry_run && slack_configured {
        controllers.push(Controller::new(
            Arc::clone(&store_handle),
            Arc::new(SlackReporter::new(
                config_agent.getter(),
                Arc::new(DisabledSlackClient),
                true,
            )),
            config_agent.getter(),
            args.workers,
            shutdown.clone(),
        ));
    }

    Ok(controllers)
}

fn run_once(args: &Args, store: &Arc<InMemoryStore>, controllers: Vec<Controller>) -> Result<()> {
    if args.abort_interval > 0 {
        let jobs = store.list()?;
        let aborted = terminate_older_jobs(store.as_ref(), &jobs)?;
        if aborted > 0 {
            info!(aborted, "aborted superseded jobs");
        }
    }
    let mut total_failed = 0;
    for controller in controllers {
        let summary = controller.run_once()?;
        info!(
            reporter = controller.reporter_name(),
            reported = summary.reported,
            skipped = summary.skipped,
            failed = summary.failed,
            "run-once pass finished"
        );
        total_failed += summary.failed;
    }
    if total_failed > 0 && !args.keep_going {
        std::process::exit(1);
    }
    Ok(())
}

fn abort_loop(store: Arc<InMemoryStore>, shutdown: ShutdownSignal, interval: Duration) {
    while shutdown.sleep_unless_triggered(interval) {
        match store.list() {
            Ok(jobs) => match terminate_older_jobs(store.as_ref(), &jobs) {
                Ok(0) => {}
                Ok(aborted) => info!(aborted, "aborted superseded jobs"),
                Err(err) => warn!(error = %err, "supersession pass failed"),
            },
            Err(err) => warn!(error = %err, "could not list jobs for supersession pass"),
        }
    }
}

fn seed_jobs(store: &InMemoryStore, path: &PathBuf) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read jobs file {}", path.display()))?;
    let jobs: Vec<prow_api::types::ProwJob> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse jobs file {}", path.display()))?;
    let count = jobs.len();
    for job in jobs {
        store
            .create(job)
            .context("Failed to create seeded prowjob")?;
    }
    Ok(count)
}
