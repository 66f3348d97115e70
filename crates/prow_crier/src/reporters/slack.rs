//! Chat sink: renders a template against the job and posts it to the
//! channel resolved from job override, repo default, org default, then
//! the global default.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use prow_api::types::{ProwJob, ProwJobState, ProwJobType};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ReportContext, ReportError, ReportOutcome, Reporter};
use crate::config::ConfigGetter;

pub const REPORTER_NAME: &str = "slack-reporter";

/// Sink-wide slack settings, from the crier config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SlackOptions {
    /// Global default channel.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    /// org -> channel.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub org_channels: BTreeMap<String, String>,
    /// "org/repo" -> channel.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub repo_channels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub job_states_to_report: Vec<ProwJobState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub job_types_to_report: Vec<ProwJobType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub report_template: String,
}

/// Posting contract; the webhook client is the shipped implementation.
pub trait SlackClient: Send + Sync {
    fn post(&self, channel: &str, message: &str) -> Result<()>;
}

/// Posts through an incoming-webhook URL.
pub struct WebhookClient {
    url: String,
    client: reqwest::blocking::Client,
}

impl WebhookClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build slack webhook client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

impl SlackClient for WebhookClient {
    fn post(&self, channel: &str, message: &str) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&serde_json::json!({ "channel": channel, "text": message }))
            .send()
            .context("Failed to post slack message")?
            .error_for_status()
            .context("Slack webhook rejected the message")?;
        Ok(())
    }
}

pub struct SlackReporter {
    config: ConfigGetter,
    client: Arc<dyn SlackClient>,
    dry_run: bool,
}

impl SlackReporter {
    pub fn new(config: ConfigGetter, client: Arc<dyn SlackClient>, dry_run: bool) -> Self {
        Self {
            config,
            client,
            dry_run,
        }
    }

    /// Highest precedence first: the job's own channel, the org/repo
    /// default, the org-wide default, the global default.
    fn resolve_channel(options: &SlackOptions, job: &ProwJob) -> Option<String> {
        if let Some(slack) = job
            .spec
            .reporter_config
            .as_ref()
            .and_then(|reporter| reporter.slack.as_ref())
        {
            if !slack.channel.is_empty() {
                return Some(slack.channel.clone());
            }
        }
        if let Some(refs) = &job.spec.refs {
            if let Some(channel) = options.repo_channels.get(&refs.org_repo()) {
                return Some(channel.clone());
            }
            if let Some(channel) = options.org_channels.get(&refs.org) {
                return Some(channel.clone());
            }
        }
        if options.channel.is_empty() {
            None
        } else {
            Some(options.channel.clone())
        }
    }
}

/// Substitute `{{.Field}}` tokens from a fixed field set. Unknown tokens
/// are a template error.
pub fn render_template(template: &str, job: &ProwJob) -> Result<String, String> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        rendered.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            return Err("unterminated {{ in template".to_string());
        };
        let token = after_open[..close].trim();
        rendered.push_str(&template_field(token, job)?);
        rest = &after_open[close + 2..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

fn template_field(token: &str, job: &ProwJob) -> Result<String, String> {
    let refs = job.spec.refs.as_ref();
    let value = match token {
        ".Spec.Job" => job.spec.job.clone(),
        ".Spec.Type" => job.spec.job_type.to_string(),
        ".Spec.Refs.Org" => refs.map(|r| r.org.clone()).unwrap_or_default(),
        ".Spec.Refs.Repo" => refs.map(|r| r.repo.clone()).unwrap_or_default(),
        ".Spec.Refs.BaseRef" => refs.map(|r| r.base_ref.clone()).unwrap_or_default(),
        ".Status.State" => job.status.state.to_string(),
        ".Status.URL" => job.status.url.clone(),
        ".Status.Description" => job.status.description.clone(),
        ".Status.BuildID" => job.status.build_id.clone(),
        _ => return Err(format!("unknown template field {token:?}")),
    };
    Ok(value)
}

impl Reporter for SlackReporter {
    fn name(&self) -> &'static str {
        REPORTER_NAME
    }

    /// state is in the configured set, and the type is configured or the
    /// job explicitly set a channel of its own.
    fn should_report(&self, job: &ProwJob) -> bool {
        let config = (self.config)();
        let Some(options) = &config.slack else {
            return false;
        };
        let job_slack = job
            .spec
            .reporter_config
            .as_ref()
            .and_then(|reporter| reporter.slack.as_ref());

        let states = match job_slack {
            Some(slack) if !slack.job_states_to_report.is_empty() => &slack.job_states_to_report,
            _ => &options.job_states_to_report,
        };
        if !states.contains(&job.status.state) {
            return false;
        }
        options.job_types_to_report.contains(&job.spec.job_type)
            || job_slack.map(|slack| !slack.channel.is_empty()).unwrap_or(false)
    }

    fn report(&self, ctx: &ReportContext, job: &ProwJob) -> Result<ReportOutcome, ReportError> {
        ctx.check_shutdown()?;

        let config = (self.config)();
        let options = config
            .slack
            .as_ref()
            .ok_or_else(|| ReportError::Validation("slack reporter is not configured".into()))?;

        let channel = Self::resolve_channel(options, job)
            .ok_or_else(|| ReportError::Validation("no slack channel resolved for job".into()))?;

        let template = job
            .spec
            .reporter_config
            .as_ref()
            .and_then(|reporter| reporter.slack.as_ref())
            .and_then(|slack| slack.report_template.clone())
            .unwrap_or_else(|| options.report_template.clone());
        let message = render_template(&template, job).map_err(ReportError::Validation)?;

        if self.dry_run {
            info!(channel = %channel, message = %message, "dry-run: skipping slack post");
            return Ok(ReportOutcome::acknowledged(job.clone()));
        }
        self.client
            .post(&channel, &message)
            .map_err(ReportError::Transient)?;
        Ok(ReportOutcome::acknowledged(job.clone()))
    }
}
