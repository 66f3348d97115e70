//! Parsing of `/test` and `/retest` commands, plus the help and
//! disambiguation messages for targets no filter matched.

use regex::Regex;
use thiserror::Error;

use crate::filter::{CommandFilter, Filter, TestAllFilter};
use prow_api::jobs::Presubmit;

/// What a comment body is asking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerRequest {
    /// `/test all`
    TestAll,
    /// `/retest`
    Retest,
    /// `/test <target>`; carries the full body for the command filter.
    Test { body: String },
    /// `/test ?`
    Help,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerParseError {
    #[error("/test requires a target; use `/test ?` to list available jobs")]
    MissingTarget,
    #[error("/retest does not take a target; use `/test <job>` instead")]
    RetestTakesNoArgs,
}

/// Classify a comment body. `Ok(None)` means the body contains no
/// trigger command at all.
pub fn parse_trigger(body: &str) -> Result<Option<TriggerRequest>, TriggerParseError> {
    let command_re =
        Regex::new(r"(?m)^/(test|retest)\b[ \t]*(.*?)[ \t]*$").expect("static regex must compile");
    let Some(captures) = command_re.captures(body) else {
        return Ok(None);
    };
    let command = &captures[1];
    let target = &captures[2];
    match command {
        "retest" => {
            if target.is_empty() {
                Ok(Some(TriggerRequest::Retest))
            } else {
                Err(TriggerParseError::RetestTakesNoArgs)
            }
        }
        _ => match target {
            "" => Err(TriggerParseError::MissingTarget),
            "?" => Ok(Some(TriggerRequest::Help)),
            "all" => Ok(Some(TriggerRequest::TestAll)),
            _ => Ok(Some(TriggerRequest::Test {
                body: body.to_string(),
            })),
        },
    }
}

/// The `{required, optional, test-all}` trigger sets, computed by running
/// the test-all filter and each job's own command filter against the
/// full job set.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AvailableTriggers {
    /// Jobs `/test all` would consider.
    pub test_all_names: Vec<String>,
    /// Rerun commands of required jobs.
    pub required: Vec<String>,
    /// Rerun commands of optional jobs.
    pub optional: Vec<String>,
}

pub fn available_triggers(presubmits: &[Presubmit]) -> AvailableTriggers {
    let mut available = AvailableTriggers::default();
    let test_all = TestAllFilter;
    for job in presubmits {
        if test_all.apply(job).matched || job.trigger_matches(crate::filter::TEST_ALL_COMMAND) {
            available.test_all_names.push(job.name.clone());
        }
        if job.rerun_command.is_empty() {
            continue;
        }
        if CommandFilter::new(&job.rerun_command).apply(job).matched {
            if job.optional {
                available.optional.push(job.rerun_command.clone());
            } else {
                available.required.push(job.rerun_command.clone());
            }
        }
    }
    available
}

fn trigger_sets(available: &AvailableTriggers) -> String {
    let mut message = String::new();
    if !available.required.is_empty() {
        message.push_str("Required jobs:\n");
        for command in &available.required {
            message.push_str(&format!("  {command}\n"));
        }
    }
    if !available.optional.is_empty() {
        message.push_str("Optional jobs:\n");
        for command in &available.optional {
            message.push_str(&format!("  {command}\n"));
        }
    }
    if !available.test_all_names.is_empty() {
        message.push_str(&format!(
            "Use `/test all` to run the following jobs:\n  {}\n",
            available.test_all_names.join(", ")
        ));
    }
    message
}

/// Response to `/test ?`.
pub fn help_message(available: &AvailableTriggers) -> String {
    format!(
        "The following commands are available to trigger jobs:\n{}",
        trigger_sets(available)
    )
}

/// Response when `/test <target>` matched no job.
pub fn unknown_target_message(body: &str, available: &AvailableTriggers) -> String {
    let target = body.lines().next().unwrap_or(body).trim();
    format!(
        "No presubmit jobs match `{target}`. Pick one of:\n{}",
        trigger_sets(available)
    )
}
