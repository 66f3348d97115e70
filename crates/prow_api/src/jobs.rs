//! Declared pre-submit job definitions and their "should run" matchers.
//!
//! The filter engine consumes these; the conditional evaluator is
//! [`Presubmit::should_run`].

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lazily yields the files changed in the PR. Implementations are
/// expected to memoize: the evaluator may ask more than once.
pub trait ChangedFilesProvider {
    fn changed_files(&mut self) -> Result<Vec<String>>;
}

impl<F> ChangedFilesProvider for F
where
    F: FnMut() -> Result<Vec<String>>,
{
    fn changed_files(&mut self) -> Result<Vec<String>> {
        self()
    }
}

#[derive(Debug, Error)]
pub enum JobDefinitionError {
    #[error("job {job:?} has an invalid {field} pattern {pattern:?}: {source}")]
    InvalidPattern {
        job: String,
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("job {0:?} sets both run_if_changed and skip_if_only_changed")]
    ConflictingChangeMatchers(String),
}

/// Branch allow/deny lists. Entries are matched whole, either literally
/// or as anchored regexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Brancher {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_branches: Vec<String>,
}

impl Brancher {
    pub fn should_run_against_branch(&self, branch: &str) -> bool {
        if matches_any_branch(&self.skip_branches, branch) {
            return false;
        }
        if self.branches.is_empty() {
            return true;
        }
        matches_any_branch(&self.branches, branch)
    }
}

fn matches_any_branch(patterns: &[String], branch: &str) -> bool {
    patterns.iter().any(|pattern| {
        pattern == branch
            || Regex::new(&format!("^(?:{pattern})$"))
                .map(|re| re.is_match(branch))
                .unwrap_or(false)
    })
}

/// File-based conditional: run when a changed file matches, or skip when
/// every changed file matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RegexpChangeMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_if_changed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if_only_changed: Option<String>,
}

impl RegexpChangeMatcher {
    /// `Ok(Some(_))` when the matcher determines the answer, `Ok(None)`
    /// when no matcher is configured.
    pub fn should_run(&self, changes: &mut dyn ChangedFilesProvider) -> Result<Option<bool>> {
        if let Some(pattern) = &self.run_if_changed {
            let re = Regex::new(pattern)?;
            let changed = changes.changed_files()?;
            return Ok(Some(changed.iter().any(|file| re.is_match(file))));
        }
        if let Some(pattern) = &self.skip_if_only_changed {
            let re = Regex::new(pattern)?;
            let changed = changes.changed_files()?;
            return Ok(Some(!changed.iter().all(|file| re.is_match(file))));
        }
        Ok(None)
    }
}

/// One declared pre-submit job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Presubmit {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    /// Run on every PR without an explicit command.
    #[serde(default)]
    pub always_run: bool,
    /// Optional jobs do not gate merge.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub skip_report: bool,
    /// Regex a comment body must match to trigger this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rerun_command: String,
    #[serde(flatten)]
    pub brancher: Brancher,
    #[serde(flatten)]
    pub change_matcher: RegexpChangeMatcher,
}

impl Presubmit {
    /// Whether running this job requires someone to type its trigger.
    pub fn needs_explicit_trigger(&self) -> bool {
        !self.always_run
            && self.change_matcher.run_if_changed.is_none()
            && self.change_matcher.skip_if_only_changed.is_none()
    }

    /// Whether the comment body matches this job's trigger regex.
    pub fn trigger_matches(&self, body: &str) -> bool {
        match &self.trigger {
            Some(pattern) => Regex::new(pattern)
                .map(|re| re.is_match(body))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Whether this job can ever run on the given branch.
    pub fn could_run(&self, branch: &str) -> bool {
        self.brancher.should_run_against_branch(branch)
    }

    /// The conditional "should run" evaluator.
    ///
    /// `forced` comes from a matching filter that wants the job regardless
    /// of its own matchers; `default` is the answer when the job's matcher
    /// is ambiguous.
    pub fn should_run(
        &self,
        branch: &str,
        changes: &mut dyn ChangedFilesProvider,
        forced: bool,
        default: bool,
    ) -> Result<bool> {
        if !self.could_run(branch) {
            return Ok(false);
        }
        if self.always_run {
            return Ok(true);
        }
        if forced {
            return Ok(true);
        }
        if let Some(determined) = self.change_matcher.should_run(changes)? {
            return Ok(determined);
        }
        Ok(default)
    }

    /// Config-time validation: every pattern must compile, and the two
    /// change matchers are mutually exclusive.
    pub fn validate(&self) -> Result<(), JobDefinitionError> {
        if self.change_matcher.run_if_changed.is_some()
            && self.change_matcher.skip_if_only_changed.is_some()
        {
            return Err(JobDefinitionError::ConflictingChangeMatchers(
                self.name.clone(),
            ));
        }
        let patterns: [(&'static str, Option<&String>); 3] = [
            ("trigger", self.trigger.as_ref()),
            ("run_if_changed", self.change_matcher.run_if_changed.as_ref()),
            (
                "skip_if_only_changed",
                self.change_matcher.skip_if_only_changed.as_ref(),
            ),
        ];
        for (field, pattern) in patterns {
            if let Some(pattern) = pattern {
                Regex::new(pattern).map_err(|source| JobDefinitionError::InvalidPattern {
                    job: self.name.clone(),
                    field,
                    pattern: pattern.clone(),
                    source,
                })?;
            }
        }
        for (field, patterns) in [
            ("branches", &self.brancher.branches),
            ("skip_branches", &self.brancher.skip_branches),
        ] {
            for pattern in patterns {
                Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
                    JobDefinitionError::InvalidPattern {
                        job: self.name.clone(),
                        field,
                        pattern: pattern.clone(),
                        source,
                    }
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_changes(files: &[&str]) -> impl FnMut() -> Result<Vec<String>> {
        let files: Vec<String> = files.iter().map(|f| f.to_string()).collect();
        move || Ok(files.clone())
    }

    fn failing_changes() -> impl FnMut() -> Result<Vec<String>> {
        || anyhow::bail!("changed files unavailable")
    }

    #[test]
    fn test_needs_explicit_trigger() {
        let job = Presubmit {
            name: "unit".to_string(),
            always_run: true,
            ..Presubmit::default()
        };
        assert!(!job.needs_explicit_trigger());

        let job = Presubmit {
            name: "unit".to_string(),
            change_matcher: RegexpChangeMatcher {
                run_if_changed: Some("^src/".to_string()),
                skip_if_only_changed: None,
            },
            ..Presubmit::default()
        };
        assert!(!job.needs_explicit_trigger());

        let job = Presubmit {
            name: "unit".to_string(),
            trigger: Some("(?m)^/test unit".to_string()),
            ..Presubmit::default()
        };
        assert!(job.needs_explicit_trigger());
    }

    #[test]
    fn test_trigger_matches() {
        let job = Presubmit {
            name: "unit".to_string(),
            trigger: Some(r"(?m)^/test( all| unit)$".to_string()),
            ..Presubmit::default()
        };
        assert!(job.trigger_matches("/test unit"));
        assert!(job.trigger_matches("/test all"));
        assert!(!job.trigger_matches("/test integration"));
    }

    #[test]
    fn test_brancher() {
        let job = Presubmit {
            name: "unit".to_string(),
            brancher: Brancher {
                branches: vec!["master".to_string(), "release-.*".to_string()],
                skip_branches: vec!["release-0.1".to_string()],
            },
            ..Presubmit::default()
        };
        assert!(job.could_run("master"));
        assert!(job.could_run("release-1.2"));
        assert!(!job.could_run("release-0.1"));
        assert!(!job.could_run("feature"));
    }

    #[test]
    fn test_should_run_always_run_ignores_changes() {
        let job = Presubmit {
            name: "unit".to_string(),
            always_run: true,
            ..Presubmit::default()
        };
        let mut changes = failing_changes();
        assert!(job.should_run("master", &mut changes, false, false).unwrap());
    }

    #[test]
    fn test_should_run_forced_skips_matchers() {
        let job = Presubmit {
            name: "unit".to_string(),
            change_matcher: RegexpChangeMatcher {
                run_if_changed: Some("^docs/".to_string()),
                skip_if_only_changed: None,
            },
            ..Presubmit::default()
        };
        let mut changes = failing_changes();
        assert!(job.should_run("master", &mut changes, true, false).unwrap());
    }

    #[test]
    fn test_should_run_run_if_changed() {
        let job = Presubmit {
            name: "unit".to_string(),
            change_matcher: RegexpChangeMatcher {
                run_if_changed: Some(r"^src/.*\.rs$".to_string()),
                skip_if_only_changed: None,
            },
            ..Presubmit::default()
        };
        let mut touched = static_changes(&["src/lib.rs", "README.md"]);
        assert!(job.should_run("master", &mut touched, false, false).unwrap());
        let mut untouched = static_changes(&["README.md"]);
        assert!(!job
            .should_run("master", &mut untouched, false, false)
            .unwrap());
    }

    #[test]
    fn test_should_run_skip_if_only_changed() {
        let job = Presubmit {
            name: "unit".to_string(),
            change_matcher: RegexpChangeMatcher {
                run_if_changed: None,
                skip_if_only_changed: Some(r"\.md$".to_string()),
            },
            ..Presubmit::default()
        };
        let mut docs_only = static_changes(&["README.md", "docs/guide.md"]);
        assert!(!job
            .should_run("master", &mut docs_only, false, false)
            .unwrap());
        let mut mixed = static_changes(&["README.md", "src/lib.rs"]);
        assert!(job.should_run("master", &mut mixed, false, false).unwrap());
    }

    #[test]
    fn test_should_run_falls_back_to_default() {
        let job = Presubmit {
            name: "unit".to_string(),
            trigger: Some("(?m)^/test unit".to_string()),
            ..Presubmit::default()
        };
        let mut changes = static_changes(&[]);
        assert!(!job.should_run("master", &mut changes, false, false).unwrap());
        assert!(job.should_run("master", &mut changes, false, true).unwrap());
    }

    #[test]
    fn test_should_run_propagates_change_errors() {
        let job = Presubmit {
            name: "unit".to_string(),
            change_matcher: RegexpChangeMatcher {
                run_if_changed: Some("^src/".to_string()),
                skip_if_only_changed: None,
            },
            ..Presubmit::default()
        };
        let mut changes = failing_changes();
        assert!(job.should_run("master", &mut changes, false, false).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_patterns() {
        let job = Presubmit {
            name: "unit".to_string(),
            trigger: Some("(/test".to_string()),
            ..Presubmit::default()
        };
        assert!(matches!(
            job.validate(),
            Err(JobDefinitionError::InvalidPattern { field: "trigger", .. })
        ));

        let job = Presubmit {
            name: "unit".to_string(),
            change_matcher: RegexpChangeMatcher {
                run_if_changed: Some("a".to_string()),
                skip_if_only_changed: Some("b".to_string()),
            },
            ..Presubmit::default()
        };
        assert!(matches!(
            job.validate(),
            Err(JobDefinitionError::ConflictingChangeMatchers(_))
        ));
    }
}
