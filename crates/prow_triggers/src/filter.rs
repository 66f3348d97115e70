//! Filter contract and the concrete filters.

use std::collections::HashSet;

use anyhow::Result;
use prow_api::jobs::{ChangedFilesProvider, Presubmit};
use tracing::debug;

/// The literal phrase that runs everything runnable.
pub const TEST_ALL_COMMAND: &str = "/test all";

/// Per-job answer from a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterResult {
    /// Does this filter apply to the job at all?
    pub matched: bool,
    /// If matched, ignore the job's conditional "should run" check.
    pub forced: bool,
    /// Answer for the conditional check when the job's own matcher is
    /// ambiguous.
    pub default_behavior: bool,
}

impl FilterResult {
    pub const NONE: FilterResult = FilterResult {
        matched: false,
        forced: false,
        default_behavior: false,
    };
}

pub trait Filter {
    fn name(&self) -> &'static str;
    fn apply(&self, job: &Presubmit) -> FilterResult;
}

/// Matches jobs whose trigger regex accepts the literal command body;
/// when matched, forces, and always defaults true.
pub struct CommandFilter {
    body: String,
}

impl CommandFilter {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

impl Filter for CommandFilter {
    fn name(&self) -> &'static str {
        "command-filter"
    }

    fn apply(&self, job: &Presubmit) -> FilterResult {
        let matched = job.trigger_matches(&self.body);
        FilterResult {
            matched,
            forced: matched,
            default_behavior: true,
        }
    }
}

/// Matches every job that does not require an explicit trigger. Jobs
/// whose trigger explicitly mentions "test all" are delegated to the
/// command filter instead. Never forces; defaults false.
pub struct TestAllFilter;

impl Filter for TestAllFilter {
    fn name(&self) -> &'static str {
        "test-all-filter"
    }

    fn apply(&self, job: &Presubmit) -> FilterResult {
        FilterResult {
            matched: !job.needs_explicit_trigger() && !job.trigger_matches(TEST_ALL_COMMAND),
            forced: false,
            default_behavior: false,
        }
    }
}

/// Matches a job iff its context previously failed, or the job needs no
/// explicit trigger and its context has no prior report. The default
/// behavior is "context was failed". With `required_only`, optional jobs
/// are rejected outright.
pub struct RetestFilter {
    failed_contexts: HashSet<String>,
    all_contexts: HashSet<String>,
    required_only: bool,
}

impl RetestFilter {
    pub fn new(failed_contexts: HashSet<String>, all_contexts: HashSet<String>) -> Self {
        Self {
            failed_contexts,
            all_contexts,
            required_only: false,
        }
    }

    /// The retest-required variant: `(false, false, false)` for optional
    /// jobs.
    pub fn required(failed_contexts: HashSet<String>, all_contexts: HashSet<String>) -> Self {
        Self {
            failed_contexts,
            all_contexts,
            required_only: true,
        }
    }
}

impl Filter for RetestFilter {
    fn name(&self) -> &'static str {
        if self.required_only {
            "retest-required-filter"
        } else {
            "retest-filter"
        }
    }

    fn apply(&self, job: &Presubmit) -> FilterResult {
        if self.required_only && job.optional {
            return FilterResult::NONE;
        }
        let failed = self.failed_contexts.contains(&job.context);
        let never_reported =
            !job.needs_explicit_trigger() && !self.all_contexts.contains(&job.context);
        FilterResult {
            matched: failed || never_reported,
            forced: false,
            default_behavior: failed,
        }
    }
}

/// Ordered list of filters; the first match wins. Callers must order
/// filters by specificity, most specific first.
pub struct AggregateFilter {
    filters: Vec<Box<dyn Filter>>,
}

impl AggregateFilter {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self { filters }
    }
}

impl Filter for AggregateFilter {
    fn name(&self) -> &'static str {
        "aggregate-filter"
    }

    fn apply(&self, job: &Presubmit) -> FilterResult {
        for filter in &self.filters {
            let result = filter.apply(job);
            if result.matched {
                return result;
            }
        }
        FilterResult::NONE
    }
}

/// Memoizing changed-files provider: the underlying fetch runs at most
/// once no matter how many jobs consult it.
pub struct LazyChangedFiles<F> {
    fetch: F,
    cache: Option<Vec<String>>,
}

impl<F> LazyChangedFiles<F>
where
    F: FnMut() -> Result<Vec<String>>,
{
    pub fn new(fetch: F) -> Self {
        Self { fetch, cache: None }
    }
}

impl<F> ChangedFilesProvider for LazyChangedFiles<F>
where
    F: FnMut() -> Result<Vec<String>>,
{
    fn changed_files(&mut self) -> Result<Vec<String>> {
        if let Some(cached) = &self.cache {
            return Ok(cached.clone());
        }
        let files = (self.fetch)()?;
        self.cache = Some(files.clone());
        Ok(files)
    }
}

/// The driver's output: the ordered subset to trigger, and the subset
/// that matched a filter but whose conditional evaluator said no.
#[derive(Debug, Default)]
pub struct FilteredPresubmits {
    pub to_trigger: Vec<Presubmit>,
    pub to_skip: Vec<Presubmit>,
}

/// Run each job through the filter, then through its own conditional
/// evaluator. Errors from the evaluator abort the whole call.
pub fn filter_presubmits(
    filter: &dyn Filter,
    changes: &mut dyn ChangedFilesProvider,
    branch: &str,
    presubmits: &[Presubmit],
) -> Result<FilteredPresubmits> {
    let mut filtered = FilteredPresubmits::default();
    for job in presubmits {
        let result = filter.apply(job);
        if !result.matched {
            continue;
        }
        let should_run = job.should_run(branch, changes, result.forced, result.default_behavior)?;
        debug!(
            job = %job.name,
            filter = filter.name(),
            should_run,
            "filtered presubmit"
        );
        if should_run {
            filtered.to_trigger.push(job.clone());
        } else {
            filtered.to_skip.push(job.clone());
        }
    }
    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prow_api::jobs::RegexpChangeMatcher;

    fn job(name: &str) -> Presubmit {
        Presubmit {
            name: name.to_string(),
            context: format!("ci/{name}"),
            trigger: Some(format!(r"(?m)^/test( all| {name})$")),
            rerun_command: format!("/test {name}"),
            ..Presubmit::default()
        }
    }

    fn always_run_job(name: &str) -> Presubmit {
        Presubmit {
            always_run: true,
            ..job(name)
        }
    }

    fn no_changes() -> LazyChangedFiles<impl FnMut() -> Result<Vec<String>>> {
        LazyChangedFiles::new(|| Ok(Vec::new()))
    }

    #[test]
    fn test_command_filter_triple() {
        let filter = CommandFilter::new("/test unit");
        let result = filter.apply(&job("unit"));
        assert!(result.matched);
        assert!(result.forced);
        assert!(result.default_behavior);

        let result = filter.apply(&job("integration"));
        assert!(!result.matched);
        assert!(!result.forced);
        // Defaults true even when unmatched; only matched results count.
        assert!(result.default_behavior);
    }

    #[test]
    fn test_test_all_filter() {
        let filter = TestAllFilter;
        // Needs an explicit trigger: not matched.
        assert!(!filter.apply(&job("unit")).matched);
        // always_run, trigger mentions "test all": delegated to command filter.
        assert!(!filter.apply(&always_run_job("unit")).matched);
        // always_run, no trigger: matched, never forced.
        let plain = Presubmit {
            name: "plain".to_string(),
            context: "ci/plain".to_string(),
            always_run: true,
            ..Presubmit::default()
        };
        let result = filter.apply(&plain);
        assert!(result.matched);
        assert!(!result.forced);
        assert!(!result.default_behavior);
    }

    #[test]
    fn test_retest_filter() {
        let failed = HashSet::from(["ci/unit".to_string()]);
        let all = HashSet::from(["ci/unit".to_string(), "ci/integration".to_string()]);
        let filter = RetestFilter::new(failed, all);

        // Failed context: matched, default true.
        let result = filter.apply(&job("unit"));
        assert!(result.matched);
        assert!(!result.forced);
        assert!(result.default_behavior);

        // Reported and green: not matched.
        assert!(!filter.apply(&always_run_job("integration")).matched);

        // Never reported and needs no explicit trigger: matched, default false.
        let mut fresh = always_run_job("new");
        fresh.trigger = None;
        let result = filter.apply(&fresh);
        assert!(result.matched);
        assert!(!result.default_behavior);

        // Never reported but needs an explicit trigger: not matched.
        assert!(!filter.apply(&job("new")).matched);
    }

    #[test]
    fn test_retest_required_filter_rejects_optional() {
        let failed = HashSet::from(["ci/unit".to_string()]);
        let filter = RetestFilter::required(failed.clone(), failed.clone());
        let mut optional = job("unit");
        optional.optional = true;
        assert_eq!(filter.apply(&optional), FilterResult::NONE);

        let plain = RetestFilter::new(failed.clone(), failed);
        assert!(plain.apply(&optional).matched);
    }

    #[test]
    fn test_aggregate_filter_first_match_wins() {
        // Command filter is more specific and forces; retest does not.
        let failed = HashSet::from(["ci/unit".to_string()]);
        let aggregate = AggregateFilter::new(vec![
            Box::new(CommandFilter::new("/test unit")),
            Box::new(RetestFilter::new(failed, HashSet::new())),
        ]);
        let result = aggregate.apply(&job("unit"));
        assert!(result.matched);
        assert!(result.forced, "command filter must win over retest");

        // Only retest applies to a job the command does not name.
        let aggregate = AggregateFilter::new(vec![
            Box::new(CommandFilter::new("/test integration")),
            Box::new(RetestFilter::new(
                HashSet::from(["ci/unit".to_string()]),
                HashSet::new(),
            )),
        ]);
        let result = aggregate.apply(&job("unit"));
        assert!(result.matched);
        assert!(!result.forced);
    }

    #[test]
    fn test_filter_presubmits_splits_trigger_and_skip() {
        let jobs = vec![
            always_run_job("unit"),
            // Matched by test-all but branch-restricted: lands in to_skip.
            Presubmit {
                brancher: prow_api::jobs::Brancher {
                    branches: vec!["release-1.0".to_string()],
                    ..Default::default()
                },
                ..always_run_job("release-only")
            },
            // Not matched at all.
            job("manual"),
        ];
        let mut changes = no_changes();
        let filtered = filter_presubmits(&TestAllFilter, &mut changes, "master", &jobs).unwrap();
        assert_eq!(
            filtered
                .to_trigger
                .iter()
                .map(|j| j.name.as_str())
                .collect::<Vec<_>>(),
            vec!["unit"]
        );
        assert_eq!(
            filtered
                .to_skip
                .iter()
                .map(|j| j.name.as_str())
                .collect::<Vec<_>>(),
            vec!["release-only"]
        );
    }

    #[test]
    fn test_filter_presubmits_aborts_on_evaluator_error() {
        let jobs = vec![Presubmit {
            // Trigger does not mention "test all", so the test-all filter
            // keeps this job instead of delegating it.
            trigger: Some(r"(?m)^/test conditional$".to_string()),
            change_matcher: RegexpChangeMatcher {
                run_if_changed: Some("^src/".to_string()),
                skip_if_only_changed: None,
            },
            ..job("conditional")
        }];
        let mut changes =
            LazyChangedFiles::new(|| anyhow::bail!("changed files unavailable"));
        // Command filter forces, so no error surfaces.
        let filter = CommandFilter::new("/test conditional");
        assert!(filter_presubmits(&filter, &mut changes, "master", &jobs).is_ok());
        // Test-all does not force; the evaluator error aborts the call.
        assert!(filter_presubmits(&TestAllFilter, &mut changes, "master", &jobs).is_err());
    }

    #[test]
    fn test_lazy_changed_files_fetches_once() {
        let mut count = 0;
        {
            let mut provider = LazyChangedFiles::new(|| {
                count += 1;
                Ok(vec!["src/lib.rs".to_string()])
            });
            provider.changed_files().unwrap();
            provider.changed_files().unwrap();
        }
        assert_eq!(count, 1);
    }
}
