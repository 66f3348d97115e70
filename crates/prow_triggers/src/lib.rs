//! Trigger filtering: which declared pre-submit jobs run for an event.
//!
//! A filter answers, per job, `(match, force, default)`; the driver loop
//! combines that with the job's own conditional evaluator. Filters of
//! different kinds never short-circuit each other, so callers order them
//! most specific first inside an [`AggregateFilter`].

pub mod command;
pub mod filter;
pub mod specs;

pub use command::{
    available_triggers, help_message, parse_trigger, unknown_target_message, AvailableTriggers,
    TriggerParseError, TriggerRequest,
};
pub use filter::{
    filter_presubmits, AggregateFilter, CommandFilter, Filter, FilterResult, FilteredPresubmits,
    LazyChangedFiles, RetestFilter, TestAllFilter, TEST_ALL_COMMAND,
};
pub use specs::presubmit_spec;
