//! ProwJob schema and model invariants.
//!
//! This crate is the durable vocabulary of the control plane: job types,
//! lifecycle states and their legal transitions, source-tree coordinates
//! (refs and pulls), decoration configs with defaulting and validation,
//! storage paths, and rerun authorization. Everything else in the
//! workspace builds on these types.

pub mod decoration;
pub mod duration;
pub mod jobs;
pub mod rerun;
pub mod storage;
pub mod types;

pub use decoration::{
    DecorationConfig, DecorationError, GcsConfiguration, PathStrategy, Resources, UtilityImages,
};
pub use jobs::{ChangedFilesProvider, JobDefinitionError, Presubmit};
pub use rerun::{RerunAuthConfig, RerunAuthError, RerunAuthLookup, Team};
pub use storage::{PathError, StoragePath};
pub use types::{
    ObjectMeta, ProwJob, ProwJobSpec, ProwJobState, ProwJobStatus, ProwJobType, Pull, Refs,
    ReporterConfig, SlackReporterConfig, ValidationError, API_VERSION, DEFAULT_CLUSTER_ALIAS, KIND,
};
