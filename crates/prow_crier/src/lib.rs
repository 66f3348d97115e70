//! Crier - status reporting control plane.
//!
//! Watches ProwJobs and delivers state changes to external sinks with
//! at-most-once-per-state semantics. One [`controller::Controller`] owns
//! one reporter sink and its own work queue; the supersession
//! [`aborter`] runs alongside and cancels older duplicate jobs.

pub mod aborter;
pub mod config;
pub mod controller;
pub mod reporters;
pub mod shutdown;
pub mod store;
pub mod workqueue;

pub use config::{ConfigAgent, ConfigGetter, CrierConfig};
pub use shutdown::ShutdownSignal;
pub use controller::{Controller, RunOnceSummary};
pub use store::{InMemoryStore, JobKey, ProwJobStore, StoreError};
pub use workqueue::WorkQueue;
