//! # Ciflow
//!
//! The step execution engine of a CI pipeline runner.
//!
//! Ciflow takes a decoded list of pipeline steps and drives them:
//!
//! - **Stage execution**: steps run in order, each followed by its cleanup
//! - **Parallel groups**: unit steps fanned out to tasks, first failure aborts the rest
//! - **Pause/resume**: a shared run state checked before every step
//! - **Status reporting**: every step ends with a terminal report to the controller
//! - **Build cache**: content-addressed save/restore with integrity checks and retry
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ciflow::prelude::*;
//!
//! let config = EngineConfig::from_env()?;
//! let state = Arc::new(ExecutionState::new());
//! let mut stage = StageExecutor::from_config(steps, state, &config, collaborators);
//!
//! stage.run().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod archive;
pub mod cache;
pub mod config;
pub mod core;
pub mod errors;
pub mod executor;
pub mod observability;
pub mod remote;
pub mod retry;
pub mod state;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::archive::{Archiver, TarArchiver};
    pub use crate::cache::{CacheService, RestoreOutcome};
    pub use crate::config::{CacheConfig, EngineConfig};
    pub use crate::core::{
        ParallelStep, RunState, StageOutput, Step, StepOutput, StepPayload, StepStatus, UnitStep,
    };
    pub use crate::errors::{EngineError, RemoteCode, RemoteStatus};
    pub use crate::executor::{Collaborators, ParallelExecutor, StageExecutor, UnitExecutor};
    pub use crate::observability::init_tracing;
    pub use crate::remote::{
        AddonClient, AddonConnector, ArtifactPublisher, ExpressionEvaluator, ObjectStore,
        StatusReporter, StepStatusReport,
    };
    pub use crate::retry::{Backoff, RetryConfig};
    pub use crate::state::ExecutionState;
    pub use std::sync::Arc;
}
