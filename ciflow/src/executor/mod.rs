//! Step executors.
//!
//! This module provides:
//! - [`UnitExecutor`]: one step of any kind, with skip evaluation and status reporting
//! - [`ParallelExecutor`]: a group of unit steps run concurrently
//! - [`StageExecutor`]: the ordered steps of a stage, with pause/resume and cleanup

mod parallel;
mod stage;
mod unit;

pub use parallel::ParallelExecutor;
pub use stage::StageExecutor;
pub use unit::UnitExecutor;

use crate::remote::{AddonConnector, ArtifactPublisher, ExpressionEvaluator, ObjectStore, StatusReporter};
use std::sync::Arc;

/// The external services an engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Opens clients for addons on container ports.
    pub connector: Arc<dyn AddonConnector>,
    /// Resolves `${...}` expressions and skip conditions.
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    /// Delivers step status reports. Wrapped with retries by `from_config`.
    pub reporter: Arc<dyn StatusReporter>,
    /// Publishes artifacts.
    pub publisher: Arc<dyn ArtifactPublisher>,
    /// Backs the build cache.
    pub store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
