//! Addon process that performs the actual work of run, test and plugin steps.

use crate::core::{StepOutput, UnitStep};
use crate::errors::EngineError;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Result of executing a step in an addon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddonResult {
    /// Output variables exported by the step.
    pub output: StepOutput,
    /// Retries the addon client already spent on this call.
    pub retries: i32,
}

/// Client for one addon.
#[async_trait]
pub trait AddonClient: Send + Sync {
    /// Runs `step` inside the addon with `work_dir` as its working directory.
    async fn execute_step(&self, step: &UnitStep, work_dir: &Path) -> Result<AddonResult, EngineError>;

    /// Asks the addon to shut down.
    async fn signal_stop(&self) -> Result<(), EngineError>;
}

/// Opens clients for addons listening on container ports.
pub trait AddonConnector: Send + Sync {
    /// Returns a client for the addon on `port`.
    fn connect(&self, port: u16) -> Result<Arc<dyn AddonClient>, EngineError>;
}
