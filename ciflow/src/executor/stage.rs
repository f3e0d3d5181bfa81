//! Runs the ordered steps of a stage.

use super::{Collaborators, ParallelExecutor, UnitExecutor};
use crate::config::EngineConfig;
use crate::core::{StageOutput, Step, StepOutput};
use crate::errors::EngineError;
use crate::state::ExecutionState;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Executes a stage: each step in order, then its cleanup.
///
/// After the first failing step the remaining steps are only cleaned up.
/// Every step is cleaned up exactly once.
#[derive(Debug)]
pub struct StageExecutor {
    steps: Vec<Step>,
    stage_output: StageOutput,
    state: Arc<ExecutionState>,
    unit: Arc<UnitExecutor>,
    parallel: ParallelExecutor,
    account_id: String,
    debug: bool,
}

impl StageExecutor {
    /// Creates a stage executor with an empty stage output.
    #[must_use]
    pub fn new(
        steps: Vec<Step>,
        state: Arc<ExecutionState>,
        unit: Arc<UnitExecutor>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            steps,
            stage_output: StageOutput::new(),
            state,
            parallel: ParallelExecutor::new(Arc::clone(&unit)),
            unit,
            account_id: account_id.into(),
            debug: false,
        }
    }

    /// Creates a stage executor from configuration.
    #[must_use]
    pub fn from_config(
        steps: Vec<Step>,
        state: Arc<ExecutionState>,
        config: &EngineConfig,
        collaborators: Collaborators,
    ) -> Self {
        let unit = Arc::new(UnitExecutor::from_config(config, collaborators));
        Self::new(steps, state, unit, config.account_id.clone()).with_debug(config.debug)
    }

    /// Blocks forever after the stage completes, keeping containers inspectable.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Outputs accumulated so far, keyed by unit step id.
    #[must_use]
    pub fn stage_output(&self) -> &StageOutput {
        &self.stage_output
    }

    /// Runs every step and returns the first step error.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let mut first_error: Option<EngineError> = None;

        for step in &self.steps {
            if first_error.is_none() {
                self.state.wait_for_running_state().await;
                match self.execute(step).await {
                    Ok(outputs) => {
                        for (step_id, output) in outputs {
                            self.stage_output.insert(step_id, output);
                        }
                    }
                    Err(e) => {
                        error!(step_id = %step.id(), error = %e, "Stage step failed, cleaning up remaining steps");
                        first_error = Some(e);
                    }
                }
            }

            if let Err(e) = self.cleanup(step).await {
                warn!(step_id = %step.id(), error = %e, "Step cleanup failed");
            }
        }

        match &first_error {
            Some(e) => error!(error = %e, "Stage failed"),
            None => info!(steps = self.steps.len(), "Stage completed"),
        }

        if self.debug {
            info!("Debug mode enabled, holding the stage open");
            std::future::pending::<()>().await;
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn execute(&self, step: &Step) -> Result<Vec<(String, StepOutput)>, EngineError> {
        match step {
            Step::Unit(unit) => {
                let output = self
                    .unit
                    .run(unit, &self.stage_output, &self.account_id)
                    .await?;
                Ok(output.map(|o| (unit.id.clone(), o)).into_iter().collect())
            }
            Step::Parallel(group) => {
                let outputs = self
                    .parallel
                    .run(group, &self.stage_output, &self.account_id)
                    .await?;
                Ok(outputs.into_iter().collect())
            }
        }
    }

    async fn cleanup(&self, step: &Step) -> Result<(), EngineError> {
        match step {
            Step::Unit(unit) => self.unit.cleanup(unit).await,
            Step::Parallel(group) => self.parallel.cleanup(group).await,
        }
    }
}
