//! Runs a group of unit steps concurrently.

use super::UnitExecutor;
use crate::core::{ParallelStep, StageOutput, StepOutput, UnitStep};
use crate::errors::{EngineError, ValidationError};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Result sent by one worker.
type StepResult = (String, Result<Option<StepOutput>, EngineError>);

/// Fans a parallel group out to one task per step and fans the results in.
///
/// When a step fails, every step that has not reported yet is marked
/// `ABORTED` and the first error is returned. The workers of those steps
/// are not cancelled: they run to completion in the background and their
/// own terminal report, if it arrives later, supersedes the abort.
#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    unit: Arc<UnitExecutor>,
}

impl ParallelExecutor {
    /// Creates a parallel executor backed by `unit`.
    #[must_use]
    pub fn new(unit: Arc<UnitExecutor>) -> Self {
        Self { unit }
    }

    /// Runs every step of `group` and returns their outputs keyed by step id.
    ///
    /// Skipped steps and steps without output are left out, the same as at
    /// stage level.
    pub async fn run(
        &self,
        group: &ParallelStep,
        stage_output: &StageOutput,
        account_id: &str,
    ) -> Result<HashMap<String, StepOutput>, EngineError> {
        if group.id.is_empty() {
            return Err(ValidationError::new("step ID", "<parallel>").into());
        }
        if group.steps.is_empty() {
            return Ok(HashMap::new());
        }

        info!(step_id = %group.id, steps = group.steps.len(), "Starting parallel step");
        let snapshot = Arc::new(stage_output.clone());
        let (tx, mut rx) = mpsc::channel::<StepResult>(group.steps.len());

        for step in &group.steps {
            let tx = tx.clone();
            let unit = Arc::clone(&self.unit);
            let snapshot = Arc::clone(&snapshot);
            let step = step.clone();
            let account_id = account_id.to_string();
            tokio::spawn(async move {
                let result = unit.run(&step, &snapshot, &account_id).await;
                if tx.send((step.id, result)).await.is_err() {
                    debug!("Parallel step result dropped after abort");
                }
            });
        }
        drop(tx);

        let mut pending: HashMap<&str, &UnitStep> =
            group.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut outputs = HashMap::with_capacity(group.steps.len());

        for _ in 0..group.steps.len() {
            let Some((step_id, result)) = rx.recv().await else {
                let e = EngineError::Join(format!(
                    "a worker of parallel step {} exited without a result",
                    group.id
                ));
                self.abort_pending(&pending, account_id).await;
                return Err(e);
            };
            pending.remove(step_id.as_str());

            match result {
                Ok(Some(output)) => {
                    outputs.insert(step_id, output);
                }
                Ok(None) => {
                    debug!(step_id = %group.id, step = %step_id, "Parallel step produced no output");
                }
                Err(e) => {
                    error!(step_id = %group.id, failed = %step_id, error = %e, "Parallel step failed");
                    self.abort_pending(&pending, account_id).await;
                    return Err(e);
                }
            }
        }

        info!(step_id = %group.id, "Parallel step succeeded");
        Ok(outputs)
    }

    /// Cleans up every step of `group`, returning the last error seen.
    pub async fn cleanup(&self, group: &ParallelStep) -> Result<(), EngineError> {
        let results = join_all(group.steps.iter().map(|step| self.unit.cleanup(step))).await;

        let mut last_error = None;
        for (step, result) in group.steps.iter().zip(results) {
            if let Err(e) = result {
                warn!(step_id = %step.id, error = %e, "Cleanup failed");
                last_error = Some(e);
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    async fn abort_pending(&self, pending: &HashMap<&str, &UnitStep>, account_id: &str) {
        for step in pending.values() {
            self.unit.report_aborted(step, account_id).await;
        }
    }
}
