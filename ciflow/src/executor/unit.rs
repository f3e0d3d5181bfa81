//! Executes a single unit step.

use crate::cache::CacheService;
use crate::config::EngineConfig;
use crate::core::{PublishArtifactsStep, StageOutput, StepOutput, StepPayload, StepStatus, UnitStep};
use crate::errors::{EngineError, ValidationError};
use crate::remote::{
    resolve_embedded, resolve_expressions, AddonConnector, ArtifactPublisher, ExpressionEvaluator,
    ResolveMode, RetryingStatusReporter, StatusReporter, StepStatusReport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::Collaborators;

/// What a dispatched step produced.
#[derive(Debug, Default)]
struct Execution {
    output: Option<StepOutput>,
    retries: i32,
    artifact: Option<serde_json::Value>,
}

/// Runs unit steps and reports their terminal status.
pub struct UnitExecutor {
    connector: Arc<dyn AddonConnector>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    reporter: Arc<dyn StatusReporter>,
    publisher: Arc<dyn ArtifactPublisher>,
    cache: CacheService,
    work_dir: PathBuf,
    endpoint: String,
}

impl UnitExecutor {
    /// Creates an executor. Reports are sent as-is through `reporter`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn AddonConnector>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        reporter: Arc<dyn StatusReporter>,
        publisher: Arc<dyn ArtifactPublisher>,
        cache: CacheService,
    ) -> Self {
        let work_dir = cache.work_dir().to_path_buf();
        Self {
            connector,
            evaluator,
            reporter,
            publisher,
            cache,
            work_dir,
            endpoint: String::new(),
        }
    }

    /// Creates an executor from configuration.
    ///
    /// Status delivery is retried with `config.status_retry`.
    #[must_use]
    pub fn from_config(config: &EngineConfig, collaborators: Collaborators) -> Self {
        let cache = CacheService::from_config(
            collaborators.store,
            Arc::clone(&collaborators.evaluator),
            config,
        );
        let reporter = Arc::new(RetryingStatusReporter::new(
            collaborators.reporter,
            config.status_retry.clone(),
        ));
        Self::new(
            collaborators.connector,
            collaborators.evaluator,
            reporter,
            collaborators.publisher,
            cache,
        )
        .with_endpoint(config.delegate_endpoint.clone().unwrap_or_default())
    }

    /// Sets the delegate endpoint reports are addressed to.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Runs `step` and reports its terminal status.
    ///
    /// Returns `Ok(None)` for skipped steps and for steps without output.
    pub async fn run(
        &self,
        step: &UnitStep,
        stage_output: &StageOutput,
        account_id: &str,
    ) -> Result<Option<StepOutput>, EngineError> {
        let start = Instant::now();

        if let Err(e) = validate(step).map_err(EngineError::from) {
            error!(step_id = %step.id, error = %e, "Invalid step");
            let report = self
                .report(step, account_id, StepStatus::Failure)
                .with_elapsed(start.elapsed())
                .with_error(e.status_message());
            if let Err(send_err) = self.reporter.send_step_status(&report).await {
                warn!(step_id = %step.id, error = %send_err, "Failed to report invalid step");
            }
            return Err(e);
        }

        if let Some(condition) = step.skip_condition.as_deref().filter(|c| !c.is_empty()) {
            if self.should_skip(step, condition, stage_output).await? {
                info!(step_id = %step.id, condition, "Skipping step");
                let report = self
                    .report(step, account_id, StepStatus::Skipped)
                    .with_elapsed(start.elapsed());
                self.reporter.send_step_status(&report).await?;
                return Ok(None);
            }
        }

        info!(step_id = %step.id, kind = step.kind(), "Starting step");
        match self.dispatch(step, stage_output).await {
            Ok(execution) => {
                let elapsed = start.elapsed();
                info!(
                    step_id = %step.id,
                    elapsed_ms = millis(elapsed),
                    retries = execution.retries,
                    "Step succeeded"
                );
                let mut report = self
                    .report(step, account_id, StepStatus::Success)
                    .with_elapsed(elapsed)
                    .with_retries(execution.retries)
                    .with_artifact(execution.artifact);
                if let Some(output) = &execution.output {
                    report = report.with_output(output.clone());
                }
                self.reporter.send_step_status(&report).await?;
                Ok(execution.output)
            }
            Err(e) => {
                let elapsed = start.elapsed();
                error!(step_id = %step.id, elapsed_ms = millis(elapsed), error = %e, "Step failed");
                let report = self
                    .report(step, account_id, StepStatus::Failure)
                    .with_elapsed(elapsed)
                    .with_error(e.status_message());
                if let Err(send_err) = self.reporter.send_step_status(&report).await {
                    error!(step_id = %step.id, error = %send_err, "Failed to report step failure");
                }
                Err(e)
            }
        }
    }

    /// Reports `step` as aborted without touching its execution.
    pub async fn report_aborted(&self, step: &UnitStep, account_id: &str) {
        warn!(step_id = %step.id, "Aborting step");
        let report = self.report(step, account_id, StepStatus::Aborted);
        if let Err(e) = self.reporter.send_step_status(&report).await {
            error!(step_id = %step.id, error = %e, "Failed to report aborted step");
        }
    }

    /// Stops the addon started for `step`, if any.
    pub async fn cleanup(&self, step: &UnitStep) -> Result<(), EngineError> {
        let Some(port) = step.container_port() else {
            return Ok(());
        };

        let cleanup_error = |e: EngineError| EngineError::Cleanup {
            step_id: step.id.clone(),
            message: e.status_message(),
        };
        let client = self.connector.connect(port).map_err(cleanup_error)?;
        client.signal_stop().await.map_err(cleanup_error)?;

        debug!(step_id = %step.id, port, "Stopped addon");
        Ok(())
    }

    async fn should_skip(
        &self,
        step: &UnitStep,
        condition: &str,
        stage_output: &StageOutput,
    ) -> Result<bool, EngineError> {
        let expressions = [condition.to_string()];
        let resolved = resolve_expressions(
            self.evaluator.as_ref(),
            &step.id,
            &expressions,
            stage_output,
            ResolveMode::SkipCondition,
        )
        .await?;

        let value = resolved.get(condition).map_or(condition, String::as_str);
        parse_bool(value).ok_or_else(|| {
            EngineError::SkipCondition(format!("{value:?} is not a boolean for step {}", step.id))
        })
    }

    async fn dispatch(
        &self,
        step: &UnitStep,
        stage_output: &StageOutput,
    ) -> Result<Execution, EngineError> {
        let Some(payload) = &step.payload else {
            return Err(EngineError::UnexpectedStepKind(step.kind().to_string()));
        };

        match payload {
            StepPayload::Run(_) | StepPayload::RunTests(_) | StepPayload::Plugin(_) => {
                let port = step
                    .container_port()
                    .ok_or_else(|| ValidationError::new("container port", &step.id))?;
                let client = self.connector.connect(port)?;
                let result = client.execute_step(step, &self.work_dir).await?;
                Ok(Execution {
                    output: Some(result.output),
                    retries: result.retries,
                    artifact: None,
                })
            }
            StepPayload::SaveCache(save) => {
                let key = self.cache.save(&step.id, save, stage_output).await?;
                Ok(Execution {
                    output: Some(StepOutput::with_var("key", key)),
                    ..Execution::default()
                })
            }
            StepPayload::RestoreCache(restore) => {
                self.cache.restore(&step.id, restore, stage_output).await?;
                Ok(Execution::default())
            }
            StepPayload::PublishArtifacts(publish) => {
                let resolved = self.resolve_artifacts(&step.id, publish, stage_output).await?;
                let artifact = self.publisher.publish(&step.id, &resolved).await?;
                Ok(Execution {
                    artifact,
                    ..Execution::default()
                })
            }
        }
    }

    async fn resolve_artifacts(
        &self,
        step_id: &str,
        publish: &PublishArtifactsStep,
        stage_output: &StageOutput,
    ) -> Result<PublishArtifactsStep, EngineError> {
        let evaluator = self.evaluator.as_ref();
        let mut resolved = publish.clone();
        for file in &mut resolved.files {
            file.source_path =
                resolve_embedded(evaluator, step_id, &file.source_path, stage_output).await?;
            file.destination_url =
                resolve_embedded(evaluator, step_id, &file.destination_url, stage_output).await?;
        }
        for image in &mut resolved.images {
            image.image = resolve_embedded(evaluator, step_id, &image.image, stage_output).await?;
            image.tag = resolve_embedded(evaluator, step_id, &image.tag, stage_output).await?;
            image.destination_url =
                resolve_embedded(evaluator, step_id, &image.destination_url, stage_output).await?;
        }
        Ok(resolved)
    }

    fn report(&self, step: &UnitStep, account_id: &str, status: StepStatus) -> StepStatusReport {
        StepStatusReport::new(&step.id, status).with_route(
            &self.endpoint,
            account_id,
            &step.callback_token,
            &step.task_id,
        )
    }
}

impl std::fmt::Debug for UnitExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitExecutor")
            .field("cache", &self.cache)
            .field("work_dir", &self.work_dir)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

fn validate(step: &UnitStep) -> Result<(), ValidationError> {
    if step.id.is_empty() {
        return Err(ValidationError::new("step ID", "<unnamed>"));
    }
    if step.callback_token.is_empty() {
        return Err(ValidationError::new("callback token", &step.id));
    }
    if step.task_id.is_empty() {
        return Err(ValidationError::new("task ID", &step.id));
    }
    Ok(())
}

/// Parses a boolean the way skip conditions are written.
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Some(true),
        "false" | "f" | "0" => Some(false),
        _ => None,
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
