//! Step builders and a wired engine for tests.

use std::path::Path;
use std::sync::Arc;

use super::mocks::{
    InMemoryObjectStore, RecordingPublisher, RecordingStatusReporter, ScriptedAddon,
    ScriptedConnector, StaticEvaluator,
};
use crate::config::{CacheConfig, EngineConfig};
use crate::core::{
    RestoreCacheStep, RunStep, SaveCacheStep, Step, StepPayload, UnitStep,
};
use crate::executor::{Collaborators, StageExecutor, UnitExecutor};
use crate::retry::{JitterStrategy, RetryConfig};
use crate::state::ExecutionState;

/// Endpoint used by [`TestEngine`] reports.
pub const TEST_ENDPOINT: &str = "http://delegate.test";

/// A run step served by the addon on `port`, with callback token
/// `token-<id>` and task id `task-<id>`.
#[must_use]
pub fn run_step(id: &str, port: u16) -> UnitStep {
    UnitStep::new(
        id,
        StepPayload::Run(RunStep {
            command: format!("echo {id}"),
            container_port: Some(port),
            ..RunStep::default()
        }),
    )
    .with_callback(format!("token-{id}"), format!("task-{id}"))
}

/// A save-cache step.
#[must_use]
pub fn save_cache_step(id: &str, key: &str, paths: &[&str]) -> UnitStep {
    UnitStep::new(
        id,
        StepPayload::SaveCache(SaveCacheStep {
            key: key.to_string(),
            paths: paths.iter().map(ToString::to_string).collect(),
        }),
    )
    .with_callback(format!("token-{id}"), format!("task-{id}"))
}

/// A restore-cache step.
#[must_use]
pub fn restore_cache_step(id: &str, key: &str, fail_if_not_exist: bool) -> UnitStep {
    UnitStep::new(
        id,
        StepPayload::RestoreCache(RestoreCacheStep {
            key: key.to_string(),
            fail_if_not_exist,
        }),
    )
    .with_callback(format!("token-{id}"), format!("task-{id}"))
}

/// Retry policy with millisecond delays and no jitter.
#[must_use]
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(3)
        .with_base_delay_ms(1)
        .with_max_delay_ms(5)
        .with_jitter(JitterStrategy::None)
}

/// An engine wired to in-memory collaborators.
#[derive(Debug)]
pub struct TestEngine {
    /// Addon serving run steps.
    pub addon: Arc<ScriptedAddon>,
    /// Receives every status report.
    pub reporter: Arc<RecordingStatusReporter>,
    /// Backs the cache.
    pub store: Arc<InMemoryObjectStore>,
    /// Receives publish requests.
    pub publisher: Arc<RecordingPublisher>,
    /// Resolves expressions.
    pub evaluator: Arc<StaticEvaluator>,
    /// Shared pause/resume state.
    pub state: Arc<ExecutionState>,
    /// Configuration executors are built from.
    pub config: EngineConfig,
}

impl TestEngine {
    /// Creates an engine whose work and temp dirs are the given paths.
    #[must_use]
    pub fn new(addon: ScriptedAddon, work_dir: &Path, tmp_dir: &Path) -> Self {
        let config = EngineConfig::new()
            .with_work_dir(work_dir)
            .with_tmp_dir(tmp_dir)
            .with_delegate_endpoint(TEST_ENDPOINT)
            .with_account_id("test-account")
            .with_cache(CacheConfig::default().with_retry(fast_retry()))
            .with_status_retry(fast_retry());
        Self {
            addon: Arc::new(addon),
            reporter: Arc::new(RecordingStatusReporter::new()),
            store: Arc::new(InMemoryObjectStore::new()),
            publisher: Arc::new(RecordingPublisher::new()),
            evaluator: Arc::new(StaticEvaluator::new()),
            state: Arc::new(ExecutionState::new()),
            config,
        }
    }

    /// Replaces the expression evaluator.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: StaticEvaluator) -> Self {
        self.evaluator = Arc::new(evaluator);
        self
    }

    /// Collaborators backed by this engine's doubles.
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            connector: Arc::new(ScriptedConnector::new(Arc::clone(&self.addon))),
            evaluator: self.evaluator.clone(),
            reporter: self.reporter.clone(),
            publisher: self.publisher.clone(),
            store: self.store.clone(),
        }
    }

    /// A unit executor built from the engine's configuration.
    #[must_use]
    pub fn unit_executor(&self) -> Arc<UnitExecutor> {
        Arc::new(UnitExecutor::from_config(&self.config, self.collaborators()))
    }

    /// A stage executor for `steps`.
    #[must_use]
    pub fn stage(&self, steps: Vec<Step>) -> StageExecutor {
        StageExecutor::from_config(
            steps,
            Arc::clone(&self.state),
            &self.config,
            self.collaborators(),
        )
    }
}
