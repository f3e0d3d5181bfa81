//! In-memory doubles for the engine's collaborators.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{PublishArtifactsStep, StageOutput, StepOutput, StepStatus, UnitStep};
use crate::errors::{EngineError, RemoteStatus};
use crate::remote::{
    AddonClient, AddonConnector, AddonResult, ArtifactPublisher, ExpressionEvaluator, ObjectInfo,
    ObjectStore, StatusReporter, StepStatusReport, UploadOptions,
};

/// Object store operations, for counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `stat`
    Stat,
    /// `upload`
    Upload,
    /// `download`
    Download,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: HashMap<String, String>,
}

/// An object store backed by memory.
///
/// Every call is counted per operation. Failures queued with
/// [`fail_next`](Self::fail_next) are returned by the next calls of that
/// operation, in order.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, StoredObject>,
    stats: AtomicUsize,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    failures: Mutex<HashMap<StoreOp, VecDeque<RemoteStatus>>>,
}

impl InMemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object directly.
    pub fn insert(&self, key: impl Into<String>, data: Vec<u8>, metadata: HashMap<String, String>) {
        self.objects
            .insert(key.into(), StoredObject { data, metadata });
    }

    /// Returns true if `key` exists.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// Returns the stored bytes for `key`.
    #[must_use]
    pub fn data(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|o| o.data.clone())
    }

    /// Returns the stored metadata for `key`.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<HashMap<String, String>> {
        self.objects.get(key).map(|o| o.metadata.clone())
    }

    /// Flips the bytes of `key` while keeping its metadata.
    pub fn corrupt(&self, key: &str) {
        if let Some(mut object) = self.objects.get_mut(key) {
            object.data.iter_mut().for_each(|b| *b = !*b);
            object.data.push(0);
        }
    }

    /// Makes the next call of `op` fail with `status`.
    pub fn fail_next(&self, op: StoreOp, status: RemoteStatus) {
        self.failures.lock().entry(op).or_default().push_back(status);
    }

    /// Number of calls made for `op`.
    #[must_use]
    pub fn count(&self, op: StoreOp) -> usize {
        self.counter(op).load(Ordering::SeqCst)
    }

    /// Zeroes every call counter.
    pub fn reset_counts(&self) {
        for op in [StoreOp::Stat, StoreOp::Upload, StoreOp::Download] {
            self.counter(op).store(0, Ordering::SeqCst);
        }
    }

    fn counter(&self, op: StoreOp) -> &AtomicUsize {
        match op {
            StoreOp::Stat => &self.stats,
            StoreOp::Upload => &self.uploads,
            StoreOp::Download => &self.downloads,
        }
    }

    fn record(&self, op: StoreOp) -> Result<(), EngineError> {
        self.counter(op).fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(status) => Err(status.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn stat(&self, key: &str) -> Result<ObjectInfo, EngineError> {
        self.record(StoreOp::Stat)?;
        self.objects
            .get(key)
            .map(|o| ObjectInfo {
                etag: hex::encode(&o.data[..o.data.len().min(8)]),
                metadata: o.metadata.clone(),
            })
            .ok_or_else(|| EngineError::NotFound {
                key: key.to_string(),
            })
    }

    async fn upload(&self, key: &str, path: &Path, options: UploadOptions) -> Result<(), EngineError> {
        self.record(StoreOp::Upload)?;
        let data = tokio::fs::read(path).await?;
        self.insert(key, data, options.metadata);
        Ok(())
    }

    async fn download(&self, key: &str, path: &Path) -> Result<(), EngineError> {
        self.record(StoreOp::Download)?;
        let data = self.data(key).ok_or_else(|| EngineError::NotFound {
            key: key.to_string(),
        })?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }
}

/// Records every status report it receives.
#[derive(Debug, Default)]
pub struct RecordingStatusReporter {
    reports: Mutex<Vec<StepStatusReport>>,
    failure: Mutex<Option<RemoteStatus>>,
}

impl RecordingStatusReporter {
    /// Creates a reporter that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent send fail with `status` (the report is still recorded).
    pub fn fail_with(&self, status: RemoteStatus) {
        *self.failure.lock() = Some(status);
    }

    /// All reports in arrival order.
    #[must_use]
    pub fn reports(&self) -> Vec<StepStatusReport> {
        self.reports.lock().clone()
    }

    /// Reports for one step in arrival order.
    #[must_use]
    pub fn reports_for(&self, step_id: &str) -> Vec<StepStatusReport> {
        self.reports
            .lock()
            .iter()
            .filter(|r| r.step_id == step_id)
            .cloned()
            .collect()
    }

    /// Statuses reported for one step in arrival order.
    #[must_use]
    pub fn statuses_for(&self, step_id: &str) -> Vec<StepStatus> {
        self.reports_for(step_id).into_iter().map(|r| r.status).collect()
    }

    /// Latest status reported for a step.
    #[must_use]
    pub fn last_status(&self, step_id: &str) -> Option<StepStatus> {
        self.statuses_for(step_id).last().copied()
    }
}

#[async_trait]
impl StatusReporter for RecordingStatusReporter {
    async fn send_step_status(&self, report: &StepStatusReport) -> Result<(), EngineError> {
        self.reports.lock().push(report.clone());
        match self.failure.lock().clone() {
            Some(status) => Err(status.into()),
            None => Ok(()),
        }
    }
}

/// Resolves expressions from a fixed table.
///
/// Unknown expressions are left out of the result, as a real evaluator does
/// for expressions it cannot resolve.
#[derive(Debug, Default)]
pub struct StaticEvaluator {
    values: HashMap<String, String>,
    failure: Option<RemoteStatus>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl StaticEvaluator {
    /// Creates an evaluator that resolves nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resolvable expression.
    #[must_use]
    pub fn with_value(mut self, expression: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(expression.into(), value.into());
        self
    }

    /// Makes every evaluation fail with `status`.
    #[must_use]
    pub fn failing(mut self, status: RemoteStatus) -> Self {
        self.failure = Some(status);
        self
    }

    /// Expression batches received, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ExpressionEvaluator for StaticEvaluator {
    async fn evaluate(
        &self,
        _step_id: &str,
        expressions: &[String],
        _stage_output: &StageOutput,
    ) -> Result<HashMap<String, String>, EngineError> {
        self.calls.lock().push(expressions.to_vec());
        if let Some(status) = &self.failure {
            return Err(status.clone().into());
        }
        Ok(expressions
            .iter()
            .filter_map(|e| self.values.get(e).map(|v| (e.clone(), v.clone())))
            .collect())
    }
}

/// What the scripted addon does for one step.
#[derive(Debug, Clone, Default)]
pub struct AddonScript {
    /// Output returned on success.
    pub output: StepOutput,
    /// Retries reported back.
    pub retries: i32,
    /// Failure returned instead of the output.
    pub error: Option<RemoteStatus>,
    /// Time to spend before answering.
    pub delay: Duration,
}

/// An addon whose behaviour is scripted per step id.
///
/// Unscripted steps succeed immediately with no output.
#[derive(Debug, Default)]
pub struct ScriptedAddon {
    scripts: HashMap<String, AddonScript>,
    executed: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
    stopped_ports: Mutex<Vec<u16>>,
    stop_failures: Mutex<HashMap<u16, RemoteStatus>>,
}

impl ScriptedAddon {
    /// Creates an addon where every step succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a successful step.
    #[must_use]
    pub fn succeed(mut self, step_id: impl Into<String>, output: StepOutput) -> Self {
        self.scripts.entry(step_id.into()).or_default().output = output;
        self
    }

    /// Scripts a failing step.
    #[must_use]
    pub fn fail(mut self, step_id: impl Into<String>, status: RemoteStatus) -> Self {
        self.scripts.entry(step_id.into()).or_default().error = Some(status);
        self
    }

    /// Scripts the retry count reported for a step.
    #[must_use]
    pub fn with_retries(mut self, step_id: impl Into<String>, retries: i32) -> Self {
        self.scripts.entry(step_id.into()).or_default().retries = retries;
        self
    }

    /// Delays the answer for a step.
    #[must_use]
    pub fn delay(mut self, step_id: impl Into<String>, delay: Duration) -> Self {
        self.scripts.entry(step_id.into()).or_default().delay = delay;
        self
    }

    /// Makes stopping the addon on `port` fail.
    pub fn fail_stop(&self, port: u16, status: RemoteStatus) {
        self.stop_failures.lock().insert(port, status);
    }

    /// Step ids whose execution started, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Step ids whose execution finished (successfully or not), in order.
    #[must_use]
    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().clone()
    }

    /// Ports that received a stop signal, in order.
    #[must_use]
    pub fn stopped_ports(&self) -> Vec<u16> {
        self.stopped_ports.lock().clone()
    }

    async fn run(&self, step: &UnitStep) -> Result<AddonResult, EngineError> {
        self.executed.lock().push(step.id.clone());
        let script = self.scripts.get(&step.id).cloned().unwrap_or_default();
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        self.completed.lock().push(step.id.clone());
        match script.error {
            Some(status) => Err(status.into()),
            None => Ok(AddonResult {
                output: script.output,
                retries: script.retries,
            }),
        }
    }

    fn stop(&self, port: u16) -> Result<(), EngineError> {
        self.stopped_ports.lock().push(port);
        match self.stop_failures.lock().get(&port) {
            Some(status) => Err(status.clone().into()),
            None => Ok(()),
        }
    }
}

/// Connects every port to one shared [`ScriptedAddon`].
#[derive(Debug, Clone)]
pub struct ScriptedConnector {
    addon: Arc<ScriptedAddon>,
}

impl ScriptedConnector {
    /// Creates a connector for `addon`.
    #[must_use]
    pub fn new(addon: Arc<ScriptedAddon>) -> Self {
        Self { addon }
    }
}

impl AddonConnector for ScriptedConnector {
    fn connect(&self, port: u16) -> Result<Arc<dyn AddonClient>, EngineError> {
        Ok(Arc::new(PortClient {
            port,
            addon: Arc::clone(&self.addon),
        }))
    }
}

#[derive(Debug)]
struct PortClient {
    port: u16,
    addon: Arc<ScriptedAddon>,
}

#[async_trait]
impl AddonClient for PortClient {
    async fn execute_step(&self, step: &UnitStep, _work_dir: &Path) -> Result<AddonResult, EngineError> {
        self.addon.run(step).await
    }

    async fn signal_stop(&self) -> Result<(), EngineError> {
        self.addon.stop(self.port)
    }
}

/// Records publish requests and returns a fixed descriptor.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, PublishArtifactsStep)>>,
    artifact: Option<serde_json::Value>,
}

impl RecordingPublisher {
    /// Creates a publisher returning no descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the descriptor returned by every publish.
    #[must_use]
    pub fn with_artifact(mut self, artifact: serde_json::Value) -> Self {
        self.artifact = Some(artifact);
        self
    }

    /// Publish requests received, with expressions already resolved.
    #[must_use]
    pub fn published(&self) -> Vec<(String, PublishArtifactsStep)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl ArtifactPublisher for RecordingPublisher {
    async fn publish(
        &self,
        step_id: &str,
        artifacts: &PublishArtifactsStep,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        self.published
            .lock()
            .push((step_id.to_string(), artifacts.clone()));
        Ok(self.artifact.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunStep, StepPayload};

    #[tokio::test]
    async fn test_in_memory_store_counts_and_fails() {
        let store = InMemoryObjectStore::new();
        store.fail_next(StoreOp::Stat, RemoteStatus::unavailable("down"));

        assert!(store.stat("k").await.is_err());
        assert!(matches!(store.stat("k").await, Err(EngineError::NotFound { .. })));
        assert_eq!(store.count(StoreOp::Stat), 2);

        store.insert("k", b"abc".to_vec(), HashMap::new());
        assert!(store.stat("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_static_evaluator_omits_unknown() {
        let evaluator = StaticEvaluator::new().with_value("${a}", "1");
        let resolved = evaluator
            .evaluate("s", &["${a}".to_string(), "${b}".to_string()], &StageOutput::new())
            .await
            .unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["${a}"], "1");
        assert_eq!(evaluator.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_addon_per_port_stop() {
        let addon = Arc::new(
            ScriptedAddon::new().succeed("a", StepOutput::with_var("VERSION", "1")),
        );
        addon.fail_stop(9001, RemoteStatus::unavailable("gone"));
        let connector = ScriptedConnector::new(addon.clone());

        let client = connector.connect(9000).unwrap();
        let step = UnitStep::new("a", StepPayload::Run(RunStep::default()));
        let result = client.execute_step(&step, Path::new("/")).await.unwrap();
        assert_eq!(result.output.get("VERSION"), Some("1"));

        client.signal_stop().await.unwrap();
        assert!(connector.connect(9001).unwrap().signal_stop().await.is_err());
        assert_eq!(addon.stopped_ports(), vec![9000, 9001]);
    }
}
