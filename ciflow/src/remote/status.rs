//! Step status delivery to the controller.

use crate::core::{StepOutput, StepStatus};
use crate::errors::EngineError;
use crate::retry::{retry_notify, RetryConfig, RetryError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// A terminal status report for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatusReport {
    /// Step the report is for.
    pub step_id: String,
    /// Delegate service endpoint.
    pub endpoint: String,
    /// Account the stage runs under.
    pub account_id: String,
    /// Callback token of the step.
    pub callback_token: String,
    /// Controller task id of the step.
    pub task_id: String,
    /// Retries spent executing the step.
    pub num_retries: i32,
    /// Wall time spent on the step, in milliseconds.
    pub elapsed_ms: u64,
    /// Terminal status.
    pub status: StepStatus,
    /// Error message for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Output variables for successful steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
    /// Published artifact descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<serde_json::Value>,
}

impl StepStatusReport {
    /// Creates a report with no error, output or artifact.
    #[must_use]
    pub fn new(step_id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            endpoint: String::new(),
            account_id: String::new(),
            callback_token: String::new(),
            task_id: String::new(),
            num_retries: 0,
            elapsed_ms: 0,
            status,
            error: None,
            output: None,
            artifact: None,
        }
    }

    /// Sets the destination of the report.
    #[must_use]
    pub fn with_route(
        mut self,
        endpoint: impl Into<String>,
        account_id: impl Into<String>,
        callback_token: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        self.endpoint = endpoint.into();
        self.account_id = account_id.into();
        self.callback_token = callback_token.into();
        self.task_id = task_id.into();
        self
    }

    /// Sets the elapsed time.
    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_retries(mut self, retries: i32) -> Self {
        self.num_retries = retries;
        self
    }

    /// Sets the error message.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Sets the step output.
    #[must_use]
    pub fn with_output(mut self, output: StepOutput) -> Self {
        self.output = Some(output);
        self
    }

    /// Sets the artifact descriptor.
    #[must_use]
    pub fn with_artifact(mut self, artifact: Option<serde_json::Value>) -> Self {
        self.artifact = artifact;
        self
    }
}

/// Delivers step status reports.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Sends `report`.
    async fn send_step_status(&self, report: &StepStatusReport) -> Result<(), EngineError>;
}

/// Wraps a reporter with exponential-backoff retries.
///
/// Configuration errors (such as an unset endpoint) and permanent remote
/// codes are not retried.
pub struct RetryingStatusReporter {
    inner: Arc<dyn StatusReporter>,
    retry: RetryConfig,
}

impl RetryingStatusReporter {
    /// Creates a retrying reporter.
    #[must_use]
    pub fn new(inner: Arc<dyn StatusReporter>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }
}

impl std::fmt::Debug for RetryingStatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingStatusReporter")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StatusReporter for RetryingStatusReporter {
    async fn send_step_status(&self, report: &StepStatusReport) -> Result<(), EngineError> {
        if report.endpoint.is_empty() {
            error!(step_id = %report.step_id, "Delegate endpoint is not configured");
            return Err(EngineError::Config(
                "delegate endpoint is not set".to_string(),
            ));
        }

        let mut backoff = self.retry.backoff();
        let inner = &self.inner;
        let result = retry_notify(&mut backoff, || async move {
            inner
                .send_step_status(report)
                .await
                .map_err(RetryError::classify)
        })
        .await;

        match &result {
            Ok(()) => debug!(step_id = %report.step_id, status = %report.status, "Sent step status"),
            Err(e) => error!(
                step_id = %report.step_id,
                status = %report.status,
                error = %e,
                "Failed to send step status"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{RemoteCode, RemoteStatus};
    use crate::retry::JitterStrategy;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyReporter {
        failures: Mutex<Vec<EngineError>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StatusReporter for FlakyReporter {
        async fn send_step_status(&self, _report: &StepStatusReport) -> Result<(), EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failures.lock().pop() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    fn report() -> StepStatusReport {
        StepStatusReport::new("s1", StepStatus::Success).with_route("http://d", "acct", "tok", "task")
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let inner = Arc::new(FlakyReporter {
            failures: Mutex::new(vec![
                RemoteStatus::unavailable("down").into(),
                RemoteStatus::internal("oops").into(),
            ]),
            calls: AtomicUsize::new(0),
        });
        let reporter = RetryingStatusReporter::new(inner.clone(), fast_retry());

        reporter.send_step_status(&report()).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let inner = Arc::new(FlakyReporter {
            failures: Mutex::new(vec![
                RemoteStatus::new(RemoteCode::Unauthenticated, "bad token").into(),
            ]),
            calls: AtomicUsize::new(0),
        });
        let reporter = RetryingStatusReporter::new(inner.clone(), fast_retry());

        let err = reporter.send_step_status(&report()).await.unwrap_err();
        assert_eq!(err.status_message(), "bad token");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_endpoint_fails_without_calling() {
        let inner = Arc::new(FlakyReporter {
            failures: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        let reporter = RetryingStatusReporter::new(inner.clone(), fast_retry());

        let err = reporter
            .send_step_status(&StepStatusReport::new("s1", StepStatus::Failure))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_report_serializes_status() {
        let json = serde_json::to_value(
            report()
                .with_elapsed(Duration::from_millis(1500))
                .with_output(StepOutput::with_var("key", "k")),
        )
        .unwrap();

        assert_eq!(json["status"], "SUCCESS");
        assert_eq!(json["elapsed_ms"], 1500);
        assert_eq!(json["output"]["key"], "k");
        assert!(json.get("error").is_none());
    }
}
