//! Artifact publishing.

use crate::core::PublishArtifactsStep;
use crate::errors::EngineError;
use async_trait::async_trait;

/// Publishes file and image artifacts.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    /// Publishes every artifact in `artifacts`, whose expressions are already
    /// resolved.
    ///
    /// Returns an optional artifact descriptor attached to the step's
    /// success report.
    async fn publish(
        &self,
        step_id: &str,
        artifacts: &PublishArtifactsStep,
    ) -> Result<Option<serde_json::Value>, EngineError>;
}
