//! Interfaces to the engine's external collaborators.
//!
//! This module provides:
//! - Addon clients that execute run, test and plugin steps
//! - The remote expression evaluator and `${...}` helpers
//! - Object storage for the build cache
//! - Step status delivery with retry
//! - Artifact publishing

mod addon;
mod artifact;
mod evaluator;
mod object_store;
mod status;

pub use addon::{AddonClient, AddonConnector, AddonResult};
pub use artifact::ArtifactPublisher;
pub use evaluator::{
    find_expressions, is_jexl, resolve_embedded, resolve_expressions, ExpressionEvaluator,
    ResolveMode,
};
#[cfg(test)]
pub use evaluator::MockExpressionEvaluator;
#[cfg(test)]
pub use object_store::MockObjectStore;
pub use object_store::{ObjectInfo, ObjectStore, UploadOptions};
pub use status::{RetryingStatusReporter, StatusReporter, StepStatusReport};
