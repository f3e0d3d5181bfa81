//! Core domain model types for ciflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Decoded pipeline steps (unit and parallel) and their payloads
//! - Per-step and per-stage output maps
//! - Step status values reported to the controller

mod output;
mod status;
mod step;

pub use output::{StageOutput, StepOutput};
pub use status::{RunState, StepStatus};
pub use step::{
    FileArtifact, ImageArtifact, ParallelStep, PluginStep, PublishArtifactsStep,
    RestoreCacheStep, RunStep, RunTestsStep, SaveCacheStep, Step, StepPayload, UnitStep,
};
