//! Decoded pipeline steps.
//!
//! A stage is an ordered list of [`Step`]s. Each entry is either a single
//! [`UnitStep`] or a [`ParallelStep`] grouping unit steps that run
//! concurrently.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One entry of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// A single step.
    Unit(UnitStep),
    /// A group of steps run concurrently.
    Parallel(ParallelStep),
}

impl Step {
    /// Returns the id of the step or group.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Unit(step) => &step.id,
            Self::Parallel(step) => &step.id,
        }
    }
}

/// The smallest independently executable pipeline action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStep {
    /// Unique id within the stage.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub display_name: String,
    /// Token identifying the status callback for this step.
    #[serde(default)]
    pub callback_token: String,
    /// Controller task this step belongs to.
    #[serde(default)]
    pub task_id: String,
    /// Expression that, when it evaluates to true, skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_condition: Option<String>,
    /// Kind-specific payload. A decoded step without one is rejected at dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StepPayload>,
}

impl UnitStep {
    /// Creates a unit step with the given id and payload.
    ///
    /// The display name defaults to the id; callback token and task id are
    /// left empty and must be set before the step can run.
    #[must_use]
    pub fn new(id: impl Into<String>, payload: StepPayload) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            callback_token: String::new(),
            task_id: String::new(),
            skip_condition: None,
            payload: Some(payload),
        }
    }

    /// Sets the callback token and task id used for status reporting.
    #[must_use]
    pub fn with_callback(mut self, callback_token: impl Into<String>, task_id: impl Into<String>) -> Self {
        self.callback_token = callback_token.into();
        self.task_id = task_id.into();
        self
    }

    /// Sets the skip condition.
    #[must_use]
    pub fn with_skip_condition(mut self, condition: impl Into<String>) -> Self {
        self.skip_condition = Some(condition.into());
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Port of the addon serving this step, for kinds executed by an addon.
    #[must_use]
    pub fn container_port(&self) -> Option<u16> {
        match self.payload.as_ref()? {
            StepPayload::Run(run) => run.container_port,
            StepPayload::RunTests(tests) => tests.container_port,
            StepPayload::Plugin(plugin) => plugin.container_port,
            StepPayload::SaveCache(_)
            | StepPayload::RestoreCache(_)
            | StepPayload::PublishArtifacts(_) => None,
        }
    }

    /// Short name of the payload kind, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.payload.as_ref().map_or("none", StepPayload::kind)
    }
}

/// A named group of unit steps executed concurrently as one stage entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelStep {
    /// Group id.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub display_name: String,
    /// Steps in the group.
    #[serde(default)]
    pub steps: Vec<UnitStep>,
}

impl ParallelStep {
    /// Creates a parallel group.
    #[must_use]
    pub fn new(id: impl Into<String>, steps: Vec<UnitStep>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            steps,
        }
    }
}

/// Kind-specific payload of a unit step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPayload {
    /// Run a shell command in an addon.
    Run(RunStep),
    /// Run tests in an addon.
    RunTests(RunTestsStep),
    /// Run a plugin image in an addon.
    Plugin(PluginStep),
    /// Archive paths and upload them under a cache key.
    SaveCache(SaveCacheStep),
    /// Download and unpack a cache archive.
    RestoreCache(RestoreCacheStep),
    /// Publish file and image artifacts.
    PublishArtifacts(PublishArtifactsStep),
}

impl StepPayload {
    /// Short name of the payload kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::RunTests(_) => "run_tests",
            Self::Plugin(_) => "plugin",
            Self::SaveCache(_) => "save_cache",
            Self::RestoreCache(_) => "restore_cache",
            Self::PublishArtifacts(_) => "publish_artifacts",
        }
    }
}

/// Run a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    /// Shell command to run.
    pub command: String,
    /// Entrypoint overriding the image default.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Extra environment.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Variables exported from the step's environment as output.
    #[serde(default)]
    pub output_vars: Vec<String>,
    /// Port of the addon that runs the command.
    #[serde(default)]
    pub container_port: Option<u16>,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Run a test suite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTestsStep {
    /// Arguments passed to the build tool.
    pub args: String,
    /// Language of the project.
    #[serde(default)]
    pub language: String,
    /// Build tool (e.g. maven, bazel).
    #[serde(default)]
    pub build_tool: String,
    /// Only run tests affected by the change.
    #[serde(default)]
    pub run_only_selected_tests: bool,
    /// Variables exported as output.
    #[serde(default)]
    pub output_vars: Vec<String>,
    /// Port of the addon that runs the tests.
    #[serde(default)]
    pub container_port: Option<u16>,
}

/// Run a plugin image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginStep {
    /// Plugin image.
    pub image: String,
    /// Plugin settings passed as environment.
    #[serde(default)]
    pub settings: HashMap<String, String>,
    /// Port of the addon that runs the plugin.
    #[serde(default)]
    pub container_port: Option<u16>,
}

/// Save a build cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveCacheStep {
    /// Cache key template.
    pub key: String,
    /// Paths to archive, relative to the work dir unless absolute.
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Restore a build cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreCacheStep {
    /// Cache key template.
    pub key: String,
    /// Fail the step when no cache exists for the key.
    #[serde(default)]
    pub fail_if_not_exist: bool,
}

/// Publish artifacts produced by earlier steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishArtifactsStep {
    /// Files to upload.
    #[serde(default)]
    pub files: Vec<FileArtifact>,
    /// Images to publish.
    #[serde(default)]
    pub images: Vec<ImageArtifact>,
}

/// A file artifact. Both fields may embed expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileArtifact {
    /// Local path.
    pub source_path: String,
    /// Destination URL.
    pub destination_url: String,
}

/// An image artifact. All fields may embed expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifact {
    /// Image name.
    pub image: String,
    /// Image tag.
    pub tag: String,
    /// Registry URL.
    pub destination_url: String,
}
