//! Step and stage output maps.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Output variables produced by a single unit step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepOutput {
    output: HashMap<String, String>,
}

impl StepOutput {
    /// Creates an empty step output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a step output holding a single variable.
    #[must_use]
    pub fn with_var(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut out = Self::new();
        out.insert(name, value);
        out
    }

    /// Sets a variable.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.output.insert(name.into(), value.into());
    }

    /// Gets a variable by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.output.get(name).map(String::as_str)
    }

    /// Returns the number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.output.len()
    }

    /// Returns true if no variables were produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }

    /// Returns the underlying variable map.
    #[must_use]
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.output
    }
}

impl From<HashMap<String, String>> for StepOutput {
    fn from(output: HashMap<String, String>) -> Self {
        Self { output }
    }
}

impl FromIterator<(String, String)> for StepOutput {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            output: iter.into_iter().collect(),
        }
    }
}

/// Outputs of every completed unit step in a stage, keyed by step id.
///
/// Entries are only ever added while a stage runs. Later steps read it to
/// resolve expressions that reference earlier outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageOutput {
    steps: HashMap<String, StepOutput>,
}

impl StageOutput {
    /// Creates an empty stage output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the output of a completed step.
    pub fn insert(&mut self, step_id: impl Into<String>, output: StepOutput) {
        self.steps.insert(step_id.into(), output);
    }

    /// Merges every entry of a parallel group's result.
    pub fn extend(&mut self, outputs: HashMap<String, StepOutput>) {
        self.steps.extend(outputs);
    }

    /// Gets a step's output.
    #[must_use]
    pub fn get(&self, step_id: &str) -> Option<&StepOutput> {
        self.steps.get(step_id)
    }

    /// Returns true if output was recorded for the step.
    #[must_use]
    pub fn contains(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }

    /// Returns the number of recorded steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Iterates over recorded outputs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &StepOutput)> {
        self.steps.iter()
    }
}
