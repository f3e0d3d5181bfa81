//! Step status and run state enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The terminal status of a step, as reported to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Step completed successfully.
    Success,
    /// Step failed.
    Failure,
    /// Step was skipped by its skip condition.
    Skipped,
    /// Step was aborted because a sibling in its parallel group failed.
    Aborted,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

impl StepStatus {
    /// Returns true if the status indicates the stage may continue.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

/// The process-wide run state toggled by pause/resume requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Steps may be dispatched.
    #[default]
    Running,
    /// Dispatch of the next step is held until the state returns to running.
    Paused,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
        }
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            other => Err(format!("invalid run state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_display() {
        assert_eq!(StepStatus::Success.to_string(), "SUCCESS");
        assert_eq!(StepStatus::Failure.to_string(), "FAILURE");
        assert_eq!(StepStatus::Skipped.to_string(), "SKIPPED");
        assert_eq!(StepStatus::Aborted.to_string(), "ABORTED");
    }

    #[test]
    fn test_step_status_serialize() {
        let json = serde_json::to_string(&StepStatus::Aborted).unwrap();
        assert_eq!(json, r#""ABORTED""#);

        let deserialized: StepStatus = serde_json::from_str(r#""SKIPPED""#).unwrap();
        assert_eq!(deserialized, StepStatus::Skipped);
    }

    #[test]
    fn test_run_state_default_is_running() {
        assert_eq!(RunState::default(), RunState::Running);
    }

    #[test]
    fn test_run_state_parse() {
        assert_eq!("paused".parse::<RunState>(), Ok(RunState::Paused));
        assert_eq!("Running".parse::<RunState>(), Ok(RunState::Running));
        assert!("stopped".parse::<RunState>().is_err());
    }
}
