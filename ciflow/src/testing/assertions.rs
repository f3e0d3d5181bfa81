//! Assertions over recorded reports and addon calls.

use super::mocks::{RecordingStatusReporter, ScriptedAddon};
use crate::core::StepStatus;

/// Asserts the exact sequence of statuses reported for a step.
pub fn assert_statuses(reporter: &RecordingStatusReporter, step_id: &str, expected: &[StepStatus]) {
    let actual = reporter.statuses_for(step_id);
    assert_eq!(
        actual, expected,
        "Expected statuses {expected:?} for step '{step_id}', got {actual:?}"
    );
}

/// Asserts the latest status reported for a step.
pub fn assert_last_status(reporter: &RecordingStatusReporter, step_id: &str, expected: StepStatus) {
    let actual = reporter.last_status(step_id);
    assert_eq!(
        actual,
        Some(expected),
        "Expected last status {expected:?} for step '{step_id}', got {actual:?}"
    );
}

/// Asserts that nothing was reported for a step.
pub fn assert_not_reported(reporter: &RecordingStatusReporter, step_id: &str) {
    let reports = reporter.reports_for(step_id);
    assert!(
        reports.is_empty(),
        "Expected no reports for step '{step_id}', got {reports:?}"
    );
}

/// Asserts that a step never reached the addon.
pub fn assert_not_executed(addon: &ScriptedAddon, step_id: &str) {
    let executed = addon.executed();
    assert!(
        !executed.iter().any(|id| id == step_id),
        "Expected step '{step_id}' not to run, executed: {executed:?}"
    );
}

/// Asserts that every port received exactly one stop signal, in any order.
pub fn assert_stopped_once(addon: &ScriptedAddon, ports: &[u16]) {
    let mut actual = addon.stopped_ports();
    actual.sort_unstable();
    let mut expected = ports.to_vec();
    expected.sort_unstable();
    assert_eq!(
        actual, expected,
        "Expected one stop per port {expected:?}, got {actual:?}"
    );
}
