//! Testing utilities for engine users and the crate's own tests.
//!
//! This module provides:
//! - In-memory doubles for every collaborator
//! - Step builders and a wired [`TestEngine`]
//! - Assertions over recorded status reports

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_last_status, assert_not_executed, assert_not_reported, assert_statuses,
    assert_stopped_once,
};
pub use fixtures::{
    fast_retry, restore_cache_step, run_step, save_cache_step, TestEngine, TEST_ENDPOINT,
};
pub use mocks::{
    AddonScript, InMemoryObjectStore, RecordingPublisher, RecordingStatusReporter, ScriptedAddon,
    ScriptedConnector, StaticEvaluator, StoreOp,
};
