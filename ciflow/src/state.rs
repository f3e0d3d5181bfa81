//! Shared run/pause state for the engine.

use crate::core::RunState;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Run/pause flag shared by the stage executor and a pause/resume controller.
///
/// Construct one per engine and hand it to every [`StageExecutor`] through an
/// `Arc`. Waiters are woken in a broadcast fashion and always re-check the
/// state, so repeated or coalesced resume signals are harmless.
///
/// [`StageExecutor`]: crate::executor::StageExecutor
#[derive(Debug, Default)]
pub struct ExecutionState {
    state: Mutex<RunState>,
    resumed: Notify,
}

impl ExecutionState {
    /// Creates a new state in [`RunState::Running`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    #[must_use]
    pub fn get_state(&self) -> RunState {
        *self.state.lock()
    }

    /// Sets the state, waking every waiter when it becomes running.
    pub fn set_state(&self, state: RunState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            info!(from = %previous, to = %state, "Execution state changed");
        }
        if state == RunState::Running {
            self.resumed.notify_waiters();
        }
    }

    /// Returns once the state is running.
    ///
    /// Returns immediately if already running; otherwise waits for a resume
    /// signal and re-checks, looping until running is observed.
    pub async fn wait_for_running_state(&self) {
        loop {
            let notified = self.resumed.notified();
            tokio::pin!(notified);
            // Register before reading the state so a resume between the read
            // and the await is not lost.
            notified.as_mut().enable();

            if self.get_state() == RunState::Running {
                return;
            }

            debug!("Execution paused, waiting for resume");
            notified.await;
        }
    }
}
