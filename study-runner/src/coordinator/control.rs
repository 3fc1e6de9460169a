use std::sync::{Arc, Mutex, MutexGuard};

use study_types::RunSnapshot;

#[derive(Debug)]
struct ControlState {
    abort_requested: bool,
    bump_requested: bool,
    exited: bool,
    snapshot: RunSnapshot,
}

/// Operator-side handle to a running coordinator.
///
/// Requests are picked up on the coordinator's next tick; the snapshot is
/// republished every tick.
#[derive(Debug, Clone)]
pub struct RunControl {
    inner: Arc<Mutex<ControlState>>,
}

impl RunControl {
    pub(crate) fn new(snapshot: RunSnapshot) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ControlState {
                abort_requested: false,
                bump_requested: false,
                exited: false,
                snapshot,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask the run to stop. Returns false once the run has exited.
    pub fn abort(&self) -> bool {
        let mut state = self.lock();
        if state.exited {
            return false;
        }
        state.abort_requested = true;
        true
    }

    /// Move the run's gate request toward the front while it waits.
    pub fn bump(&self) -> bool {
        let mut state = self.lock();
        if state.exited {
            return false;
        }
        state.bump_requested = true;
        true
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().exited
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.lock().abort_requested
    }

    pub(crate) fn take_bump(&self) -> bool {
        std::mem::take(&mut self.lock().bump_requested)
    }

    pub(crate) fn publish(&self, snapshot: RunSnapshot) {
        self.lock().snapshot = snapshot;
    }

    pub(crate) fn mark_exited(&self) {
        self.lock().exited = true;
    }
}
