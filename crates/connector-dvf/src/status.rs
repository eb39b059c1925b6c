use connector_core::{ConnectorError, SyncState};
use parking_lot::RwLock;

/// Current [`SyncState`] of a subscription plus the error that ended it, if any.
///
/// Shared by the feed task (which moves through `Connecting` and `Syncing`),
/// the book task (`Synced`, `Resyncing`) and the owning handle (`Closed`).
/// Once a terminal state is reached it never changes again.
#[derive(Debug)]
pub struct SyncStatus {
    state: RwLock<SyncState>,
    failure: RwLock<Option<ConnectorError>>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatus {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SyncState::Connecting),
            failure: RwLock::new(None),
        }
    }

    pub fn get(&self) -> SyncState {
        *self.state.read()
    }

    pub fn failure(&self) -> Option<ConnectorError> {
        self.failure.read().clone()
    }

    /// Moves to `next`. Refused (returns false) once the state is terminal.
    pub fn transition(&self, next: SyncState) -> bool {
        let mut state = self.state.write();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    /// Moves to `next` only while the state is still `expected`.
    pub fn transition_from(&self, expected: SyncState, next: SyncState) -> bool {
        let mut state = self.state.write();
        if *state != expected || state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    /// Records `error` and moves to `Failed`, unless already terminal.
    pub fn fail(&self, error: ConnectorError) -> bool {
        let mut state = self.state.write();
        if state.is_terminal() {
            return false;
        }
        *state = SyncState::Failed;
        *self.failure.write() = Some(error);
        true
    }
}
