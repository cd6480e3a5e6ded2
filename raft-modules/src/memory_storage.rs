use std::sync::{Arc, Mutex};

use raft_core::{CancellationSignal, PersistentState, RaftError, ReplicatedState, Storage};

/// Basic in-memory implementation of the Storage trait. Durability reaches
/// exactly as far as the process lifetime, which is what tests need.
#[derive(Clone)]
pub struct MemoryStorage<S: ReplicatedState> {
    stored: Arc<Mutex<Option<PersistentState<S>>>>,
}

impl<S: ReplicatedState> MemoryStorage<S> {
    pub fn new() -> MemoryStorage<S> {
        MemoryStorage {
            stored: Arc::new(Mutex::new(None)),
        }
    }

    /// The last state written, as a restarted member would read it back.
    pub fn stored_state(&self) -> Option<PersistentState<S>> {
        self.stored
            .lock()
            .expect("storage lock is not poisoned")
            .clone()
    }
}

impl<S: ReplicatedState> Default for MemoryStorage<S> {
    fn default() -> MemoryStorage<S> {
        MemoryStorage::new()
    }
}

impl<S: ReplicatedState> Storage<S> for MemoryStorage<S> {
    fn write_persistent_state(
        &self,
        persistent_state: &PersistentState<S>,
        cancellation: &CancellationSignal,
    ) -> Result<(), RaftError> {
        if cancellation.is_cancelled() {
            return Err(RaftError::Cancelled);
        }

        let mut stored = self.stored.lock().expect("storage lock is not poisoned");
        *stored = Some(persistent_state.clone());
        trace!(
            "Stored persistent state for term {}",
            persistent_state.current_term()
        );

        Ok(())
    }
}
