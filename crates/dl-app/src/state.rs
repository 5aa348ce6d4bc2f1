use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use dl_core::ports::StateStorePort;
use dl_core::{State, Status};

/// Shared handle to the daemon state.
///
/// Handlers lock it briefly and drop the guard before calling any port.
#[derive(Clone)]
pub struct StateHandle {
    state: Arc<Mutex<State>>,
    store: Arc<dyn StateStorePort>,
    /// Serializes writes so snapshots reach the store in the order taken.
    save_lock: Arc<Mutex<()>>,
}

impl StateHandle {
    pub fn new(state: State, store: Arc<dyn StateStorePort>) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            store,
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Loads the persisted state from the store. Tasks that were running
    /// when the previous process stopped are queued to run again.
    pub async fn load(store: Arc<dyn StateStorePort>) -> anyhow::Result<Self> {
        let mut state = store.load().await?;
        let interrupted = state
            .graph()
            .tasks()
            .any(|t| matches!(t.status, Status::Doing | Status::Undoing));
        if interrupted {
            let requeued = state.graph_mut().requeue_interrupted();
            warn!(tasks = ?requeued, "requeued tasks interrupted by a restart");
        }
        Ok(Self::new(state, store))
    }

    pub async fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().await
    }

    /// Writes the state to the store if it changed since the last write.
    /// The state lock is only held while taking the snapshot.
    pub async fn checkpoint(&self) -> anyhow::Result<()> {
        let _saving = self.save_lock.lock().await;
        let snapshot = {
            let mut state = self.state.lock().await;
            if !state.is_modified() {
                return Ok(());
            }
            state.mark_clean();
            state.clone()
        };
        if let Err(err) = self.store.save(&snapshot).await {
            self.state.lock().await.mark_modified();
            return Err(err);
        }
        debug!("state checkpointed");
        Ok(())
    }
}
