use async_trait::async_trait;

use crate::state::State;

/// Durable storage of the daemon state.
#[async_trait]
pub trait StateStorePort: Send + Sync {
    /// Loads the state; a missing store yields an empty state.
    async fn load(&self) -> anyhow::Result<State>;

    async fn save(&self, state: &State) -> anyhow::Result<()>;
}
