use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ModelAssertion, RemodelKind};
use crate::snap::{SnapRegistry, SnapSetup};

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("cannot find snap {0:?} for the new model")]
    MissingSnap(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RemodelContext {
    pub old_model: ModelAssertion,
    pub new_model: ModelAssertion,
    pub kind: RemodelKind,
    pub installed: SnapRegistry,
    pub store_session: String,
}

/// Computes which snaps must be fetched and installed to converge on a
/// new model.
#[async_trait]
pub trait RemodelPlannerPort: Send + Sync {
    async fn plan(&self, ctx: &RemodelContext) -> Result<Vec<SnapSetup>, PlannerError>;
}
