//! Errors for orchestrator operations that target a single item.
//!
//! Batch runs themselves never fail as a whole: per-item failures are recorded
//! on the item and the loop moves on.

use thiserror::Error;

use super::types::{ItemId, ItemStatus};
use crate::pipeline::analysis::AnalysisError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Unknown item: {0}")]
    UnknownItem(ItemId),

    #[error("Item {id} cannot be refined while {status}")]
    NotRefinable { id: ItemId, status: ItemStatus },

    #[error("Refinement text is empty")]
    EmptyRefinement,

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}
