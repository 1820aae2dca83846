//! Batch Orchestration
//!
//! Owns the collection of uploaded scans and drives them through analysis
//! one at a time.
//!
//! ```text
//! add_item → ItemStore ← BatchOrchestrator → ImageAnalyzer → MappingVerifier → ItemStore
//! ```
//!
//! - One active run at a time; a new run cancels the one it replaces.
//! - Per-item failures are recorded on the item, never on the batch.
//! - Refinement runs outside the batch and replaces only result and heatmap.

pub mod error;
pub mod types;
pub mod store;
pub mod verifier;
pub mod runner;

pub use error::OrchestratorError;
pub use types::*;
pub use store::ItemStore;
pub use verifier::{MappingVerifier, MismatchReason};
pub use runner::BatchOrchestrator;
