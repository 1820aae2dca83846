//! BatchOrchestrator: owns the item collection and drives batch runs.
//!
//! Candidates are processed strictly one at a time: an item's four remote
//! calls and its mapping verification finish before the next item starts.
//! At most one run is active; starting another cancels the previous one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::error::OrchestratorError;
use super::store::ItemStore;
use super::types::*;
use super::verifier::MappingVerifier;
use crate::pipeline::analysis::{AnalysisError, AnalysisRequest, ImageAnalyzer, ImageSource};

/// Handle held in the current-run slot.
struct ActiveRun {
    id: Uuid,
    token: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BatchOrchestrator {
    analyzer: Arc<dyn ImageAnalyzer>,
    verifier: MappingVerifier,
    store: Mutex<ItemStore>,
    current_run: Mutex<Option<ActiveRun>>,
}

impl BatchOrchestrator {
    pub fn new(analyzer: Arc<dyn ImageAnalyzer>) -> Self {
        Self {
            analyzer,
            verifier: MappingVerifier::new(),
            store: Mutex::new(ItemStore::new()),
            current_run: Mutex::new(None),
        }
    }

    fn with_store<R>(&self, f: impl FnOnce(&mut ItemStore) -> R) -> R {
        f(&mut lock(&self.store))
    }

    // ── Collection ────────────────────────────────────

    /// Upload: register a new Pending item.
    pub fn add_item(&self, source: ImageSource) -> ItemId {
        let item = TrackableItem::new(source);
        tracing::info!(item_id = %item.id(), file = item.file_name(), "Item added");
        self.with_store(|s| s.insert(item))
    }

    /// Explicit deletion. Returns false for unknown ids.
    pub fn remove_item(&self, id: ItemId) -> bool {
        self.with_store(|s| s.remove(id)).is_some()
    }

    pub fn get(&self, id: ItemId) -> Option<TrackableItem> {
        self.with_store(|s| s.get(id))
    }

    /// Immutable copy of every item, in upload order.
    pub fn snapshot(&self) -> Vec<TrackableItem> {
        self.with_store(|s| s.snapshot())
    }

    pub fn live_previews(&self) -> usize {
        self.with_store(|s| s.live_previews())
    }

    // ── Run control ───────────────────────────────────

    pub fn is_running(&self) -> bool {
        lock(&self.current_run).is_some()
    }

    /// Signal the active run, if any. Returns whether a run was signalled.
    pub fn cancel_active(&self) -> bool {
        match lock(&self.current_run).as_ref() {
            Some(active) => {
                tracing::info!(run_id = %active.id, "Cancelling active batch run");
                active.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Swap the current-run slot to a new run and signal the one it replaces.
    fn begin_run(&self, candidates: Vec<ItemId>) -> BatchRun {
        let run = BatchRun::new(candidates);
        let previous = lock(&self.current_run).replace(ActiveRun {
            id: run.id,
            token: run.token().clone(),
        });

        if let Some(previous) = previous {
            previous.token.cancel();
            tracing::info!(
                previous_run = %previous.id,
                run_id = %run.id,
                "Superseding active batch run"
            );
        }
        run
    }

    /// Clear the slot, unless a newer run already owns it.
    fn end_run(&self, run_id: Uuid) {
        let mut slot = lock(&self.current_run);
        if slot.as_ref().is_some_and(|active| active.id == run_id) {
            *slot = None;
        }
    }

    // ── Batch entry points ────────────────────────────

    /// Analyze every Pending item.
    pub async fn analyze_pending(&self) -> BatchSummary {
        let candidates = self.with_store(|s| s.ids_with_status(ItemStatus::Pending));
        self.run_batch(candidates).await
    }

    /// Re-run every item currently in Error.
    pub async fn retry_failed(&self) -> BatchSummary {
        let candidates = self.with_store(|s| s.ids_with_status(ItemStatus::Error));
        self.run_batch(candidates).await
    }

    /// Re-run a single item as its own batch run.
    pub async fn retry_item(&self, id: ItemId) -> Result<BatchSummary, OrchestratorError> {
        if !self.with_store(|s| s.contains(id)) {
            return Err(OrchestratorError::UnknownItem(id));
        }
        Ok(self.run_batch(vec![id]).await)
    }

    /// Run `candidates` as one batch under a fresh cancellation token.
    pub async fn run_batch(&self, candidates: Vec<ItemId>) -> BatchSummary {
        let run = self.begin_run(candidates);
        let span = tracing::info_span!(
            "batch_run",
            run_id = %run.id,
            candidates = run.candidates.len()
        );

        let summary = self.process(&run).instrument(span).await;

        self.end_run(run.id);
        summary
    }

    async fn process(&self, run: &BatchRun) -> BatchSummary {
        let mut summary = BatchSummary::new(run.id, run.candidates.len());

        // Optimistic: every candidate shows Loading before any call begins.
        self.with_store(|s| s.update_many(&run.candidates, TrackableItem::into_loading));

        for (index, &id) in run.candidates.iter().enumerate() {
            if run.token().is_cancelled() {
                tracing::info!(
                    remaining = run.candidates.len() - index,
                    "Batch run cancelled, remaining items left loading"
                );
                summary.cancelled = true;
                break;
            }

            let Some(item) = self.get(id) else {
                tracing::debug!(item_id = %id, "Item deleted before processing, skipping");
                continue;
            };

            let request =
                AnalysisRequest::new(item.source().clone()).with_correlation_id(id.to_string());

            match self.analyzer.analyze(request, Some(run.token())).await {
                Ok(outcome) => {
                    let mapping = self.verifier.verify(
                        &item,
                        outcome.result.processed_id.as_deref(),
                        outcome.result.processed_hash.as_deref(),
                    );
                    let stored = self.with_store(|s| s.update(id, |i| i.into_success(outcome, mapping)));
                    if !stored {
                        tracing::debug!(item_id = %id, "Item deleted while in flight, result dropped");
                        continue;
                    }
                    summary.succeeded += 1;
                    if mapping == MappingStatus::Mismatch {
                        summary.mismatched += 1;
                    }
                }
                Err(AnalysisError::Cancelled) => {
                    tracing::info!(item_id = %id, "Batch run cancelled mid-item, result discarded");
                    summary.cancelled = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(item_id = %id, file = item.file_name(), error = %e, "Item analysis failed");
                    let message = e.to_string();
                    if self.with_store(|s| s.update(id, |i| i.into_error(message))) {
                        summary.failed += 1;
                    }
                }
            }
        }

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            mismatched = summary.mismatched,
            unresolved = summary.unresolved(),
            cancelled = summary.cancelled,
            "Batch run finished"
        );
        summary
    }

    // ── Refinement ────────────────────────────────────

    /// Re-run classification and heatmap for a Success item, focused on `focus`.
    ///
    /// Runs outside the batch: it neither uses nor cancels the active run's
    /// token. On success only the result and heatmap are replaced.
    pub async fn refine_item(&self, id: ItemId, focus: &str) -> Result<(), OrchestratorError> {
        let item = self.get(id).ok_or(OrchestratorError::UnknownItem(id))?;
        if item.status() != ItemStatus::Success {
            return Err(OrchestratorError::NotRefinable {
                id,
                status: item.status(),
            });
        }
        if focus.trim().is_empty() {
            return Err(OrchestratorError::EmptyRefinement);
        }

        self.with_store(|s| s.update(id, TrackableItem::into_loading));

        let request = AnalysisRequest::new(item.source().clone())
            .with_correlation_id(id.to_string())
            .with_refinement(focus);
        let span = tracing::info_span!("refine_item", item_id = %id);

        match self.analyzer.analyze(request, None).instrument(span).await {
            Ok(outcome) => {
                let mapping = self.verifier.verify(
                    &item,
                    outcome.result.processed_id.as_deref(),
                    outcome.result.processed_hash.as_deref(),
                );
                self.with_store(|s| s.update(id, |i| i.into_refined(outcome, mapping)));
                tracing::info!(item_id = %id, mapping = mapping.as_str(), "Refinement complete");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(item_id = %id, error = %e, "Refinement failed");
                let message = e.to_string();
                self.with_store(|s| s.update(id, |i| i.into_error(message)));
                Err(e.into())
            }
        }
    }
}
