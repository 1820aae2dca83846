//! Core types for the per-item processing queue.
//!
//! These types model the item lifecycle:
//! Pending → Loading → {Success, Error}, and Success/Error → Loading again on
//! retry or refinement. Transitions are pure functions (old item → new item);
//! the id is fixed at creation and never changes.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::pipeline::analysis::{AnalysisOutcome, AnalysisResult, ImageSource, InlineImage};
use crate::pipeline::fingerprint::content_fingerprint;

pub type ItemId = Uuid;

// ═══════════════════════════════════════════
// Status enums
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Loading,
    Success,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the response was shown to belong to the request that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Unverified,
    Verified,
    Mismatch,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Verified => "verified",
            Self::Mismatch => "mismatch",
        }
    }
}

impl std::fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════
// Trackable item
// ═══════════════════════════════════════════

/// Images generated for an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedImages {
    pub segmentation: Option<InlineImage>,
    pub heatmap: Option<InlineImage>,
    pub segmentation_uncertainty: Option<InlineImage>,
}

/// One uploaded image and everything known about its analysis.
///
/// Fields are read-only outside this module so that `Success ⇒ result` and
/// `Error ⇒ error_message` hold for every value that exists.
#[derive(Debug, Clone, Serialize)]
pub struct TrackableItem {
    id: ItemId,
    #[serde(skip)]
    source: Arc<ImageSource>,
    file_name: String,
    content_hash: Option<String>,
    preview: String,
    status: ItemStatus,
    mapping_status: MappingStatus,
    result: Option<AnalysisResult>,
    error_message: Option<String>,
    images: DerivedImages,
}

impl TrackableItem {
    /// New Pending item. The fingerprint is computed here, once.
    pub fn new(source: ImageSource) -> Self {
        let id = Uuid::new_v4();
        let content_hash = Some(content_fingerprint(&source.bytes));
        Self {
            id,
            file_name: source.file_name.clone(),
            source: Arc::new(source),
            content_hash,
            preview: format!("preview://{id}"),
            status: ItemStatus::Pending,
            mapping_status: MappingStatus::Unverified,
            result: None,
            error_message: None,
            images: DerivedImages::default(),
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn source(&self) -> &Arc<ImageSource> {
        &self.source
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    pub fn preview(&self) -> &str {
        &self.preview
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn mapping_status(&self) -> MappingStatus {
        self.mapping_status
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        self.result.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn images(&self) -> &DerivedImages {
        &self.images
    }

    // ── Transitions ───────────────────────────────────

    /// Enqueued into a run (or refinement). Mapping status resets.
    pub fn into_loading(self) -> Self {
        Self {
            status: ItemStatus::Loading,
            mapping_status: MappingStatus::Unverified,
            ..self
        }
    }

    /// Round-trip succeeded. All three derived images are replaced.
    pub fn into_success(self, outcome: AnalysisOutcome, mapping_status: MappingStatus) -> Self {
        Self {
            status: ItemStatus::Success,
            mapping_status,
            result: Some(outcome.result),
            error_message: None,
            images: DerivedImages {
                segmentation: outcome.segmentation,
                heatmap: Some(outcome.heatmap),
                segmentation_uncertainty: outcome.segmentation_uncertainty,
            },
            ..self
        }
    }

    /// Refinement succeeded. Only the result and heatmap change; prior
    /// segmentation images are kept as they were.
    pub fn into_refined(self, outcome: AnalysisOutcome, mapping_status: MappingStatus) -> Self {
        let images = DerivedImages {
            heatmap: Some(outcome.heatmap),
            ..self.images.clone()
        };
        Self {
            status: ItemStatus::Success,
            mapping_status,
            result: Some(outcome.result),
            error_message: None,
            images,
            ..self
        }
    }

    /// Round-trip failed with a normalized message.
    pub fn into_error(self, message: impl Into<String>) -> Self {
        Self {
            status: ItemStatus::Error,
            error_message: Some(message.into()),
            ..self
        }
    }
}

// ═══════════════════════════════════════════
// Batch run
// ═══════════════════════════════════════════

/// One analyze/retry invocation: a candidate list under one cancellation token.
#[derive(Debug)]
pub struct BatchRun {
    pub id: Uuid,
    pub candidates: Vec<ItemId>,
    token: CancellationToken,
}

impl BatchRun {
    pub fn new(candidates: Vec<ItemId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            candidates,
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// What a batch run did. Logged; never shown as a batch-level error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub candidates: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub mismatched: usize,
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn new(run_id: Uuid, candidates: usize) -> Self {
        Self {
            run_id,
            candidates,
            ..Self::default()
        }
    }

    /// Candidates never resolved by this run (still Loading if cancelled).
    pub fn unresolved(&self) -> usize {
        self.candidates
            .saturating_sub(self.succeeded + self.failed)
    }
}
