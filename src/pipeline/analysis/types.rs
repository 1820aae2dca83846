//! Core types for one image round-trip.
//!
//! Request → four remote calls → [`AnalysisOutcome`] (classification + generated images).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════
// Diagnosis
// ═══════════════════════════════════════════

/// Closed set of diagnoses the classifier may return.
///
/// `RequiresFurtherReview` is the low-confidence sentinel. It is never offered
/// to the model; only the confidence gate produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Diagnosis {
    #[serde(rename = "Normal")]
    Normal,
    #[serde(rename = "Drusen (Dry AMD)")]
    Drusen,
    #[serde(rename = "Geographic Atrophy (Dry AMD)")]
    GeographicAtrophy,
    #[serde(rename = "Wet AMD (CNV)")]
    WetAmd,
    #[serde(rename = "Requires Further Review")]
    RequiresFurtherReview,
}

impl Diagnosis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Drusen => "Drusen (Dry AMD)",
            Self::GeographicAtrophy => "Geographic Atrophy (Dry AMD)",
            Self::WetAmd => "Wet AMD (CNV)",
            Self::RequiresFurtherReview => "Requires Further Review",
        }
    }

    /// Diagnoses the classifier is allowed to choose from.
    pub fn model_choices() -> &'static [Diagnosis] {
        &[Self::Normal, Self::Drusen, Self::GeographicAtrophy, Self::WetAmd]
    }
}

impl std::fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════
// Classification result
// ═══════════════════════════════════════════

/// Structured classification returned by the model, after post-processing.
///
/// Wire names are camelCase. `processedId` is requested as required but is
/// tolerated when missing; mapping verification treats its absence leniently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub diagnosis: Diagnosis,
    /// Percentage as text, e.g. "85%".
    pub confidence: String,
    pub explanation: String,
    pub explainability: String,
    pub uncertainty_statement: String,
    pub segmentation_uncertainty_statement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_report: Option<String>,
    /// Echo of the correlation id embedded in the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_hash: Option<String>,
    /// Stamped client-side when the request carried a correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_timestamp: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════
// Images
// ═══════════════════════════════════════════

/// An uploaded image as submitted for analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImageSource {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

/// Image payload returned inline by the model (base64 data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

// ═══════════════════════════════════════════
// Request / outcome
// ═══════════════════════════════════════════

/// One analysis request. `refinement` switches to refinement mode, which skips
/// both segmentation calls and focuses the heatmap on the given text.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub image: Arc<ImageSource>,
    pub refinement: Option<String>,
    pub correlation_id: Option<String>,
}

impl AnalysisRequest {
    pub fn new(image: Arc<ImageSource>) -> Self {
        Self {
            image,
            refinement: None,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_refinement(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.refinement = if text.trim().is_empty() { None } else { Some(text) };
        self
    }

    pub fn is_refinement(&self) -> bool {
        self.refinement.is_some()
    }
}

/// Everything one round-trip produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub result: AnalysisResult,
    pub heatmap: InlineImage,
    /// Absent in refinement mode.
    pub segmentation: Option<InlineImage>,
    /// Absent in refinement mode.
    pub segmentation_uncertainty: Option<InlineImage>,
}
