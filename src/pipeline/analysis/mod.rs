//! Remote analysis client.
//!
//! One image fans out into four remote calls (segmentation map, segmentation
//! uncertainty map, classification, attention heatmap), each under its own
//! retry budget and a shared cancellation token, then fans back in:
//! ```text
//! encode → ┬ segmentation ─────────────┬→ join → parse → confidence gate → extract
//!          ├ segmentation uncertainty ─┤
//!          ├ classification ───────────┤
//!          └ heatmap ──────────────────┘
//! ```
//! Remote failures are classified exactly once, at the backend boundary, into
//! [`AnalysisError`]. Nothing downstream inspects error strings.

pub mod types;
pub mod prompt;
pub mod confidence;
pub mod backend;
pub mod client;

pub use types::*;
pub use confidence::{apply_confidence_gate, parse_confidence, CONFIDENCE_THRESHOLD};
pub use backend::{CallKind, GeminiBackend, GenerateRequest, GenerateResponse, GenerativeBackend, MockBackend};
pub use client::{AnalysisClient, ImageAnalyzer};

use thiserror::Error;

use crate::pipeline::retry::Retryable;

/// Markers that identify a quota or rate-limit rejection.
const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "rate limit",
    "rate-limit",
    "resource_exhausted",
    "resource exhausted",
    "too many requests",
];

/// Markers that identify a transient server-side outage.
const UNAVAILABLE_MARKERS: &[&str] = &[
    "server error",
    "unavailable",
    "overloaded",
    "internal error",
    "deadline exceeded",
];

const AUTH_MARKERS: &[&str] = &[
    "api key not valid",
    "api_key_invalid",
    "invalid api key",
    "unauthenticated",
    "permission denied",
    "permission_denied",
];

const SAFETY_MARKERS: &[&str] = &["safety", "blocked", "prohibited_content", "recitation"];

/// Which generated image an extraction failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Segmentation,
    SegmentationUncertainty,
    Heatmap,
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Segmentation => write!(f, "segmentation map"),
            Self::SegmentationUncertainty => write!(f, "segmentation uncertainty map"),
            Self::Heatmap => write!(f, "heatmap"),
        }
    }
}

/// Normalized analysis failure. `Display` is the message shown on the item.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("API key not configured. Set GEMINI_API_KEY in the environment.")]
    MissingCredential,

    #[error("Invalid API key. Please check your credentials. ({0})")]
    Auth(String),

    #[error("Quota exceeded or rate limited. Please wait and try again. ({0})")]
    Quota(String),

    #[error("The image was blocked by content safety filters. ({0})")]
    Safety(String),

    #[error("The analysis service is temporarily unavailable. ({0})")]
    Unavailable(String),

    #[error("Analysis cancelled by user")]
    Cancelled,

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),

    #[error("Failed to extract {0} from model response")]
    MissingArtifact(Artifact),

    #[error("{0}")]
    Other(String),
}

impl AnalysisError {
    /// Classify a remote failure from its HTTP status (when known) and message.
    ///
    /// Status codes win over message keywords. Keyword order: quota,
    /// unavailable, auth, safety.
    pub fn from_remote(status: Option<u16>, message: &str) -> Self {
        let detail = message.trim().to_string();
        let lower = detail.to_lowercase();
        let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

        match status {
            Some(429) => return Self::Quota(detail),
            Some(401) | Some(403) => return Self::Auth(detail),
            Some(500..=599) => return Self::Unavailable(detail),
            _ => {}
        }

        if has(QUOTA_MARKERS) {
            Self::Quota(detail)
        } else if has(UNAVAILABLE_MARKERS) {
            Self::Unavailable(detail)
        } else if has(AUTH_MARKERS) {
            Self::Auth(detail)
        } else if has(SAFETY_MARKERS) {
            Self::Safety(detail)
        } else {
            Self::Other(detail)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl Retryable for AnalysisError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Quota(_) | Self::Unavailable(_))
    }

    fn is_cancellation(&self) -> bool {
        self.is_cancelled()
    }
}
