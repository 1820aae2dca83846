//! AnalysisClient: fans one image out into four remote calls and back in.
//!
//! Cancellation is cooperative and checked at fixed points: on entry, before
//! every dispatch (including retries), and after the join barrier. An
//! already-dispatched call is never aborted; its result is discarded instead.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::backend::{CallKind, GenerateRequest, GenerateResponse, GenerativeBackend};
use super::confidence::apply_confidence_gate;
use super::prompt;
use super::types::{AnalysisOutcome, AnalysisRequest, AnalysisResult, ImageSource, InlineImage};
use super::{AnalysisError, Artifact};
use crate::config::AnalysisConfig;
use crate::pipeline::retry::retry_with_backoff;

/// Seam between the batch orchestrator and the remote analysis (allows mocking).
#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        request: AnalysisRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<AnalysisOutcome, AnalysisError>;
}

/// Production analyzer backed by a [`GenerativeBackend`].
pub struct AnalysisClient {
    backend: Arc<dyn GenerativeBackend>,
    config: AnalysisConfig,
}

impl AnalysisClient {
    pub fn new(backend: Arc<dyn GenerativeBackend>, config: AnalysisConfig) -> Self {
        Self { backend, config }
    }

    /// Dispatch one call under the retry policy, rechecking cancellation
    /// before every attempt.
    async fn dispatch(
        &self,
        kind: CallKind,
        prompt: String,
        response_schema: Option<Value>,
        image: &EncodedImage,
        cancel: Option<&CancellationToken>,
    ) -> Result<GenerateResponse, AnalysisError> {
        let model = match kind {
            CallKind::Classification => &self.config.classifier_model,
            _ => &self.config.image_model,
        };
        let backend = &self.backend;

        retry_with_backoff(&self.config.retry, kind.as_str(), || {
            let request = GenerateRequest {
                kind,
                model: model.clone(),
                mime_type: image.mime_type.clone(),
                image_base64: image.data.clone(),
                prompt: prompt.clone(),
                response_schema: response_schema.clone(),
            };
            async move {
                ensure_not_cancelled(cancel)?;
                tracing::debug!(call = kind.as_str(), model = %request.model, "Dispatching remote call");
                backend.generate(request).await
            }
        })
        .await
    }

    /// Image-generation call that resolves to `None` in refinement mode.
    async fn optional_image_call(
        &self,
        kind: CallKind,
        prompt: &str,
        image: &EncodedImage,
        refining: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<GenerateResponse>, AnalysisError> {
        if refining {
            return Ok(None);
        }
        self.dispatch(kind, prompt.to_string(), None, image, cancel)
            .await
            .map(Some)
    }

    async fn run(
        &self,
        request: AnalysisRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        ensure_not_cancelled(cancel)?;
        if !self.config.has_credential() {
            return Err(AnalysisError::MissingCredential);
        }

        let start = Instant::now();
        let image = encode_image(request.image.clone()).await?;
        let refining = request.is_refinement();
        let correlation_id = request.correlation_id.as_deref();

        let (segmentation, uncertainty, classification, heatmap) = tokio::join!(
            self.optional_image_call(
                CallKind::Segmentation,
                prompt::SEGMENTATION_PROMPT,
                &image,
                refining,
                cancel,
            ),
            self.optional_image_call(
                CallKind::SegmentationUncertainty,
                prompt::SEGMENTATION_UNCERTAINTY_PROMPT,
                &image,
                refining,
                cancel,
            ),
            self.dispatch(
                CallKind::Classification,
                prompt::classification_prompt(correlation_id),
                Some(prompt::classification_schema()),
                &image,
                cancel,
            ),
            self.dispatch(
                CallKind::Heatmap,
                prompt::heatmap_prompt(request.refinement.as_deref()),
                None,
                &image,
                cancel,
            ),
        );

        // Results that arrived after cancellation are discarded unread.
        ensure_not_cancelled(cancel)?;

        let classification = classification?;
        let heatmap = heatmap?;
        let segmentation = segmentation?;
        let uncertainty = uncertainty?;

        let mut result = apply_confidence_gate(parse_classification(&classification)?);
        if correlation_id.is_some() {
            result.backend_timestamp = Some(Utc::now());
        }

        let heatmap = extract_image(&heatmap, Artifact::Heatmap)?;
        let segmentation = segmentation
            .map(|r| extract_image(&r, Artifact::Segmentation))
            .transpose()?;
        let segmentation_uncertainty = uncertainty
            .map(|r| extract_image(&r, Artifact::SegmentationUncertainty))
            .transpose()?;

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            diagnosis = result.diagnosis.as_str(),
            confidence = %result.confidence,
            "Image analysis complete"
        );

        Ok(AnalysisOutcome {
            result,
            heatmap,
            segmentation,
            segmentation_uncertainty,
        })
    }
}

#[async_trait]
impl ImageAnalyzer for AnalysisClient {
    async fn analyze(
        &self,
        request: AnalysisRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let span = tracing::info_span!(
            "analyze_image",
            correlation_id = request.correlation_id.as_deref().unwrap_or("-"),
            file = %request.image.file_name,
            refinement = request.is_refinement(),
        );
        self.run(request, cancel).instrument(span).await
    }
}

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

/// Image in transport encoding, shared by all four calls.
struct EncodedImage {
    mime_type: String,
    data: Arc<str>,
}

fn ensure_not_cancelled(cancel: Option<&CancellationToken>) -> Result<(), AnalysisError> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(AnalysisError::Cancelled),
        _ => Ok(()),
    }
}

/// Base64-encode on the blocking pool so large images never stall the runtime.
async fn encode_image(image: Arc<ImageSource>) -> Result<EncodedImage, AnalysisError> {
    let mime_type = image.mime_type.clone();
    let data = tokio::task::spawn_blocking(move || {
        base64::engine::general_purpose::STANDARD.encode(&image.bytes)
    })
    .await
    .map_err(|e| AnalysisError::Other(format!("Image encoding failed: {e}")))?;

    Ok(EncodedImage {
        mime_type,
        data: Arc::from(data),
    })
}

/// Parse the classification response body into a result.
fn parse_classification(response: &GenerateResponse) -> Result<AnalysisResult, AnalysisError> {
    let text = response.text().ok_or_else(|| {
        AnalysisError::MalformedResponse("classification response carried no text".into())
    })?;

    serde_json::from_str(strip_code_fence(&text))
        .map_err(|e| AnalysisError::MalformedResponse(format!("classification JSON: {e}")))
}

/// Strip a surrounding Markdown code fence, if present.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.get(..4) {
        Some(tag) if tag.eq_ignore_ascii_case("json") => &rest[4..],
        _ => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn extract_image(response: &GenerateResponse, artifact: Artifact) -> Result<InlineImage, AnalysisError> {
    response
        .first_inline_image()
        .ok_or(AnalysisError::MissingArtifact(artifact))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use crate::pipeline::analysis::backend::MockBackend;
    use crate::pipeline::analysis::types::Diagnosis;
    use crate::pipeline::retry::RetryPolicy;
    use std::time::Duration;

    fn config() -> AnalysisConfig {
        AnalysisConfig::default()
            .with_credential("test-key")
            .with_retry_policy(RetryPolicy::new(4, Duration::from_millis(10), 2))
    }

    fn image() -> Arc<ImageSource> {
        Arc::new(ImageSource::new("scan.png", "image/png", b"fake-png".to_vec()))
    }

    fn client(mock: Arc<MockBackend>) -> AnalysisClient {
        AnalysisClient::new(mock, config())
    }

    #[tokio::test]
    async fn full_analysis_makes_four_calls() {
        let mock = Arc::new(MockBackend::new());
        let outcome = client(mock.clone())
            .analyze(AnalysisRequest::new(image()).with_correlation_id("item-1"), None)
            .await
            .unwrap();

        assert_eq!(mock.total_calls(), 4);
        assert_eq!(outcome.result.diagnosis, Diagnosis::Normal);
        assert_eq!(outcome.result.processed_id.as_deref(), Some("item-1"));
        assert!(outcome.result.backend_timestamp.is_some());
        assert!(outcome.segmentation.is_some());
        assert!(outcome.segmentation_uncertainty.is_some());
        let heatmap = base64::engine::general_purpose::STANDARD
            .decode(&outcome.heatmap.data)
            .unwrap();
        assert_eq!(heatmap, b"heatmap-1");
    }

    #[tokio::test]
    async fn every_call_carries_the_same_encoded_image() {
        let mock = Arc::new(MockBackend::new());
        client(mock.clone())
            .analyze(AnalysisRequest::new(image()), None)
            .await
            .unwrap();

        let expected = base64::engine::general_purpose::STANDARD.encode(b"fake-png");
        assert!(mock.requests().iter().all(|r| &*r.image_base64 == expected));
    }

    #[tokio::test]
    async fn no_timestamp_without_correlation_id() {
        let mock = Arc::new(MockBackend::new());
        let outcome = client(mock)
            .analyze(AnalysisRequest::new(image()), None)
            .await
            .unwrap();
        assert!(outcome.result.backend_timestamp.is_none());
    }

    #[tokio::test]
    async fn refinement_skips_segmentation_calls() {
        let mock = Arc::new(MockBackend::new());
        let outcome = client(mock.clone())
            .analyze(
                AnalysisRequest::new(image())
                    .with_correlation_id("item-1")
                    .with_refinement("superior arcade"),
                None,
            )
            .await
            .unwrap();

        assert_eq!(mock.call_count(CallKind::Segmentation), 0);
        assert_eq!(mock.call_count(CallKind::SegmentationUncertainty), 0);
        assert_eq!(mock.call_count(CallKind::Classification), 1);
        assert_eq!(mock.call_count(CallKind::Heatmap), 1);
        assert!(outcome.segmentation.is_none());
        assert!(outcome.segmentation_uncertainty.is_none());

        let heatmap_prompt = mock
            .requests()
            .into_iter()
            .find(|r| r.kind == CallKind::Heatmap)
            .unwrap()
            .prompt;
        assert!(heatmap_prompt.contains("superior arcade"));
    }

    #[tokio::test]
    async fn missing_credential_fails_fast() {
        let mock = Arc::new(MockBackend::new());
        let client = AnalysisClient::new(mock.clone(), AnalysisConfig::default());
        let err = client.analyze(AnalysisRequest::new(image()), None).await.unwrap_err();

        assert_eq!(err, AnalysisError::MissingCredential);
        assert_eq!(mock.total_calls(), 0);
    }

    #[tokio::test]
    async fn pre_cancelled_token_dispatches_nothing() {
        let mock = Arc::new(MockBackend::new());
        let token = CancellationToken::new();
        token.cancel();

        let err = client(mock.clone())
            .analyze(AnalysisRequest::new(image()), Some(&token))
            .await
            .unwrap_err();

        assert_eq!(err, AnalysisError::Cancelled);
        assert_eq!(mock.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_prevents_retry_dispatch() {
        let mock = Arc::new(MockBackend::new());
        mock.push(CallKind::Heatmap, Err(AnalysisError::Quota("rate limit".into())));
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            let mock = mock.clone();
            async move {
                while mock.call_count(CallKind::Heatmap) == 0 {
                    tokio::task::yield_now().await;
                }
                // First heatmap attempt failed; the retrier is now in backoff.
                token.cancel();
            }
        };

        let client = client(mock.clone());
        let (result, _) = tokio::join!(
            client.analyze(AnalysisRequest::new(image()), Some(&token)),
            canceller
        );

        assert_eq!(result.unwrap_err(), AnalysisError::Cancelled);
        assert_eq!(mock.call_count(CallKind::Heatmap), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retried_per_call() {
        let mock = Arc::new(MockBackend::new());
        mock.push(CallKind::Classification, Err(AnalysisError::Unavailable("503".into())));
        mock.push(CallKind::Classification, Err(AnalysisError::Quota("quota".into())));

        let outcome = client(mock.clone())
            .analyze(AnalysisRequest::new(image()), None)
            .await
            .unwrap();

        assert_eq!(mock.call_count(CallKind::Classification), 3);
        assert_eq!(mock.call_count(CallKind::Heatmap), 1);
        assert_eq!(outcome.result.diagnosis, Diagnosis::Normal);
    }

    #[tokio::test]
    async fn non_retryable_failure_surfaces_immediately() {
        let mock = Arc::new(MockBackend::new());
        mock.push(CallKind::Segmentation, Err(AnalysisError::Safety("blocked".into())));

        let err = client(mock.clone())
            .analyze(AnalysisRequest::new(image()), None)
            .await
            .unwrap_err();

        assert!(matches!(err, AnalysisError::Safety(_)));
        assert_eq!(mock.call_count(CallKind::Segmentation), 1);
    }

    #[tokio::test]
    async fn unparsable_classification_is_hard_failure() {
        let mock = Arc::new(MockBackend::new());
        mock.push(CallKind::Classification, Ok(GenerateResponse::from_text("not json")));

        let err = client(mock.clone())
            .analyze(AnalysisRequest::new(image()), None)
            .await
            .unwrap_err();

        assert!(matches!(err, AnalysisError::MalformedResponse(_)));
        assert_eq!(mock.call_count(CallKind::Classification), 1);
    }

    #[tokio::test]
    async fn missing_heatmap_payload_names_artifact() {
        let mock = Arc::new(MockBackend::new());
        mock.push(CallKind::Heatmap, Ok(GenerateResponse::from_text("I cannot draw that")));

        let err = client(mock)
            .analyze(AnalysisRequest::new(image()), None)
            .await
            .unwrap_err();

        assert_eq!(err, AnalysisError::MissingArtifact(Artifact::Heatmap));
    }

    #[tokio::test]
    async fn missing_segmentation_payload_names_artifact() {
        let mock = Arc::new(MockBackend::new());
        mock.push(CallKind::SegmentationUncertainty, Ok(GenerateResponse::default()));

        let err = client(mock)
            .analyze(AnalysisRequest::new(image()), None)
            .await
            .unwrap_err();

        assert_eq!(err, AnalysisError::MissingArtifact(Artifact::SegmentationUncertainty));
    }

    #[tokio::test]
    async fn low_confidence_gated_end_to_end() {
        let mock = Arc::new(MockBackend::new().with_classification(serde_json::json!({
            "diagnosis": "Wet AMD (CNV)",
            "confidence": "65%",
            "explanation": "Possible subretinal fluid.",
            "explainability": "Hyporeflective region nasal to fovea.",
            "uncertaintyStatement": "Motion artifact present.",
            "segmentationUncertaintyStatement": "RPE boundary ambiguous."
        })));

        let outcome = client(mock)
            .analyze(AnalysisRequest::new(image()), None)
            .await
            .unwrap();

        assert_eq!(outcome.result.diagnosis, Diagnosis::RequiresFurtherReview);
        assert!(outcome.result.uncertainty_statement.contains("Wet AMD (CNV)"));
    }

    #[test]
    fn strips_json_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn fence_tag_matched_case_insensitively() {
        assert_eq!(strip_code_fence("```JSON\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```Json {\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[tokio::test]
    async fn uppercase_fenced_classification_parses() {
        let body = serde_json::json!({
            "diagnosis": "Normal",
            "confidence": "93%",
            "explanation": "Normal foveal contour.",
            "explainability": "Fovea.",
            "uncertaintyStatement": "Low.",
            "segmentationUncertaintyStatement": "Low."
        });
        let mock = Arc::new(MockBackend::new());
        mock.push(
            CallKind::Classification,
            Ok(GenerateResponse::from_text(format!("```JSON\n{body}\n```"))),
        );

        let outcome = client(mock.clone())
            .analyze(AnalysisRequest::new(image()), None)
            .await
            .unwrap();

        assert_eq!(outcome.result.confidence, "93%");
    }
}
