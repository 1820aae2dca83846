use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::InlineImage;
use super::AnalysisError;
use crate::config::AnalysisConfig;

/// Connect timeout for the remote service. Requests themselves carry no deadline.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Finish reasons that mean the candidate was withheld by safety filters.
const SAFETY_FINISH_REASONS: &[&str] = &["SAFETY", "PROHIBITED_CONTENT", "IMAGE_SAFETY", "BLOCKLIST", "SPII"];

/// The four remote calls made per image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Segmentation,
    SegmentationUncertainty,
    Classification,
    Heatmap,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation",
            Self::SegmentationUncertainty => "segmentation_uncertainty",
            Self::Classification => "classification",
            Self::Heatmap => "heatmap",
        }
    }

    pub fn generates_image(&self) -> bool {
        !matches!(self, Self::Classification)
    }
}

/// One call to the remote capability: a single image plus one text instruction.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub kind: CallKind,
    pub model: String,
    pub mime_type: String,
    /// Base64 image payload, shared across the four calls.
    pub image_base64: Arc<str>,
    pub prompt: String,
    /// JSON response schema; only set for classification.
    pub response_schema: Option<Value>,
}

/// Remote generative model abstraction (allows mocking).
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, AnalysisError>;
}

// ═══════════════════════════════════════════
// Response shape
// ═══════════════════════════════════════════

/// Response body of `models/{model}:generateContent`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineImage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

impl GenerateResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::from_parts(vec![Part {
            text: Some(text.into()),
            inline_data: None,
        }])
    }

    pub fn from_image(image: InlineImage) -> Self {
        Self::from_parts(vec![Part {
            text: None,
            inline_data: Some(image),
        }])
    }

    fn from_parts(parts: Vec<Part>) -> Self {
        Self {
            candidates: vec![Candidate {
                content: Some(Content { parts }),
                finish_reason: Some("STOP".into()),
            }],
            prompt_feedback: None,
        }
    }

    fn first_parts(&self) -> &[Part] {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or(&[])
    }

    /// Concatenated text of the first candidate, `None` when it has no text.
    pub fn text(&self) -> Option<String> {
        let text: String = self
            .first_parts()
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// First inline image carried by the first candidate.
    pub fn first_inline_image(&self) -> Option<InlineImage> {
        self.first_parts()
            .iter()
            .find_map(|p| p.inline_data.clone())
            .filter(|img| !img.data.is_empty())
    }

    /// Reason the response was withheld by safety filters, if it was.
    pub fn safety_block(&self) -> Option<String> {
        if let Some(reason) = self.prompt_feedback.as_ref().and_then(|f| f.block_reason.clone()) {
            return Some(reason);
        }
        let candidate = self.candidates.first()?;
        let reason = candidate.finish_reason.as_deref()?;
        let empty = candidate.content.as_ref().map_or(true, |c| c.parts.is_empty());
        (empty && SAFETY_FINISH_REASONS.contains(&reason)).then(|| reason.to_string())
    }
}

// ═══════════════════════════════════════════
// Request body
// ═══════════════════════════════════════════

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentBody<'a> {
    contents: Vec<WireContent<'a>>,
    generation_config: WireGenerationConfig<'a>,
}

#[derive(Serialize)]
struct WireContent<'a> {
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WirePart<'a> {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: WireInlineData<'a>,
    },
    Text {
        text: &'a str,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireInlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<[&'static str; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<&'a Value>,
}

fn build_body(request: &GenerateRequest) -> GenerateContentBody<'_> {
    let generation_config = if request.kind.generates_image() {
        WireGenerationConfig {
            response_modalities: Some(["TEXT", "IMAGE"]),
            response_mime_type: None,
            response_schema: None,
        }
    } else {
        WireGenerationConfig {
            response_modalities: None,
            response_mime_type: Some("application/json"),
            response_schema: request.response_schema.as_ref(),
        }
    };

    GenerateContentBody {
        contents: vec![WireContent {
            parts: vec![
                WirePart::Inline {
                    inline_data: WireInlineData {
                        mime_type: &request.mime_type,
                        data: &request.image_base64,
                    },
                },
                WirePart::Text {
                    text: &request.prompt,
                },
            ],
        }],
        generation_config,
    }
}

/// Error envelope returned by the service on non-2xx responses.
#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Pull a readable message out of an error body, falling back to the raw body.
fn remote_error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => match env.error.status {
            Some(status) => format!("{status}: {}", env.error.message),
            None => env.error.message,
        },
        Err(_) => body.trim().to_string(),
    }
}

// ═══════════════════════════════════════════
// Gemini backend
// ═══════════════════════════════════════════

/// HTTP client for the Gemini `generateContent` endpoint.
pub struct GeminiBackend {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl GeminiBackend {
    pub fn new(api_base: &str, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(&config.api_base, config.credential.clone())
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.api_base, model)
    }
}

fn map_transport_error(e: reqwest::Error) -> AnalysisError {
    if e.is_connect() || e.is_timeout() {
        AnalysisError::Unavailable(e.to_string())
    } else {
        AnalysisError::from_remote(e.status().map(|s| s.as_u16()), &e.to_string())
    }
}

#[async_trait]
impl GenerativeBackend for GeminiBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, AnalysisError> {
        let api_key = self.api_key.as_deref().ok_or(AnalysisError::MissingCredential)?;
        let url = self.endpoint(&request.model);
        let body = build_body(&request);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::from_remote(
                Some(status.as_u16()),
                &remote_error_message(&body),
            ));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::MalformedResponse(e.to_string()))?;

        if let Some(reason) = parsed.safety_block() {
            return Err(AnalysisError::Safety(format!("{} response blocked: {reason}", request.kind.as_str())));
        }

        Ok(parsed)
    }
}

// ═══════════════════════════════════════════
// Mock backend
// ═══════════════════════════════════════════

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted backend for testing.
///
/// Scripted results are consumed per call kind in FIFO order. Once a kind's
/// script is empty, image calls return a small PNG tagged `{kind}-{n}` and
/// classification returns the configured template, echoing the request id
/// found in the prompt into `processedId` unless echo is disabled.
pub struct MockBackend {
    scripted: Mutex<HashMap<CallKind, VecDeque<Result<GenerateResponse, AnalysisError>>>>,
    classification: Value,
    echo_ids: bool,
    latency: Duration,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            classification: serde_json::json!({
                "diagnosis": "Normal",
                "confidence": "92%",
                "explanation": "Foveal contour preserved; no fluid or drusen.",
                "explainability": "Attention concentrated on the foveal pit.",
                "uncertaintyStatement": "Low diagnostic uncertainty.",
                "segmentationUncertaintyStatement": "Layer boundaries are sharp."
            }),
            echo_ids: true,
            latency: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replace the classification template.
    pub fn with_classification(mut self, template: Value) -> Self {
        self.classification = template;
        self
    }

    /// Stop echoing the prompt's request id into `processedId`.
    pub fn without_echo(mut self) -> Self {
        self.echo_ids = false;
        self
    }

    /// Delay every call (simulated network time).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a result for the next call of `kind`.
    pub fn push(&self, kind: CallKind, result: Result<GenerateResponse, AnalysisError>) {
        lock(&self.scripted).entry(kind).or_default().push_back(result);
    }

    pub fn call_count(&self, kind: CallKind) -> usize {
        lock(&self.requests).iter().filter(|r| r.kind == kind).count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        lock(&self.requests).clone()
    }

    fn default_response(&self, request: &GenerateRequest, nth: usize) -> GenerateResponse {
        if request.kind.generates_image() {
            let tag = format!("{}-{nth}", request.kind.as_str());
            return GenerateResponse::from_image(InlineImage {
                mime_type: "image/png".into(),
                data: base64::engine::general_purpose::STANDARD.encode(tag),
            });
        }

        let mut body = self.classification.clone();
        if self.echo_ids {
            if let (Some(id), Some(obj)) = (echoed_request_id(&request.prompt), body.as_object_mut()) {
                obj.insert("processedId".into(), Value::String(id));
            }
        }
        GenerateResponse::from_text(body.to_string())
    }
}

/// Request id embedded in a classification prompt, if any.
fn echoed_request_id(prompt: &str) -> Option<String> {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("REQUEST ID: "))
        .map(|id| id.trim().to_string())
}

#[async_trait]
impl GenerativeBackend for MockBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, AnalysisError> {
        let nth = {
            let mut requests = lock(&self.requests);
            requests.push(request.clone());
            requests.iter().filter(|r| r.kind == request.kind).count()
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = lock(&self.scripted)
            .get_mut(&request.kind)
            .and_then(|queue| queue.pop_front());

        match scripted {
            Some(result) => result,
            None => Ok(self.default_response(&request, nth)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: CallKind, prompt: &str) -> GenerateRequest {
        GenerateRequest {
            kind,
            model: "gemini-test".into(),
            mime_type: "image/png".into(),
            image_base64: Arc::from("aW1n"),
            prompt: prompt.into(),
            response_schema: None,
        }
    }

    #[test]
    fn image_body_requests_image_modality() {
        let req = request(CallKind::Heatmap, "heat");
        let body = serde_json::to_value(build_body(&req)).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(body["contents"][0]["parts"][0]["inlineData"]["data"], "aW1n");
        assert_eq!(body["contents"][0]["parts"][1]["text"], "heat");
        assert_eq!(body["generationConfig"]["responseModalities"][1], "IMAGE");
        assert!(body["generationConfig"].get("responseSchema").is_none());
    }

    #[test]
    fn classification_body_requests_json_schema() {
        let mut req = request(CallKind::Classification, "classify");
        req.response_schema = Some(serde_json::json!({"type": "OBJECT"}));
        let body = serde_json::to_value(build_body(&req)).unwrap();
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["generationConfig"]["responseSchema"]["type"], "OBJECT");
        assert!(body["generationConfig"].get("responseModalities").is_none());
    }

    #[test]
    fn response_text_and_image_extraction() {
        let json = r#"{
            "candidates": [{
                "content": {"parts": [
                    {"text": "Here is the map."},
                    {"inlineData": {"mimeType": "image/png", "data": "cG5n"}}
                ]},
                "finishReason": "STOP"
            }]
        }"#;
        let response: GenerateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.text().as_deref(), Some("Here is the map."));
        let img = response.first_inline_image().unwrap();
        assert_eq!(img.mime_type, "image/png");
        assert_eq!(img.data, "cG5n");
        assert!(response.safety_block().is_none());
    }

    #[test]
    fn empty_response_has_no_artifacts() {
        let response: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert!(response.text().is_none());
        assert!(response.first_inline_image().is_none());
    }

    #[test]
    fn safety_block_detected_from_feedback_and_finish_reason() {
        let blocked: GenerateResponse =
            serde_json::from_str(r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#).unwrap();
        assert_eq!(blocked.safety_block().as_deref(), Some("SAFETY"));

        let withheld: GenerateResponse =
            serde_json::from_str(r#"{"candidates": [{"finishReason": "IMAGE_SAFETY"}]}"#).unwrap();
        assert_eq!(withheld.safety_block().as_deref(), Some("IMAGE_SAFETY"));
    }

    #[test]
    fn error_envelope_message_extracted() {
        let body = r#"{"error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(remote_error_message(body), "RESOURCE_EXHAUSTED: Quota exceeded");
        assert_eq!(remote_error_message("  plain failure "), "plain failure");
    }

    #[test]
    fn gemini_endpoint_uses_model_path() {
        let backend = GeminiBackend::new("https://example.test/v1beta/", Some("k".into()));
        assert_eq!(
            backend.endpoint("gemini-2.5-flash"),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[tokio::test]
    async fn gemini_without_key_fails_before_network() {
        let backend = GeminiBackend::new("http://127.0.0.1:9", None);
        let err = backend.generate(request(CallKind::Heatmap, "x")).await.unwrap_err();
        assert_eq!(err, AnalysisError::MissingCredential);
    }

    #[tokio::test]
    async fn mock_echoes_request_id() {
        let mock = MockBackend::new();
        let response = mock
            .generate(request(CallKind::Classification, "intro\nREQUEST ID: abc-123\nmore"))
            .await
            .unwrap();
        let body: Value = serde_json::from_str(&response.text().unwrap()).unwrap();
        assert_eq!(body["processedId"], "abc-123");
    }

    #[tokio::test]
    async fn mock_scripted_results_consumed_in_order() {
        let mock = MockBackend::new();
        mock.push(CallKind::Heatmap, Err(AnalysisError::Quota("q".into())));

        let first = mock.generate(request(CallKind::Heatmap, "h")).await;
        let second = mock.generate(request(CallKind::Heatmap, "h")).await;

        assert!(matches!(first, Err(AnalysisError::Quota(_))));
        assert!(second.unwrap().first_inline_image().is_some());
        assert_eq!(mock.call_count(CallKind::Heatmap), 2);
    }
}
