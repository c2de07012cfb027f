//! Google Gemini `generateContent` client gated by a priority request rate
//! limiter.
//!
//! Every API call is admitted through a [`RequestRateLimiter`]: callers tag
//! each request with a [`RequestPriority`] and the client charges a rough
//! token estimate against the limiter's window budget. When Gemini answers
//! with a quota error, the raw body (which carries Google's
//! `retryDelay:"<N>s"` detail) flows into the error message, so the limiter's
//! overload detection and cooldown hinting work end to end. The client never
//! retries on its own; callers observe [`GeminiClientError::RateLimited`] and
//! decide, typically after checking [`GeminiClient::rate_limit_status`].

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use url::Url;

use rate_limiter_priority::priority_admission::{
    AdmissionError, PriorityAdmissionSettings, RateLimitStatus, RequestRateLimiter,
};

// --- Constants ---
const DEFAULT_GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
/// Output-token estimate used when a request carries no `max_output_tokens`.
const DEFAULT_FALLBACK_OUTPUT_TOKENS: u32 = 1024;

// --- Error Definition ---
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GeminiClientError {
    #[snafu(display("Initialization error: {message}"))]
    Initialization { message: String },

    #[snafu(display("URL parsing error: {source}"))]
    UrlParse { source: url::ParseError },

    #[snafu(display("Base URL does not support path segments: {url}"))]
    BaseUrlCannotHavePathSegments { url: String },

    #[snafu(display("Failed to serialize JSON request: {source}"))]
    JsonSerialization { source: serde_json::Error },

    #[snafu(display("Failed to deserialize JSON response: {source}"))]
    JsonDeserialization { source: serde_json::Error },

    #[snafu(display("Reqwest client error: {source}"))]
    Reqwest { source: reqwest::Error },

    /// Non-success response from the API. The raw body is rendered verbatim:
    /// a 429 payload carries the `retryDelay` detail the limiter's overload
    /// detection reads out of this message.
    #[snafu(display("Gemini API request failed with status {status}: {body}"))]
    Api { status: StatusCode, body: String },

    /// The limiter refused the call while the upstream cools down.
    #[snafu(display("Admission refused: upstream is cooling down for another {}s", retry_in.as_secs()))]
    RateLimited { retry_in: Duration },

    /// The limiter's pending queue is at capacity.
    #[snafu(display("Admission refused: {depth} requests already waiting"))]
    QueueFull { depth: usize },

    #[snafu(display("No content returned from API"))]
    NoContent,
}

impl GeminiClientError {
    fn from_admission(error: AdmissionError<GeminiClientError>) -> Self {
        match error {
            AdmissionError::RateLimited { retry_in } => GeminiClientError::RateLimited { retry_in },
            AdmissionError::QueueFull { depth } => GeminiClientError::QueueFull { depth },
            AdmissionError::Upstream { source } => source,
        }
    }
}

// --- Configuration ---
#[derive(Clone, Debug)]
pub struct GeminiClientConfig {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
    pub user_agent: Option<String>,
    pub reqwest_client: Option<ReqwestClient>,
    /// Admission gate shared by every call made through this client.
    pub admission: PriorityAdmissionSettings,
    /// Output-token estimate applied when a request does not set
    /// `max_output_tokens`.
    pub fallback_output_tokens: u32,
}

impl Default for GeminiClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_GEMINI_API_BASE_URL.to_string(),
            default_model: "gemini-pro".to_string(),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            reqwest_client: None,
            admission: PriorityAdmissionSettings::default(),
            fallback_output_tokens: DEFAULT_FALLBACK_OUTPUT_TOKENS,
        }
    }
}

// --- Priorities ---
/// Caller intent, mapped onto the limiter's integer priority scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestPriority {
    /// Prefetches and batch refreshes; admitted last.
    Background,
    /// Ordinary application traffic.
    Standard,
    /// A user is actively waiting on the reply.
    Interactive,
}

impl RequestPriority {
    pub const fn weight(self) -> i32 {
        match self {
            RequestPriority::Background => 0,
            RequestPriority::Standard => 5,
            RequestPriority::Interactive => 10,
        }
    }
}

// --- API Request/Response Structures (generateContent) ---
// Refer to: https://ai.google.dev/api/rest/v1beta/models/generateContent
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_settings: Option<Vec<SafetySetting>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<Part>>,
    /// "user" or "model".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SafetySetting {
    pub category: HarmCategory,
    pub threshold: HarmBlockThreshold,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmCategory {
    HarmCategoryHarassment,
    HarmCategoryHateSpeech,
    HarmCategorySexuallyExplicit,
    HarmCategoryDangerousContent,
    HarmCategoryUnspecified,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmBlockThreshold {
    HarmBlockThresholdUnspecified,
    BlockLowAndAbove,
    BlockMediumAndAbove,
    BlockOnlyHigh,
    BlockNone,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    pub candidates: Option<Vec<Candidate>>,
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    /// e.g. "STOP", "MAX_TOKENS", "SAFETY".
    pub finish_reason: Option<String>,
    pub safety_ratings: Option<Vec<SafetyRating>>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SafetyRating {
    pub category: HarmCategory,
    /// e.g. "NEGLIGIBLE", "LOW", "MEDIUM", "HIGH".
    pub probability: String,
    pub blocked: Option<bool>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    pub block_reason: Option<String>,
    pub safety_ratings: Vec<SafetyRating>,
}

// --- Gemini Client ---
/// Client for the Google Gemini API.
///
/// Handles request construction, API communication and response parsing.
/// Every call is admitted through the shared [`RequestRateLimiter`]; clones
/// of the client share the same gate.
#[derive(Clone)]
pub struct GeminiClient {
    http: ReqwestClient,
    limiter: RequestRateLimiter,
    /// Shared configuration for the client.
    pub config: Arc<GeminiClientConfig>,
}

impl Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    /// Creates a new `GeminiClient` instance.
    ///
    /// # Errors
    ///
    /// Returns `GeminiClientError::Initialization` if the API key is empty.
    pub fn new(config: GeminiClientConfig) -> Result<Self, GeminiClientError> {
        if config.api_key.is_empty() {
            return InitializationSnafu {
                message: "API key cannot be empty",
            }
            .fail();
        }

        let http = config.reqwest_client.clone().unwrap_or_else(|| {
            ReqwestClient::builder()
                .timeout(Duration::from_secs(90))
                .connect_timeout(Duration::from_secs(10))
                .user_agent(config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT))
                .build()
                .unwrap() // Builder::build() can fail if an invalid TLS backend is forced
        });
        let limiter = RequestRateLimiter::new(config.admission);

        Ok(Self {
            http,
            limiter,
            config: Arc::new(config),
        })
    }

    /// Snapshot of the shared admission gate.
    ///
    /// Callers check this before an optional request to short-circuit to a
    /// cached or fallback answer instead of spending a call during a
    /// cooldown.
    pub fn rate_limit_status(&self) -> RateLimitStatus {
        self.limiter.rate_limit_status()
    }

    /// Full URL for a model's `generateContent` endpoint.
    fn build_url_for_model(&self, model: &str) -> Result<Url, GeminiClientError> {
        let mut endpoint_url = Url::parse(&self.config.base_url).context(UrlParseSnafu)?;
        let model_action = format!("{model}:generateContent");
        endpoint_url
            .path_segments_mut()
            .map_err(|()| GeminiClientError::BaseUrlCannotHavePathSegments {
                url: self.config.base_url.clone(),
            })?
            .push(&model_action);
        endpoint_url
            .query_pairs_mut()
            .append_pair("key", &self.config.api_key);
        Ok(endpoint_url)
    }

    /// Admission cost of a request: prompt characters / 4 plus the expected
    /// output budget. A stand-in for a real tokenizer; admission smoothing
    /// only, not billing.
    fn estimate_request_cost(&self, request: &GenerateContentRequest) -> u64 {
        let prompt_chars: usize = request
            .contents
            .iter()
            .filter_map(|content| content.parts.as_ref())
            .flatten()
            .filter_map(|part| part.text.as_deref())
            .map(str::len)
            .sum();
        let output_budget = request
            .generation_config
            .as_ref()
            .and_then(|config| config.max_output_tokens)
            .map_or(u64::from(self.config.fallback_output_tokens), |tokens| {
                tokens.max(0) as u64
            });
        (prompt_chars as u64).div_ceil(4) + output_budget
    }

    /// Generates content with the given model, admitted at `priority`.
    ///
    /// # Errors
    ///
    /// `RateLimited`/`QueueFull` when the limiter refuses the call before it
    /// runs; otherwise whatever the request itself produced (transport,
    /// non-success status, deserialization).
    pub async fn generate_content(
        &self,
        model: &str,
        priority: RequestPriority,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, GeminiClientError> {
        let url = self.build_url_for_model(model)?;
        let body = serde_json::to_vec(&request).context(JsonSerializationSnafu)?;
        let estimated_cost = self.estimate_request_cost(&request);
        tracing::debug!(
            target: "gemini_client",
            model,
            priority = ?priority,
            estimated_cost,
            "Submitting generateContent request"
        );

        let http = self.http.clone();
        self.limiter
            .execute_request(priority.weight(), estimated_cost, move || async move {
                send_generate_content(http, url, body).await
            })
            .await
            .map_err(GeminiClientError::from_admission)
    }

    /// Content generation with the client's default model at standard
    /// priority.
    pub async fn generate_content_with_defaults(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, GeminiClientError> {
        let default_model = self.config.default_model.clone();
        self.generate_content(&default_model, RequestPriority::Standard, request)
            .await
    }

    /// Simplified helper for generating text from a single user prompt.
    ///
    /// # Errors
    ///
    /// Returns `GeminiClientError` on failure, including `NoContent` when the
    /// response yields no text part.
    pub async fn generate_text_from_user_prompt(
        &self,
        model: &str,
        priority: RequestPriority,
        prompt: String,
    ) -> Result<String, GeminiClientError> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: Some(vec![Part { text: Some(prompt) }]),
                role: Some("user".to_string()),
            }],
            generation_config: None,
            safety_settings: None,
        };
        let response = self.generate_content(model, priority, request).await?;

        response
            .candidates
            .and_then(|mut candidates| candidates.pop())
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts)
            .and_then(|mut parts| parts.pop())
            .and_then(|part| part.text)
            .ok_or(GeminiClientError::NoContent)
    }
}

/// The admitted unit of work: one POST to `generateContent`.
async fn send_generate_content(
    http: ReqwestClient,
    url: Url,
    body: Vec<u8>,
) -> Result<GenerateContentResponse, GeminiClientError> {
    let response = http
        .post(url)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .context(ReqwestSnafu)?;

    let status = response.status();
    let bytes = response.bytes().await.context(ReqwestSnafu)?;

    if status.is_success() {
        serde_json::from_slice(&bytes).context(JsonDeserializationSnafu)
    } else {
        let body = String::from_utf8_lossy(&bytes).into_owned();
        tracing::warn!(target: "gemini_client", status = %status, "Gemini API call failed");
        Err(GeminiClientError::Api { status, body })
    }
}

#[cfg(test)]
mod tests {
    use rate_limiter_priority::priority_admission::backoff;
    use tokio_test::assert_ok;

    use super::*;

    fn config() -> GeminiClientConfig {
        GeminiClientConfig {
            api_key: "test-key".to_string(),
            ..GeminiClientConfig::default()
        }
    }

    fn user_request(text: &str) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                parts: Some(vec![Part {
                    text: Some(text.to_string()),
                }]),
                role: Some("user".to_string()),
            }],
            generation_config: None,
            safety_settings: None,
        }
    }

    #[test]
    fn rejects_an_empty_api_key() {
        let error = GeminiClient::new(GeminiClientConfig::default()).unwrap_err();
        assert!(matches!(error, GeminiClientError::Initialization { .. }));
    }

    #[test]
    fn url_appends_model_action_and_key() {
        let client = assert_ok!(GeminiClient::new(config()));
        let url = client.build_url_for_model("gemini-pro").unwrap();
        assert!(url.path().ends_with("/gemini-pro:generateContent"));
        assert_eq!(url.query(), Some("key=test-key"));
    }

    #[test]
    fn cost_counts_prompt_chars_and_output_budget() {
        let client = assert_ok!(GeminiClient::new(config()));
        let mut request = user_request("abcdefgh");
        request.generation_config = Some(GenerationConfig {
            max_output_tokens: Some(100),
            ..GenerationConfig::default()
        });
        assert_eq!(client.estimate_request_cost(&request), 2 + 100);
    }

    #[test]
    fn cost_falls_back_to_the_configured_output_budget() {
        let client = assert_ok!(GeminiClient::new(config()));
        let request = user_request("abcdefghi");
        assert_eq!(
            client.estimate_request_cost(&request),
            3 + u64::from(DEFAULT_FALLBACK_OUTPUT_TOKENS)
        );
    }

    #[test]
    fn priority_weights_order_intent() {
        assert!(RequestPriority::Interactive.weight() > RequestPriority::Standard.weight());
        assert!(RequestPriority::Standard.weight() > RequestPriority::Background.weight());
    }

    #[test]
    fn quota_error_message_drives_overload_detection() {
        let error = GeminiClientError::Api {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED","details":[{"retryDelay":"37s"}]}}"#.to_string(),
        };
        let message = error.to_string();
        assert!(backoff::is_overload_signal(&message));
        assert_eq!(
            backoff::retry_after_hint(&message),
            Some(Duration::from_secs(37))
        );
    }

    #[test]
    fn limiter_rejections_do_not_read_as_overload() {
        let error = GeminiClientError::RateLimited {
            retry_in: Duration::from_secs(12),
        };
        assert!(!backoff::is_overload_signal(&error.to_string()));
    }

    #[test]
    fn fresh_client_reports_clear_status() {
        let client = assert_ok!(GeminiClient::new(config()));
        let status = client.rate_limit_status();
        assert!(!status.is_backing_off);
        assert_eq!(status.queue_depth, 0);
        assert_eq!(status.in_flight, 0);
    }

    #[test]
    fn parses_a_generate_content_response() {
        let raw = r#"{
            "candidates": [{
                "content": {"parts": [{"text": "Blue."}], "role": "model"},
                "finishReason": "STOP"
            }]
        }"#;
        let response: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        let text = response
            .candidates
            .and_then(|mut candidates| candidates.pop())
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts)
            .and_then(|mut parts| parts.pop())
            .and_then(|part| part.text);
        assert_eq!(text.as_deref(), Some("Blue."));
    }
}
