//! # Analysis client
//! Provider abstraction for the external text-analysis API plus the retry,
//! rate-gating and response-normalization policy around it.
//!
//! The wire contract is a chat-completions call that is asked to return one
//! JSON object: `{sentiment_score, clusters, confidence, reasoning}`. Models
//! routinely wrap that object in markdown fences or drift structurally, so
//! parsing is tolerant and the final parse failure degrades to a neutral
//! fallback instead of an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::gate::RateGate;
use crate::ingest::text_digest;
use crate::model::Analysis;

// ------------------------------------------------------------
// Errors
// ------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// External push-back (HTTP 429), possibly carrying an advisory wait.
    #[error("analysis API rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Payload arrived but was not the expected JSON object.
    #[error("malformed analysis payload: {0}")]
    Malformed(String),

    /// Non-success status other than 429.
    #[error("analysis API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Transport failure, including the fixed per-request timeout.
    #[error("analysis request failed: {0}")]
    Network(#[from] reqwest::Error),
}

impl AnalyzerError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Advisory wait attached to a rate-limit signal, if any.
    pub fn advisory_wait(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

// ------------------------------------------------------------
// Config
// ------------------------------------------------------------

/// Analyzer section of the app config. All fields have serde defaults so a
/// missing `[analyzer]` table behaves like production settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// "grok" (real API, needs `GROK_API_KEY`) or "mock" (canned output).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait applied to a rate-limit signal without an advisory value.
    #[serde(default = "default_rate_limit_wait_secs")]
    pub rate_limit_wait_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_provider() -> String {
    "grok".to_string()
}
fn default_api_url() -> String {
    "https://api.x.ai/v1/chat/completions".to_string()
}
fn default_model() -> String {
    "grok-4-latest".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_rate_limit_wait_secs() -> u64 {
    5
}
fn default_temperature() -> f32 {
    0.3
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_url: default_api_url(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            rate_limit_wait_secs: default_rate_limit_wait_secs(),
            temperature: default_temperature(),
        }
    }
}

impl AnalyzerConfig {
    /// Clamp nonsensical values instead of failing startup.
    pub fn sanitize(&mut self) {
        if self.max_attempts == 0 {
            self.max_attempts = 1;
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = default_timeout_secs();
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            self.temperature = default_temperature();
        }
    }
}

// ------------------------------------------------------------
// Provider abstraction + concrete providers
// ------------------------------------------------------------

/// One raw completion round-trip. Separated from the retry/gating policy so
/// tests can script failure sequences against the same client.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Returns the model's text payload (usually JSON, possibly fenced).
    async fn complete(&self, prompt: &str) -> Result<String, AnalyzerError>;
    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;
}

/// x.ai chat-completions provider.
pub struct GrokProvider {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl GrokProvider {
    pub fn new(cfg: &AnalyzerConfig, api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("convo-insights/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_url: cfg.api_url.clone(),
            api_key,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
        }
    }
}

#[async_trait]
impl AnalysisProvider for GrokProvider {
    async fn complete(&self, prompt: &str) -> Result<String, AnalyzerError> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            messages: Vec<Msg<'a>>,
            model: &'a str,
            stream: bool,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let req = Req {
            messages: vec![Msg {
                role: "user",
                content: prompt,
            }],
            model: &self.model,
            stream: false,
            temperature: self.temperature,
        };

        let resp = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AnalyzerError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(AnalyzerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: Resp = resp.json().await?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AnalyzerError::Malformed("response contained no choices".to_string()))
    }

    fn name(&self) -> &'static str {
        "grok"
    }
}

/// Canned provider for local runs without an API key.
pub struct MockProvider {
    payload: String,
}

impl MockProvider {
    pub fn canned() -> Self {
        Self {
            payload: r#"{"sentiment_score": 0.4, "clusters": ["customer_support"], "confidence": 0.9, "reasoning": "Canned mock analysis."}"#
                .to_string(),
        }
    }

    pub fn with_payload(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

#[async_trait]
impl AnalysisProvider for MockProvider {
    async fn complete(&self, _prompt: &str) -> Result<String, AnalyzerError> {
        Ok(self.payload.clone())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Factory used by `main`: provider choice comes from config, secrets from env.
pub fn provider_from_config(cfg: &AnalyzerConfig) -> anyhow::Result<Arc<dyn AnalysisProvider>> {
    match cfg.provider.as_str() {
        "mock" => Ok(Arc::new(MockProvider::canned())),
        "grok" => {
            let api_key = std::env::var("GROK_API_KEY")
                .context("GROK_API_KEY must be set when analyzer.provider = \"grok\"")?;
            Ok(Arc::new(GrokProvider::new(cfg, api_key)))
        }
        other => anyhow::bail!("unknown analyzer provider: {other:?}"),
    }
}

// ------------------------------------------------------------
// Client: slots + gate + retries around a provider
// ------------------------------------------------------------

/// Enriches one text under the outbound ceiling.
///
/// Two mechanisms are held before any call leaves the process: a concurrency
/// slot (semaphore sized to the gate capacity) and a sliding-window gate
/// admission. The slot spans all retry attempts of one `analyze` call; the
/// admission is taken once, before the first attempt.
pub struct AnalysisClient {
    provider: Arc<dyn AnalysisProvider>,
    gate: Arc<RateGate>,
    slots: Semaphore,
    max_attempts: u32,
    rate_limit_wait: Duration,
}

impl AnalysisClient {
    pub fn new(provider: Arc<dyn AnalysisProvider>, gate: Arc<RateGate>, cfg: &AnalyzerConfig) -> Self {
        let slots = Semaphore::new(gate.capacity().max(1));
        Self {
            provider,
            gate,
            slots,
            max_attempts: cfg.max_attempts.max(1),
            rate_limit_wait: Duration::from_secs(cfg.rate_limit_wait_secs),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Analyze one text.
    ///
    /// Retry policy, up to `max_attempts` total attempts:
    /// * structural parse failures and transport/API errors back off
    ///   exponentially (1s, 2s, 4s, ...);
    /// * an external rate-limit signal consumes an attempt and its advisory
    ///   wait replaces the exponential delay (default wait when absent);
    /// * exhausting attempts on a parse failure returns the neutral fallback,
    ///   every other exhaustion propagates the error.
    pub async fn analyze(&self, text: &str) -> Result<Analysis, AnalyzerError> {
        let _slot = self
            .slots
            .acquire()
            .await
            .expect("analysis slot semaphore closed");
        self.wait_for_admission().await;

        let prompt = build_prompt(text);
        let id = text_digest(text);
        let mut attempt: u32 = 1;
        loop {
            let started = Instant::now();
            let outcome = match self.provider.complete(&prompt).await {
                Ok(payload) => parse_analysis(&payload),
                Err(e) => Err(e),
            };
            histogram!("analyzer_call_ms").record(started.elapsed().as_millis() as f64);

            let err = match outcome {
                Ok(analysis) => return Ok(analysis),
                Err(e) => e,
            };

            if attempt >= self.max_attempts {
                return match err {
                    AnalyzerError::Malformed(detail) => {
                        counter!("analyzer_parse_fallbacks_total").increment(1);
                        tracing::warn!(
                            target: "analyzer",
                            %id,
                            attempts = attempt,
                            "payload never parsed, degrading to fallback: {detail}"
                        );
                        Ok(Analysis::parse_fallback(&detail))
                    }
                    other => {
                        tracing::warn!(
                            target: "analyzer",
                            %id,
                            attempts = attempt,
                            error = %other,
                            "analysis failed, giving up"
                        );
                        Err(other)
                    }
                };
            }

            let wait = match &err {
                AnalyzerError::RateLimited { retry_after } => {
                    counter!("analyzer_rate_limit_waits_total").increment(1);
                    retry_after.unwrap_or(self.rate_limit_wait)
                }
                _ => backoff_delay(attempt),
            };
            counter!("analyzer_retries_total").increment(1);
            tracing::warn!(
                target: "analyzer",
                %id,
                attempt,
                wait_secs = wait.as_secs(),
                error = %err,
                "analysis attempt failed, retrying"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    /// Spin on the outbound gate, sleeping the advisory wait between tries.
    async fn wait_for_admission(&self) {
        loop {
            if self.gate.admit() {
                return;
            }
            let wait = self.gate.retry_after_secs().max(1);
            tracing::debug!(target: "analyzer", wait_secs = wait, "outbound gate full, waiting");
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }
    }
}

/// Exponential delay after a failed attempt: 1s, 2s, 4s, ...
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << (attempt - 1).min(6))
}

fn build_prompt(text: &str) -> String {
    format!(
        "Analyze the sentiment and key topics of this customer conversation.\n\
         Return ONLY valid JSON with exactly these fields:\n\
         {{\n\
           \"sentiment_score\": <float between -1.0 and 1.0>,\n\
           \"clusters\": [<short topic labels such as \"product_issues\", \"delivery_problems\", \"praise\", \"complaint\", \"customer_support\">],\n\
           \"confidence\": <float between 0.0 and 1.0>,\n\
           \"reasoning\": \"<one short sentence>\"\n\
         }}\n\n\
         Conversation:\n{text}"
    )
}

// ------------------------------------------------------------
// Payload parsing
// ------------------------------------------------------------

/// Strip a markdown code fence (```json or plain ```) wrapping the payload.
fn strip_code_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// Parse the model payload into an `Analysis`, tolerating the usual drift:
/// fenced JSON, numbers as strings, missing optional fields. Out-of-range
/// scores clamp to their documented intervals.
fn parse_analysis(raw: &str) -> Result<Analysis, AnalyzerError> {
    let stripped = strip_code_fences(raw);
    let value: serde_json::Value =
        serde_json::from_str(stripped).map_err(|e| AnalyzerError::Malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| AnalyzerError::Malformed("payload is not a JSON object".to_string()))?;

    let sentiment_score = coerce_score(obj.get("sentiment_score"), 0.0)?.clamp(-1.0, 1.0);
    let confidence = coerce_score(obj.get("confidence"), 0.5)?.clamp(0.0, 1.0);
    let clusters = match obj.get("clusters") {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    let reasoning = obj
        .get("reasoning")
        .and_then(|v| v.as_str())
        .unwrap_or("Analysis completed")
        .to_string();

    Ok(Analysis {
        sentiment_score,
        clusters,
        confidence,
        reasoning,
    })
}

/// Numbers pass through, numeric strings parse, absent/null falls back.
fn coerce_score(value: Option<&serde_json::Value>, default: f32) -> Result<f32, AnalyzerError> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(serde_json::Value::Number(n)) => Ok(n.as_f64().unwrap_or(default as f64) as f32),
        Some(serde_json::Value::String(s)) => {
            let parsed = s
                .trim()
                .parse::<f32>()
                .map_err(|_| AnalyzerError::Malformed(format!("non-numeric score: {s:?}")))?;
            if parsed.is_finite() {
                Ok(parsed)
            } else {
                Err(AnalyzerError::Malformed(format!(
                    "non-finite score: {s:?}"
                )))
            }
        }
        Some(other) => Err(AnalyzerError::Malformed(format!(
            "unexpected score type: {other}"
        ))),
    }
}
