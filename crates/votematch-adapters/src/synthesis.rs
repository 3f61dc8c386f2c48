//! Plain-language question synthesis through an OpenAI-compatible chat endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use votematch_core::{PollId, SynthesizedQuestion};
use votematch_storage::{retry_with, FetchError, HttpFetcher, RetryDisposition, RetryPolicy};

use crate::text::{clean_description, truncate_on_boundary, DESCRIPTION_BUDGET};

pub const DEFAULT_LLM_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_LLM_MODEL: &str = "mistralai/devstral-2512:free";

const QUESTION_INSTRUCTIONS: &str = r#"Du schreibst für eine App, die Abstimmungen im Bundestag für Bürgerinnen und Bürger verständlich macht.
Lies Titel und Beschreibung des Antrags und liefere:
1. simplified_title: ein kurzer Titel, höchstens 10 Wörter.
2. question: eine neutrale Frage, die man mit Ja oder Nein beantworten kann, höchstens 15 Wörter.
3. explanation: worum es inhaltlich geht, höchstens 280 Zeichen. Nenne nie das Ergebnis der Abstimmung (kein "angenommen", kein "abgelehnt").
4. originator: wer den Antrag eingebracht hat (Fraktion(en) oder "Bundesregierung"), oder null, wenn es nicht im Text steht.
5. vote_flip: true nur dann, wenn ein Ja auf deine Frage logisch ein Nein zum ursprünglichen Antrag bedeutet. Beispiel: Der Antrag lautet "Keine Waffenlieferungen", deine Frage lautet "Soll Deutschland Waffen liefern?". Sonst false. Formuliere nicht ohne Grund um.

Regeln für klare Sprache: aktiv statt passiv, kurze Sätze, keine doppelten Verneinungen, Fachwörter ersetzen, keine Füllwörter.

Antworte ausschließlich mit einem JSON-Objekt:
{"simplified_title": "...", "question": "...", "explanation": "...", "originator": "..." oder null, "vote_flip": true oder false}"#;

const EXPLAIN_INSTRUCTIONS: &str = r#"Du übersetzt politische Texte in Leichte Sprache.
Schreibe kurze Sätze mit höchstens 10 Wörtern, einen Satz pro Zeile, nur im Aktiv.
Benutze einfache Alltagswörter und erkläre schwierige Wörter im nächsten Satz.
Trenne lange Wörter mit Binde-Strich, zum Beispiel Gesetz-Entwurf.
Benutze nur Informationen aus dem Text. Erkläre, wer den Vorschlag gemacht hat, was passieren soll und warum es wichtig ist.
Nenne nie das Ergebnis der Abstimmung und nie Namen von Parteien.
Keine Listen, keine Einleitung, nur der reine Text."#;

/// Words that give away how the vote ended.
const OUTCOME_MARKERS: &[&str] = &[
    "abgelehnt",
    "angenommen",
    "zugestimmt",
    "mehrheitlich",
    "rejected",
    "adopted",
];

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("completion quota exhausted or rate limited (status {status})")]
    QuotaExceeded { status: u16 },
    #[error("completion transport failed: {0}")]
    Transport(String),
    #[error("completion endpoint returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("completion returned no content")]
    EmptyContent,
    #[error("completion output is not a JSON object: {0}")]
    Malformed(String),
    #[error("completion output has no question")]
    MissingQuestion,
    #[error("synthesis failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: usize,
        #[source]
        last: Box<SynthesisError>,
    },
}

impl SynthesisError {
    pub fn is_quota(&self) -> bool {
        match self {
            SynthesisError::QuotaExceeded { .. } => true,
            SynthesisError::Exhausted { last, .. } => last.is_quota(),
            _ => false,
        }
    }

    fn disposition(&self) -> RetryDisposition {
        if self.is_quota() {
            RetryDisposition::NonRetryable
        } else {
            RetryDisposition::Retryable
        }
    }
}

fn is_quota_status(status: u16) -> bool {
    status == 402 || status == 429
}

impl From<FetchError> for SynthesisError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, .. } if is_quota_status(status) => SynthesisError::QuotaExceeded { status },
            FetchError::HttpStatus { status, body, .. } => SynthesisError::HttpStatus { status, body },
            FetchError::Request { source, .. } => SynthesisError::Transport(source.to_string()),
            FetchError::Decode { source, .. } => SynthesisError::Malformed(source.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// One round trip to a chat-completion service, returning the first choice's text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, SynthesisError>;
}

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Sent as `HTTP-Referer` for attribution.
    pub app_url: String,
    pub app_title: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LLM_URL.to_string(),
            api_key: None,
            app_url: "http://localhost:3000".to_string(),
            app_title: "Parliament Vote Match".to_string(),
        }
    }
}

pub struct OpenRouterBackend {
    http: HttpFetcher,
    config: OpenRouterConfig,
}

impl OpenRouterBackend {
    pub fn new(http: HttpFetcher, config: OpenRouterConfig) -> Self {
        Self { http, config }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

impl ApiError {
    fn status(&self) -> Option<u16> {
        match self.code.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenRouterBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, SynthesisError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let headers = [
            ("http-referer", self.config.app_url.clone()),
            ("x-title", self.config.app_title.clone()),
        ];
        let response: CompletionResponse = self
            .http
            .post_json(&url, self.config.api_key.as_deref(), &headers, request)
            .await?;

        // errors can arrive inside a 200 body
        if let Some(err) = response.error {
            let status = err.status().unwrap_or(500);
            if is_quota_status(status) {
                return Err(SynthesisError::QuotaExceeded { status });
            }
            return Err(SynthesisError::HttpStatus {
                status,
                body: err.message.unwrap_or_default(),
            });
        }

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(SynthesisError::EmptyContent)
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub description_budget: usize,
    pub retry: RetryPolicy,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_LLM_MODEL.to_string(),
            temperature: 0.3,
            max_tokens: Some(1024),
            description_budget: DESCRIPTION_BUDGET,
            retry: RetryPolicy::fixed(3, Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawQuestion {
    #[serde(default)]
    simplified_title: Option<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    vote_flip: Option<bool>,
    #[serde(default)]
    originator: Option<String>,
}

/// Turns a poll's title and description into a [`SynthesizedQuestion`].
#[derive(Clone)]
pub struct QuestionSynthesizer {
    backend: Arc<dyn CompletionBackend>,
    config: SynthesisConfig,
}

impl QuestionSynthesizer {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: SynthesisConfig) -> Self {
        Self { backend, config }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn build_request(&self, title: &str, description: &str) -> CompletionRequest {
        let cleaned = clean_description(description, self.config.description_budget);
        CompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage::system(QUESTION_INSTRUCTIONS),
                ChatMessage::user(format!("Titel: \"{}\"\n\nBeschreibung:\n{}", title.trim(), cleaned)),
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }

    /// Up to `retry.max_attempts` completion calls. A quota signal is returned
    /// as-is on the first occurrence; any other final failure is wrapped in
    /// [`SynthesisError::Exhausted`].
    pub async fn synthesize(
        &self,
        poll_id: PollId,
        title: &str,
        description: &str,
    ) -> Result<SynthesizedQuestion, SynthesisError> {
        let request = self.build_request(title, description);
        let span = info_span!("synthesize", poll_id);
        let max_attempts = self.config.retry.max_attempts.max(1);

        let result = retry_with(
            &self.config.retry,
            |attempt| {
                let request = &request;
                async move {
                    let content = self.backend.complete(request).await?;
                    let question = self.parse(poll_id, &content)?;
                    info!(attempt, vote_flip = question.vote_flip, "question synthesized");
                    Ok(question)
                }
            },
            SynthesisError::disposition,
        )
        .instrument(span)
        .await;

        result.map_err(|err| {
            if err.is_quota() {
                err
            } else {
                SynthesisError::Exhausted {
                    attempts: max_attempts,
                    last: Box::new(err),
                }
            }
        })
    }

    fn parse(&self, poll_id: PollId, content: &str) -> Result<SynthesizedQuestion, SynthesisError> {
        let json = extract_json_object(content)
            .ok_or_else(|| SynthesisError::Malformed(truncate_on_boundary(content, 120)))?;
        let raw: RawQuestion = serde_json::from_str(json).map_err(|e| SynthesisError::Malformed(e.to_string()))?;

        let question = non_blank(raw.question).ok_or(SynthesisError::MissingQuestion)?;
        let simplified_title = non_blank(raw.simplified_title).unwrap_or_default();
        let explanation = non_blank(raw.explanation).unwrap_or_default();
        if simplified_title.is_empty() || explanation.is_empty() {
            warn!(poll_id, "synthesized question lacks title or explanation; record stays incomplete");
        }
        if let Some(marker) = mentions_outcome(&explanation) {
            warn!(poll_id, marker, "explanation mentions the vote outcome");
        }

        Ok(SynthesizedQuestion {
            simplified_title,
            question,
            explanation,
            vote_flip: raw.vote_flip.unwrap_or(false),
            originator: non_blank(raw.originator),
            model: self.config.model.clone(),
        })
    }

    /// Long-form explanation in easy language. Single attempt.
    pub async fn explain_more(&self, poll_id: PollId, title: &str, description: &str) -> Result<String, SynthesisError> {
        let source = if description.trim().is_empty() {
            title.trim().to_string()
        } else {
            clean_description(description, self.config.description_budget)
        };
        let request = CompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage::system(EXPLAIN_INSTRUCTIONS),
                ChatMessage::user(format!("Hier ist der Text:\n\"{source}\"\n\nÜbersetze diesen Text in Leichte Sprache.")),
            ],
            temperature: 0.2,
            max_tokens: Some(800),
        };
        self.backend
            .complete(&request)
            .instrument(info_span!("explain_more", poll_id))
            .await
    }
}

/// The substring from the first `{` to the last `}`, if any.
pub fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

/// First outcome marker found in `text`, case-insensitive.
pub fn mentions_outcome(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    OUTCOME_MARKERS.iter().copied().find(|m| lower.contains(m))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
