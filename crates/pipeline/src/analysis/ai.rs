//! AI provider seams and an OpenAI-compatible client.
//!
//! Works against any server exposing `/v1/chat/completions` (Ollama,
//! vLLM, OpenAI). Models are asked for a bare JSON object; fenced or
//! chatty replies are tolerated as long as one object can be cut out.

use async_trait::async_trait;
use serde::Deserialize;
use shared_types::{ActionItems, Sentiment, Urgency};
use std::time::Duration;
use tracing::debug;

use crate::error::AiError;

const SUMMARY_PROMPT: &str = "You summarise emails for a busy professional. \
Reply with a single JSON object and nothing else, using exactly these keys:\n\
\"summary\": one or two sentences,\n\
\"category\": one of \"work\", \"personal\", \"finance\", \"newsletter\", \"notification\", \"other\",\n\
\"sentiment\": one of \"positive\", \"neutral\", \"negative\",\n\
\"urgency\": one of \"high\", \"medium\", \"low\",\n\
\"action_items\": a list of short imperative strings (empty if none).";

const SENTIMENT_PROMPT: &str = "Classify the tone of the email. \
Reply with a single JSON object and nothing else: \
{\"sentiment\": \"positive\" | \"neutral\" | \"negative\", \"urgency\": \"high\" | \"medium\" | \"low\"}";

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryResult {
    pub summary: String,
    pub category: Option<String>,
    pub sentiment: Option<Sentiment>,
    pub urgency: Option<Urgency>,
    pub action_items: ActionItems,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentimentResult {
    pub sentiment: Sentiment,
    pub urgency: Option<Urgency>,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<SummaryResult, AiError>;
}

#[async_trait]
pub trait SentimentAnalyzer: Send + Sync {
    async fn analyze_sentiment(&self, text: &str) -> Result<SentimentResult, AiError>;
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// Longer inputs are cut to this many characters
    pub max_input_chars: usize,
}

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_input_chars: usize,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct RawSummary {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    sentiment: Option<String>,
    #[serde(default)]
    urgency: Option<String>,
    #[serde(default)]
    action_items: Vec<String>,
}

#[derive(Deserialize)]
struct RawSentiment {
    sentiment: String,
    #[serde(default)]
    urgency: Option<String>,
}

impl OpenAiCompatClient {
    pub fn new(config: AiConfig) -> Result<Self, AiError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            http,
            endpoint: format!("{}/v1/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model,
            api_key: config.api_key.filter(|k| !k.is_empty()),
            max_input_chars: config.max_input_chars,
        })
    }

    async fn chat_complete(&self, system_prompt: &str, text: &str) -> Result<String, AiError> {
        let input = truncate_chars(text, self.max_input_chars);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": input }
            ],
            "temperature": 0.0,
            "response_format": { "type": "json_object" },
            "stream": false
        });

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AiError::Status {
                status: status.as_u16(),
                body: truncate_chars(&body, 500).to_string(),
            });
        }

        let parsed: ChatResponse = resp.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(AiError::EmptyResponse)?;

        debug!("AI response ({} chars) from {}", content.len(), self.model);
        Ok(content)
    }
}

#[async_trait]
impl Summarizer for OpenAiCompatClient {
    async fn summarize(&self, text: &str) -> Result<SummaryResult, AiError> {
        let content = self.chat_complete(SUMMARY_PROMPT, text).await?;
        parse_summary(&content)
    }
}

#[async_trait]
impl SentimentAnalyzer for OpenAiCompatClient {
    async fn analyze_sentiment(&self, text: &str) -> Result<SentimentResult, AiError> {
        let content = self.chat_complete(SENTIMENT_PROMPT, text).await?;
        parse_sentiment(&content)
    }
}

pub(crate) fn parse_summary(content: &str) -> Result<SummaryResult, AiError> {
    let raw: RawSummary = serde_json::from_str(extract_json(content)?)
        .map_err(|e| AiError::Parse(e.to_string()))?;

    let summary = raw.summary.trim().to_string();
    if summary.is_empty() {
        return Err(AiError::Parse("summary is empty".to_string()));
    }

    Ok(SummaryResult {
        summary,
        category: raw
            .category
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty()),
        sentiment: raw.sentiment.as_deref().and_then(Sentiment::from_label),
        urgency: raw.urgency.as_deref().and_then(Urgency::from_label),
        action_items: ActionItems::new(raw.action_items),
    })
}

pub(crate) fn parse_sentiment(content: &str) -> Result<SentimentResult, AiError> {
    let raw: RawSentiment = serde_json::from_str(extract_json(content)?)
        .map_err(|e| AiError::Parse(e.to_string()))?;

    let sentiment = Sentiment::from_label(&raw.sentiment)
        .ok_or_else(|| AiError::Parse(format!("unknown sentiment label {:?}", raw.sentiment)))?;

    Ok(SentimentResult {
        sentiment,
        urgency: raw.urgency.as_deref().and_then(Urgency::from_label),
    })
}

/// Cut the outermost `{...}` out of a model reply.
fn extract_json(content: &str) -> Result<&str, AiError> {
    let start = content.find('{');
    let end = content.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(&content[start..=end]),
        _ => Err(AiError::Parse(format!(
            "no JSON object in response: {}",
            truncate_chars(content, 200)
        ))),
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
