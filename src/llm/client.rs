//! Backend client for the expert pipeline
//!
//! The pipeline talks to any chat-completion backend through the
//! `ChatBackend` trait; the production implementation speaks the OpenRouter
//! API. Transport-level rate-limit retry lives here; semantic retry (schema
//! corrections) is the retry orchestrator's job.

use super::models::{Model, Usage};
use super::parse::truncate_str;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// OpenRouter direct API URL (BYOK mode)
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Rate limit retry configuration
const MAX_TRANSPORT_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

/// Response from the backend including content and usage stats
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub content: String,
    pub usage: Option<Usage>,
}

/// Chat-completion seam. One call sends a system directive plus a user
/// directive and returns a single string that should parse as JSON.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        model: Model,
        json_mode: bool,
    ) -> anyhow::Result<BackendReply>;
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f64,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// Production backend speaking the OpenRouter chat-completions API.
pub struct OpenRouterBackend {
    client: reqwest::Client,
    api_key: String,
    temperature: f64,
}

impl OpenRouterBackend {
    pub fn new(api_key: String, temperature: f64) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            temperature,
        }
    }

    /// Build from the environment. Returns `None` when no key is configured.
    pub fn from_env(temperature: f64) -> Option<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY").ok().filter(|k| !k.is_empty())?;
        Some(Self::new(api_key, temperature))
    }
}

/// Extract a retry-after hint from a rate-limit response body, if present
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    if let Some(pos) = text_lower.find("retry") {
        let after_retry = &text_lower[pos..];
        for word in after_retry.split_whitespace().skip(1).take(5) {
            if let Ok(secs) = word
                .trim_matches(|c: char| !c.is_numeric())
                .parse::<u64>()
            {
                if secs > 0 && secs < 300 {
                    return Some(secs);
                }
            }
        }
    }
    None
}

#[async_trait]
impl ChatBackend for OpenRouterBackend {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        model: Model,
        json_mode: bool,
    ) -> anyhow::Result<BackendReply> {
        let response_format = if json_mode && model.supports_json_mode() {
            Some(ResponseFormat {
                format_type: "json_object".to_string(),
            })
        } else {
            None
        };

        let request = ChatRequest {
            model: model.id().to_string(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: model.max_tokens(),
            temperature: self.temperature,
            stream: false,
            response_format,
        };

        let mut retry_count = 0;

        loop {
            let response = self
                .client
                .post(OPENROUTER_URL)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    anyhow::anyhow!("failed to parse backend response: {}\n{}", e, truncate_str(&text, 400))
                })?;

                let content = parsed
                    .choices
                    .first()
                    .map(|c| c.message.content.clone())
                    .unwrap_or_default();

                return Ok(BackendReply {
                    content,
                    usage: parsed.usage,
                });
            }

            if status.as_u16() == 429 && retry_count < MAX_TRANSPORT_RETRIES {
                retry_count += 1;
                let retry_after = parse_retry_after(&text).unwrap_or_else(|| {
                    (INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1)) / 1000
                });
                tracing::warn!(
                    retry_after_secs = retry_after,
                    attempt = retry_count,
                    "backend rate limited, backing off"
                );
                tokio::time::sleep(tokio::time::Duration::from_secs(retry_after)).await;
                continue;
            }

            let error_msg = match status.as_u16() {
                401 => "invalid API key; check OPENROUTER_API_KEY".to_string(),
                429 => format!("rate limited after {} retries", retry_count),
                500..=599 => format!("backend server error ({})", status),
                _ => format!("API error {}: {}", status, truncate_str(&text, 200)),
            };
            return Err(anyhow::anyhow!("{}", error_msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_extracts_seconds() {
        assert_eq!(parse_retry_after("please retry after 12 seconds"), Some(12));
        assert_eq!(parse_retry_after("retry in 5s"), Some(5));
        assert_eq!(parse_retry_after("no hint here"), None);
    }

    #[test]
    fn test_parse_retry_after_rejects_absurd_values() {
        assert_eq!(parse_retry_after("retry after 100000 seconds"), None);
    }

    #[test]
    fn test_from_env_without_key() {
        std::env::remove_var("OPENROUTER_API_KEY");
        assert!(OpenRouterBackend::from_env(0.3).is_none());
    }
}
