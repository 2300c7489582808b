use crate::error::ModelError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// One completion from a language model, with token usage when the backend
/// reports it.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub total_tokens: Option<u64>,
}

/// Sampling bounds passed through to the backend. Judges run at temperature
/// zero; synthesis leaves the backend default in place.
#[derive(Debug, Clone, Default)]
pub struct CompletionConstraints {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Chat-style language model seam. Decomposition, synthesis, and judging all
/// go through this trait so tests can swap in scripted fakes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        constraints: &CompletionConstraints,
    ) -> Result<Completion, ModelError>;
}

/// Client for OpenAI-compatible chat completion endpoints.
pub struct HttpLlmClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpLlmClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|err| ModelError::Malformed {
                service: "llm".to_string(),
                details: format!("invalid api key header: {err}"),
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            endpoint: resolve_chat_endpoint(base_url),
            model: model.into(),
        })
    }
}

/// Accepts either a bare API base or a full chat-completions URL.
fn resolve_chat_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/chat/completions")
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        constraints: &CompletionConstraints,
    ) -> Result<Completion, ModelError> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        if let Some(max_tokens) = constraints.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = constraints.temperature {
            body["temperature"] = json!(temperature);
        }

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                service: "llm".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|err| ModelError::Malformed {
            service: "llm".to_string(),
            details: err.to_string(),
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ModelError::Empty {
                service: "llm".to_string(),
            });
        }

        Ok(Completion {
            text,
            total_tokens: parsed.usage.map(|usage| usage.total_tokens),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_bare_base_url() {
        assert_eq!(
            resolve_chat_endpoint("https://api.example.com/v1"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn accepts_full_chat_endpoint() {
        assert_eq!(
            resolve_chat_endpoint("https://api.example.com/v1/chat/completions/"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn parses_usage_from_response() {
        let raw = json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12},
        });
        let parsed: ChatResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hello");
        assert_eq!(parsed.usage.unwrap().total_tokens, 12);
    }
}
