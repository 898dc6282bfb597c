//! Chat-completions client used by the label processor. Only the
//! [`ChatModel`] trait is visible to the processor, so tests can substitute
//! a canned model.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// A message in a conversation with the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_owned(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_owned(),
            content: content.into(),
        }
    }
}

/// A single completion request. `json_response` forces the API to return
/// a parseable JSON object.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f64,
    pub json_response: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("response unparseable: {0}")]
    Parse(String),
}

impl From<LlmError> for JobError {
    fn from(error: LlmError) -> Self {
        match error {
            // A bad key cannot fix itself; burn no retries on it.
            LlmError::Unauthorized(m) => JobError::Permanent(format!("llm unauthorized: {}", m)),
            LlmError::RateLimited(m) => JobError::RateLimited {
                reason: m,
                retry_after: Some(Duration::from_secs(30)),
            },
            LlmError::Api { code, message } if code >= 500 => {
                JobError::Transient(format!("llm api error {}: {}", code, message))
            }
            LlmError::Api { code, message } => {
                JobError::Permanent(format!("llm api error {}: {}", code, message))
            }
            LlmError::Request(m) => JobError::Transient(format!("llm request failed: {}", m)),
            LlmError::Parse(m) => JobError::Transient(format!("llm response unparseable: {}", m)),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run one completion and return the assistant message content.
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError>;
}

/// Client for OpenAI-compatible chat-completion APIs.
pub struct OpenAiClient {
    api_base: String,
    api_key: String,
    http_client: Client,
}

impl OpenAiClient {
    pub fn new(api_base: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
            http_client: Client::builder()
                .timeout(timeout)
                .build()
                .expect("failed to construct reqwest client for the llm"),
        }
    }
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: String,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let api_request = ApiRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            response_format: request.json_response.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let url = format!("{}/chat/completions", self.api_base);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);

            return Err(match status.as_u16() {
                401 | 403 => LlmError::Unauthorized(message),
                429 => LlmError::RateLimited(message),
                code => LlmError::Api { code, message },
            });
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        api_response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Parse("response contained no choices".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_forced_json() {
        let request = ApiRequest {
            model: "gpt-4.1-mini",
            messages: &[Message::system("be terse"), Message::user("hello")],
            temperature: 0.1,
            response_format: Some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "gpt-4.1-mini");
        assert_eq!(value["temperature"], 0.1);
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["messages"][0]["role"], "system");
    }

    #[test]
    fn errors_classify_for_retry() {
        assert!(matches!(
            JobError::from(LlmError::Unauthorized("bad key".into())),
            JobError::Permanent(_)
        ));
        assert!(matches!(
            JobError::from(LlmError::RateLimited("slow down".into())),
            JobError::RateLimited { .. }
        ));
        assert!(matches!(
            JobError::from(LlmError::Api {
                code: 500,
                message: "oops".into()
            }),
            JobError::Transient(_)
        ));
        assert!(matches!(
            JobError::from(LlmError::Api {
                code: 400,
                message: "bad request".into()
            }),
            JobError::Permanent(_)
        ));
    }
}
