//! AI service client seam.
//!
//! One call per analysis task: a prompt goes in, free-form text comes
//! back. Errors are categorized so callers can tell throttling (feeds
//! the rate limiter backoff) from everything else.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    error::{AppError, AppResult},
    server_config::AiConfig,
    HttpClient,
};

#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
}

impl From<&AiConfig> for GenerationParams {
    fn from(config: &AiConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
        }
    }
}

#[async_trait]
pub trait AiClient: Send + Sync {
    /// Run one generation. The response is the model's raw text; the
    /// caller owns parsing.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> AppResult<String>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: i32,
    pub message: ChatMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiError {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatApiResponseOrError {
    Response(ChatApiResponse),
    Error(ChatApiError),
}

/// Chat-completions HTTP client.
#[derive(Clone)]
pub struct HttpAiClient {
    http_client: HttpClient,
    endpoint: String,
    key: String,
    model: String,
}

impl HttpAiClient {
    pub fn new(http_client: HttpClient, config: &AiConfig) -> Self {
        Self {
            http_client,
            endpoint: config.endpoint.clone(),
            key: config.key.clone(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl AiClient for HttpAiClient {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> AppResult<String> {
        let resp = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.key)
            .json(&json!({
                "model": &self.model,
                "max_tokens": params.max_tokens,
                "temperature": params.temperature,
                "top_p": params.top_p,
                "messages": [
                    {
                        "role": "user",
                        "content": prompt
                    }
                ]
            }))
            .send()
            .await?;

        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::TooManyRequests);
        }

        let body = resp.json::<serde_json::Value>().await?;
        let parsed = serde_json::from_value::<ChatApiResponseOrError>(body.clone())
            .map_err(|_| AppError::BadResponse(format!("unrecognized chat response: {}", body)))?;

        let parsed = match parsed {
            ChatApiResponseOrError::Error(error) => {
                if error.message.to_lowercase().contains("rate limit") {
                    return Err(AppError::TooManyRequests);
                }
                return Err(AppError::AiService(error.message));
            }
            ChatApiResponseOrError::Response(parsed) => parsed,
        };

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::BadResponse("no choices in response".to_string()))?;

        Ok(choice.message.content)
    }
}
