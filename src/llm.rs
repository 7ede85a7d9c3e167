//! Language-model boundary and the Ollama implementation of it.

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ModelError {
    pub message: String,
}

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ModelError {}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ModelError::new(format!("model request timed out: {e}"))
        } else {
            ModelError::new(e.to_string())
        }
    }
}

/// Text completion. Output is opaque, untrusted text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError>;

    fn model(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Client for Ollama's non-streaming `/api/generate` endpoint.
pub struct OllamaClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: generate_endpoint(base_url),
            model: model.to_string(),
        })
    }
}

fn generate_endpoint(base_url: &str) -> String {
    format!("{}/api/generate", base_url.trim_end_matches('/'))
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions { temperature: 0.0 },
        };
        debug!("Sending {} byte prompt to {} ({})", prompt.len(), self.endpoint, self.model);

        let response = self.http.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::new(format!("Ollama API error {status}: {text}")));
        }
        let parsed: GenerateResponse = response.json().await?;
        Ok(parsed.response)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_endpoint() {
        assert_eq!(generate_endpoint("http://localhost:11434"), "http://localhost:11434/api/generate");
        assert_eq!(generate_endpoint("http://ollama:11434/"), "http://ollama:11434/api/generate");
    }

    #[test]
    fn test_request_body_shape() {
        let body = GenerateRequest {
            model: "llama3.2",
            prompt: "hi",
            stream: false,
            options: GenerateOptions { temperature: 0.0 },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["model"], "llama3.2");
        assert_eq!(value["stream"], false);
        assert_eq!(value["options"]["temperature"], 0.0);
    }

    #[test]
    fn test_missing_response_field_is_empty_reply() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"done":true}"#).unwrap();
        assert!(parsed.response.is_empty());
    }

    #[test]
    fn test_client_keeps_model_name() {
        let client = OllamaClient::new("http://localhost:11434", "llama3.2", Duration::from_secs(5)).unwrap();
        assert_eq!(client.model(), "llama3.2");
    }
}
