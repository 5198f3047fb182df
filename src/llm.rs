//! Chat-completion client for OpenAI-compatible endpoints.
//!
//! One request per call. Errors surface to the orchestrator, which degrades
//! the answer instead of retrying.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crm_rag_core::generation::{ChatRequest, LlmClient, ResponseFormat};

use crate::config::{credential, LlmConfig, OPENAI_API_KEY_ENV};

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// Build the configured client. `disabled` yields a client whose every
/// call fails, so answers come back degraded.
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiChatClient::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledLlm)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
    async fn complete(&self, _request: &ChatRequest) -> Result<String> {
        bail!("LLM provider is disabled")
    }

    fn model_name(&self) -> &str {
        "disabled"
    }
}

pub struct OpenAiChatClient {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = credential(OPENAI_API_KEY_ENV)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

fn request_body(model: &str, temperature: f32, max_tokens: u32, request: &ChatRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": model,
        "temperature": temperature,
        "max_tokens": max_tokens,
        "messages": [
            {"role": "system", "content": request.system},
            {"role": "user", "content": request.user},
        ],
    });
    if request.format == ResponseFormat::Json {
        body["response_format"] = serde_json::json!({"type": "json_object"});
    }
    body
}

fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing message content"))
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let body = request_body(&self.model, self.temperature, self.max_tokens, request);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Completion API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_format_sets_response_format() {
        let req = ChatRequest {
            system: "sys".into(),
            user: "hi".into(),
            format: ResponseFormat::Json,
        };
        let body = request_body("m", 0.2, 100, &req);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][1]["content"], "hi");

        let text = ChatRequest {
            format: ResponseFormat::Text,
            ..req
        };
        assert!(request_body("m", 0.2, 100, &text).get("response_format").is_none());
    }

    #[test]
    fn completion_content_is_extracted() {
        let json = serde_json::json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(parse_completion(&json).unwrap(), "hello");
        assert!(parse_completion(&serde_json::json!({"choices": []})).is_err());
    }

    #[tokio::test]
    async fn disabled_client_fails() {
        let client = create_client(&LlmConfig::default()).unwrap();
        let req = ChatRequest {
            system: String::new(),
            user: String::new(),
            format: ResponseFormat::Text,
        };
        assert!(client.complete(&req).await.is_err());
    }
}
