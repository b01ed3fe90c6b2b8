//! Generative text service abstraction.
//!
//! A [`TextGenerator`] takes a system instruction, a prompt and a
//! temperature and returns the generated text, optionally constrained to a
//! JSON object. Implementations:
//! - **[`DisabledGenerator`]**: makes no call; callers use their fallbacks.
//! - **[`OpenAIChatGenerator`]**: calls the OpenAI chat completions API.
//!
//! Calls are made once, bounded by `generation.timeout_secs`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::GenerationConfig;

/// One request to a generative text service.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    /// Ask the service for a single JSON object.
    pub json: bool,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    /// False when no call should be attempted at all.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn is_enabled(&self) -> bool {
        false
    }
    async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        bail!("Generation provider is disabled")
    }
}

/// Chat-completions client. Requires `OPENAI_API_KEY`.
pub struct OpenAIChatGenerator {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIChatGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAIChatGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "temperature": request.temperature,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
        });
        if request.json {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
}

/// | Config Value | Generator |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledGenerator`] |
/// | `"openai"` | [`OpenAIChatGenerator`] |
pub fn create_generator(config: &GenerationConfig) -> Result<Box<dyn TextGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledGenerator)),
        "openai" => Ok(Box::new(OpenAIChatGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
