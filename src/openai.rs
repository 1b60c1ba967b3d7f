use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::llm::Generator;
use crate::ollama::normalize_err_body;

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatCompletionReq<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResp {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub async fn chat_completion(
        &self,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&ChatCompletionReq {
                model: &self.model,
                messages: vec![ChatMessage {
                    role: "user",
                    content: prompt,
                }],
                max_tokens,
                temperature,
            })
            .send()
            .await
            .context("failed to call openai chat completions endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "openai /chat/completions returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let response = response
            .json::<ChatCompletionResp>()
            .await
            .context("failed to decode openai chat completions response")?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("openai returned no completion choices"))?;

        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl Generator for OpenAiClient {
    async fn generate(&self, prompt: &str, max_tokens: usize, temperature: f32) -> Result<String> {
        self.chat_completion(prompt, max_tokens, temperature).await
    }

    fn describe(&self) -> String {
        format!("openai:{}", self.model)
    }
}
