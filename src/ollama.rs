use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::llm::{Embedder, Generator};

/// Word limits tried in turn when the embedding model rejects a chunk as too long.
const TRUNCATION_STEPS: [usize; 9] = [1400, 1000, 800, 600, 450, 320, 240, 180, 120];

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct LegacyEmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct LegacyEmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: SamplingOptions,
}

#[derive(Serialize)]
struct SamplingOptions {
    num_predict: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Embeds `text`, retrying with fewer words while the model reports the
    /// input as longer than its context.
    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let input = text.trim();
        if input.is_empty() {
            anyhow::bail!("cannot embed empty text input");
        }

        let mut last_err = match self.embed_any_endpoint(model, input).await {
            Ok(vector) => return Ok(vector),
            Err(err) if is_context_length_error(&err) => err,
            Err(err) => return Err(err),
        };

        let word_count = input.split_whitespace().count();
        for limit in TRUNCATION_STEPS.into_iter().filter(|limit| *limit < word_count) {
            let shortened = truncate_to_word_limit(input, limit);
            match self.embed_any_endpoint(model, &shortened).await {
                Ok(vector) => {
                    tracing::debug!(
                        "embedded chunk after truncating {} words to {}",
                        word_count,
                        limit
                    );
                    return Ok(vector);
                }
                Err(err) if is_context_length_error(&err) => last_err = err,
                Err(err) => return Err(err),
            }
        }

        Err(last_err.context(format!(
            "ollama embedding exceeded the context length even at {} words",
            TRUNCATION_STEPS[TRUNCATION_STEPS.len() - 1]
        )))
    }

    async fn embed_any_endpoint(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        // /api/embed replaced /api/embeddings; older servers only know the latter.
        let modern_err = match self
            .post_json::<_, EmbedResponse>("/api/embed", &EmbedRequest { model, input: text })
            .await
        {
            Ok(response) => {
                return response
                    .embeddings
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("ollama /api/embed returned no embeddings"));
            }
            Err(err) => err,
        };

        self.post_json::<_, LegacyEmbedResponse>(
            "/api/embeddings",
            &LegacyEmbedRequest {
                model,
                prompt: text,
            },
        )
        .await
        .map(|response| response.embedding)
        .map_err(|legacy_err| {
            anyhow::anyhow!(
                "ollama embedding failed on both endpoints ({modern_err:#}; {legacy_err:#}); \
                 is `{model}` pulled?"
            )
        })
    }

    pub async fn generate_text(
        &self,
        model: &str,
        prompt: &str,
        num_predict: usize,
        temperature: f32,
    ) -> Result<String> {
        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
            options: SamplingOptions {
                num_predict,
                temperature,
            },
        };
        let response: GenerateResponse = self.post_json("/api/generate", &request).await?;
        Ok(response.response.trim().to_string())
    }

    async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to reach ollama {path}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ollama {path} returned {status}: {}", normalize_err_body(&body));
        }

        response
            .json::<Resp>()
            .await
            .with_context(|| format!("failed to decode ollama {path} response"))
    }
}

/// Binds an [`OllamaClient`] to the embedding model used for indexing.
#[derive(Clone)]
pub struct OllamaEmbedder {
    client: OllamaClient,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.client.embed(&self.model, text).await
    }
}

#[derive(Clone)]
pub struct OllamaGenerator {
    client: OllamaClient,
    model: String,
}

impl OllamaGenerator {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, prompt: &str, max_tokens: usize, temperature: f32) -> Result<String> {
        self.client
            .generate_text(&self.model, prompt, max_tokens, temperature)
            .await
    }

    fn describe(&self) -> String {
        format!("ollama:{}", self.model)
    }
}

pub(crate) fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
        if let Some(err) = json
            .get("error")
            .and_then(|v| v.get("message"))
            .and_then(|v| v.as_str())
        {
            return err.to_string();
        }
    }

    trimmed.to_string()
}

fn is_context_length_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("input length exceeds the context length")
        || (msg.contains("context length") && msg.contains("input length"))
}

fn truncate_to_word_limit(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}
