use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::openai::OpenAiClient;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: usize, temperature: f32) -> Result<String>;

    /// Short label for logs, e.g. `ollama:llama3.1:8b`.
    fn describe(&self) -> String;
}

/// Picks the backends used for a request.
///
/// Embeddings always come from the local embedder so that vectors stay
/// comparable with the ones already stored. Generation switches to OpenAI as
/// soon as an API key is known.
#[derive(Clone)]
pub struct ModelRouter {
    embedder: Arc<dyn Embedder>,
    local_generator: Arc<dyn Generator>,
    openai: OpenAiSettings,
    openai_key: Arc<RwLock<Option<String>>>,
    http: reqwest::Client,
}

#[derive(Clone, Debug)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub model: String,
}

impl ModelRouter {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        local_generator: Arc<dyn Generator>,
        openai: OpenAiSettings,
        openai_key: Option<String>,
    ) -> Self {
        Self {
            embedder,
            local_generator,
            openai,
            openai_key: Arc::new(RwLock::new(openai_key)),
            http: reqwest::Client::new(),
        }
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.embedder.clone()
    }

    pub async fn set_openai_key(&self, key: impl Into<String>) {
        *self.openai_key.write().await = Some(key.into());
        tracing::info!("openai api key updated; generation now uses {}", self.openai.model);
    }

    pub async fn generator(&self) -> Arc<dyn Generator> {
        match self.openai_key.read().await.as_ref() {
            Some(key) => Arc::new(OpenAiClient::with_client(
                self.http.clone(),
                self.openai.base_url.clone(),
                key.clone(),
                self.openai.model.clone(),
            )),
            None => self.local_generator.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeModel;

    #[tokio::test]
    async fn generator_switches_to_openai_once_a_key_is_set() {
        let local = Arc::new(FakeModel::default());
        let router = ModelRouter::new(
            local.clone(),
            local,
            OpenAiSettings {
                base_url: "http://localhost:1".to_string(),
                model: "gpt-test".to_string(),
            },
            None,
        );

        assert_eq!(router.generator().await.describe(), "fake");

        router.set_openai_key("sk-test").await;
        assert_eq!(router.generator().await.describe(), "openai:gpt-test");
    }
}
