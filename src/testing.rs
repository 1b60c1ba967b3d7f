//! In-process stand-ins for the model and vector backends used by unit tests.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::llm::{Embedder, Generator};
use crate::qdrant_store::{VectorHit, VectorPoint, VectorStore};

const DIMENSIONS: usize = 64;

/// Hashes words into a small vector and answers every prompt with `reply`.
pub struct FakeModel {
    reply: String,
    fail_embeddings: AtomicBool,
    fail_generation: AtomicBool,
    prompts: Mutex<Vec<String>>,
}

impl Default for FakeModel {
    fn default() -> Self {
        Self {
            reply: "fake answer".to_string(),
            fail_embeddings: AtomicBool::new(false),
            fail_generation: AtomicBool::new(false),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

impl FakeModel {
    pub fn failing() -> Self {
        let model = Self::default();
        model.set_embeddings_failing(true);
        model
    }

    pub fn set_embeddings_failing(&self, failing: bool) {
        self.fail_embeddings.store(failing, Ordering::SeqCst);
    }

    pub fn set_generation_failing(&self, failing: bool) {
        self.fail_generation.store(failing, Ordering::SeqCst);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Embedder for FakeModel {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.fail_embeddings.load(Ordering::SeqCst) {
            anyhow::bail!("embedding backend unavailable");
        }

        let mut vector = vec![0.0f32; DIMENSIONS];
        for word in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase()
                .trim_matches(|c: char| !c.is_alphanumeric())
                .hash(&mut hasher);
            vector[(hasher.finish() as usize) % DIMENSIONS] += 1.0;
        }
        Ok(vector)
    }
}

#[async_trait]
impl Generator for FakeModel {
    async fn generate(&self, prompt: &str, _max_tokens: usize, _temperature: f32) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail_generation.load(Ordering::SeqCst) {
            anyhow::bail!("generation backend unavailable");
        }
        Ok(self.reply.clone())
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

#[derive(Default)]
pub struct MemoryVectorStore {
    collections: Mutex<HashMap<String, Vec<VectorPoint>>>,
}

impl MemoryVectorStore {
    pub fn point_count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn collection_count(&self) -> usize {
        self.collections.lock().unwrap().len()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn recreate_collection(&self, collection: &str, _vector_size: usize) -> Result<()> {
        self.collections
            .lock()
            .unwrap()
            .insert(collection.to_string(), Vec::new());
        Ok(())
    }

    async fn delete_collection(&self, collection: &str) -> Result<()> {
        self.collections.lock().unwrap().remove(collection);
        Ok(())
    }

    async fn upsert_points(&self, collection: &str, points: &[VectorPoint]) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        let Some(stored) = collections.get_mut(collection) else {
            anyhow::bail!("collection {collection} does not exist");
        };
        stored.extend_from_slice(points);
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let collections = self.collections.lock().unwrap();
        let Some(stored) = collections.get(collection) else {
            anyhow::bail!("collection {collection} does not exist");
        };

        let mut hits: Vec<VectorHit> = stored
            .iter()
            .map(|point| VectorHit {
                chunk_id: point.payload.chunk_id.clone(),
                score: cosine(vector, &point.vector),
            })
            .filter(|hit| hit.score > 0.0)
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
