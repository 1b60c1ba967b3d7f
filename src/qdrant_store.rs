use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

const UPSERT_BATCH: usize = 64;

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointPayload {
    pub chunk_id: String,
    pub source: String,
}

/// Similarity search over chunk embeddings, one collection per index build.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn recreate_collection(&self, collection: &str, vector_size: usize) -> Result<()>;

    async fn delete_collection(&self, collection: &str) -> Result<()>;

    async fn upsert_points(&self, collection: &str, points: &[VectorPoint]) -> Result<()>;

    async fn search(&self, collection: &str, vector: &[f32], limit: usize)
        -> Result<Vec<VectorHit>>;
}

#[derive(Clone)]
pub struct QdrantStore {
    client: Client,
    base_url: String,
}

impl QdrantStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/collections/{}", self.base_url, collection)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn recreate_collection(&self, collection: &str, vector_size: usize) -> Result<()> {
        self.delete_collection(collection).await?;

        let payload = json!({
            "vectors": {
                "size": vector_size,
                "distance": "Cosine"
            }
        });

        self.client
            .put(self.collection_url(collection))
            .json(&payload)
            .send()
            .await
            .context("failed to contact qdrant while creating collection")?
            .error_for_status()
            .context("qdrant failed to create collection")?;

        Ok(())
    }

    async fn delete_collection(&self, collection: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.collection_url(collection))
            .send()
            .await
            .context("failed to contact qdrant while deleting collection")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        response
            .error_for_status()
            .context("qdrant failed to delete collection")?;
        Ok(())
    }

    async fn upsert_points(&self, collection: &str, points: &[VectorPoint]) -> Result<()> {
        let url = format!("{}/points?wait=true", self.collection_url(collection));

        for batch in points.chunks(UPSERT_BATCH) {
            self.client
                .put(&url)
                .json(&json!({ "points": batch }))
                .send()
                .await
                .context("failed to contact qdrant during upsert")?
                .error_for_status()
                .context("qdrant upsert returned non-success status")?;
        }

        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        if vector.is_empty() {
            return Ok(vec![]);
        }

        let url = format!("{}/points/search", self.collection_url(collection));
        let body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("failed to contact qdrant during search")?
            .error_for_status()
            .context("qdrant search returned non-success status")?
            .json::<QdrantSearchResponse>()
            .await
            .context("failed to decode qdrant search response")?;

        Ok(hits_from_response(response))
    }
}

#[derive(Debug, Deserialize)]
struct QdrantSearchResponse {
    result: Vec<QdrantResultPoint>,
}

#[derive(Debug, Deserialize)]
struct QdrantResultPoint {
    score: f32,
    payload: Option<PointPayload>,
}

fn hits_from_response(response: QdrantSearchResponse) -> Vec<VectorHit> {
    response
        .result
        .into_iter()
        .filter_map(|point| {
            let payload = point.payload?;
            Some(VectorHit {
                chunk_id: payload.chunk_id,
                score: point.score,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_without_payload_are_dropped() {
        let body = r#"{
            "result": [
                {"id": "1", "score": 0.9, "payload": {"chunk_id": "c1", "source": "a.txt"}},
                {"id": "2", "score": 0.5, "payload": null}
            ],
            "status": "ok",
            "time": 0.001
        }"#;
        let parsed: QdrantSearchResponse = serde_json::from_str(body).unwrap();
        let hits = hits_from_response(parsed);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");
    }

    #[test]
    fn base_url_is_normalised() {
        let store = QdrantStore::new("http://localhost:6333/");
        assert_eq!(
            store.collection_url("docqa_x"),
            "http://localhost:6333/collections/docqa_x"
        );
    }
}
