use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::db::Database;
use crate::index::DocumentIndex;
use crate::llm::Embedder;
use crate::models::RetrievalResult;
use crate::qdrant_store::{VectorHit, VectorStore};

const MIN_RECALL_K: usize = 24;
const RRF_K: f32 = 60.0;

#[derive(Clone)]
pub struct Retriever {
    db: Database,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(db: Database, vectors: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            db,
            vectors,
            embedder,
        }
    }

    pub async fn retrieve(
        &self,
        index: &DocumentIndex,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let recall_k = top_k.saturating_mul(3).max(MIN_RECALL_K);

        let vector_fut = async {
            let embedding = self.embedder.embed(query).await?;
            self.vectors
                .search(index.collection(), &embedding, recall_k)
                .await
        };

        let lexical = index.lexical().clone();
        let query_text = query.to_string();
        let bm25_fut = async move {
            match tokio::task::spawn_blocking(move || lexical.search(&query_text, recall_k)).await {
                Ok(result) => result,
                Err(err) => Err(anyhow::anyhow!("bm25 search task failed: {err}")),
            }
        };

        let (vector_hits, bm25_hits) = tokio::join!(vector_fut, bm25_fut);

        let (vector_hits, bm25_hits) = match (vector_hits, bm25_hits) {
            (Err(vector_err), Err(bm25_err)) => {
                return Err(vector_err.context(format!("bm25 search also failed: {bm25_err:#}")));
            }
            (vector_hits, bm25_hits) => (
                vector_hits.unwrap_or_else(|err| {
                    tracing::warn!("vector search failed, using bm25 only: {:#}", err);
                    vec![]
                }),
                bm25_hits.unwrap_or_else(|err| {
                    tracing::warn!("bm25 search failed, using vectors only: {:#}", err);
                    vec![]
                }),
            ),
        };

        let ranked = fuse_rankings(&vector_hits, &bm25_hits);
        let selected_ids: Vec<String> = ranked
            .iter()
            .take(top_k)
            .map(|(chunk_id, _)| chunk_id.clone())
            .collect();

        let chunks = self.db.get_chunks_by_ids(index.id(), &selected_ids).await?;
        let score_map: HashMap<&str, f32> = ranked
            .iter()
            .map(|(chunk_id, score)| (chunk_id.as_str(), *score))
            .collect();

        let mut out: Vec<RetrievalResult> = chunks
            .into_iter()
            .map(|chunk| RetrievalResult {
                score: score_map.get(chunk.id.as_str()).copied().unwrap_or(0.0),
                chunk,
            })
            .collect();

        out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        tracing::debug!(
            "retrieved {} chunks ({} vector hits, {} bm25 hits)",
            out.len(),
            vector_hits.len(),
            bm25_hits.len()
        );
        Ok(out)
    }
}

/// Reciprocal-rank fusion of the vector and BM25 rankings, best first.
fn fuse_rankings(vector_hits: &[VectorHit], bm25_hits: &[(String, f32)]) -> Vec<(String, f32)> {
    let mut fused_scores: HashMap<String, f32> = HashMap::new();

    for (rank, hit) in vector_hits.iter().enumerate() {
        let rank_score = 1.0 / (RRF_K + (rank + 1) as f32);
        let similarity_bonus = hit.score.clamp(0.0, 1.0) * 0.04;
        *fused_scores.entry(hit.chunk_id.clone()).or_insert(0.0) += rank_score + similarity_bonus;
    }

    for (rank, (chunk_id, raw_score)) in bm25_hits.iter().enumerate() {
        let rank_score = 1.0 / (RRF_K + (rank + 1) as f32);
        let lexical_bonus = raw_score.max(0.0).ln_1p() * 0.012;
        *fused_scores.entry(chunk_id.clone()).or_insert(0.0) += rank_score + lexical_bonus;
    }

    let mut ranked: Vec<(String, f32)> = fused_scores.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::index::Indexer;
    use crate::models::Document;
    use crate::testing::{FakeModel, MemoryVectorStore};

    fn hit(id: &str, score: f32) -> VectorHit {
        VectorHit {
            chunk_id: id.to_string(),
            score,
        }
    }

    #[test]
    fn chunks_found_by_both_searches_rank_first() {
        let ranked = fuse_rankings(
            &[hit("a", 0.9), hit("b", 0.8)],
            &[("b".to_string(), 4.0), ("c".to_string(), 3.0)],
        );
        let order: Vec<&str> = ranked.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order[0], "b");
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn empty_inputs_fuse_to_nothing() {
        assert!(fuse_rankings(&[], &[]).is_empty());
    }

    #[tokio::test]
    async fn retrieve_returns_relevant_chunks_of_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::rooted_at(dir.path());
        let db = Database::new(&config).await.unwrap();
        let model = Arc::new(FakeModel::default());
        let vectors = Arc::new(MemoryVectorStore::default());
        let indexer = Indexer::new(config, db.clone(), model.clone(), vectors.clone());

        let index = indexer
            .build(vec![
                Document {
                    text: "Rust guarantees memory safety without a garbage collector".to_string(),
                    source: "rust.md".to_string(),
                },
                Document {
                    text: "Sourdough bread needs a lively starter and patience".to_string(),
                    source: "bread.txt".to_string(),
                },
            ])
            .await
            .unwrap();

        let retriever = Retriever::new(db, vectors, model);
        let results = retriever
            .retrieve(&index, "How does Rust handle memory safety?", 1)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.source, "rust.md");
        assert!(results[0].score > 0.0);
    }

    async fn built_index(
        root: &std::path::Path,
    ) -> (AppConfig, Retriever, Arc<MemoryVectorStore>, Arc<FakeModel>, DocumentIndex) {
        let config = AppConfig::rooted_at(root);
        let db = Database::new(&config).await.unwrap();
        let model = Arc::new(FakeModel::default());
        let vectors = Arc::new(MemoryVectorStore::default());
        let indexer = Indexer::new(config.clone(), db.clone(), model.clone(), vectors.clone());
        let index = indexer
            .build(vec![Document {
                text: "Glaciers carve valleys over thousands of years".to_string(),
                source: "ice.txt".to_string(),
            }])
            .await
            .unwrap();
        let retriever = Retriever::new(db, vectors.clone(), model.clone());
        (config, retriever, vectors, model, index)
    }

    #[tokio::test]
    async fn lost_vector_collection_falls_back_to_bm25() {
        let dir = tempfile::tempdir().unwrap();
        let (_, retriever, vectors, _, index) = built_index(dir.path()).await;
        vectors.delete_collection(index.collection()).await.unwrap();

        let results = retriever.retrieve(&index, "glaciers", 4).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.source, "ice.txt");
    }

    #[tokio::test]
    async fn failing_embedder_falls_back_to_bm25() {
        let dir = tempfile::tempdir().unwrap();
        let (_, retriever, _, model, index) = built_index(dir.path()).await;
        model.set_embeddings_failing(true);

        let results = retriever.retrieve(&index, "valleys", 4).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn error_surfaces_when_both_searches_fail() {
        let dir = tempfile::tempdir().unwrap();
        let (config, retriever, _, model, index) = built_index(dir.path()).await;
        model.set_embeddings_failing(true);
        std::fs::write(
            config.index_dir(index.id()).join("tantivy").join("meta.json"),
            "not an index",
        )
        .unwrap();

        let err = retriever.retrieve(&index, "glaciers", 4).await.unwrap_err();
        assert!(format!("{err:#}").contains("bm25 search also failed"));
    }
}
