use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::Database;
use crate::ingest::build_chunks;
use crate::llm::Embedder;
use crate::models::{Document, IndexManifest, IndexStatus};
use crate::qdrant_store::{PointPayload, VectorPoint, VectorStore};
use crate::tantivy_store::TantivyStore;

const RETIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to one completed index build.
#[derive(Debug, Clone)]
pub struct DocumentIndex {
    manifest: IndexManifest,
    lexical: TantivyStore,
}

impl DocumentIndex {
    pub fn id(&self) -> &str {
        &self.manifest.index_id
    }

    pub fn collection(&self) -> &str {
        &self.manifest.collection
    }

    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn lexical(&self) -> &TantivyStore {
        &self.lexical
    }

    pub fn status(&self) -> IndexStatus {
        IndexStatus {
            indexed: true,
            index_id: Some(self.manifest.index_id.clone()),
            documents: self.manifest.document_count,
            chunks: self.manifest.chunk_count,
            sources: self.manifest.sources.clone(),
            created_at: Some(self.manifest.created_at),
        }
    }
}

/// Process-wide holder of the current index, if any.
#[derive(Clone, Default)]
pub struct IndexSlot {
    current: Arc<RwLock<Option<Arc<DocumentIndex>>>>,
}

impl IndexSlot {
    pub async fn current(&self) -> Option<Arc<DocumentIndex>> {
        self.current.read().await.clone()
    }

    /// Installs `index` and hands back the one it replaced.
    pub async fn replace(&self, index: DocumentIndex) -> Option<Arc<DocumentIndex>> {
        self.current.write().await.replace(Arc::new(index))
    }

    pub async fn take(&self) -> Option<Arc<DocumentIndex>> {
        self.current.write().await.take()
    }
}

#[derive(Clone)]
pub struct Indexer {
    config: AppConfig,
    db: Database,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
}

impl Indexer {
    pub fn new(
        config: AppConfig,
        db: Database,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            config,
            db,
            embedder,
            vectors,
        }
    }

    pub async fn build(&self, documents: Vec<Document>) -> Result<DocumentIndex> {
        let index_id = Uuid::new_v4().simple().to_string();
        let manifest = IndexManifest {
            index_id: index_id.clone(),
            collection: format!("{}_{}", self.config.qdrant_collection_prefix, index_id),
            embedding_model: self.config.models.embedding_model.clone(),
            created_at: Utc::now(),
            document_count: documents.len() as i64,
            chunk_count: 0,
            sources: unique_sources(&documents),
        };
        let mut index = DocumentIndex {
            lexical: TantivyStore::new(self.config.index_dir(&index_id).join("tantivy")),
            manifest,
        };

        if let Err(err) = self.populate(&mut index, &documents).await {
            self.discard(&index).await;
            return Err(err);
        }
        Ok(index)
    }

    async fn populate(&self, index: &mut DocumentIndex, documents: &[Document]) -> Result<()> {
        let chunks = build_chunks(
            index.id(),
            documents,
            self.config.tokens.chunk_target_tokens,
            self.config.tokens.chunk_overlap_tokens,
        );
        if chunks.is_empty() {
            anyhow::bail!("no indexable text found in uploaded files");
        }
        index.manifest.chunk_count = chunks.len() as i64;

        tracing::info!(
            "building index {} from {} documents ({} chunks)",
            index.id(),
            documents.len(),
            chunks.len()
        );

        let mut points = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let embedding = self.embedder.embed(&chunk.content).await.with_context(|| {
                format!("failed embedding chunk {} of {}", chunk.ordinal, chunk.source)
            })?;

            points.push(VectorPoint {
                id: chunk.id.clone(),
                vector: embedding,
                payload: PointPayload {
                    chunk_id: chunk.id.clone(),
                    source: chunk.source.clone(),
                },
            });
        }

        let vector_size = points.first().map(|point| point.vector.len()).unwrap_or(0);
        self.vectors
            .recreate_collection(index.collection(), vector_size)
            .await?;
        self.vectors
            .upsert_points(index.collection(), &points)
            .await?;

        let lexical = index.lexical.clone();
        let chunks_for_index = chunks.clone();
        tokio::task::spawn_blocking(move || lexical.rebuild(&chunks_for_index))
            .await
            .context("tantivy rebuild task panicked")??;

        self.db.insert_chunks(&chunks).await?;
        self.db.record_manifest(&index.manifest).await?;

        tracing::info!("index {} ready", index.id());
        Ok(())
    }

    /// The most recent build recorded on disk, if its files survived.
    pub async fn load_latest(&self) -> Result<Option<DocumentIndex>> {
        let Some(manifest) = self.db.latest_manifest().await? else {
            return Ok(None);
        };

        if manifest.embedding_model != self.config.models.embedding_model {
            tracing::warn!(
                "index {} was embedded with {:?}, not {:?}; ignoring it",
                manifest.index_id,
                manifest.embedding_model,
                self.config.models.embedding_model
            );
            return Ok(None);
        }

        let lexical = TantivyStore::new(self.config.index_dir(&manifest.index_id).join("tantivy"));
        if !lexical.exists() {
            tracing::warn!(
                "index {} is recorded but its files are missing; ignoring it",
                manifest.index_id
            );
            return Ok(None);
        }

        tracing::info!(
            "reloaded index {} ({} chunks from {} documents)",
            manifest.index_id,
            manifest.chunk_count,
            manifest.document_count
        );
        Ok(Some(DocumentIndex { manifest, lexical }))
    }

    /// Discards a replaced index once no in-flight request still holds it.
    pub async fn retire(&self, previous: Arc<DocumentIndex>) {
        if Arc::strong_count(&previous) == 1 {
            self.discard(&previous).await;
            return;
        }

        tracing::debug!("index {} still in use; deferring discard", previous.id());
        let indexer = self.clone();
        tokio::spawn(async move {
            while Arc::strong_count(&previous) > 1 {
                tokio::time::sleep(RETIRE_POLL_INTERVAL).await;
            }
            indexer.discard(&previous).await;
        });
    }

    /// Removes every artifact of `index`. Failures are logged, not returned.
    pub async fn discard(&self, index: &DocumentIndex) {
        if let Err(err) = self.vectors.delete_collection(index.collection()).await {
            tracing::warn!("failed to drop collection {}: {:#}", index.collection(), err);
        }

        let index_dir = self.config.index_dir(index.id());
        if let Err(err) = tokio::fs::remove_dir_all(&index_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove {}: {}", index_dir.display(), err);
            }
        }

        if let Err(err) = self.db.delete_chunks(index.id()).await {
            tracing::warn!("failed to delete chunks of {}: {:#}", index.id(), err);
        }
        if let Err(err) = self.db.delete_manifest(index.id()).await {
            tracing::warn!("failed to delete manifest of {}: {:#}", index.id(), err);
        }
    }

    /// Discards every recorded build and all conversation history.
    pub async fn reset(&self) -> Result<()> {
        for manifest in self.db.all_manifests().await? {
            let lexical = TantivyStore::new(self.config.index_dir(&manifest.index_id).join("tantivy"));
            self.discard(&DocumentIndex { manifest, lexical }).await;
        }
        self.db.clear_conversations().await?;
        crate::uploads::clear_directory(&self.config.index_root()).await?;
        Ok(())
    }
}

fn unique_sources(documents: &[Document]) -> Vec<String> {
    documents
        .iter()
        .map(|document| document.source.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeModel, MemoryVectorStore};

    async fn indexer(root: &std::path::Path) -> (Indexer, Arc<MemoryVectorStore>) {
        let mut config = AppConfig::rooted_at(root);
        config.tokens.chunk_target_tokens = 8;
        config.tokens.chunk_overlap_tokens = 2;
        let db = Database::new(&config).await.unwrap();
        let vectors = Arc::new(MemoryVectorStore::default());
        (
            Indexer::new(config, db, Arc::new(FakeModel::default()), vectors.clone()),
            vectors,
        )
    }

    fn doc(source: &str, text: &str) -> Document {
        Document {
            text: text.to_string(),
            source: source.to_string(),
        }
    }

    #[tokio::test]
    async fn build_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let (indexer, vectors) = indexer(dir.path()).await;

        let built = indexer
            .build(vec![
                doc("b.txt", "the quick brown fox jumps over the lazy dog again and again"),
                doc("a.txt", "lorem ipsum"),
            ])
            .await
            .unwrap();

        assert_eq!(built.manifest().sources, vec!["a.txt", "b.txt"]);
        assert_eq!(built.manifest().chunk_count, 3);
        assert!(built.lexical().exists());
        assert_eq!(vectors.point_count(built.collection()), 3);

        let reloaded = indexer.load_latest().await.unwrap().unwrap();
        assert_eq!(reloaded.id(), built.id());
        assert_eq!(reloaded.manifest().chunk_count, 3);
    }

    #[tokio::test]
    async fn empty_input_fails_and_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let (indexer, vectors) = indexer(dir.path()).await;

        let err = indexer.build(vec![]).await.unwrap_err();
        assert!(err.to_string().contains("no indexable text"));
        assert!(indexer.load_latest().await.unwrap().is_none());
        assert_eq!(vectors.collection_count(), 0);
    }

    #[tokio::test]
    async fn discard_removes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (indexer, vectors) = indexer(dir.path()).await;

        let built = indexer.build(vec![doc("a.txt", "some text")]).await.unwrap();
        indexer.discard(&built).await;

        assert!(!built.lexical().exists());
        assert_eq!(vectors.collection_count(), 0);
        assert!(indexer.load_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_forgets_every_build() {
        let dir = tempfile::tempdir().unwrap();
        let (indexer, vectors) = indexer(dir.path()).await;

        indexer.build(vec![doc("a.txt", "first")]).await.unwrap();
        indexer.build(vec![doc("b.txt", "second")]).await.unwrap();
        indexer.reset().await.unwrap();

        assert!(indexer.load_latest().await.unwrap().is_none());
        assert_eq!(vectors.collection_count(), 0);
    }

    #[tokio::test]
    async fn index_from_another_embedding_model_is_not_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let (indexer, vectors) = indexer(dir.path()).await;
        indexer.build(vec![doc("a.txt", "some text")]).await.unwrap();

        let mut config = indexer.config.clone();
        config.models.embedding_model = "mxbai-embed-large".to_string();
        let switched = Indexer::new(
            config,
            indexer.db.clone(),
            Arc::new(FakeModel::default()),
            vectors,
        );

        assert!(switched.load_latest().await.unwrap().is_none());
        assert!(indexer.load_latest().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn recorded_index_without_files_is_not_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let (indexer, _) = indexer(dir.path()).await;
        let built = indexer.build(vec![doc("a.txt", "some text")]).await.unwrap();

        std::fs::remove_dir_all(indexer.config.index_dir(built.id())).unwrap();

        assert!(indexer.load_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retire_waits_for_the_last_holder() {
        let dir = tempfile::tempdir().unwrap();
        let (indexer, vectors) = indexer(dir.path()).await;
        let built = Arc::new(indexer.build(vec![doc("a.txt", "some text")]).await.unwrap());
        let in_flight = built.clone();

        indexer.retire(built).await;
        assert!(in_flight.lexical().exists());
        assert_eq!(vectors.point_count(in_flight.collection()), 1);

        let index_dir = indexer.config.index_dir(in_flight.id());
        drop(in_flight);
        for _ in 0..100 {
            if !index_dir.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!index_dir.exists());
        assert_eq!(vectors.collection_count(), 0);
    }

    #[tokio::test]
    async fn retire_discards_an_unshared_index_at_once() {
        let dir = tempfile::tempdir().unwrap();
        let (indexer, vectors) = indexer(dir.path()).await;
        let built = indexer.build(vec![doc("a.txt", "some text")]).await.unwrap();
        let index_dir = indexer.config.index_dir(built.id());

        indexer.retire(Arc::new(built)).await;
        assert!(!index_dir.exists());
        assert_eq!(vectors.collection_count(), 0);
    }

    #[tokio::test]
    async fn slot_replace_returns_previous_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (indexer, _) = indexer(dir.path()).await;
        let slot = IndexSlot::default();

        let first = indexer.build(vec![doc("a.txt", "first")]).await.unwrap();
        let second = indexer.build(vec![doc("b.txt", "second")]).await.unwrap();
        let first_id = first.id().to_string();

        assert!(slot.replace(first).await.is_none());
        let previous = slot.replace(second).await.unwrap();
        assert_eq!(previous.id(), first_id);
        assert!(slot.take().await.is_some());
        assert!(slot.current().await.is_none());
    }
}
