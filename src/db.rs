use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};

use crate::config::AppConfig;
use crate::models::{Chunk, IndexManifest};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.storage_dir).await?;

        let options = SqliteConnectOptions::from_str(&config.sqlite_dsn())?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("failed to open sqlite database")?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS indexes (
                index_id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                embedding_model TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                document_count INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                sources TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                index_id TEXT NOT NULL,
                source TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS chunks_by_index ON chunks (index_id);

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Databases created before the column existed get it with an empty
        // value, which never matches a configured model.
        let columns = sqlx::query("SELECT name FROM pragma_table_info('indexes')")
            .fetch_all(&self.pool)
            .await?;
        if !columns
            .iter()
            .any(|row| row.get::<String, _>("name") == "embedding_model")
        {
            sqlx::query("ALTER TABLE indexes ADD COLUMN embedding_model TEXT NOT NULL DEFAULT ''")
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    pub async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            insert_chunk_tx(&mut tx, chunk).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_chunks(&self, index_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE index_id = ?")
            .bind(index_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Chunks of `index_id` with the given ids, in the order of `ids`.
    pub async fn get_chunks_by_ids(&self, index_id: &str, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, index_id, source, ordinal, content, token_count FROM chunks WHERE index_id = ",
        );
        qb.push_bind(index_id);
        qb.push(" AND id IN (");
        let mut separated = qb.separated(",");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        let mut chunks: Vec<Chunk> = rows.into_iter().map(row_to_chunk).collect();

        chunks.sort_by_key(|chunk| {
            ids.iter()
                .position(|id| id == &chunk.id)
                .unwrap_or(usize::MAX)
        });

        Ok(chunks)
    }

    pub async fn record_manifest(&self, manifest: &IndexManifest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO indexes
                (index_id, collection, embedding_model, created_at, document_count, chunk_count, sources)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&manifest.index_id)
        .bind(&manifest.collection)
        .bind(&manifest.embedding_model)
        .bind(manifest.created_at.to_rfc3339())
        .bind(manifest.document_count)
        .bind(manifest.chunk_count)
        .bind(serde_json::to_string(&manifest.sources)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_manifest(&self, index_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM indexes WHERE index_id = ?")
            .bind(index_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn latest_manifest(&self) -> Result<Option<IndexManifest>> {
        let row = sqlx::query(
            r#"
            SELECT index_id, collection, embedding_model, created_at, document_count,
                   chunk_count, sources
            FROM indexes
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_manifest).transpose()
    }

    pub async fn all_manifests(&self) -> Result<Vec<IndexManifest>> {
        let rows = sqlx::query(
            r#"
            SELECT index_id, collection, embedding_model, created_at, document_count,
                   chunk_count, sources
            FROM indexes
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_manifest).collect()
    }

    pub async fn ensure_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO sessions (id, created_at) VALUES (?, ?)")
            .bind(session_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn save_message(&self, session_id: &str, role: &str, content: &str) -> Result<()> {
        self.ensure_session(session_id).await?;
        sqlx::query(
            "INSERT INTO messages (session_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The newest `limit` messages of a session, oldest first.
    pub async fn latest_messages(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT role, content
            FROM messages
            WHERE session_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out: Vec<(String, String)> = rows
            .into_iter()
            .map(|r| (r.get::<String, _>("role"), r.get::<String, _>("content")))
            .collect();
        out.reverse();
        Ok(out)
    }

    /// Conversations refer to documents that are gone after a reset.
    pub async fn clear_conversations(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM sessions").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn insert_chunk_tx(tx: &mut Transaction<'_, Sqlite>, chunk: &Chunk) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunks (id, index_id, source, ordinal, content, token_count)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.index_id)
    .bind(&chunk.source)
    .bind(chunk.ordinal)
    .bind(&chunk.content)
    .bind(chunk.token_count)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn row_to_chunk(row: SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        index_id: row.get("index_id"),
        source: row.get("source"),
        ordinal: row.get("ordinal"),
        content: row.get("content"),
        token_count: row.get("token_count"),
    }
}

fn row_to_manifest(row: SqliteRow) -> Result<IndexManifest> {
    let sources: Vec<String> = serde_json::from_str(&row.get::<String, _>("sources"))
        .context("corrupt sources column in indexes table")?;

    Ok(IndexManifest {
        index_id: row.get("index_id"),
        collection: row.get("collection"),
        embedding_model: row.get("embedding_model"),
        created_at: chrono::DateTime::parse_from_rfc3339(&row.get::<String, _>("created_at"))
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        document_count: row.get("document_count"),
        chunk_count: row.get("chunk_count"),
        sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, index_id: &str, ordinal: i64) -> Chunk {
        Chunk {
            id: id.to_string(),
            index_id: index_id.to_string(),
            source: "notes.txt".to_string(),
            ordinal,
            content: format!("content of {id}"),
            token_count: 3,
        }
    }

    #[tokio::test]
    async fn chunks_come_back_in_requested_order_and_scoped_to_index() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&AppConfig::rooted_at(dir.path())).await.unwrap();

        db.insert_chunks(&[chunk("a", "one", 0), chunk("b", "one", 1), chunk("c", "two", 0)])
            .await
            .unwrap();

        let ids = vec!["b".to_string(), "c".to_string(), "a".to_string()];
        let found = db.get_chunks_by_ids("one", &ids).await.unwrap();
        let found_ids: Vec<&str> = found.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(found_ids, vec!["b", "a"]);

        db.delete_chunks("one").await.unwrap();
        assert!(db.get_chunks_by_ids("one", &ids).await.unwrap().is_empty());
        assert_eq!(db.get_chunks_by_ids("two", &ids).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn latest_manifest_is_the_newest_build() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&AppConfig::rooted_at(dir.path())).await.unwrap();
        assert!(db.latest_manifest().await.unwrap().is_none());

        let older = IndexManifest {
            index_id: "old".to_string(),
            collection: "docqa_old".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            created_at: Utc::now() - chrono::Duration::minutes(5),
            document_count: 1,
            chunk_count: 2,
            sources: vec!["a.txt".to_string()],
        };
        let newer = IndexManifest {
            index_id: "new".to_string(),
            collection: "docqa_new".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            created_at: Utc::now(),
            document_count: 2,
            chunk_count: 5,
            sources: vec!["a.txt".to_string(), "b.md".to_string()],
        };
        db.record_manifest(&newer).await.unwrap();
        db.record_manifest(&older).await.unwrap();

        let latest = db.latest_manifest().await.unwrap().unwrap();
        assert_eq!(latest.index_id, "new");
        assert_eq!(latest.sources, newer.sources);
        assert_eq!(latest.embedding_model, "nomic-embed-text");
        assert_eq!(db.all_manifests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn older_indexes_table_gains_embedding_model_column() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::rooted_at(dir.path());
        std::fs::create_dir_all(&config.storage_dir).unwrap();

        let options = SqliteConnectOptions::from_str(&config.sqlite_dsn())
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE indexes (
                index_id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                created_at TEXT NOT NULL,
                document_count INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                sources TEXT NOT NULL
            );
            INSERT INTO indexes VALUES ('legacy', 'docqa_legacy', '2024-01-01T00:00:00Z', 1, 1, '["a.txt"]');
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;

        let db = Database::new(&config).await.unwrap();
        let latest = db.latest_manifest().await.unwrap().unwrap();
        assert_eq!(latest.index_id, "legacy");
        assert_eq!(latest.embedding_model, "");
    }

    #[tokio::test]
    async fn history_is_returned_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&AppConfig::rooted_at(dir.path())).await.unwrap();

        db.save_message("s", "user", "first").await.unwrap();
        db.save_message("s", "assistant", "second").await.unwrap();
        db.save_message("s", "user", "third").await.unwrap();

        let history = db.latest_messages("s", 2).await.unwrap();
        assert_eq!(
            history,
            vec![
                ("assistant".to_string(), "second".to_string()),
                ("user".to_string(), "third".to_string()),
            ]
        );

        db.clear_conversations().await.unwrap();
        assert!(db.latest_messages("s", 10).await.unwrap().is_empty());
    }
}
