use std::path::PathBuf;

use anyhow::Result;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index};

use crate::models::Chunk;

const WRITER_HEAP_BYTES: usize = 50_000_000;

#[derive(Clone, Debug)]
pub struct TantivyStore {
    index_dir: PathBuf,
}

#[derive(Clone, Copy)]
struct TantivyFields {
    chunk_id: Field,
    content: Field,
    source: Field,
}

impl TantivyStore {
    pub fn new(index_dir: PathBuf) -> Self {
        Self { index_dir }
    }

    pub fn exists(&self) -> bool {
        self.index_dir.join("meta.json").exists()
    }

    pub fn rebuild(&self, chunks: &[Chunk]) -> Result<()> {
        if self.index_dir.exists() {
            std::fs::remove_dir_all(&self.index_dir)?;
        }
        std::fs::create_dir_all(&self.index_dir)?;

        let (schema, fields) = build_schema();
        let index = Index::create_in_dir(&self.index_dir, schema)?;
        let mut writer = index.writer(WRITER_HEAP_BYTES)?;

        for chunk in chunks {
            writer.add_document(doc!(
                fields.chunk_id => chunk.id.clone(),
                fields.content => chunk.content.clone(),
                fields.source => chunk.source.clone(),
            ))?;
        }

        writer.commit()?;
        Ok(())
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<(String, f32)>> {
        if !self.exists() || limit == 0 {
            return Ok(vec![]);
        }

        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(vec![]);
        }

        let index = Index::open_in_dir(&self.index_dir)?;
        let schema = index.schema();
        let fields = resolve_fields(&schema)?;
        let reader = index.reader()?;
        let searcher = reader.searcher();

        let query_parser = QueryParser::for_index(&index, vec![fields.content, fields.source]);
        let query = query_parser.parse_query(&terms)?;
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut out = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc = searcher.doc::<tantivy::schema::TantivyDocument>(addr)?;
            if let Some(chunk_id) = doc
                .get_first(fields.chunk_id)
                .and_then(|value| value.as_str())
            {
                out.push((chunk_id.to_string(), score));
            }
        }

        Ok(out)
    }
}

/// Free text reduced to lowercase terms, so neither punctuation nor `AND`/`OR`
/// reach the query grammar.
fn query_terms(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn build_schema() -> (Schema, TantivyFields) {
    let mut builder = Schema::builder();

    let chunk_id = builder.add_text_field("chunk_id", STRING | STORED);
    let content = builder.add_text_field("content", TEXT | STORED);
    let source = builder.add_text_field("source", TEXT | STORED);

    (
        builder.build(),
        TantivyFields {
            chunk_id,
            content,
            source,
        },
    )
}

fn resolve_fields(schema: &Schema) -> Result<TantivyFields> {
    let field = |name: &str| {
        schema
            .get_field(name)
            .map_err(|err| anyhow::anyhow!(err.to_string()))
    };

    Ok(TantivyFields {
        chunk_id: field("chunk_id")?,
        content: field("content")?,
        source: field("source")?,
    })
}
