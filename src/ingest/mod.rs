pub mod docx;
pub mod html;
pub mod pdf;

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

use crate::models::{Chunk, Document};

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s+").unwrap_or_else(|err| panic!("invalid whitespace regex: {err}"))
});

/// Every whitespace run becomes a single space.
pub fn clean_text(text: &str) -> String {
    WHITESPACE_RUN
        .replace_all(&text.replace('\u{00A0}', " "), " ")
        .trim()
        .to_string()
}

/// Reads every supported file under `dir` into a [`Document`].
///
/// Hidden entries are skipped. A file that fails to parse is logged and
/// skipped so one bad upload does not block the rest.
pub fn read_documents(dir: &Path) -> Result<Vec<Document>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut documents = Vec::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry));

    for entry in walker {
        let entry = entry.with_context(|| format!("failed walking {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let source = entry.file_name().to_string_lossy().to_string();
        match read_file(path) {
            Ok(Some(raw)) => {
                let text = clean_text(&raw);
                if text.is_empty() {
                    tracing::debug!("{} has no extractable text", path.display());
                    continue;
                }
                documents.push(Document { text, source });
            }
            Ok(None) => {
                tracing::warn!("skipping unsupported file {}", path.display());
            }
            Err(err) => {
                tracing::warn!("skipping {}: {:#}", path.display(), err);
            }
        }
    }

    Ok(documents)
}

fn read_file(path: &Path) -> Result<Option<String>> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "txt" | "md" | "markdown" | "csv" | "json" | "log" | "rst" => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
        }
        "html" | "htm" => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(Some(html::html_to_text(&String::from_utf8_lossy(&bytes))))
        }
        "pdf" => pdf::extract_pdf_text(path).map(Some),
        "docx" => docx::extract_docx_text(path).map(Some),
        _ => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(String::from_utf8(bytes).ok())
        }
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

pub fn build_chunks(
    index_id: &str,
    documents: &[Document],
    target_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let target_tokens = target_tokens.max(1);
    let step = target_tokens.saturating_sub(overlap_tokens).max(1);

    for document in documents {
        let tokens: Vec<&str> = document.text.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        let mut ordinal = 0i64;
        let mut start = 0;
        loop {
            let end = (start + target_tokens).min(tokens.len());
            chunks.push(Chunk {
                id: Uuid::new_v4().to_string(),
                index_id: index_id.to_string(),
                source: document.source.clone(),
                ordinal,
                content: tokens[start..end].join(" "),
                token_count: (end - start) as i64,
            });

            if end == tokens.len() {
                break;
            }
            ordinal += 1;
            start += step;
        }
    }

    chunks
}
