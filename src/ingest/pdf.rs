use std::path::Path;

use anyhow::{Context, Result};

/// Text of every page of the PDF at `path`.
///
/// `pdf-extract` panics on some malformed files; those panics are turned into
/// errors so the caller can skip the file.
pub fn extract_pdf_text(path: &Path) -> Result<String> {
    let extracted = std::panic::catch_unwind(|| pdf_extract::extract_text(path))
        .map_err(|_| anyhow::anyhow!("PDF parser panicked on {}", path.display()))?;

    extracted.with_context(|| format!("failed to extract text from PDF: {}", path.display()))
}
