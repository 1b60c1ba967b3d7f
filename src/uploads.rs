use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::error::client_error;
use crate::models::UploadedFile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedUpload {
    pub file_name: String,
    /// Same name and same bytes as a file already on disk; nothing was written.
    pub duplicate: bool,
}

/// The final component of a client-supplied file name.
pub fn sanitize_file_name(name: &str) -> Result<String> {
    let candidate = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    if candidate.is_empty() || candidate == "." || candidate == ".." {
        return Err(client_error(format!("invalid file name: {name:?}")));
    }

    Ok(candidate)
}

pub async fn save_upload(data_dir: &Path, file: &UploadedFile) -> Result<SavedUpload> {
    let file_name = sanitize_file_name(&file.file_name)?;
    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let path = data_dir.join(&file_name);
    if let Ok(existing) = tokio::fs::read(&path).await {
        if sha256_hex(&existing) == sha256_hex(&file.bytes) {
            tracing::info!("{} already uploaded with identical content", file_name);
            return Ok(SavedUpload {
                file_name,
                duplicate: true,
            });
        }
    }

    tokio::fs::write(&path, &file.bytes)
        .await
        .with_context(|| format!("failed to write upload {}", path.display()))?;
    tracing::info!(
        "saved upload {} ({} bytes, {})",
        file_name,
        file.bytes.len(),
        file.content_type.as_deref().unwrap_or("unknown type")
    );

    Ok(SavedUpload {
        file_name,
        duplicate: false,
    })
}

/// Removes `dir` with everything in it and recreates it empty.
pub async fn clear_directory(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to remove {}", dir.display()));
        }
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to recreate {}", dir.display()))?;
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
