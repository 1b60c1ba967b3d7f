use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub text: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub index_id: String,
    pub source: String,
    pub ordinal: i64,
    pub content: String,
    pub token_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub index_id: String,
    pub collection: String,
    /// Model whose vectors fill `collection`.
    pub embedding_model: String,
    pub created_at: DateTime<Utc>,
    pub document_count: i64,
    pub chunk_count: i64,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub response: String,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<String>,
}

impl From<Answer> for AnswerResponse {
    fn from(answer: Answer) -> Self {
        let sources = if answer.sources.is_empty() {
            None
        } else {
            Some(answer.sources.join(", "))
        };
        Self {
            response: answer.response,
            sources,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRequest {
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    pub files: Vec<String>,
    pub duplicates: Vec<String>,
    pub documents: i64,
    pub chunks: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStatus {
    pub indexed: bool,
    pub index_id: Option<String>,
    pub documents: i64,
    pub chunks: i64,
    pub sources: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}
