use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Redirect};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::{Mutex, Semaphore};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::chat::{AnswerService, DEFAULT_SESSION};
use crate::config::AppConfig;
use crate::db::Database;
use crate::error::ClientError;
use crate::index::{IndexSlot, Indexer};
use crate::ingest::read_documents;
use crate::llm::{ModelRouter, OpenAiSettings};
use crate::models::{
    AnswerResponse, ApiKeyRequest, ChatRequest, IndexStatus, MessageResponse, QueryRequest,
    UploadResponse, UploadedFile,
};
use crate::ollama::{OllamaClient, OllamaEmbedder, OllamaGenerator};
use crate::qdrant_store::{QdrantStore, VectorStore};
use crate::retrieval::Retriever;
use crate::uploads::{clear_directory, sanitize_file_name, save_upload};

const NO_INDEX_MESSAGE: &str = "No documents indexed. Please upload files first.";

/// Everything the HTTP handlers and the CLI share.
#[derive(Clone)]
pub struct AppState {
    config: AppConfig,
    models: ModelRouter,
    indexer: Indexer,
    answers: AnswerService,
    slot: IndexSlot,
    build_lock: Arc<Mutex<()>>,
}

impl AppState {
    /// Wires the Ollama and Qdrant backends named in `config`.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let db = Database::new(&config).await?;
        let ollama = OllamaClient::new(config.ollama_base_url.clone());
        let models = ModelRouter::new(
            Arc::new(OllamaEmbedder::new(
                ollama.clone(),
                config.models.embedding_model.clone(),
            )),
            Arc::new(OllamaGenerator::new(ollama, config.models.answer_model.clone())),
            OpenAiSettings {
                base_url: config.openai_base_url.clone(),
                model: config.models.openai_model.clone(),
            },
            config.openai_api_key.clone(),
        );
        let vectors = Arc::new(QdrantStore::new(config.qdrant_base_url.clone()));

        Ok(Self::with_backends(config, db, models, vectors))
    }

    pub fn with_backends(
        config: AppConfig,
        db: Database,
        models: ModelRouter,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        let retriever = Retriever::new(db.clone(), vectors.clone(), models.embedder());
        let indexer = Indexer::new(config.clone(), db.clone(), models.embedder(), vectors);
        let answers = AnswerService::new(
            config.clone(),
            db,
            models.clone(),
            retriever,
            Arc::new(Semaphore::new(1)),
        );

        Self {
            config,
            models,
            indexer,
            answers,
            slot: IndexSlot::default(),
            build_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn answers(&self) -> &AnswerService {
        &self.answers
    }

    pub fn slot(&self) -> &IndexSlot {
        &self.slot
    }

    /// Puts the last persisted index back in the slot. Returns whether one was found.
    pub async fn restore(&self) -> Result<bool> {
        match self.indexer.load_latest().await? {
            Some(index) => {
                self.slot.replace(index).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Indexes everything in the data directory and swaps the result in.
    ///
    /// The previous index stays in service if the build fails.
    pub async fn rebuild_from_data_dir(&self) -> Result<IndexStatus> {
        let _guard = self.build_lock.lock().await;

        let data_dir = self.config.data_dir.clone();
        let documents = tokio::task::spawn_blocking(move || read_documents(&data_dir))
            .await
            .context("document reader task panicked")??;

        let index = self.indexer.build(documents).await?;
        let status = index.status();
        if let Some(previous) = self.slot.replace(index).await {
            self.indexer.retire(previous).await;
        }
        Ok(status)
    }

    /// Forgets the current index, every persisted build, and all uploads.
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.build_lock.lock().await;
        self.slot.take().await;
        self.indexer.reset().await?;
        clear_directory(&self.config.data_dir).await?;
        tracing::info!("cleared uploads and indexes");
        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    let static_dir = ServeDir::new(&state.config.static_dir);
    let body_limit = DefaultBodyLimit::max(state.config.max_upload_bytes);

    Router::new()
        .route("/", get(root))
        .route("/set_openai_key", post(set_openai_key))
        .route("/upload", post(upload_files))
        .route("/upload/", post(upload_files))
        .route("/chat", post(chat_handler))
        .route("/chat/", post(chat_handler))
        .route("/query", post(query_handler))
        .route("/query/", post(query_handler))
        .route("/index", get(index_status))
        .route("/index/", get(index_status))
        .nest_service("/static", static_dir)
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: AppState) -> Result<()> {
    tokio::fs::create_dir_all(&state.config.data_dir).await?;
    tokio::fs::create_dir_all(&state.config.index_root()).await?;

    if state.restore().await? {
        tracing::info!("serving previously built index");
    }

    let addr: SocketAddr = state.config.bind_addr.parse()?;
    let app = router(state);
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn root(State(state): State<AppState>) -> Result<Redirect, ApiError> {
    if state.config.reset_on_root {
        state.reset().await?;
    }
    Ok(Redirect::to("/static/main.html"))
}

async fn set_openai_key(
    State(state): State<AppState>,
    Json(request): Json<ApiKeyRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let key = request
        .api_key
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ApiError::bad_request("API key is required."))?;

    state.models.set_openai_key(key).await;
    Ok(Json(MessageResponse {
        message: "OpenAI API key set successfully.".to_string(),
    }))
}

async fn upload_files(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut uploads = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("failed to read {file_name}: {err}")))?;

        uploads.push(UploadedFile {
            file_name,
            content_type,
            bytes: bytes.to_vec(),
        });
    }

    if uploads.is_empty() {
        return Err(ApiError::bad_request("No files provided."));
    }
    // Reject the whole request before anything reaches the data directory.
    for upload in &uploads {
        sanitize_file_name(&upload.file_name)?;
    }

    let mut files = Vec::with_capacity(uploads.len());
    let mut duplicates = Vec::new();
    for upload in &uploads {
        let saved = save_upload(&state.config.data_dir, upload).await?;
        if saved.duplicate {
            duplicates.push(saved.file_name.clone());
        }
        files.push(saved.file_name);
    }

    let status = state.rebuild_from_data_dir().await.map_err(|err| {
        tracing::error!("indexing failed: {:#}", err);
        ApiError::internal(format!("Indexing failed: {err:#}"))
    })?;

    Ok(Json(UploadResponse {
        message: "Files uploaded and indexed successfully.".to_string(),
        files,
        duplicates,
        documents: status.documents,
        chunks: status.chunks,
    }))
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<AnswerResponse>, ApiError> {
    let index = state
        .slot
        .current()
        .await
        .ok_or_else(|| ApiError::bad_request(NO_INDEX_MESSAGE))?;

    let session_id = request
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .unwrap_or(DEFAULT_SESSION);

    let answer = state.answers.chat(&index, session_id, &request.query).await?;
    Ok(Json(answer.into()))
}

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<AnswerResponse>, ApiError> {
    let index = state
        .slot
        .current()
        .await
        .ok_or_else(|| ApiError::bad_request(NO_INDEX_MESSAGE))?;

    let answer = state.answers.query(&index, &request.query).await?;
    Ok(Json(answer.into()))
}

async fn index_status(State(state): State<AppState>) -> Json<IndexStatus> {
    let status = match state.slot.current().await {
        Some(index) => index.status(),
        None => IndexStatus {
            indexed: false,
            index_id: None,
            documents: 0,
            chunks: 0,
            sources: vec![],
            created_at: None,
        },
    };
    Json(status)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        if let Some(client) = value.downcast_ref::<ClientError>() {
            return Self::bad_request(client.to_string());
        }
        tracing::error!("request failed: {:#}", value);
        Self::internal(format!("{value:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "detail": self.message });
        (self.status, Json(body)).into_response()
    }
}
