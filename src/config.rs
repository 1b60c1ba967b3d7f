use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub answer_model: String,
    pub openai_model: String,
    pub embedding_model: String,
}

#[derive(Clone, Debug)]
pub struct TokenConfig {
    pub chunk_target_tokens: usize,
    pub chunk_overlap_tokens: usize,
    pub retrieval_top_k: usize,
    pub max_context_tokens: usize,
    pub max_output_tokens: usize,
    pub chat_history_turns: usize,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub static_dir: PathBuf,
    pub reset_on_root: bool,
    pub max_upload_bytes: usize,
    pub ollama_base_url: String,
    pub qdrant_base_url: String,
    pub qdrant_collection_prefix: String,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub models: ModelConfig,
    pub tokens: TokenConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Built-in defaults with `data/`, `storage/` and `static/` beneath `root`.
    /// The process environment is not consulted.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data_dir: root.join("data"),
            storage_dir: root.join("storage"),
            static_dir: root.join("static"),
            ..Self::from_lookup(|_| None)
        }
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let path = |key: &str, default: &str| PathBuf::from(text(key, default));

        Self {
            bind_addr: text("DOCQA_BIND", "127.0.0.1:8000"),
            data_dir: path("DOCQA_DATA_DIR", "./data"),
            storage_dir: path("DOCQA_STORAGE_DIR", "./storage"),
            static_dir: path("DOCQA_STATIC_DIR", "./static"),
            reset_on_root: parse_or(lookup("DOCQA_RESET_ON_ROOT"), true),
            max_upload_bytes: parse_or(lookup("DOCQA_MAX_UPLOAD_BYTES"), 50 * 1024 * 1024),
            ollama_base_url: text("OLLAMA_BASE_URL", "http://127.0.0.1:11434"),
            qdrant_base_url: text("QDRANT_BASE_URL", "http://127.0.0.1:6333"),
            qdrant_collection_prefix: text("QDRANT_COLLECTION_PREFIX", "docqa"),
            openai_base_url: text("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            openai_api_key: lookup("OPENAI_API_KEY").filter(|key| !key.trim().is_empty()),
            models: ModelConfig {
                answer_model: text("ANSWER_MODEL", "llama3.1:8b"),
                openai_model: text("OPENAI_MODEL", "gpt-4o-mini"),
                embedding_model: text("EMBEDDING_MODEL", "nomic-embed-text"),
            },
            tokens: TokenConfig {
                chunk_target_tokens: parse_or(lookup("CHUNK_TARGET_TOKENS"), 512),
                chunk_overlap_tokens: parse_or(lookup("CHUNK_OVERLAP_TOKENS"), 40),
                retrieval_top_k: parse_or(lookup("RETRIEVAL_TOP_K"), 4),
                max_context_tokens: parse_or(lookup("MAX_CONTEXT_TOKENS"), 3_000),
                max_output_tokens: parse_or(lookup("MAX_OUTPUT_TOKENS"), 512),
                chat_history_turns: parse_or(lookup("CHAT_HISTORY_TURNS"), 8),
            },
        }
    }

    pub fn index_root(&self) -> PathBuf {
        self.storage_dir.join("indexes")
    }

    pub fn index_dir(&self, index_id: &str) -> PathBuf {
        self.index_root().join(index_id)
    }

    pub fn sqlite_dsn(&self) -> String {
        format!("sqlite://{}", self.storage_dir.join("docqa.sqlite3").display())
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}
