pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod ollama;
pub mod openai;
pub mod qdrant_store;
pub mod retrieval;
pub mod server;
pub mod tantivy_store;
pub mod uploads;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use server::{run_server, AppState};
