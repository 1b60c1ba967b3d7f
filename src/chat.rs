use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::Semaphore;

use crate::config::AppConfig;
use crate::db::Database;
use crate::error::client_error;
use crate::index::DocumentIndex;
use crate::llm::ModelRouter;
use crate::models::{Answer, RetrievalResult};
use crate::retrieval::Retriever;

pub const NO_CONTEXT_MESSAGE: &str = "No relevant content found in the indexed documents.";
pub const DEFAULT_SESSION: &str = "default";

#[derive(Clone)]
pub struct AnswerService {
    config: AppConfig,
    db: Database,
    models: ModelRouter,
    retriever: Retriever,
    generation_limit: Arc<Semaphore>,
}

impl AnswerService {
    pub fn new(
        config: AppConfig,
        db: Database,
        models: ModelRouter,
        retriever: Retriever,
        generation_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            config,
            db,
            models,
            retriever,
            generation_limit,
        }
    }

    /// One-shot question with no conversation memory.
    pub async fn query(&self, index: &DocumentIndex, question: &str) -> Result<Answer> {
        let question = validate_question(question)?;
        self.answer(index, question, &[]).await
    }

    /// Question answered in the context of the session's previous turns.
    pub async fn chat(
        &self,
        index: &DocumentIndex,
        session_id: &str,
        question: &str,
    ) -> Result<Answer> {
        let question = validate_question(question)?;

        let history = self
            .db
            .latest_messages(session_id, self.config.tokens.chat_history_turns as i64)
            .await?;
        let answer = self.answer(index, question, &history).await?;

        // A failed answer leaves no half turn in the session.
        self.db.save_message(session_id, "user", question).await?;
        self.db
            .save_message(session_id, "assistant", &answer.response)
            .await?;
        Ok(answer)
    }

    async fn answer(
        &self,
        index: &DocumentIndex,
        question: &str,
        history: &[(String, String)],
    ) -> Result<Answer> {
        let started = Instant::now();
        let retrieval_query = retrieval_query(question, history);
        let retrieved = self
            .retriever
            .retrieve(index, &retrieval_query, self.config.tokens.retrieval_top_k)
            .await?;

        let context = trim_to_context_budget(retrieved, self.config.tokens.max_context_tokens);
        if context.is_empty() {
            return Ok(Answer {
                response: NO_CONTEXT_MESSAGE.to_string(),
                sources: vec![],
            });
        }

        let prompt = build_answer_prompt(question, &build_context(&context), history);
        let generator = self.models.generator().await;

        let _permit = self.generation_limit.acquire().await?;
        let response = generator
            .generate(&prompt, self.config.tokens.max_output_tokens, 0.1)
            .await?;

        tracing::info!(
            "answered with {} from {} chunks in {} ms",
            generator.describe(),
            context.len(),
            started.elapsed().as_millis()
        );

        Ok(Answer {
            response: sanitize_model_output(response),
            sources: unique_sources(&context),
        })
    }
}

fn validate_question(question: &str) -> Result<&str> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(client_error("Query must not be empty."));
    }
    Ok(trimmed)
}

/// Follow-up questions often lean on the previous user turn for their subject.
fn retrieval_query(question: &str, history: &[(String, String)]) -> String {
    let previous = history
        .iter()
        .rev()
        .find(|(role, _)| role == "user")
        .map(|(_, text)| text.as_str());

    match previous {
        Some(previous) if question.split_whitespace().count() < 6 => {
            format!("{previous} {question}")
        }
        _ => question.to_string(),
    }
}

fn trim_to_context_budget(
    retrieved: Vec<RetrievalResult>,
    max_tokens: usize,
) -> Vec<RetrievalResult> {
    let mut kept = Vec::new();
    let mut total_tokens = 0usize;

    for item in retrieved {
        let chunk_tokens = item.chunk.token_count.max(0) as usize;
        if total_tokens + chunk_tokens > max_tokens {
            continue;
        }
        total_tokens += chunk_tokens;
        kept.push(item);
    }

    kept
}

fn build_context(sources: &[RetrievalResult]) -> String {
    let mut context = String::new();
    for (idx, item) in sources.iter().enumerate() {
        context.push_str(&format!(
            "[{}] source={}\n{}\n\n",
            idx + 1,
            item.chunk.source,
            item.chunk.content
        ));
    }
    context
}

fn build_answer_prompt(question: &str, context: &str, history: &[(String, String)]) -> String {
    let history_text = if history.is_empty() {
        "(none)".to_string()
    } else {
        history
            .iter()
            .map(|(role, text)| format!("{role}: {text}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "You answer questions about the user's uploaded documents.\n\
         Rules: Use only the provided context. Do not invent facts. If the context does not \
         contain the answer, say so plainly. Never wrap your answer in code fences.\n\n\
         Conversation:\n{history_text}\n\n\
         Context:\n{context}\
         Question:\n{question}\n"
    )
}

fn sanitize_model_output(answer: String) -> String {
    let text = answer.trim();
    let Some(inner) = text.strip_prefix("```") else {
        return text.to_string();
    };

    // An opening fence may carry a language tag on its own line.
    let inner = match inner.split_once('\n') {
        Some((tag, rest)) if !tag.trim().contains(' ') => rest,
        _ => inner,
    };
    inner.trim_end().trim_end_matches("```").trim().to_string()
}

/// Source names of the context chunks, first occurrence wins.
fn unique_sources(context: &[RetrievalResult]) -> Vec<String> {
    let mut seen = HashSet::new();
    context
        .iter()
        .filter(|item| seen.insert(item.chunk.source.as_str()))
        .map(|item| item.chunk.source.clone())
        .collect()
}
