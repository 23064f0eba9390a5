//! Model backend boundary.
//!
//! Speaks the OpenAI-compatible wire format of a local llama-server process
//! for both chat completions (summarization) and embeddings. The chronicle
//! worker only sees the `SummaryModel` trait, so tests swap the backend out.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MemoryError, Result};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Summarization seam for the chronicle worker.
#[async_trait]
pub trait SummaryModel: Send + Sync {
    /// Condense a role-prefixed transcript into summary text.
    async fn summarize(&self, transcript: &str) -> Result<String>;
}

pub struct LlmWorker {
    backend_url: String,
    summary_word_limit: usize,
    http_client: reqwest::Client,
}

impl LlmWorker {
    pub fn new(backend_url: String, summary_word_limit: usize) -> Self {
        info!("LLM worker initialized with backend: {}", backend_url);
        Self {
            backend_url,
            summary_word_limit,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.backend_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.backend_url)
    }

    pub async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        debug!("LLM worker generating embedding ({} chars)", text.len());
        let request = EmbeddingRequest {
            model: "local-embedding".to_string(),
            input: vec![text.to_string()],
        };
        let response = self
            .http_client
            .post(self.embeddings_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| MemoryError::Backend(format!("embedding request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(MemoryError::Backend(format!(
                "embedding backend returned {}",
                response.status()
            )));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::Backend(format!("invalid embedding response: {}", e)))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| MemoryError::Backend("embedding response contained no data".into()))
    }
}

#[async_trait]
impl SummaryModel for LlmWorker {
    async fn summarize(&self, transcript: &str) -> Result<String> {
        debug!("LLM worker generating chronicle summary");
        let request = ChatCompletionRequest {
            model: "local-llm".to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: format!(
                        "You are the town chronicler. Condense the townhall transcript \
                         into a factual third-person summary of at most {} words. \
                         Keep speaker names.",
                        self.summary_word_limit
                    ),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: transcript.to_string(),
                },
            ],
            max_tokens: 512,
            temperature: 0.3,
            stream: false,
        };
        let response = self
            .http_client
            .post(self.completions_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| MemoryError::Backend(format!("summarization request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(MemoryError::Backend(format!(
                "summarization backend returned {}",
                response.status()
            )));
        }
        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::Backend(format!("invalid chat response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|message| message.content.trim().to_string())
            .ok_or_else(|| MemoryError::Backend("chat response contained no choices".into()))
    }
}
