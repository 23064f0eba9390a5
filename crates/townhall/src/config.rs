// townhall/crates/townhall/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Runtime configuration, resolved from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection string for the townhall stream.
    pub redis_url: String,
    /// Logical conversation stream the chronicle worker watches.
    pub stream_name: String,
    /// SQLite file holding the canonical summary rows.
    pub db_path: PathBuf,
    /// Base path for the persisted vector index artifacts.
    pub index_path: PathBuf,
    /// OpenAI-compatible llama-server base URL.
    pub backend_url: String,
    /// Embedding dimension; must match the model served at `backend_url`.
    pub vector_dimension: usize,
    /// Unread events required before a batch is summarized.
    pub events_before_summary: usize,
    /// Chronicle wake interval in seconds.
    pub poll_interval_seconds: u64,
    /// Attempts per batch before summarization is abandoned for the cycle.
    pub summary_retries: u32,
    /// Soft word limit folded into the summarization prompt.
    pub summary_word_limit: usize,
    /// Sleep after an unexpected cycle failure before resuming the loop.
    pub failure_backoff_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let redis_url = env::var("REDIS_URL")
            .context("REDIS_URL environment variable not set. Please set it in your .env file (e.g., REDIS_URL=redis://localhost:6379)")?;

        let llama_host = env::var("LLAMA_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let llama_port: u16 = env::var("LLAMA_PORT").unwrap_or_else(|_| "8081".into()).parse()?;
        let backend_url = format!("http://{}:{}", llama_host, llama_port);

        let config = Self {
            redis_url,
            stream_name: env::var("TOWNHALL_STREAM").unwrap_or_else(|_| "townhall".into()),
            db_path: env::var("TOWNHALL_DB_PATH")
                .unwrap_or_else(|_| "data/townhall.db".into())
                .into(),
            index_path: env::var("VECTOR_INDEX_PATH")
                .unwrap_or_else(|_| "data/townhall.index".into())
                .into(),
            backend_url,
            vector_dimension: env::var("VECTOR_DIMENSION")
                .unwrap_or_else(|_| "768".into())
                .parse()?,
            events_before_summary: env::var("EVENTS_BEFORE_SUMMARY")
                .unwrap_or_else(|_| "10".into())
                .parse()?,
            poll_interval_seconds: env::var("POLL_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "15".into())
                .parse()?,
            summary_retries: env::var("SUMMARY_RETRIES")
                .unwrap_or_else(|_| "3".into())
                .parse()?,
            summary_word_limit: env::var("SUMMARY_WORD_LIMIT")
                .unwrap_or_else(|_| "150".into())
                .parse()?,
            failure_backoff_seconds: env::var("FAILURE_BACKOFF_SECONDS")
                .unwrap_or_else(|_| "5".into())
                .parse()?,
        };

        if config.vector_dimension == 0 {
            anyhow::bail!("VECTOR_DIMENSION must be greater than zero");
        }
        if config.events_before_summary == 0 {
            anyhow::bail!("EVENTS_BEFORE_SUMMARY must be greater than zero");
        }
        // Zero attempts would abandon every batch and stall the cursor.
        if config.summary_retries == 0 {
            anyhow::bail!("SUMMARY_RETRIES must be greater than zero");
        }

        info!(
            "Chronicle configuration: stream '{}', batch threshold {}, poll every {}s, {} retries",
            config.stream_name,
            config.events_before_summary,
            config.poll_interval_seconds,
            config.summary_retries
        );

        Ok(config)
    }
}
