//! Rolling chronicle worker.
//!
//! Wakes on a fixed interval, peeks at the townhall stream past its
//! watermark, and once a full batch has accumulated condenses it into one
//! summary row plus one vector index entry. The watermark only advances
//! after both writes land, so a failed or crashed cycle re-reads the same
//! range on the next wake.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::embeddings::EmbeddingProvider;
use crate::error::Result;
use crate::llm::SummaryModel;
use crate::memory_db::{MemoryDatabase, NewSummary};
use crate::transport::{format_transcript, ChatTransport, StreamId};
use crate::vector_index::VectorIndex;

/// Per-cycle result, surfaced for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Not enough unread events yet; nothing was consumed.
    BelowThreshold(usize),
    /// A batch was summarized and persisted; the watermark moved to `end`.
    Summarized {
        start: StreamId,
        end: StreamId,
        summary_id: i64,
    },
    /// The retry budget ran out. Watermark unchanged; the same range comes
    /// back on the next wake, so transient model failures self-heal.
    Exhausted,
}

/// Summarization result as a value, not an error: exhaustion is an
/// expected outcome the caller handles, not an exception to catch.
enum SummarizeOutcome {
    Summary(String),
    Exhausted,
}

pub struct ChronicleWorker {
    stream_name: String,
    events_before_summary: usize,
    poll_interval: Duration,
    summary_retries: u32,
    failure_backoff: Duration,
    transport: Arc<dyn ChatTransport>,
    model: Arc<dyn SummaryModel>,
    embedder: Arc<dyn EmbeddingProvider>,
    db: Arc<MemoryDatabase>,
    index: Arc<VectorIndex>,
    cursor: Option<StreamId>,
}

impl ChronicleWorker {
    pub fn new(
        config: &Config,
        transport: Arc<dyn ChatTransport>,
        model: Arc<dyn SummaryModel>,
        embedder: Arc<dyn EmbeddingProvider>,
        db: Arc<MemoryDatabase>,
        index: Arc<VectorIndex>,
    ) -> Self {
        Self {
            stream_name: config.stream_name.clone(),
            events_before_summary: config.events_before_summary,
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            summary_retries: config.summary_retries,
            failure_backoff: Duration::from_secs(config.failure_backoff_seconds),
            transport,
            model,
            embedder,
            db,
            index,
            cursor: None,
        }
    }

    /// Boundary id of the last successfully summarized event.
    pub fn cursor(&self) -> Option<StreamId> {
        self.cursor
    }

    /// Main loop. Runs until the shutdown signal flips. A failing cycle is
    /// logged and followed by a short backoff; only shutdown ends the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Chronicle worker watching stream '{}' (threshold {}, every {:?})",
            self.stream_name, self.events_before_summary, self.poll_interval
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Chronicle worker shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                Ok(CycleOutcome::Summarized { start, end, summary_id }) => {
                    info!("Chronicled {}..{} as summary {}", start, end, summary_id);
                }
                Ok(CycleOutcome::Exhausted) => {
                    warn!(
                        "Summarization budget ({}) exhausted; range will be retried next wake",
                        self.summary_retries
                    );
                }
                Ok(CycleOutcome::BelowThreshold(count)) => {
                    debug!(
                        "{} unread events on '{}', below threshold {}",
                        count, self.stream_name, self.events_before_summary
                    );
                }
                Err(e) => {
                    error!("Chronicle cycle failed: {}", e);
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(self.failure_backoff) => {}
                    }
                }
            }
        }
    }

    /// One wake: fetch, gate on the threshold, summarize, embed, persist.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let batch = self
            .transport
            .read_after(&self.stream_name, self.cursor, self.events_before_summary)
            .await?;
        if batch.len() < self.events_before_summary {
            return Ok(CycleOutcome::BelowThreshold(batch.len()));
        }
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Ok(CycleOutcome::BelowThreshold(0));
        };
        let (start, end) = (first.id, last.id);

        let transcript = format_transcript(&batch);
        let summary_text = match self.summarize_with_retries(&transcript).await {
            SummarizeOutcome::Summary(text) => text,
            SummarizeOutcome::Exhausted => return Ok(CycleOutcome::Exhausted),
        };

        // Embed once; the same vector goes to both stores.
        let embedding = self.embedder.embed(&summary_text).await?;

        // Canonical store first, then the derived cache. A crash in between
        // leaves the cache one entry behind, which a reload or rebuild
        // absorbs; the reverse order could leave the cache pointing at a
        // row that was never durably written.
        let summary_id = self.db.summaries.insert_summary(&NewSummary {
            stream_name: self.stream_name.clone(),
            start_msg_id: start.to_string(),
            end_msg_id: end.to_string(),
            summary_text,
            embedding: embedding.clone(),
        })?;
        self.index.add(summary_id, &embedding)?;
        self.index.save()?;

        self.cursor = Some(end);
        Ok(CycleOutcome::Summarized {
            start,
            end,
            summary_id,
        })
    }

    /// Flat retry loop over the model call; attempts are not differentiated
    /// by backoff. Exhaustion is returned as a value.
    async fn summarize_with_retries(&self, transcript: &str) -> SummarizeOutcome {
        for attempt in 1..=self.summary_retries {
            match self.model.summarize(transcript).await {
                Ok(text) if !text.trim().is_empty() => {
                    return SummarizeOutcome::Summary(text);
                }
                Ok(_) => warn!(
                    "Summarizer returned empty text (attempt {}/{})",
                    attempt, self.summary_retries
                ),
                Err(e) => warn!(
                    "Summarization attempt {}/{} failed: {}",
                    attempt, self.summary_retries, e
                ),
            }
        }
        SummarizeOutcome::Exhausted
    }
}
