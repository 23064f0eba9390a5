//! Schema definitions for the townhall memory database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::transport::StreamId;

/// A durable summary row: the unit of long-term chronicle memory.
///
/// Rows are append-only. They are created by the chronicle worker after a
/// successful model call, never updated, never deleted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub id: i64,
    pub stream_name: String,
    pub start_msg_id: String,
    pub end_msg_id: String,
    pub summary_text: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a summary row, validated before it reaches SQL.
#[derive(Debug, Clone)]
pub struct NewSummary {
    pub stream_name: String,
    pub start_msg_id: String,
    pub end_msg_id: String,
    pub summary_text: String,
    pub embedding: Vec<f32>,
}

impl NewSummary {
    /// Reject malformed payloads at the store boundary: empty text, empty
    /// embeddings, boundary ids that are not well-formed `millis-seq`, or
    /// an inverted range.
    pub fn validate(&self) -> Result<()> {
        if self.stream_name.trim().is_empty() {
            return Err(MemoryError::InvalidRecord("stream name is empty".into()));
        }
        if self.summary_text.trim().is_empty() {
            return Err(MemoryError::InvalidRecord("summary text is empty".into()));
        }
        if self.embedding.is_empty() {
            return Err(MemoryError::InvalidRecord("embedding is empty".into()));
        }
        let start: StreamId = self.start_msg_id.parse()?;
        let end: StreamId = self.end_msg_id.parse()?;
        if start > end {
            return Err(MemoryError::InvalidRecord(format!(
                "range start {} is after range end {}",
                start, end
            )));
        }
        Ok(())
    }

    /// Parsed start boundary, the source of the numeric mirror columns.
    pub fn start_id(&self) -> Result<StreamId> {
        self.start_msg_id.parse()
    }
}

pub const SCHEMA_SQL: &str = "
-- Summaries table: source of truth for chronicle memory.
-- start_millis/start_seq mirror start_msg_id numerically: stream ids order
-- by (millis, seq), and the text form compares lexically once the seq
-- component grows a digit.
CREATE TABLE IF NOT EXISTS summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_name TEXT NOT NULL,
    start_msg_id TEXT NOT NULL,
    end_msg_id TEXT NOT NULL,
    start_millis INTEGER NOT NULL,
    start_seq INTEGER NOT NULL,
    summary_text TEXT NOT NULL,
    embedding BLOB NOT NULL,
    created_at TIMESTAMP NOT NULL,
    UNIQUE(stream_name, start_msg_id, end_msg_id)
);
-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_summaries_stream ON summaries (stream_name);
CREATE INDEX IF NOT EXISTS idx_summaries_start ON summaries (stream_name, start_millis, start_seq);
CREATE INDEX IF NOT EXISTS idx_summaries_end_msg ON summaries (end_msg_id);
CREATE INDEX IF NOT EXISTS idx_summaries_created ON summaries (created_at);
";

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> NewSummary {
        NewSummary {
            stream_name: "townhall".into(),
            start_msg_id: "100-0".into(),
            end_msg_id: "110-0".into(),
            summary_text: "The mayor opened the meeting.".into(),
            embedding: vec![1.0, 0.0],
        }
    }

    #[test]
    fn valid_payload_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn empty_text_is_rejected() {
        let mut summary = valid();
        summary.summary_text = "   ".into();
        assert!(matches!(
            summary.validate(),
            Err(MemoryError::InvalidRecord(_))
        ));
    }

    #[test]
    fn malformed_boundary_id_is_rejected() {
        let mut summary = valid();
        summary.start_msg_id = "not-an-id".into();
        assert!(summary.validate().is_err());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut summary = valid();
        summary.start_msg_id = "200-0".into();
        summary.end_msg_id = "100-0".into();
        assert!(matches!(
            summary.validate(),
            Err(MemoryError::InvalidRecord(_))
        ));
    }
}
