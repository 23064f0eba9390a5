//! Summary storage and retrieval operations.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{NewSummary, SummaryRecord};
use crate::transport::StreamId;

const COLUMNS: &str = "id, stream_name, start_msg_id, end_msg_id, summary_text, embedding, created_at";

/// Queries against the `summaries` table. Cheap to clone handles out of
/// `MemoryDatabase`; all access funnels through the single pooled connection.
pub struct SummaryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SummaryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Insert one summary row, returning its assigned id.
    ///
    /// A `(stream_name, start_msg_id, end_msg_id)` collision surfaces as
    /// `DuplicateRecord` with nothing written.
    pub fn insert_summary(&self, summary: &NewSummary) -> Result<i64> {
        summary.validate()?;
        let start = summary.start_id()?;
        let embedding_bytes = bincode::serialize(&summary.embedding)?;
        let conn = self.get_conn()?;

        debug!(
            "Storing summary for stream {} ({} to {})",
            summary.stream_name, summary.start_msg_id, summary.end_msg_id
        );

        conn.execute(
            "INSERT INTO summaries
             (stream_name, start_msg_id, end_msg_id, start_millis, start_seq,
              summary_text, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &summary.stream_name,
                &summary.start_msg_id,
                &summary.end_msg_id,
                start.millis as i64,
                start.seq as i64,
                &summary.summary_text,
                embedding_bytes,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| map_duplicate(e, summary))?;

        Ok(conn.last_insert_rowid())
    }

    /// Batch insert in a single transaction; any duplicate aborts the whole
    /// batch and no rows are written.
    pub fn insert_summaries(&self, summaries: &[NewSummary]) -> Result<Vec<i64>> {
        for summary in summaries {
            summary.validate()?;
        }
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let start = summary.start_id()?;
            let embedding_bytes = bincode::serialize(&summary.embedding)?;
            tx.execute(
                "INSERT INTO summaries
                 (stream_name, start_msg_id, end_msg_id, start_millis, start_seq,
                  summary_text, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    &summary.stream_name,
                    &summary.start_msg_id,
                    &summary.end_msg_id,
                    start.millis as i64,
                    start.seq as i64,
                    &summary.summary_text,
                    embedding_bytes,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| map_duplicate(e, summary))?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Summaries for a stream, newest first.
    pub fn get_by_stream(&self, stream_name: &str, limit: usize) -> Result<Vec<SummaryRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM summaries
             WHERE stream_name = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2"
        ))?;

        let mut rows = stmt.query(params![stream_name, limit as i64])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            summaries.push(row_to_record(row)?);
        }
        Ok(summaries)
    }

    /// Most recent summary for a stream, if any.
    pub fn get_latest(&self, stream_name: &str) -> Result<Option<SummaryRecord>> {
        Ok(self.get_by_stream(stream_name, 1)?.into_iter().next())
    }

    /// First summary whose range starts after the given boundary id.
    ///
    /// Compares the numeric mirror columns, not the text ids: `100-10`
    /// comes after `100-9` even though it sorts before it lexically.
    pub fn get_after(&self, stream_name: &str, msg_id: StreamId) -> Result<Option<SummaryRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM summaries
             WHERE stream_name = ?1
               AND (start_millis > ?2 OR (start_millis = ?2 AND start_seq > ?3))
             ORDER BY start_millis ASC, start_seq ASC
             LIMIT 1"
        ))?;

        let mut rows = stmt.query(params![
            stream_name,
            msg_id.millis as i64,
            msg_id.seq as i64
        ])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    /// Batch point lookup for the retriever. Results come back in the input
    /// id order so callers can correlate them to search hits; ids with no
    /// row are silently absent.
    pub fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<SummaryRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let query = format!("SELECT {COLUMNS} FROM summaries WHERE id IN ({placeholders})");
        let mut stmt = conn.prepare(&query)?;

        let mut rows = stmt.query(rusqlite::params_from_iter(ids))?;
        let mut by_id = HashMap::with_capacity(ids.len());
        while let Some(row) = rows.next()? {
            let record = row_to_record(row)?;
            by_id.insert(record.id, record);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// All summaries in primary-key order, the replay source for index
    /// rebuilds.
    pub fn get_all_ordered_by_id(&self) -> Result<Vec<SummaryRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM summaries ORDER BY id ASC"))?;

        let mut rows = stmt.query([])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            summaries.push(row_to_record(row)?);
        }
        Ok(summaries)
    }

    pub fn count_for_stream(&self, stream_name: &str) -> Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM summaries WHERE stream_name = ?1",
            [stream_name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn map_duplicate(e: rusqlite::Error, summary: &NewSummary) -> MemoryError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            MemoryError::DuplicateRecord {
                stream: summary.stream_name.clone(),
                start: summary.start_msg_id.clone(),
                end: summary.end_msg_id.clone(),
            }
        }
        _ => MemoryError::Sqlite(e),
    }
}

fn row_to_record(row: &Row) -> Result<SummaryRecord> {
    let embedding_bytes: Vec<u8> = row.get(5)?;
    let embedding: Vec<f32> = bincode::deserialize(&embedding_bytes)?;

    let created_at_str: String = row.get(6)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map_err(|e| MemoryError::InvalidRecord(format!("unparseable created_at: {}", e)))?
        .with_timezone(&Utc);

    Ok(SummaryRecord {
        id: row.get(0)?,
        stream_name: row.get(1)?,
        start_msg_id: row.get(2)?,
        end_msg_id: row.get(3)?,
        summary_text: row.get(4)?,
        embedding,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDatabase;

    fn summary(stream: &str, start: &str, end: &str, text: &str) -> NewSummary {
        NewSummary {
            stream_name: stream.into(),
            start_msg_id: start.into(),
            end_msg_id: end.into(),
            summary_text: text.into(),
            embedding: vec![0.5, 0.5, 0.5],
        }
    }

    #[test]
    fn insert_assigns_increasing_ids() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let first = db
            .summaries
            .insert_summary(&summary("townhall", "100-0", "110-0", "A"))
            .unwrap();
        let second = db
            .summaries
            .insert_summary(&summary("townhall", "111-0", "120-0", "B"))
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn duplicate_range_fails_and_leaves_table_unchanged() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.summaries
            .insert_summary(&summary("townhall", "100-0", "110-0", "A"))
            .unwrap();

        let result = db
            .summaries
            .insert_summary(&summary("townhall", "100-0", "110-0", "B"));
        assert!(matches!(result, Err(MemoryError::DuplicateRecord { .. })));

        assert_eq!(db.summaries.count_for_stream("townhall").unwrap(), 1);
        let latest = db.summaries.get_latest("townhall").unwrap().unwrap();
        assert_eq!(latest.summary_text, "A");
    }

    #[test]
    fn same_range_on_another_stream_is_allowed() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.summaries
            .insert_summary(&summary("townhall", "100-0", "110-0", "A"))
            .unwrap();
        db.summaries
            .insert_summary(&summary("courtroom", "100-0", "110-0", "B"))
            .unwrap();
        assert_eq!(db.summaries.count_for_stream("courtroom").unwrap(), 1);
    }

    #[test]
    fn batch_insert_is_all_or_nothing() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.summaries
            .insert_summary(&summary("townhall", "100-0", "110-0", "A"))
            .unwrap();

        let batch = vec![
            summary("townhall", "111-0", "120-0", "B"),
            // Collides with the pre-existing row.
            summary("townhall", "100-0", "110-0", "C"),
        ];
        let result = db.summaries.insert_summaries(&batch);
        assert!(matches!(result, Err(MemoryError::DuplicateRecord { .. })));
        assert_eq!(db.summaries.count_for_stream("townhall").unwrap(), 1);
    }

    #[test]
    fn reads_return_empty_rather_than_erroring() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        assert!(db.summaries.get_by_stream("townhall", 10).unwrap().is_empty());
        assert!(db.summaries.get_latest("townhall").unwrap().is_none());
        assert!(db
            .summaries
            .get_after("townhall", StreamId::new(100, 0))
            .unwrap()
            .is_none());
        assert!(db.summaries.get_by_ids(&[1, 2, 3]).unwrap().is_empty());
    }

    #[test]
    fn get_after_returns_the_next_range() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.summaries
            .insert_summary(&summary("townhall", "100-0", "110-0", "A"))
            .unwrap();
        db.summaries
            .insert_summary(&summary("townhall", "111-0", "120-0", "B"))
            .unwrap();

        let next = db
            .summaries
            .get_after("townhall", StreamId::new(105, 0))
            .unwrap()
            .unwrap();
        assert_eq!(next.summary_text, "B");
    }

    #[test]
    fn get_after_orders_seq_numerically_not_lexically() {
        // Redis assigns 100-10 after 100-9 once ten entries share a
        // millisecond; text comparison would sort 100-10 before 100-3.
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.summaries
            .insert_summary(&summary("townhall", "100-2", "100-3", "A"))
            .unwrap();
        db.summaries
            .insert_summary(&summary("townhall", "100-10", "100-20", "B"))
            .unwrap();

        let next = db
            .summaries
            .get_after("townhall", StreamId::new(100, 3))
            .unwrap()
            .unwrap();
        assert_eq!(next.summary_text, "B");

        // And nothing starts after the last range.
        assert!(db
            .summaries
            .get_after("townhall", StreamId::new(100, 10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn get_by_ids_preserves_request_order() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let a = db
            .summaries
            .insert_summary(&summary("townhall", "100-0", "110-0", "A"))
            .unwrap();
        let b = db
            .summaries
            .insert_summary(&summary("townhall", "111-0", "120-0", "B"))
            .unwrap();
        let c = db
            .summaries
            .insert_summary(&summary("townhall", "121-0", "130-0", "C"))
            .unwrap();

        let records = db.summaries.get_by_ids(&[c, a, b]).unwrap();
        let texts: Vec<_> = records.iter().map(|r| r.summary_text.as_str()).collect();
        assert_eq!(texts, vec!["C", "A", "B"]);

        // Unknown ids are dropped, order of the rest intact.
        let records = db.summaries.get_by_ids(&[b, 9999, a]).unwrap();
        let texts: Vec<_> = records.iter().map(|r| r.summary_text.as_str()).collect();
        assert_eq!(texts, vec!["B", "A"]);
    }

    #[test]
    fn embedding_round_trips_through_the_blob_column() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let mut payload = summary("townhall", "100-0", "110-0", "A");
        payload.embedding = vec![0.25, -1.5, 3.0];
        let id = db.summaries.insert_summary(&payload).unwrap();

        let record = db.summaries.get_by_ids(&[id]).unwrap().remove(0);
        assert_eq!(record.embedding, vec![0.25, -1.5, 3.0]);
    }

    #[test]
    fn invalid_payload_is_rejected_before_sql() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let mut bad = summary("townhall", "100-0", "110-0", "A");
        bad.summary_text = "".into();
        assert!(db.summaries.insert_summary(&bad).is_err());
        assert_eq!(db.summaries.count_for_stream("townhall").unwrap(), 0);
    }
}
