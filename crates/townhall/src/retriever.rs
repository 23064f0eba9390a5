//! Semantic retrieval over chronicled summaries.
//!
//! Joins a vector index search against the canonical summary store: the
//! index proposes row ids by cosine similarity, the store supplies the
//! full records, and hits come back in the index's rank order. Index
//! entries with no surviving row are dropped silently, so a stale index
//! degrades results instead of failing the query.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::embeddings::EmbeddingProvider;
use crate::error::{MemoryError, Result};
use crate::memory_db::{MemoryDatabase, SummaryRecord};
use crate::vector_index::VectorIndex;

/// One retrieved summary with its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct RetrievalHit {
    pub record: SummaryRecord,
    pub score: f32,
}

pub struct Retriever {
    db: Arc<MemoryDatabase>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Retriever {
    pub fn new(
        db: Arc<MemoryDatabase>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            db,
            index,
            embedder,
        }
    }

    /// Top-`k` summaries most similar to `query`, best first.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievalHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed(query).await?;

        let index = Arc::clone(&self.index);
        let matches = tokio::task::spawn_blocking(move || index.search(&embedding, k))
            .await
            .map_err(|e| MemoryError::TaskJoin(e.to_string()))??;
        if matches.is_empty() {
            debug!("Vector index returned no matches for query");
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = matches.iter().map(|(id, _)| *id).collect();
        let records = self.db.summaries.get_by_ids(&ids)?;
        let mut by_id: HashMap<i64, SummaryRecord> =
            records.into_iter().map(|r| (r.id, r)).collect();

        let mut hits = Vec::with_capacity(matches.len());
        for (id, score) in matches {
            match by_id.remove(&id) {
                Some(record) => hits.push(RetrievalHit { record, score }),
                None => warn!(
                    "Index entry {} has no backing summary row; consider rebuilding the index",
                    id
                ),
            }
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::memory_db::NewSummary;

    const DIM: usize = 4;

    /// Maps a handful of known phrases onto fixed axes.
    struct AxisEmbedder;

    fn axis_for(text: &str) -> usize {
        match text {
            t if t.contains("harvest") => 0,
            t if t.contains("bandit") => 1,
            t if t.contains("festival") => 2,
            _ => 3,
        }
    }

    #[async_trait]
    impl EmbeddingProvider for AxisEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0; DIM];
            v[axis_for(text)] = 1.0;
            Ok(v)
        }

        fn dimension(&self) -> usize {
            DIM
        }
    }

    fn seeded_retriever() -> (Retriever, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let index = Arc::new(VectorIndex::new(dir.path().join("retrieve.index"), DIM));

        for text in [
            "The harvest came in early this year.",
            "Scouts reported a bandit camp by the river.",
            "Plans were drawn up for the autumn festival.",
        ] {
            let mut embedding = vec![0.0; DIM];
            embedding[axis_for(text)] = 1.0;
            let id = db
                .summaries
                .insert_summary(&NewSummary {
                    stream_name: "townhall".into(),
                    start_msg_id: "1-0".into(),
                    end_msg_id: format!("{}-0", 10 + axis_for(text)),
                    summary_text: text.into(),
                    embedding: embedding.clone(),
                })
                .unwrap();
            index.add(id, &embedding).unwrap();
        }
        (
            Retriever::new(db, index, Arc::new(AxisEmbedder)),
            dir,
        )
    }

    #[tokio::test]
    async fn retrieves_the_matching_summary_first() {
        let (retriever, _dir) = seeded_retriever();
        let hits = retriever.retrieve("what about the bandit threat?", 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits[0].record.summary_text.contains("bandit"));
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn k_caps_the_result_count() {
        let (retriever, _dir) = seeded_retriever();
        let hits = retriever.retrieve("festival preparations", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].record.summary_text.contains("festival"));
    }

    #[tokio::test]
    async fn empty_index_yields_no_hits() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let index = Arc::new(VectorIndex::new(dir.path().join("empty.index"), DIM));
        let retriever = Retriever::new(db, index, Arc::new(AxisEmbedder));

        let hits = retriever.retrieve("anything at all", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn zero_k_short_circuits() {
        let (retriever, _dir) = seeded_retriever();
        let hits = retriever.retrieve("harvest", 0).await.unwrap();
        assert!(hits.is_empty());
    }
}
