//! Shared embedding service.
//!
//! The embedding backend is expensive to warm up and offers no internal
//! concurrency guarantees, so one service instance is constructed at
//! startup and shared by handle. The first caller pays the warmup cost
//! exactly once (concurrent first-callers block on that single warmup
//! rather than racing duplicates), and every call afterwards is serialized
//! through a lock.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::info;

use crate::error::{MemoryError, Result};
use crate::llm::LlmWorker;

/// Text -> fixed-dimension vector. The chronicle worker and retriever both
/// go through this trait so tests can plug in deterministic embedders.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dimension(&self) -> usize;
}

pub struct EmbeddingService {
    worker: Arc<LlmWorker>,
    dimension: usize,
    warmup: OnceCell<()>,
    call_guard: Mutex<()>,
}

impl EmbeddingService {
    pub fn new(worker: Arc<LlmWorker>, dimension: usize) -> Self {
        Self {
            worker,
            dimension,
            warmup: OnceCell::new(),
            call_guard: Mutex::new(()),
        }
    }

    /// Single-flight warmup: the first embed triggers the backend's model
    /// load and verifies the served dimension matches the configured one.
    async fn ensure_ready(&self) -> Result<()> {
        self.warmup
            .get_or_try_init(|| async {
                let probe = self.worker.generate_embedding("townhall warmup").await?;
                if probe.len() != self.dimension {
                    return Err(MemoryError::DimensionMismatch {
                        expected: self.dimension,
                        actual: probe.len(),
                    });
                }
                info!("Embedding backend ready ({}-dimensional)", self.dimension);
                Ok(())
            })
            .await
            .copied()
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.ensure_ready().await?;
        // The backend owns shared model state; one call at a time.
        let _guard = self.call_guard.lock().await;
        let embedding = self.worker.generate_embedding(text).await?;
        if embedding.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
