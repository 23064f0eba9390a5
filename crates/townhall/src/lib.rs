//! Memory subsystem for a multi-agent townhall chat simulation.
//!
//! Speaker agents converse through an append-only Redis stream; a rolling
//! chronicle worker condenses batches of that stream into summary records.
//! SQLite holds the canonical rows, a flat vector index caches their
//! normalized embeddings for cosine search, and the retriever joins the two
//! to answer natural-language queries about past conversation.

pub mod chronicle;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod memory_db;
pub mod retriever;
pub mod system;
pub mod telemetry;
pub mod transport;
pub mod vector_index;

// Public API exports
pub use chronicle::{ChronicleWorker, CycleOutcome};
pub use config::Config;
pub use embeddings::{EmbeddingProvider, EmbeddingService};
pub use error::{MemoryError, Result};
pub use llm::{LlmWorker, SummaryModel};
pub use memory_db::{MemoryDatabase, NewSummary, SummaryRecord, SummaryStore};
pub use retriever::{RetrievalHit, Retriever};
pub use system::{ChronicleHandle, MemorySystem};
pub use transport::{ChatTransport, RedisTransport, StreamId, StreamMessage};
pub use vector_index::{LoadOutcome, VectorIndex};
