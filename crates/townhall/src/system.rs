//! Top-level assembly of the memory subsystem.
//!
//! `MemorySystem::open` wires the canonical store, the vector index, and
//! the llama-server client together from a [`Config`]; callers then hand
//! out retrievers and spawn the chronicle worker against a transport.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::chronicle::ChronicleWorker;
use crate::config::Config;
use crate::embeddings::EmbeddingService;
use crate::llm::LlmWorker;
use crate::memory_db::MemoryDatabase;
use crate::retriever::Retriever;
use crate::transport::{ChatTransport, RedisTransport};
use crate::vector_index::{LoadOutcome, VectorIndex};

/// Handle to a running chronicle worker. Dropping it closes the shutdown
/// channel, which the worker reads as a stop signal; call
/// [`shutdown`](ChronicleHandle::shutdown) to also wait for the loop to
/// exit.
pub struct ChronicleHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ChronicleHandle {
    /// Signals the worker and waits for its loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Chronicle task ended abnormally: {}", e);
        }
    }
}

pub struct MemorySystem {
    config: Config,
    db: Arc<MemoryDatabase>,
    index: Arc<VectorIndex>,
    embedder: Arc<EmbeddingService>,
    llm: Arc<LlmWorker>,
}

impl MemorySystem {
    /// Opens the database and index artifacts named by `config` and builds
    /// the llama-server client. Does not touch Redis; transports are
    /// connected separately so the store stays usable offline.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let db = Arc::new(
            MemoryDatabase::new(&config.db_path)
                .with_context(|| format!("opening summary db at {}", config.db_path.display()))?,
        );

        let index = Arc::new(VectorIndex::new(&config.index_path, config.vector_dimension));
        match index.load_or_create()? {
            LoadOutcome::Loaded(n) => info!("Vector index loaded with {} entries", n),
            LoadOutcome::StartedEmpty => info!("Starting with a fresh vector index"),
            LoadOutcome::Recovered => warn!(
                "Vector index artifacts were unreadable and have been discarded; \
                 run rebuild_index() to repopulate from the summary store"
            ),
        }

        let llm = Arc::new(LlmWorker::new(
            config.backend_url.clone(),
            config.summary_word_limit,
        ));
        let embedder = Arc::new(EmbeddingService::new(
            Arc::clone(&llm),
            config.vector_dimension,
        ));

        Ok(Self {
            config,
            db,
            index,
            embedder,
            llm,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> Arc<MemoryDatabase> {
        Arc::clone(&self.db)
    }

    pub fn retriever(&self) -> Retriever {
        let embedder: Arc<dyn crate::embeddings::EmbeddingProvider> = self.embedder.clone();
        Retriever::new(Arc::clone(&self.db), Arc::clone(&self.index), embedder)
    }

    /// Connects to the Redis configured in `config.redis_url` and verifies
    /// it answers a PING.
    pub async fn connect_transport(&self) -> anyhow::Result<RedisTransport> {
        RedisTransport::connect(&self.config.redis_url)
            .await
            .with_context(|| format!("connecting to redis at {}", self.config.redis_url))
    }

    /// Spawns the chronicle worker against `transport` and returns a handle
    /// for graceful shutdown.
    pub fn spawn_chronicle(&self, transport: Arc<dyn ChatTransport>) -> ChronicleHandle {
        let model: Arc<dyn crate::llm::SummaryModel> = self.llm.clone();
        let embedder: Arc<dyn crate::embeddings::EmbeddingProvider> = self.embedder.clone();
        let worker = ChronicleWorker::new(
            &self.config,
            transport,
            model,
            embedder,
            Arc::clone(&self.db),
            Arc::clone(&self.index),
        );
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(rx));
        ChronicleHandle { shutdown, task }
    }

    /// Drops the in-memory index and replays every stored summary into it,
    /// rewriting the on-disk artifacts. Intended for operator use after a
    /// [`LoadOutcome::Recovered`] start or a suspected store/index skew.
    pub async fn rebuild_index(&self) -> anyhow::Result<usize> {
        let index = Arc::clone(&self.index);
        let db = Arc::clone(&self.db);
        let rebuilt = tokio::task::spawn_blocking(move || index.rebuild_from_store(&db))
            .await
            .context("index rebuild task panicked")??;
        info!("Vector index rebuilt with {} entries", rebuilt);
        Ok(rebuilt)
    }
}
