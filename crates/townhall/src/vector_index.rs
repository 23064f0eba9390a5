//! Flat inner-product vector index over chronicle summaries.
//!
//! Cosine similarity via normalized inner product: every vector is scaled
//! to unit length on the way in, so a plain dot product against a likewise
//! normalized query is the cosine of the angle between them.
//!
//! The index is a derived cache. SQLite stays the source of truth, and a
//! damaged on-disk index is recovered by starting empty or by replaying the
//! canonical rows through `rebuild_from_store`.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::error::{MemoryError, Result};
use crate::memory_db::MemoryDatabase;

/// Row-major unit vectors plus the parallel ordinal -> summary id array.
/// The two must stay the same length at all times; that parity is the
/// index's structural invariant.
#[derive(Debug, Default)]
struct IndexState {
    vectors: Vec<f32>,
    ids: Vec<i64>,
}

impl IndexState {
    fn check_parity(&self, dimension: usize) -> Result<()> {
        let stored = self.vectors.len() / dimension;
        if self.vectors.len() % dimension != 0 || stored != self.ids.len() {
            return Err(MemoryError::CorruptIndex(format!(
                "stored vector count {} disagrees with id array length {}",
                stored,
                self.ids.len()
            )));
        }
        Ok(())
    }
}

/// What `load_or_create` found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Both artifacts present and consistent; holds the vector count.
    Loaded(usize),
    /// No persisted artifacts; a fresh empty index.
    StartedEmpty,
    /// Artifacts present but unusable; the cache was reset to empty.
    Recovered,
}

/// Brute-force nearest-neighbor cache keyed to summary row ids.
///
/// One lock guards everything: this is a point-in-time-consistent cache,
/// not a concurrent data structure.
pub struct VectorIndex {
    dimension: usize,
    vector_path: PathBuf,
    ids_path: PathBuf,
    state: Mutex<IndexState>,
}

impl VectorIndex {
    /// Create an empty index persisting to `<base>.vec` / `<base>.ids`.
    pub fn new(base_path: impl AsRef<Path>, dimension: usize) -> Self {
        let base = base_path.as_ref();
        Self {
            dimension,
            vector_path: append_extension(base, "vec"),
            ids_path: append_extension(base, "ids"),
            state: Mutex::new(IndexState::default()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scale to unit length, rejecting dimension mismatches and the
    /// direction-less zero vector.
    fn normalize(&self, embedding: &[f32]) -> Result<Vec<f32>> {
        if embedding.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            return Err(MemoryError::ZeroVector);
        }
        Ok(embedding.iter().map(|x| x / norm).collect())
    }

    /// Add one embedding under a summary row id. In-memory only; call
    /// `save` to persist.
    pub fn add(&self, external_id: i64, embedding: &[f32]) -> Result<()> {
        let unit = self.normalize(embedding)?;
        let mut state = self.state.lock().unwrap();
        if state.ids.contains(&external_id) {
            return Err(MemoryError::AlreadyIndexed(external_id));
        }
        state.vectors.extend_from_slice(&unit);
        state.ids.push(external_id);
        state.check_parity(self.dimension)
    }

    /// Top-`k` summary ids by cosine similarity, descending. Returns only
    /// as many entries as the index holds; empty index means empty result.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>> {
        let unit = self.normalize(query)?;
        let state = self.state.lock().unwrap();
        if state.ids.is_empty() {
            return Ok(Vec::new());
        }
        state.check_parity(self.dimension)?;

        let mut scored: Vec<(i64, f32)> = state
            .vectors
            .chunks_exact(self.dimension)
            .zip(state.ids.iter())
            .map(|(row, &id)| (id, dot(row, &unit)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Persist both artifacts. Each file is written to a temp path and
    /// renamed into place, so a crash mid-save never leaves a half-written
    /// file; if it lands between the two renames, the pair disagrees and
    /// the next `load_or_create` resets the cache.
    pub fn save(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        state.check_parity(self.dimension)?;
        if let Some(parent) = self.vector_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        write_atomic(&self.vector_path, &bincode::serialize(&state.vectors)?)?;
        write_atomic(&self.ids_path, &bincode::serialize(&state.ids)?)?;
        info!(
            "Saved vector index ({} vectors) to {}",
            state.ids.len(),
            self.vector_path.display()
        );
        Ok(())
    }

    /// Load the persisted pair, or start empty.
    ///
    /// Missing, unreadable, or mismatched artifacts reset the cache to
    /// empty. That discards derived data only and is always logged; the
    /// canonical store can repopulate it via `rebuild_from_store`.
    pub fn load_or_create(&self) -> Result<LoadOutcome> {
        let mut state = self.state.lock().unwrap();
        if !self.vector_path.exists() || !self.ids_path.exists() {
            *state = IndexState::default();
            info!(
                "No persisted vector index at {}; starting empty",
                self.vector_path.display()
            );
            return Ok(LoadOutcome::StartedEmpty);
        }
        match self.read_artifacts() {
            Ok(loaded) => {
                let count = loaded.ids.len();
                *state = loaded;
                info!(
                    "Loaded vector index ({} vectors) from {}",
                    count,
                    self.vector_path.display()
                );
                Ok(LoadOutcome::Loaded(count))
            }
            Err(e) => {
                warn!(
                    "Vector index at {} is unusable ({}); resetting to an empty cache",
                    self.vector_path.display(),
                    e
                );
                *state = IndexState::default();
                Ok(LoadOutcome::Recovered)
            }
        }
    }

    fn read_artifacts(&self) -> Result<IndexState> {
        let vectors: Vec<f32> = bincode::deserialize(&fs::read(&self.vector_path)?)?;
        let ids: Vec<i64> = bincode::deserialize(&fs::read(&self.ids_path)?)?;
        let state = IndexState { vectors, ids };
        state.check_parity(self.dimension)?;
        Ok(state)
    }

    /// Replay the canonical store into a fresh index, in primary-key order,
    /// and persist the result. The recovery path for a reset cache.
    pub fn rebuild_from_store(&self, db: &MemoryDatabase) -> Result<usize> {
        let records = db.summaries.get_all_ordered_by_id()?;
        {
            let mut state = self.state.lock().unwrap();
            *state = IndexState::default();
        }
        for record in &records {
            self.add(record.id, &record.embedding)?;
        }
        self.save()?;
        info!(
            "Rebuilt vector index from canonical store: {} summaries",
            records.len()
        );
        Ok(records.len())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = append_extension(path, "tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
