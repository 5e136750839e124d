//! Sled-backed run store holding zstd-compressed JSON checkpoints

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;

use super::{ensure_writable, newest_first, StateStore, StatusFilter};
use crate::coord::state::SharedState;
use crate::core::errors::{BoardError, Result};

const RUNS_TREE: &str = "planboard_runs";
const COMPRESSION_LEVEL: i32 = 3;

/// Durable store keeping one zstd-compressed JSON checkpoint per run
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    runs: Tree,
}

impl SledStore {
    /// Open (or create) a database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(db)
    }

    /// A throwaway database removed when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let runs = db.open_tree(RUNS_TREE)?;
        Ok(Self { db, runs })
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn encode(state: &SharedState) -> Result<Vec<u8>> {
        let serialized = serde_json::to_vec(state)?;
        zstd::encode_all(&*serialized, COMPRESSION_LEVEL).map_err(|source| BoardError::Io {
            operation: format!("compress checkpoint {}", state.run_id()),
            source,
        })
    }

    fn decode(bytes: &[u8]) -> Result<SharedState> {
        let raw = zstd::decode_all(bytes).map_err(|source| BoardError::Io {
            operation: "decompress checkpoint".to_string(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[async_trait]
impl StateStore for SledStore {
    async fn create(&self, state: &SharedState) -> Result<()> {
        let encoded = Self::encode(state)?;
        let swapped =
            self.runs
                .compare_and_swap(state.run_id(), None as Option<&[u8]>, Some(encoded))?;
        if swapped.is_err() {
            return Err(BoardError::RunAlreadyExists {
                run_id: state.run_id().to_string(),
            });
        }
        self.flush().await?;
        tracing::debug!(run_id = %state.run_id(), "Created run checkpoint");
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<SharedState>> {
        match self.runs.get(run_id)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, state: &SharedState) -> Result<()> {
        let previous = self
            .runs
            .get(state.run_id())?
            .ok_or_else(|| BoardError::RunNotFound {
                run_id: state.run_id().to_string(),
            })?;
        ensure_writable(&Self::decode(&previous)?)?;

        let encoded = Self::encode(state)?;
        let swapped = self
            .runs
            .compare_and_swap(state.run_id(), Some(previous), Some(encoded))?;
        if swapped.is_err() {
            return Err(BoardError::persistence_msg(format!(
                "checkpoint for {} changed during update",
                state.run_id()
            )));
        }
        self.flush().await?;
        tracing::debug!(
            run_id = %state.run_id(),
            status = %state.status(),
            iteration = state.iteration(),
            "Saved run checkpoint"
        );
        Ok(())
    }

    async fn list(&self, filter: StatusFilter, limit: usize) -> Result<Vec<SharedState>> {
        let mut states = Vec::new();
        for entry in self.runs.iter() {
            let (_, bytes) = entry?;
            let state = Self::decode(&bytes)?;
            if filter.matches(state.status()) {
                states.push(state);
            }
        }
        Ok(newest_first(states, limit))
    }

    async fn delete(&self, run_id: &str) -> Result<bool> {
        let removed = self.runs.remove(run_id)?.is_some();
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }
}
