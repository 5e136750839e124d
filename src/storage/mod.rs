//! Storage layer for run checkpoints
//!
//! The coordinator writes a checkpoint of the [`SharedState`] after every
//! superstep through a [`StateStore`]. Two backends ship with the crate: an
//! in-memory map for tests and embedding, and a compressed sled database.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use async_trait::async_trait;

use crate::coord::state::SharedState;
use crate::coord::types::{RunStatus, Seed};
use crate::core::errors::{BoardError, Result};

/// Which runs `list` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    Any,
    Only(RunStatus),
}

impl StatusFilter {
    pub fn matches(&self, status: RunStatus) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::Only(wanted) => *wanted == status,
        }
    }
}

impl From<RunStatus> for StatusFilter {
    fn from(status: RunStatus) -> Self {
        StatusFilter::Only(status)
    }
}

/// Persistence contract for run states
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Store a new run; fails with `RunAlreadyExists` if the id is taken
    async fn create(&self, state: &SharedState) -> Result<()>;

    async fn get(&self, run_id: &str) -> Result<Option<SharedState>>;

    /// Replace a stored run. Fails with `RunNotFound` for unknown ids and with
    /// `Archived` once the stored copy is terminal.
    async fn update(&self, state: &SharedState) -> Result<()>;

    /// Runs matching `filter`, most recently updated first, at most `limit`
    async fn list(&self, filter: StatusFilter, limit: usize) -> Result<Vec<SharedState>>;

    /// Remove a run; returns whether it existed
    async fn delete(&self, run_id: &str) -> Result<bool>;

    /// Validate a seed, create its initial state and store it
    async fn create_from_seed(&self, seed: Seed) -> Result<SharedState> {
        let state = SharedState::init(seed)?;
        self.create(&state).await?;
        Ok(state)
    }
}

/// Rejects overwriting a checkpoint that already reached a terminal status
pub(crate) fn ensure_writable(stored: &SharedState) -> Result<()> {
    if stored.is_terminal() {
        return Err(BoardError::Archived {
            run_id: stored.run_id().to_string(),
            status: stored.status().to_string(),
        });
    }
    Ok(())
}

/// Apply the listing order shared by all backends
pub(crate) fn newest_first(mut states: Vec<SharedState>, limit: usize) -> Vec<SharedState> {
    states.sort_by(|a, b| {
        b.updated_at()
            .cmp(&a.updated_at())
            .then_with(|| a.run_id().cmp(b.run_id()))
    });
    states.truncate(limit);
    states
}
