//! In-memory run store for tests and embedding

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use super::{ensure_writable, newest_first, StateStore, StatusFilter};
use crate::coord::state::SharedState;
use crate::core::errors::{BoardError, Result};

/// In-process store backed by a concurrent map
#[derive(Clone, Default)]
pub struct MemoryStore {
    runs: Arc<DashMap<String, SharedState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create(&self, state: &SharedState) -> Result<()> {
        match self.runs.entry(state.run_id().to_string()) {
            Entry::Occupied(_) => Err(BoardError::RunAlreadyExists {
                run_id: state.run_id().to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(state.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, run_id: &str) -> Result<Option<SharedState>> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn update(&self, state: &SharedState) -> Result<()> {
        let mut stored = self
            .runs
            .get_mut(state.run_id())
            .ok_or_else(|| BoardError::RunNotFound {
                run_id: state.run_id().to_string(),
            })?;
        ensure_writable(&stored)?;
        *stored = state.clone();
        Ok(())
    }

    async fn list(&self, filter: StatusFilter, limit: usize) -> Result<Vec<SharedState>> {
        let states = self
            .runs
            .iter()
            .filter(|r| filter.matches(r.value().status()))
            .map(|r| r.value().clone())
            .collect();
        Ok(newest_first(states, limit))
    }

    async fn delete(&self, run_id: &str) -> Result<bool> {
        Ok(self.runs.remove(run_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::types::{RunStatus, Seed, Variant};

    #[tokio::test]
    async fn test_create_get_update_delete() {
        let store = MemoryStore::new();
        let mut state = store
            .create_from_seed(Seed::with_run_id("m1", Variant::NaturalDisaster))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        let err = store.create(&state).await.unwrap_err();
        assert!(matches!(err, BoardError::RunAlreadyExists { .. }));

        state.mark_running();
        store.update(&state).await.unwrap();
        let loaded = store.get("m1").await.unwrap().unwrap();
        assert_eq!(loaded.status(), RunStatus::Running);

        assert!(store.delete("m1").await.unwrap());
        assert!(!store.delete("m1").await.unwrap());
        assert!(store.get("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_rules() {
        let store = MemoryStore::new();
        let mut state =
            SharedState::init(Seed::with_run_id("m2", Variant::EconomicCrisis)).unwrap();

        let err = store.update(&state).await.unwrap_err();
        assert!(matches!(err, BoardError::RunNotFound { .. }));

        store.create(&state).await.unwrap();
        state.mark_running();
        state.finish(RunStatus::Completed, None).unwrap();
        store.update(&state).await.unwrap();

        let err = store.update(&state).await.unwrap_err();
        assert_eq!(err.category(), "archived");
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let store = MemoryStore::new();
        for id in ["a", "b", "c"] {
            store
                .create_from_seed(Seed::with_run_id(id, Variant::NaturalDisaster))
                .await
                .unwrap();
        }
        let mut b = store.get("b").await.unwrap().unwrap();
        b.mark_running();
        store.update(&b).await.unwrap();

        let running = store
            .list(StatusFilter::Only(RunStatus::Running), 10)
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].run_id(), "b");

        assert_eq!(store.list(StatusFilter::Any, 2).await.unwrap().len(), 2);
    }
}
