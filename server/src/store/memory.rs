//! In-memory result store.
//!
//! Backs single-node deployments and tests. Rows carry the same TTL
//! attribute a durable backend would use; reads filter expired rows so
//! expiry behaves the same everywhere.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Mutex, RwLock,
    },
};

use async_trait::async_trait;

use crate::{
    error::{AppError, AppResult},
    util::check_expired,
};

use super::{LimiterState, LimiterStore, MarkerKind, ResultStore, StoredResult};

#[derive(Default)]
pub struct InMemoryStore {
    /// workflow_id -> account_id -> row
    results: RwLock<HashMap<String, HashMap<String, StoredResult>>>,
    /// (scope, kind) -> ttl
    markers: RwLock<HashMap<(String, MarkerKind), i64>>,
    limiter: Mutex<Option<(LimiterState, u64)>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault-injection hook: makes every call fail with
    /// `StoreUnavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Relaxed);
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Relaxed) {
            return Err(AppError::StoreUnavailable("injected outage".to_string()));
        }
        Ok(())
    }

    /// Drop expired rows and markers. Returns the number removed.
    pub fn prune_expired(&self) -> usize {
        let mut removed = 0;

        {
            let mut results = self.results.write().unwrap();
            for rows in results.values_mut() {
                let before = rows.len();
                rows.retain(|_, row| !check_expired(row.ttl));
                removed += before - rows.len();
            }
            results.retain(|_, rows| !rows.is_empty());
        }

        {
            let mut markers = self.markers.write().unwrap();
            let before = markers.len();
            markers.retain(|_, ttl| !check_expired(*ttl));
            removed += before - markers.len();
        }

        removed
    }
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn put_result(&self, result: StoredResult) -> AppResult<()> {
        self.check_available()?;

        let mut results = self.results.write().unwrap();
        results
            .entry(result.workflow_id.clone())
            .or_default()
            .insert(result.account_id.clone(), result);

        Ok(())
    }

    async fn count(&self, workflow_id: &str) -> AppResult<usize> {
        self.check_available()?;

        let results = self.results.read().unwrap();
        let count = results
            .get(workflow_id)
            .map(|rows| rows.values().filter(|row| !check_expired(row.ttl)).count())
            .unwrap_or(0);

        Ok(count)
    }

    async fn list(&self, workflow_id: &str) -> AppResult<Vec<StoredResult>> {
        self.check_available()?;

        let results = self.results.read().unwrap();
        let rows = results
            .get(workflow_id)
            .map(|rows| {
                rows.values()
                    .filter(|row| !check_expired(row.ttl))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(rows)
    }

    async fn delete_all(&self, workflow_id: &str) -> AppResult<usize> {
        self.check_available()?;

        let mut results = self.results.write().unwrap();
        let removed = results
            .remove(workflow_id)
            .map(|rows| rows.len())
            .unwrap_or(0);

        Ok(removed)
    }

    async fn create_marker(&self, scope: &str, kind: MarkerKind, ttl: i64) -> AppResult<bool> {
        self.check_available()?;

        let mut markers = self.markers.write().unwrap();
        let key = (scope.to_string(), kind);

        // An expired marker no longer guards anything; creation may
        // reclaim its slot.
        if let Some(existing_ttl) = markers.get(&key) {
            if !check_expired(*existing_ttl) {
                return Ok(false);
            }
        }

        markers.insert(key, ttl);
        Ok(true)
    }

    async fn marker_exists(&self, scope: &str, kind: MarkerKind) -> AppResult<bool> {
        self.check_available()?;

        let markers = self.markers.read().unwrap();
        let exists = markers
            .get(&(scope.to_string(), kind))
            .map(|ttl| !check_expired(*ttl))
            .unwrap_or(false);

        Ok(exists)
    }
}

#[async_trait]
impl LimiterStore for InMemoryStore {
    async fn load(&self) -> AppResult<Option<(LimiterState, u64)>> {
        self.check_available()?;
        Ok(*self.limiter.lock().unwrap())
    }

    async fn init(&self, state: LimiterState) -> AppResult<(LimiterState, u64)> {
        self.check_available()?;

        let mut limiter = self.limiter.lock().unwrap();
        match *limiter {
            Some(existing) => Ok(existing),
            None => {
                *limiter = Some((state, 0));
                Ok((state, 0))
            }
        }
    }

    async fn compare_and_swap(&self, expected_version: u64, new: LimiterState) -> AppResult<bool> {
        self.check_available()?;

        let mut limiter = self.limiter.lock().unwrap();
        match *limiter {
            Some((_, version)) if version == expected_version => {
                *limiter = Some((new, version + 1));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::common::make_result;

    #[tokio::test]
    async fn upsert_is_idempotent_on_composite_key() {
        let store = InMemoryStore::new();

        store
            .put_result(make_result("wf-1", "111122223333"))
            .await
            .unwrap();
        store
            .put_result(make_result("wf-1", "111122223333"))
            .await
            .unwrap();
        store
            .put_result(make_result("wf-1", "444455556666"))
            .await
            .unwrap();

        assert_eq!(store.count("wf-1").await.unwrap(), 2);
        assert_eq!(store.count("wf-other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn markers_are_create_once_and_excluded_from_count() {
        let store = InMemoryStore::new();
        let ttl = crate::util::ttl_from_days(7);

        assert!(store
            .create_marker("wf-1", MarkerKind::EmailQueued, ttl)
            .await
            .unwrap());
        assert!(!store
            .create_marker("wf-1", MarkerKind::EmailQueued, ttl)
            .await
            .unwrap());
        assert!(store
            .marker_exists("wf-1", MarkerKind::EmailQueued)
            .await
            .unwrap());

        // Same scope, different kind is a different marker.
        assert!(store
            .create_marker("wf-1", MarkerKind::EmailSent, ttl)
            .await
            .unwrap());

        assert_eq!(store.count("wf-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_rows_are_invisible() {
        let store = InMemoryStore::new();

        let mut row = make_result("wf-1", "111122223333");
        row.ttl = crate::util::unix_now() - 1;
        store.put_result(row).await.unwrap();

        assert_eq!(store.count("wf-1").await.unwrap(), 0);
        assert!(store.list("wf-1").await.unwrap().is_empty());

        let expired_ttl = crate::util::unix_now() - 1;
        assert!(store
            .create_marker("wf-1", MarkerKind::EmailQueued, expired_ttl)
            .await
            .unwrap());
        assert!(!store
            .marker_exists("wf-1", MarkerKind::EmailQueued)
            .await
            .unwrap());

        assert!(store.prune_expired() >= 1);
    }

    #[tokio::test]
    async fn delete_all_removes_only_that_workflow() {
        let store = InMemoryStore::new();

        store
            .put_result(make_result("wf-1", "111122223333"))
            .await
            .unwrap();
        store
            .put_result(make_result("wf-2", "111122223333"))
            .await
            .unwrap();

        assert_eq!(store.delete_all("wf-1").await.unwrap(), 1);
        assert_eq!(store.count("wf-1").await.unwrap(), 0);
        assert_eq!(store.count("wf-2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn limiter_cas_rejects_stale_versions() {
        let store = InMemoryStore::new();

        let initial = LimiterState {
            window_start: 0,
            calls_in_window: 0,
            max_calls_per_window: 20,
        };
        let (state, version) = store.init(initial).await.unwrap();
        assert_eq!(state, initial);

        // Second init returns the existing row.
        let (state2, version2) = store
            .init(LimiterState {
                window_start: 99,
                calls_in_window: 5,
                max_calls_per_window: 1,
            })
            .await
            .unwrap();
        assert_eq!(state2, initial);
        assert_eq!(version2, version);

        let bumped = LimiterState {
            calls_in_window: 1,
            ..initial
        };
        assert!(store.compare_and_swap(version, bumped).await.unwrap());
        // Stale version loses.
        assert!(!store.compare_and_swap(version, bumped).await.unwrap());

        let (current, new_version) = store.load().await.unwrap().unwrap();
        assert_eq!(current.calls_in_window, 1);
        assert_eq!(new_version, version + 1);
    }

    #[tokio::test]
    async fn injected_outage_propagates() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);

        let err = store.count("wf-1").await.unwrap_err();
        assert!(err.is_retryable());

        store.set_unavailable(false);
        assert_eq!(store.count("wf-1").await.unwrap(), 0);
    }
}
