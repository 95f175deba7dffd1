//! Per-dataset advisory lock
//!
//! Loads of one dataset must not overlap. The lock row lives in the metadata
//! store, so it also covers runs on other hosts. A run that finds the dataset
//! locked bumps the release attempt counter; once the counter reaches the
//! configured threshold the lock is presumed stale (its holder crashed) and
//! is released automatically.

use thiserror::Error;
use tracing::{info, warn};

use crate::metadata::{MetadataError, MetadataStore};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock {operation} failed for dataset '{dataset}': {source}")]
    Store {
        operation: &'static str,
        dataset: String,
        #[source]
        source: MetadataError,
    },
}

/// When a held lock is presumed stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockPolicy {
    /// Configured as `-1`
    Never,
    /// Release after this many refused attempts
    After(u32),
}

impl TryFrom<i64> for UnlockPolicy {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(UnlockPolicy::Never),
            n => u32::try_from(n).map(UnlockPolicy::After).map_err(|_| value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    Available,
    Busy { release_attempts: i64 },
}

pub struct LockManager {
    store: MetadataStore,
    dataset: String,
    policy: UnlockPolicy,
}

impl LockManager {
    pub fn new(store: MetadataStore, dataset: impl Into<String>, policy: UnlockPolicy) -> Self {
        Self {
            store,
            dataset: dataset.into(),
            policy,
        }
    }

    fn store_error(&self, operation: &'static str) -> impl FnOnce(MetadataError) -> LockError + '_ {
        move |source| LockError::Store {
            operation,
            dataset: self.dataset.clone(),
            source,
        }
    }

    /// Decide whether this run may take the lock.
    ///
    /// Does not take it; call [`acquire`](Self::acquire) once the run commits
    /// to loading.
    pub async fn try_acquire(&self) -> Result<LockDecision, LockError> {
        let status = self
            .store
            .lock_status(&self.dataset)
            .await
            .map_err(self.store_error("status"))?;
        info!(
            dataset = %self.dataset,
            locked = status.locked,
            release_attempts = status.release_attempts,
            "Checked dataset lock"
        );

        let mut locked = status.locked;
        if let UnlockPolicy::After(threshold) = self.policy {
            if status.release_attempts >= i64::from(threshold) {
                self.store
                    .force_unlock(&self.dataset)
                    .await
                    .map_err(self.store_error("auto release"))?;
                warn!(
                    dataset = %self.dataset,
                    release_attempts = status.release_attempts,
                    max_unlock_attempts = threshold,
                    "Auto-unlocked dataset after repeated release attempts"
                );
                locked = false;
            }
        }

        if !locked {
            info!(dataset = %self.dataset, "Dataset unlocked and available for load");
            return Ok(LockDecision::Available);
        }

        self.store
            .increment_release_attempts(&self.dataset)
            .await
            .map_err(self.store_error("increment attempts"))?;
        info!(dataset = %self.dataset, "Dataset locked by another load");
        Ok(LockDecision::Busy {
            release_attempts: status.release_attempts + 1,
        })
    }

    /// Take the lock and reset the attempt counter
    pub async fn acquire(&self) -> Result<(), LockError> {
        self.store
            .set_locked(&self.dataset)
            .await
            .map_err(self.store_error("acquire"))?;
        info!(dataset = %self.dataset, "Acquired lock");
        Ok(())
    }

    pub async fn release(&self) -> Result<(), LockError> {
        self.store
            .release(&self.dataset)
            .await
            .map_err(self.store_error("release"))?;
        info!(dataset = %self.dataset, "Released lock");
        Ok(())
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::metadata::LockStatus;

    async fn manager(policy: UnlockPolicy) -> (LockManager, MetadataStore) {
        let store = MetadataStore::connect("sqlite::memory:").await.unwrap();
        store.insert_lock("clicks").await.unwrap();
        (LockManager::new(store.clone(), "clicks", policy), store)
    }

    #[test]
    fn test_policy_from_config_value() {
        assert_eq!(UnlockPolicy::try_from(-1).unwrap(), UnlockPolicy::Never);
        assert_eq!(UnlockPolicy::try_from(0).unwrap(), UnlockPolicy::After(0));
        assert_eq!(UnlockPolicy::try_from(5).unwrap(), UnlockPolicy::After(5));
        assert!(UnlockPolicy::try_from(-3).is_err());
    }

    #[tokio::test]
    async fn test_unlocked_dataset_is_available() {
        let (lock, _) = manager(UnlockPolicy::After(3)).await;
        assert_eq!(lock.try_acquire().await.unwrap(), LockDecision::Available);
    }

    #[tokio::test]
    async fn test_locked_dataset_counts_attempts() {
        let (lock, store) = manager(UnlockPolicy::After(3)).await;
        lock.acquire().await.unwrap();

        assert_eq!(
            lock.try_acquire().await.unwrap(),
            LockDecision::Busy { release_attempts: 1 }
        );
        assert_eq!(
            lock.try_acquire().await.unwrap(),
            LockDecision::Busy { release_attempts: 2 }
        );
        assert_eq!(
            store.lock_status("clicks").await.unwrap(),
            LockStatus {
                locked: true,
                release_attempts: 2
            }
        );
    }

    #[tokio::test]
    async fn test_auto_unlock_at_threshold() {
        let (lock, store) = manager(UnlockPolicy::After(2)).await;
        lock.acquire().await.unwrap();

        assert!(matches!(lock.try_acquire().await.unwrap(), LockDecision::Busy { .. }));
        assert!(matches!(lock.try_acquire().await.unwrap(), LockDecision::Busy { .. }));
        assert_eq!(lock.try_acquire().await.unwrap(), LockDecision::Available);
        assert_eq!(
            store.lock_status("clicks").await.unwrap(),
            LockStatus {
                locked: false,
                release_attempts: 0
            }
        );

        lock.acquire().await.unwrap();
        assert_eq!(store.lock_status("clicks").await.unwrap().release_attempts, 0);
    }

    #[tokio::test]
    async fn test_never_policy_stays_busy() {
        let (lock, _) = manager(UnlockPolicy::Never).await;
        lock.acquire().await.unwrap();
        for attempt in 1..=5 {
            assert_eq!(
                lock.try_acquire().await.unwrap(),
                LockDecision::Busy {
                    release_attempts: attempt
                }
            );
        }
    }

    #[tokio::test]
    async fn test_release_keeps_attempts() {
        let (lock, store) = manager(UnlockPolicy::Never).await;
        lock.acquire().await.unwrap();
        lock.try_acquire().await.unwrap();
        lock.release().await.unwrap();
        assert_eq!(
            store.lock_status("clicks").await.unwrap(),
            LockStatus {
                locked: false,
                release_attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn test_missing_lock_row_is_an_error() {
        let store = MetadataStore::connect("sqlite::memory:").await.unwrap();
        let lock = LockManager::new(store, "unknown", UnlockPolicy::Never);
        assert!(matches!(lock.try_acquire().await, Err(LockError::Store { .. })));
    }
}
