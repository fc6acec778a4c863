//! Run-level mutual exclusion
//!
//! At most one retraining run may be active per lock key. Acquisition never
//! waits: a held lock means the caller must give up.

use crate::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Held for the lifetime of a run. Dropping it releases the lock.
pub struct RunLease {
    key: String,
    _guard: Box<dyn Send>,
}

impl RunLease {
    pub fn new(key: &str, guard: Box<dyn Send>) -> Self {
        Self {
            key: key.to_string(),
            _guard: guard,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for RunLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLease").field("key", &self.key).finish()
    }
}

/// Trait for non-blocking run locks
#[async_trait]
pub trait RunLock: Send + Sync {
    /// `Ok(None)` when another holder owns `key`
    async fn try_acquire(&self, key: &str) -> Result<Option<RunLease>>;
}

/// Lock scoped to this process
#[derive(Default)]
pub struct InProcessRunLock {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InProcessRunLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunLock for InProcessRunLock {
    async fn try_acquire(&self, key: &str) -> Result<Option<RunLease>> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        match slot.try_lock_owned() {
            Ok(guard) => Ok(Some(RunLease::new(key, Box::new(guard)))),
            Err(_) => {
                debug!(key = %key, "Run lock already held");
                Ok(None)
            }
        }
    }
}

/// Lock shared by every process using the same database.
///
/// Uses a transaction-scoped advisory lock; the open transaction lives inside
/// the lease and is rolled back when the lease drops, releasing the lock.
pub struct PostgresRunLock {
    pool: PgPool,
}

impl PostgresRunLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Map a lock key to the 64-bit id Postgres advisory locks expect.
pub fn advisory_lock_id(key: &str) -> i64 {
    let hash = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    i64::from_be_bytes(bytes)
}

#[async_trait]
impl RunLock for PostgresRunLock {
    async fn try_acquire(&self, key: &str) -> Result<Option<RunLease>> {
        let mut tx = self.pool.begin().await?;

        let acquired: bool = sqlx::query("SELECT pg_try_advisory_xact_lock($1) AS acquired")
            .bind(advisory_lock_id(key))
            .fetch_one(&mut *tx)
            .await?
            .try_get("acquired")?;

        if !acquired {
            debug!(key = %key, "Advisory run lock already held");
            return Ok(None);
        }

        Ok(Some(RunLease::new(key, Box::new(tx))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_fails_until_release() {
        let lock = InProcessRunLock::new();

        let lease = lock.try_acquire("retrain").await.unwrap();
        assert!(lease.is_some());
        assert!(lock.try_acquire("retrain").await.unwrap().is_none());

        drop(lease);
        assert!(lock.try_acquire("retrain").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let lock = InProcessRunLock::new();
        let _a = lock.try_acquire("a").await.unwrap().unwrap();
        assert!(lock.try_acquire("b").await.unwrap().is_some());
    }

    #[test]
    fn test_advisory_lock_id_is_stable() {
        assert_eq!(advisory_lock_id("retrain"), advisory_lock_id("retrain"));
        assert_ne!(advisory_lock_id("retrain"), advisory_lock_id("other"));
    }
}
