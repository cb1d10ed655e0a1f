//! Key-scoped advisory locks
//!
//! Metadata merges hold one of these for the read-merge-write window. Two
//! backends implement [`NamedMutex`]: a row in `advisory_locks` (shared by every
//! process using the same database file) and a sharded in-process map.
use crate::error::{MemoryError, Result, StorageContext};
use crate::memory_db::schema::format_timestamp;
use chrono::Utc;
use dashmap::DashMap;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rand::Rng;
use rusqlite::params;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock identity derived from an entity UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey(pub u64);

impl LockKey {
    /// First 8 bytes of BLAKE3(uuid string), big-endian
    pub fn for_entity(entity: &Uuid) -> Self {
        let hash = blake3::hash(entity.to_string().as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        LockKey(u64::from_be_bytes(prefix))
    }

    /// SQLite integers are signed; keep the bit pattern
    fn as_sql(&self) -> i64 {
        self.0 as i64
    }
}

pub trait NamedMutex: Send + Sync {
    /// Non-blocking; `Ok(false)` means somebody else holds the key
    fn try_acquire(&self, key: LockKey) -> Result<bool>;
    fn release(&self, key: LockKey) -> Result<()>;
}

pub struct SqliteAdvisoryLock {
    pool: Arc<Pool<SqliteConnectionManager>>,
    holder: String,
    stale_after: Duration,
}

impl SqliteAdvisoryLock {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, stale_after: Duration) -> Self {
        Self {
            pool,
            holder: Uuid::new_v4().to_string(),
            stale_after,
        }
    }
}

impl NamedMutex for SqliteAdvisoryLock {
    fn try_acquire(&self, key: LockKey) -> Result<bool> {
        let conn = self.pool.get().storage_context("advisory lock connection")?;
        let now = Utc::now();
        let stale_cutoff = now
            - chrono::Duration::from_std(self.stale_after).unwrap_or_else(|_| chrono::Duration::minutes(5));

        let reclaimed = conn
            .execute(
                "DELETE FROM advisory_locks WHERE lock_key = ?1 AND acquired_at < ?2",
                params![key.as_sql(), format_timestamp(&stale_cutoff)],
            )
            .storage_context("reclaim stale advisory lock")?;
        if reclaimed > 0 {
            warn!("Reclaimed stale advisory lock {:#x}", key.0);
        }

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO advisory_locks (lock_key, holder, acquired_at) VALUES (?1, ?2, ?3)",
                params![key.as_sql(), &self.holder, format_timestamp(&now)],
            )
            .storage_context("acquire advisory lock")?;
        Ok(inserted == 1)
    }

    fn release(&self, key: LockKey) -> Result<()> {
        let conn = self.pool.get().storage_context("advisory lock connection")?;
        conn.execute(
            "DELETE FROM advisory_locks WHERE lock_key = ?1 AND holder = ?2",
            params![key.as_sql(), &self.holder],
        )
        .storage_context("release advisory lock")?;
        Ok(())
    }
}

/// In-process lock table for deployments without a shared relational store
#[derive(Default)]
pub struct ShardedMutex {
    held: DashMap<u64, ()>,
}

impl ShardedMutex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NamedMutex for ShardedMutex {
    fn try_acquire(&self, key: LockKey) -> Result<bool> {
        match self.held.entry(key.0) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(true)
            }
        }
    }

    fn release(&self, key: LockKey) -> Result<()> {
        self.held.remove(&key.0);
        Ok(())
    }
}

/// Try-lock retry schedule
#[derive(Debug, Clone)]
pub struct LockPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            max_attempts: 15,
        }
    }
}

impl LockPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let base = self.initial_backoff.saturating_mul(factor).min(self.max_backoff);
        // up to 25% jitter so contenders do not retry in lockstep
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 { rand::thread_rng().gen_range(0..=jitter_ms) } else { 0 };
        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

/// Held lock; released on drop if not released explicitly
pub struct LockGuard {
    mutex: Arc<dyn NamedMutex>,
    key: LockKey,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> LockKey {
        self.key
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.mutex.release(self.key)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.mutex.release(self.key) {
                warn!("Failed to release advisory lock {:#x}: {}", self.key.0, e);
            }
        }
    }
}

/// Acquire `key` with exponential backoff, giving up after `policy.max_attempts`
pub async fn acquire(mutex: Arc<dyn NamedMutex>, key: LockKey, policy: &LockPolicy) -> Result<LockGuard> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        if mutex.try_acquire(key)? {
            return Ok(LockGuard { mutex, key, released: false });
        }
        if attempt == attempts {
            break;
        }
        let delay = policy.delay_for(attempt);
        debug!("Advisory lock {:#x} contended (attempt {}), retrying in {:?}", key.0, attempt, delay);
        tokio::time::sleep(delay).await;
    }
    Err(MemoryError::LockAcquisitionFailed { key: key.0, attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(attempts: u32) -> LockPolicy {
        LockPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            max_attempts: attempts,
        }
    }

    #[test]
    fn test_lock_key_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(LockKey::for_entity(&id), LockKey::for_entity(&id));
        assert_ne!(LockKey::for_entity(&id), LockKey::for_entity(&Uuid::new_v4()));
    }

    #[test]
    fn test_lock_key_matches_hash_prefix() {
        let id = Uuid::nil();
        let hash = blake3::hash(id.to_string().as_bytes());
        let expected = u64::from_be_bytes(hash.as_bytes()[..8].try_into().unwrap());
        assert_eq!(LockKey::for_entity(&id).0, expected);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = LockPolicy::default();
        assert!(policy.delay_for(1) >= Duration::from_millis(200));
        assert!(policy.delay_for(1) <= Duration::from_millis(250));
        assert_eq!(policy.delay_for(15), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_sharded_mutex_excludes_second_holder() {
        let mutex: Arc<dyn NamedMutex> = Arc::new(ShardedMutex::new());
        let key = LockKey(7);

        let guard = acquire(mutex.clone(), key, &fast_policy(3)).await.unwrap();
        let err = acquire(mutex.clone(), key, &fast_policy(3)).await.err().unwrap();
        assert!(matches!(err, MemoryError::LockAcquisitionFailed { attempts: 3, .. }));

        drop(guard);
        assert!(acquire(mutex, key, &fast_policy(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_explicit_release_frees_key() {
        let mutex: Arc<dyn NamedMutex> = Arc::new(ShardedMutex::new());
        let guard = acquire(mutex.clone(), LockKey(1), &fast_policy(1)).await.unwrap();
        guard.release().unwrap();
        assert!(mutex.try_acquire(LockKey(1)).unwrap());
    }
}
