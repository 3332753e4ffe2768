// ============================================================================
// Resource Lock Table
// ============================================================================
//
// Exclusive advisory locks keyed by resource id. A lock belongs to exactly
// one transaction, expires after the configured timeout and is released
// only by its holder or by expiry.
//
// ============================================================================

use crate::core::{LockPolicy, Result, TransactionId, TxError};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, timeout};
use tracing::{Level, event};

/// Handle of one acquired lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(pub u64);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock_{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct ResourceLock {
    lock_id: LockId,
    holder: TransactionId,
    expires_at: Instant,
}

impl ResourceLock {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A lock acquired on one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub resource: String,
    pub lock_id: LockId,
}

/// Advisory lock table shared by every transaction of an engine.
///
/// ```
/// use batchtx::{ResourceLockTable, TransactionId};
/// # tokio_test::block_on(async {
/// let table = ResourceLockTable::default();
/// let holder = TransactionId::new();
/// table.try_acquire("doc-1", holder).await.unwrap();
/// assert!(table.try_acquire("doc-1", TransactionId::new()).await.is_err());
/// assert!(table.release("doc-1", holder).await);
/// # });
/// ```
pub struct ResourceLockTable {
    locks: Mutex<HashMap<String, ResourceLock>>,
    released: Notify,
    next_lock_id: AtomicU64,
    policy: LockPolicy,
}

impl Default for ResourceLockTable {
    fn default() -> Self {
        Self::new(LockPolicy::default())
    }
}

impl ResourceLockTable {
    pub fn new(policy: LockPolicy) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            released: Notify::new(),
            next_lock_id: AtomicU64::new(1),
            policy,
        }
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    /// Takes the lock on `resource` for `holder` without waiting.
    ///
    /// Re-acquiring a lock the holder already owns refreshes its expiry and
    /// returns the same id. An expired lock held by someone else is reclaimed.
    pub async fn try_acquire(&self, resource: &str, holder: TransactionId) -> Result<LockId> {
        let mut locks = self.locks.lock().await;
        self.try_acquire_locked(&mut locks, resource, holder)
    }

    fn try_acquire_locked(
        &self,
        locks: &mut HashMap<String, ResourceLock>,
        resource: &str,
        holder: TransactionId,
    ) -> Result<LockId> {
        let now = Instant::now();
        let expires_at = now + self.policy.lock_timeout();

        if let Some(existing) = locks.get_mut(resource) {
            if existing.holder == holder {
                existing.expires_at = expires_at;
                return Ok(existing.lock_id);
            }
            if !existing.is_expired(now) {
                return Err(TxError::LockConflict {
                    resource: resource.to_string(),
                    holder: existing.holder.to_string(),
                });
            }
            event!(
                Level::WARN,
                resource,
                previous_holder = %existing.holder,
                "reclaiming expired resource lock"
            );
        }

        let lock_id = LockId(self.next_lock_id.fetch_add(1, Ordering::SeqCst));
        locks.insert(
            resource.to_string(),
            ResourceLock {
                lock_id,
                holder,
                expires_at,
            },
        );
        Ok(lock_id)
    }

    /// Takes the lock, waiting up to `wait` for the current holder to
    /// release it or for it to expire.
    pub async fn acquire(
        &self,
        resource: &str,
        holder: TransactionId,
        wait: Duration,
    ) -> Result<LockId> {
        let deadline = Instant::now() + wait;
        let retry = Duration::from_millis(self.policy.retry_interval_ms.max(1));
        loop {
            let notified = self.released.notified();
            match self.try_acquire(resource, holder).await {
                Ok(lock_id) => return Ok(lock_id),
                Err(err @ TxError::LockConflict { .. }) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(err);
                    }
                    let remaining = deadline - now;
                    let _ = timeout(remaining.min(retry), notified).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Takes every lock or none of them.
    ///
    /// Resources are acquired in sorted order so two overlapping batches
    /// never wait on each other in opposite orders. On a conflict every lock
    /// already taken by this call is released before the error is returned.
    pub async fn acquire_all(
        &self,
        resources: &[String],
        holder: TransactionId,
        wait: Duration,
    ) -> Result<Vec<LockGrant>> {
        let ordered: BTreeSet<&str> = resources.iter().map(String::as_str).collect();
        let mut grants: Vec<LockGrant> = Vec::with_capacity(ordered.len());
        for resource in ordered {
            match self.acquire(resource, holder, wait).await {
                Ok(lock_id) => grants.push(LockGrant {
                    resource: resource.to_string(),
                    lock_id,
                }),
                Err(err) => {
                    for grant in &grants {
                        self.release(&grant.resource, holder).await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(grants)
    }

    /// Releases `resource` if `holder` owns it. Returns whether a lock was
    /// released; a lock owned by anyone else is left untouched.
    pub async fn release(&self, resource: &str, holder: TransactionId) -> bool {
        let released = {
            let mut locks = self.locks.lock().await;
            match locks.get(resource) {
                Some(lock) if lock.holder == holder => {
                    locks.remove(resource);
                    true
                }
                _ => false,
            }
        };
        if released {
            self.released.notify_waiters();
        }
        released
    }

    /// Releases every lock owned by `holder`.
    pub async fn release_all(&self, holder: TransactionId) -> usize {
        let released = {
            let mut locks = self.locks.lock().await;
            let before = locks.len();
            locks.retain(|_, lock| lock.holder != holder);
            before - locks.len()
        };
        if released > 0 {
            self.released.notify_waiters();
        }
        released
    }

    /// Current live holder of `resource`.
    pub async fn holder_of(&self, resource: &str) -> Option<TransactionId> {
        let locks = self.locks.lock().await;
        let now = Instant::now();
        locks
            .get(resource)
            .filter(|lock| !lock.is_expired(now))
            .map(|lock| lock.holder)
    }

    /// Drops expired locks and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let removed = {
            let mut locks = self.locks.lock().await;
            let now = Instant::now();
            let before = locks.len();
            locks.retain(|resource, lock| {
                let keep = !lock.is_expired(now);
                if !keep {
                    event!(Level::WARN, resource = %resource, holder = %lock.holder, "resource lock expired");
                }
                keep
            });
            before - locks.len()
        };
        if removed > 0 {
            self.released.notify_waiters();
        }
        removed
    }

    /// Number of live (unexpired) locks.
    pub async fn active_count(&self) -> usize {
        let locks = self.locks.lock().await;
        let now = Instant::now();
        locks.values().filter(|lock| !lock.is_expired(now)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_policy() -> LockPolicy {
        LockPolicy {
            lock_timeout_ms: 40,
            acquire_wait_ms: 0,
            retry_interval_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let table = ResourceLockTable::default();
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();

        table.try_acquire("doc-1", t1).await.unwrap();
        let err = table.try_acquire("doc-1", t2).await.unwrap_err();
        assert!(matches!(err, TxError::LockConflict { .. }));
        assert_eq!(table.holder_of("doc-1").await, Some(t1));
    }

    #[tokio::test]
    async fn test_reacquire_by_holder_keeps_lock_id() {
        let table = ResourceLockTable::default();
        let t1 = TransactionId::new();
        let first = table.try_acquire("doc-1", t1).await.unwrap();
        let second = table.try_acquire("doc-1", t1).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(table.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_ignored() {
        let table = ResourceLockTable::default();
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();
        table.try_acquire("doc-1", t1).await.unwrap();

        assert!(!table.release("doc-1", t2).await);
        assert_eq!(table.holder_of("doc-1").await, Some(t1));
        assert!(table.release("doc-1", t1).await);
        assert_eq!(table.holder_of("doc-1").await, None);
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let table = ResourceLockTable::new(short_policy());
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();
        table.try_acquire("doc-1", t1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(table.holder_of("doc-1").await, None);
        table.try_acquire("doc-1", t2).await.unwrap();
        assert_eq!(table.holder_of("doc-1").await, Some(t2));
    }

    #[tokio::test]
    async fn test_acquire_all_is_all_or_nothing() {
        let table = ResourceLockTable::default();
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();
        table.try_acquire("b", t2).await.unwrap();

        let resources = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let err = table
            .acquire_all(&resources, t1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::LockConflict { .. }));
        assert_eq!(table.holder_of("a").await, None);
        assert_eq!(table.holder_of("c").await, None);
        assert_eq!(table.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let table = std::sync::Arc::new(ResourceLockTable::default());
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();
        table.try_acquire("doc-1", t1).await.unwrap();

        let releaser = table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.release("doc-1", t1).await;
        });

        table
            .acquire("doc-1", t2, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(table.holder_of("doc-1").await, Some(t2));
    }

    #[tokio::test]
    async fn test_purge_expired_counts_removed() {
        let table = ResourceLockTable::new(short_policy());
        let t1 = TransactionId::new();
        table.try_acquire("a", t1).await.unwrap();
        table.try_acquire("b", t1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(table.purge_expired().await, 2);
        assert_eq!(table.active_count().await, 0);
    }
}
