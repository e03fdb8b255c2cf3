//! Resource locks taken around action handlers.
//!
//! The dispatch core only sees the [`LockProvider`] / [`LockHandle`] pair.
//! Production deployments plug in a cluster-wide provider; the in-process
//! [`LocalLockProvider`] serves single-node setups and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::types::{Error, Result};

/// TTL applied when the caller does not configure one.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_millis(30_000);

/// Source of resource locks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Acquire `resource` for at most `ttl`. Fails with
    /// [`Error::LockUnavailable`] when the resource cannot be taken.
    async fn lock(&self, resource: &str, ttl: Duration) -> Result<Box<dyn LockHandle>>;
}

/// An acquired lock.
#[async_trait]
pub trait LockHandle: Send + Sync {
    fn resource(&self) -> &str;

    /// Release the lock. Calling it more than once is a no-op.
    async fn release(&self) -> Result<()>;
}

/// Owns a handle for the duration of one invocation.
///
/// [`LockGuard::release`] is the normal exit. If the guard is dropped
/// unreleased (panic, cancelled future) the release is spawned onto the
/// current runtime.
pub struct LockGuard {
    handle: Option<Box<dyn LockHandle>>,
}

impl LockGuard {
    pub fn new(handle: Box<dyn LockHandle>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn resource(&self) -> Option<&str> {
        self.handle.as_deref().map(LockHandle::resource)
    }

    pub async fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = handle.release().await {
                        tracing::warn!(resource = handle.resource(), error = %err, "deferred lock release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(resource = handle.resource(), "lock dropped outside runtime; left to expire");
            }
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource())
            .finish()
    }
}

// =============================================================================
// In-process provider
// =============================================================================

#[derive(Debug)]
struct Lease {
    token: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LocalLocks {
    leases: Mutex<HashMap<String, Lease>>,
    released: Notify,
    next_token: AtomicU64,
}

/// In-process TTL lock provider.
///
/// Mutual exclusion per resource string within one process. A busy resource
/// is awaited up to the acquisition timeout; expired leases are taken over.
#[derive(Debug, Clone)]
pub struct LocalLockProvider {
    locks: Arc<LocalLocks>,
    acquire_timeout: Duration,
}

impl LocalLockProvider {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            locks: Arc::new(LocalLocks::default()),
            acquire_timeout,
        }
    }

    /// Number of resources currently held (expired leases included).
    pub async fn held(&self) -> usize {
        self.locks.leases.lock().await.len()
    }
}

impl Default for LocalLockProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl LockProvider for LocalLockProvider {
    async fn lock(&self, resource: &str, ttl: Duration) -> Result<Box<dyn LockHandle>> {
        let deadline = Instant::now() + self.acquire_timeout;

        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.locks.released.notified();

            let busy_until = {
                let mut leases = self.locks.leases.lock().await;
                let now = Instant::now();
                match leases.get(resource) {
                    Some(lease) if lease.expires_at > now => lease.expires_at,
                    _ => {
                        let token = self.locks.next_token.fetch_add(1, Ordering::Relaxed);
                        leases.insert(
                            resource.to_string(),
                            Lease {
                                token,
                                expires_at: now + ttl,
                            },
                        );
                        tracing::debug!(resource, ?ttl, "lock acquired");
                        return Ok(Box::new(LocalLockHandle {
                            locks: Arc::clone(&self.locks),
                            resource: resource.to_string(),
                            token,
                            released: AtomicBool::new(false),
                        }));
                    }
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::lock_unavailable(
                    resource,
                    format!("not acquired within {:?}", self.acquire_timeout),
                ));
            }
            let wake_at = busy_until.min(deadline);
            let _ = tokio::time::timeout_at(wake_at, released).await;
        }
    }
}

struct LocalLockHandle {
    locks: Arc<LocalLocks>,
    resource: String,
    token: u64,
    released: AtomicBool,
}

#[async_trait]
impl LockHandle for LocalLockHandle {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut leases = self.locks.leases.lock().await;
        // A lease taken over after expiry belongs to someone else.
        if leases
            .get(&self.resource)
            .is_some_and(|lease| lease.token == self.token)
        {
            leases.remove(&self.resource);
        }
        drop(leases);

        self.locks.released.notify_waiters();
        tracing::debug!(resource = %self.resource, "lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_locker_waits_for_release() {
        let provider = LocalLockProvider::new(Duration::from_secs(2));
        let first = provider.lock("doc.1", DEFAULT_LOCK_TTL).await.unwrap();

        let contender = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.lock("doc.1", DEFAULT_LOCK_TTL).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        first.release().await.unwrap();
        let second = contender.await.unwrap().unwrap();
        assert_eq!(second.resource(), "doc.1");
        second.release().await.unwrap();
        assert_eq!(provider.held().await, 0);
    }

    #[tokio::test]
    async fn busy_resource_times_out() {
        let provider = LocalLockProvider::new(Duration::from_millis(30));
        let _held = provider.lock("doc.1", DEFAULT_LOCK_TTL).await.unwrap();

        let err = provider
            .lock("doc.1", DEFAULT_LOCK_TTL)
            .await
            .err()
            .unwrap();
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let provider = LocalLockProvider::new(Duration::from_secs(1));
        let stale = provider
            .lock("doc.1", Duration::from_millis(10))
            .await
            .unwrap();

        let fresh = provider.lock("doc.1", DEFAULT_LOCK_TTL).await.unwrap();

        // Releasing the stale handle must not free the new lease.
        stale.release().await.unwrap();
        assert_eq!(provider.held().await, 1);
        fresh.release().await.unwrap();
        assert_eq!(provider.held().await, 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let provider = LocalLockProvider::default();
        let handle = provider.lock("doc.1", DEFAULT_LOCK_TTL).await.unwrap();
        handle.release().await.unwrap();
        handle.release().await.unwrap();
        assert_eq!(provider.held().await, 0);
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let provider = LocalLockProvider::default();
        let guard = LockGuard::new(provider.lock("doc.1", DEFAULT_LOCK_TTL).await.unwrap());
        drop(guard);

        let reacquired = tokio::time::timeout(
            Duration::from_secs(1),
            provider.lock("doc.1", DEFAULT_LOCK_TTL),
        )
        .await
        .unwrap()
        .unwrap();
        reacquired.release().await.unwrap();
    }
}
