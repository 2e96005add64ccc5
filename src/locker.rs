//! Per-path async lock manager.
//!
//! Reads on a path may interleave with other reads; a write excludes every
//! other lock whose path is on the same trail (equal, ancestor or
//! descendant), so a subtree write is consistent against concurrent readers
//! anywhere above or below it. Locks held by the same transaction never
//! conflict with each other, which is what lets cascading parent updates
//! re-acquire upward without deadlocking.
//!
//! A granted lock expires after the configured timeout; holders assert the
//! lock is still active before touching storage and abort instead of
//! mutating shared state past expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{ArborError, Result};
use crate::path::PathInfo;

/// Transaction identifier shared by the locks of one logical operation.
pub type TransactionId = u64;

#[derive(Debug)]
struct HeldLock {
    id: u64,
    path: PathInfo,
    tid: TransactionId,
    for_writing: bool,
    granted_at: Instant,
}

#[derive(Default)]
struct LockerState {
    held: Vec<HeldLock>,
}

struct LockerInner {
    state: Mutex<LockerState>,
    notify: Notify,
    timeout: Duration,
    next_lock_id: AtomicU64,
    next_tid: AtomicU64,
}

/// Async per-path lock manager.
#[derive(Clone)]
pub struct NodeLocker {
    inner: Arc<LockerInner>,
}

impl NodeLocker {
    /// Creates a locker whose locks expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(LockerInner {
                state: Mutex::new(LockerState::default()),
                notify: Notify::new(),
                timeout,
                next_lock_id: AtomicU64::new(1),
                next_tid: AtomicU64::new(1),
            }),
        }
    }

    /// Allocates a transaction id for one logical operation.
    pub fn next_transaction_id(&self) -> TransactionId {
        self.inner.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    /// Acquires a lock on `path`, waiting until conflicting locks are
    /// released or expire. `reason` is carried into trace output only.
    pub async fn lock(
        &self,
        path: &PathInfo,
        tid: TransactionId,
        for_writing: bool,
        reason: &str,
    ) -> Result<NodeLock> {
        let deadline = Instant::now() + self.inner.timeout;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                prune_expired(&mut state, self.inner.timeout);
                if !has_conflict(&state, path, tid, for_writing) {
                    let id = self.inner.next_lock_id.fetch_add(1, Ordering::Relaxed);
                    state.held.push(HeldLock {
                        id,
                        path: path.clone(),
                        tid,
                        for_writing,
                        granted_at: Instant::now(),
                    });
                    trace!(path = %path, tid, for_writing, reason, "lock.granted");
                    return Ok(NodeLock {
                        inner: self.inner.clone(),
                        locker: self.clone(),
                        id,
                        path: path.clone(),
                        tid,
                        for_writing,
                        released: false,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(path = %path, tid, for_writing, reason, "lock.timeout");
                return Err(ArborError::Lock {
                    path: path.to_string(),
                    reason: format!("timed out waiting for {reason}"),
                });
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    /// Number of currently held (non-expired) locks; used by tests and the
    /// engine's stats snapshot.
    pub fn active_locks(&self) -> usize {
        let mut state = self.inner.state.lock();
        prune_expired(&mut state, self.inner.timeout);
        state.held.len()
    }
}

fn prune_expired(state: &mut LockerState, timeout: Duration) {
    let now = Instant::now();
    state
        .held
        .retain(|lock| now.duration_since(lock.granted_at) < timeout);
}

fn has_conflict(
    state: &LockerState,
    path: &PathInfo,
    tid: TransactionId,
    for_writing: bool,
) -> bool {
    state.held.iter().any(|held| {
        held.tid != tid
            && (for_writing || held.for_writing)
            && held.path.is_on_trail_of(path)
    })
}

/// A granted lock. Released explicitly or on drop.
pub struct NodeLock {
    inner: Arc<LockerInner>,
    locker: NodeLocker,
    id: u64,
    path: PathInfo,
    tid: TransactionId,
    for_writing: bool,
    released: bool,
}

impl NodeLock {
    /// Path the lock is held on.
    pub fn path(&self) -> &PathInfo {
        &self.path
    }

    /// Transaction the lock belongs to.
    pub fn tid(&self) -> TransactionId {
        self.tid
    }

    /// Whether this is a write lock.
    pub fn for_writing(&self) -> bool {
        self.for_writing
    }

    /// Errors unless the lock is still granted and unexpired. Every storage
    /// touch goes through this check first.
    pub fn assert_active(&self) -> Result<()> {
        if self.released {
            return Err(ArborError::Lock {
                path: self.path.to_string(),
                reason: "lock was already released".into(),
            });
        }
        let state = self.inner.state.lock();
        let held = state.held.iter().find(|held| held.id == self.id);
        match held {
            Some(held) if held.granted_at.elapsed() < self.inner.timeout => Ok(()),
            _ => Err(ArborError::Lock {
                path: self.path.to_string(),
                reason: "lock expired".into(),
            }),
        }
    }

    /// Releases the lock and wakes waiters.
    pub fn release(mut self) {
        self.release_inner();
    }

    /// Re-acquires on the parent path without dropping transaction identity,
    /// for cascading parent updates. The current lock is released once the
    /// parent lock is granted.
    pub async fn move_to_parent(mut self, reason: &str) -> Result<NodeLock> {
        let parent = self.path.parent().ok_or_else(|| ArborError::Lock {
            path: self.path.to_string(),
            reason: "root has no parent to move to".into(),
        })?;
        self.assert_active()?;
        let parent_lock = self
            .locker
            .lock(&parent, self.tid, self.for_writing, reason)
            .await?;
        self.release_inner();
        Ok(parent_lock)
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = self.inner.state.lock();
        state.held.retain(|held| held.id != self.id);
        drop(state);
        self.inner.notify.notify_waiters();
        trace!(path = %self.path, tid = self.tid, "lock.released");
    }
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}
