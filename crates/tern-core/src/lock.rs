//! Single-writer, thread-affine execution lock

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
    /// Held through [`ExecutionLock::pin`] rather than a guard
    pinned: bool,
}

/// Acquire/release counters of an [`ExecutionLock`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    pub acquires: u64,
    pub releases: u64,
}

/// Exclusive access to one engine instance.
///
/// The lock is owned by a thread, not by a guard: re-acquiring on the
/// owning thread nests, while any other thread blocks until the outermost
/// guard is released. Releasing a lock the current thread does not hold is
/// a fatal programming error and panics.
pub struct ExecutionLock {
    state: Mutex<LockState>,
    released: Condvar,
    acquires: AtomicU64,
    releases: AtomicU64,
}

impl Default for ExecutionLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ExecutionLock")
            .field("owner", &state.owner)
            .field("depth", &state.depth)
            .field("pinned", &state.pinned)
            .finish()
    }
}

impl ExecutionLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                owner: None,
                depth: 0,
                pinned: false,
            }),
            released: Condvar::new(),
            acquires: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    fn enter(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    break;
                }
                Some(owner) if owner == me => break,
                Some(_) => self.released.wait(&mut state),
            }
        }
        state.depth += 1;
        self.acquires.fetch_add(1, Ordering::Relaxed);
    }

    fn exit(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) || state.depth == 0 {
            drop(state);
            tracing::error!(thread = ?me, "Execution lock released by a thread that does not hold it");
            panic!("execution lock released by a thread that does not hold it");
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            state.pinned = false;
            self.released.notify_one();
        }
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Block until the current thread owns the lock
    pub fn acquire(&self) -> ExecutionGuard<'_> {
        self.enter();
        ExecutionGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Take the lock without a guard, for callers that bracket many
    /// operations explicitly. Panics if this thread already pinned it.
    pub fn pin(&self) {
        let me = thread::current().id();
        {
            let state = self.state.lock();
            if state.owner == Some(me) && state.pinned {
                drop(state);
                tracing::error!(thread = ?me, "Isolate locked twice");
                panic!("lock called while already locked");
            }
        }
        self.enter();
        self.state.lock().pinned = true;
    }

    /// Release a lock taken with [`pin`](Self::pin). Panics if this thread
    /// did not pin it.
    pub fn unpin(&self) {
        let me = thread::current().id();
        {
            let mut state = self.state.lock();
            if state.owner != Some(me) || !state.pinned {
                drop(state);
                tracing::error!(thread = ?me, "Isolate unlocked without being locked");
                panic!("unlock called without first being locked");
            }
            state.pinned = false;
        }
        self.exit();
    }

    /// Whether the calling thread currently owns the lock
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquires: self.acquires.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}

/// Proof that the current thread holds an [`ExecutionLock`].
///
/// Releases one level of the lock when dropped. The guard is `!Send`: the
/// lock is bound to the thread that acquired it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ExecutionGuard<'a> {
    lock: &'a ExecutionLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.lock.exit();
    }
}

impl fmt::Debug for ExecutionGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_reentrant_on_same_thread() {
        let lock = ExecutionLock::new();
        let outer = lock.acquire();
        let inner = lock.acquire();
        assert!(lock.is_held_by_current_thread());
        drop(inner);
        assert!(lock.is_locked());
        drop(outer);
        assert!(!lock.is_locked());
        assert_eq!(
            lock.stats(),
            LockStats {
                acquires: 2,
                releases: 2
            }
        );
    }

    #[test]
    fn test_other_thread_blocks_until_release() {
        let lock = Arc::new(ExecutionLock::new());
        let guard = lock.acquire();
        let (tx, rx) = mpsc::channel();
        let remote = lock.clone();
        let waiter = thread::spawn(move || {
            let _guard = remote.acquire();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_pin_and_unpin() {
        let lock = ExecutionLock::new();
        lock.pin();
        {
            let _nested = lock.acquire();
        }
        assert!(lock.is_held_by_current_thread());
        lock.unpin();
        assert!(!lock.is_locked());
    }

    #[test]
    #[should_panic(expected = "lock called while already locked")]
    fn test_double_pin_panics() {
        let lock = ExecutionLock::new();
        lock.pin();
        lock.pin();
    }

    #[test]
    #[should_panic(expected = "unlock called without first being locked")]
    fn test_unpin_without_pin_panics() {
        let lock = ExecutionLock::new();
        lock.unpin();
    }
}
