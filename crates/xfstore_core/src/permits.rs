//! Worker permits for parallel fan-out.
//!
//! A transaction acquires permits before prepare, commit or rollback fans
//! out across its items. The grant is greedy: as many permits as are free,
//! up to the per-grant cap, but never fewer than one.

use crate::error::{CoreError, CoreResult};
use crate::lock::LockLevel;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of worker permits.
pub trait Throttle: Send + Sync {
    /// Acquires at least one permit, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if no permit frees up in time.
    fn acquire(&self, timeout: Duration) -> CoreResult<Permits>;
}

#[derive(Debug)]
struct PoolState {
    available: usize,
}

#[derive(Debug)]
struct PoolInner {
    capacity: usize,
    max_per_grant: usize,
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl PoolInner {
    fn give_back(&self, count: usize) {
        let mut state = self.state.lock();
        state.available = (state.available + count).min(self.capacity);
        drop(state);
        self.freed.notify_all();
    }
}

/// The shared, bounded permit pool.
#[derive(Debug, Clone)]
pub struct PermitPool {
    inner: Arc<PoolInner>,
}

impl PermitPool {
    /// Creates a pool of `capacity` permits granting at most `max_per_grant`
    /// to a single caller.
    #[must_use]
    pub fn new(capacity: usize, max_per_grant: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                max_per_grant: max_per_grant.clamp(1, capacity),
                state: Mutex::new(PoolState {
                    available: capacity,
                }),
                freed: Condvar::new(),
            }),
        }
    }

    /// Returns the number of free permits.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Returns the pool size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl Throttle for PermitPool {
    fn acquire(&self, timeout: Duration) -> CoreResult<Permits> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        let mut state = self.inner.state.lock();
        while state.available == 0 {
            let timed_out = match deadline {
                Some(deadline) => self.inner.freed.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.inner.freed.wait(&mut state);
                    false
                }
            };
            if timed_out && state.available == 0 {
                return Err(CoreError::lock_timeout(
                    "permit pool",
                    LockLevel::Permits,
                    "fan-out",
                    None,
                    0,
                    started.elapsed(),
                ));
            }
        }
        let count = state.available.min(self.inner.max_per_grant);
        state.available -= count;
        Ok(Permits {
            count,
            pool: Some(Arc::clone(&self.inner)),
            released: AtomicBool::new(false),
        })
    }
}

/// A throttle that always grants a fixed count without drawing on a pool.
///
/// Used for administrative rollback, which must not wait for permits.
#[derive(Debug, Clone, Copy)]
pub struct UnboundedThrottle(pub usize);

impl Throttle for UnboundedThrottle {
    fn acquire(&self, _timeout: Duration) -> CoreResult<Permits> {
        Ok(Permits {
            count: self.0.max(1),
            pool: None,
            released: AtomicBool::new(false),
        })
    }
}

/// A grant of worker permits. Returned to the pool on release or drop.
pub struct Permits {
    count: usize,
    pool: Option<Arc<PoolInner>>,
    released: AtomicBool,
}

impl Permits {
    /// Returns the number of permits granted.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the permits to their pool. Later calls do nothing.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pool) = &self.pool {
            pool.give_back(self.count);
        }
    }
}

impl Drop for Permits {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Permits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permits")
            .field("count", &self.count)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_is_greedy_but_capped() {
        let pool = PermitPool::new(10, 4);
        let first = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(first.count(), 4);
        let second = pool.acquire(Duration::from_millis(10)).unwrap();
        let third = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(second.count(), 4);
        assert_eq!(third.count(), 2);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = PermitPool::new(1, 1);
        let _held = pool.acquire(Duration::from_millis(10)).unwrap();
        let err = pool.acquire(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::LockTimeout {
                level: LockLevel::Permits,
                ..
            }
        ));
    }

    #[test]
    fn release_is_idempotent() {
        let pool = PermitPool::new(3, 3);
        let permits = pool.acquire(Duration::from_millis(10)).unwrap();
        permits.release();
        permits.release();
        drop(permits);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn waiter_wakes_when_permits_return() {
        let pool = PermitPool::new(1, 1);
        let held = pool.acquire(Duration::from_millis(10)).unwrap();
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire(Duration::from_secs(5)).map(|p| p.count()))
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn unbounded_throttle_never_waits() {
        let permits = UnboundedThrottle(16).acquire(Duration::ZERO).unwrap();
        assert_eq!(permits.count(), 16);
    }
}
