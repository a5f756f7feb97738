//! Per-item three-level lock.
//!
//! An [`ItemLock`] combines:
//! - a shared **read** lock taken for every access, including enrollment
//! - an exclusive **write** lock held briefly to mutate item bookkeeping
//! - a **transaction** lock keyed by transaction id, reentrant for its owner
//!
//! While a transaction holds the transaction lock, readers and writers from
//! other transactions wait; the owner's own threads pass straight through.
//! Every blocking acquisition is bounded by a timeout and fails with
//! [`CoreError::LockTimeout`] carrying the current owner and queue length.

use crate::error::{CoreError, CoreResult};
use crate::types::Xid;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// The lock a timed-out request was waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockLevel {
    /// Shared item read lock.
    Read,
    /// Exclusive item write lock.
    Write,
    /// Transaction-exclusive item lock.
    Transaction,
    /// A coordinator's lifecycle lock.
    Coordinator,
    /// Worker permits from the shared pool.
    Permits,
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Transaction => "transaction",
            Self::Coordinator => "coordinator",
            Self::Permits => "permit",
        };
        f.write_str(name)
    }
}

impl CoreError {
    /// Creates a lock timeout error.
    pub fn lock_timeout(
        resource: impl Into<String>,
        level: LockLevel,
        requester: impl ToString,
        owner: Option<String>,
        queue_length: usize,
        waited: Duration,
    ) -> Self {
        Self::LockTimeout {
            resource: resource.into(),
            level,
            requester: requester.to_string(),
            owner,
            queue_length,
            waited,
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    readers: BTreeMap<Xid, usize>,
    writer: Option<(ThreadId, String)>,
    holder: Option<Xid>,
    holds: usize,
    waiting: usize,
}

impl LockState {
    fn foreign_holder(&self, xid: &Xid) -> bool {
        self.holder.as_ref().is_some_and(|h| h != xid)
    }

    fn can_read(&self, xid: &Xid) -> bool {
        self.writer.is_none() && !self.foreign_holder(xid)
    }

    fn can_write(&self, xid: &Xid) -> bool {
        self.writer.is_none() && self.readers.is_empty() && !self.foreign_holder(xid)
    }

    fn can_hold(&self, xid: &Xid) -> bool {
        self.writer.is_none()
            && !self.foreign_holder(xid)
            && self.readers.keys().all(|reader| reader == xid)
    }

    fn owner(&self) -> Option<String> {
        if let Some(holder) = &self.holder {
            return Some(holder.to_string());
        }
        if let Some((_, name)) = &self.writer {
            return Some(format!("thread {name}"));
        }
        self.readers
            .keys()
            .next()
            .map(|reader| format!("reader {reader}"))
    }
}

/// The lock owned by one item object.
pub struct ItemLock {
    resource: String,
    state: Mutex<LockState>,
    changed: Condvar,
}

impl ItemLock {
    /// Creates an unlocked lock; `resource` names the item in diagnostics.
    #[must_use]
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            state: Mutex::new(LockState::default()),
            changed: Condvar::new(),
        }
    }

    /// Returns the name used in diagnostics.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Acquires a shared read lock on behalf of `xid`.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if another transaction holds the transaction
    /// lock, or a writer is active, for longer than `timeout`.
    pub fn read(&self, xid: &Xid, timeout: Duration) -> CoreResult<ReadGuard<'_>> {
        let mut state = self.wait(LockLevel::Read, xid, timeout, |s| s.can_read(xid))?;
        *state.readers.entry(xid.clone()).or_insert(0) += 1;
        Ok(ReadGuard {
            lock: self,
            xid: xid.clone(),
        })
    }

    /// Acquires a read lock only if it is available right now.
    #[must_use]
    pub fn try_read(&self, xid: &Xid) -> Option<ReadGuard<'_>> {
        let mut state = self.state.lock();
        if !state.can_read(xid) {
            return None;
        }
        *state.readers.entry(xid.clone()).or_insert(0) += 1;
        Some(ReadGuard {
            lock: self,
            xid: xid.clone(),
        })
    }

    /// Acquires the exclusive write lock on behalf of `xid`.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the lock cannot be taken within `timeout`.
    pub fn write(&self, xid: &Xid, timeout: Duration) -> CoreResult<WriteGuard<'_>> {
        let mut state = self.wait(LockLevel::Write, xid, timeout, |s| s.can_write(xid))?;
        let current = thread::current();
        let name = current
            .name()
            .map_or_else(|| format!("{:?}", current.id()), str::to_string);
        state.writer = Some((current.id(), name));
        Ok(WriteGuard { lock: self })
    }

    /// Acquires the transaction lock for `xid`.
    ///
    /// Reentrant: if `xid` already holds it, the hold count is incremented
    /// without waiting.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if another transaction keeps the lock, or keeps
    /// reading, for longer than `timeout`.
    pub fn acquire_transaction_lock(&self, xid: &Xid, timeout: Duration) -> CoreResult<()> {
        {
            let mut state = self.state.lock();
            if state.holder.as_ref() == Some(xid) {
                state.holds += 1;
                return Ok(());
            }
        }
        let mut state = self.wait(LockLevel::Transaction, xid, timeout, |s| s.can_hold(xid))?;
        state.holder = Some(xid.clone());
        state.holds = 1;
        Ok(())
    }

    /// Releases one hold of the transaction lock.
    ///
    /// Returns true if the lock became free.
    pub fn release_transaction_lock(&self, xid: &Xid) -> bool {
        let mut state = self.state.lock();
        if state.holder.as_ref() != Some(xid) {
            return false;
        }
        state.holds = state.holds.saturating_sub(1);
        if state.holds == 0 {
            state.holder = None;
            drop(state);
            self.changed.notify_all();
            return true;
        }
        false
    }

    /// Releases every hold `xid` has on the transaction lock.
    pub fn release_all_transaction_holds(&self, xid: &Xid) {
        let mut state = self.state.lock();
        if state.holder.as_ref() == Some(xid) {
            state.holder = None;
            state.holds = 0;
            drop(state);
            self.changed.notify_all();
        }
    }

    /// Returns the transaction holding the transaction lock, if any.
    #[must_use]
    pub fn transaction_lock_holder(&self) -> Option<Xid> {
        self.state.lock().holder.clone()
    }

    /// Returns how many threads are waiting on this lock.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.state.lock().waiting
    }

    /// Returns the number of read locks currently held.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.values().sum()
    }

    /// Returns the name of the thread holding the write lock, if any.
    #[must_use]
    pub fn write_owner(&self) -> Option<String> {
        self.state.lock().writer.as_ref().map(|(_, name)| name.clone())
    }

    fn wait(
        &self,
        level: LockLevel,
        xid: &Xid,
        timeout: Duration,
        ready: impl Fn(&LockState) -> bool,
    ) -> CoreResult<MutexGuard<'_, LockState>> {
        let mut state = self.state.lock();
        if ready(&state) {
            return Ok(state);
        }
        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        state.waiting += 1;
        loop {
            let timed_out = match deadline {
                Some(deadline) => self.changed.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.changed.wait(&mut state);
                    false
                }
            };
            if ready(&state) {
                state.waiting -= 1;
                return Ok(state);
            }
            if timed_out {
                let queue_length = state.waiting;
                state.waiting -= 1;
                return Err(CoreError::lock_timeout(
                    self.resource.clone(),
                    level,
                    xid,
                    state.owner(),
                    queue_length,
                    started.elapsed(),
                ));
            }
        }
    }
}

impl fmt::Debug for ItemLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ItemLock")
            .field("resource", &self.resource)
            .field("holder", &state.holder)
            .field("readers", &state.readers.len())
            .field("waiting", &state.waiting)
            .finish_non_exhaustive()
    }
}

/// A held read lock. Released on drop.
pub struct ReadGuard<'a> {
    lock: &'a ItemLock,
    xid: Xid,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        if let Some(count) = state.readers.get_mut(&self.xid) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&self.xid);
            }
        }
        drop(state);
        self.lock.changed.notify_all();
    }
}

/// A held write lock. Released on drop.
pub struct WriteGuard<'a> {
    lock: &'a ItemLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.lock().writer = None;
        self.lock.changed.notify_all();
    }
}
