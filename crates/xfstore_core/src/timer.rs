//! Auto-rollback of idle transactions.
//!
//! One scheduler thread keeps every pending deadline in an ordered map. When
//! a deadline passes, the transaction is handed to the [`RollbackTarget`] on a
//! short-lived thread so a slow rollback never delays other deadlines.

use crate::error::CoreResult;
use crate::types::Xid;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::warn;

/// Receives transactions whose idle deadline has passed.
pub trait RollbackTarget: Send + Sync {
    /// Rolls back `xid` because it has been idle too long.
    fn auto_rollback(&self, xid: &Xid);
}

type Slot = (Instant, u64);

#[derive(Default)]
struct SchedulerState {
    queue: BTreeMap<Slot, Xid>,
    next_seq: u64,
    shutdown: bool,
    target: Option<Weak<dyn RollbackTarget>>,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    changed: Condvar,
}

impl SchedulerShared {
    fn insert(&self, xid: Xid, timeout: Duration) -> Option<Slot> {
        let deadline = Instant::now().checked_add(timeout)?;
        let mut state = self.state.lock();
        let slot = (deadline, state.next_seq);
        state.next_seq += 1;
        state.queue.insert(slot, xid);
        drop(state);
        self.changed.notify_all();
        Some(slot)
    }

    fn remove(&self, slot: Slot) {
        self.state.lock().queue.remove(&slot);
    }
}

/// The scheduler thread shared by all transactions of one engine.
pub struct RollbackScheduler {
    shared: Arc<SchedulerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RollbackScheduler {
    /// Starts the scheduler thread.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the thread cannot be spawned.
    pub fn start() -> CoreResult<Self> {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState::default()),
            changed: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("xfstore-auto-rollback".to_string())
            .spawn(move || run_scheduler(&worker))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Sets the object that performs rollbacks.
    pub fn set_target(&self, target: Weak<dyn RollbackTarget>) {
        self.shared.state.lock().target = Some(target);
    }

    /// Schedules a rollback of `xid` after `timeout` of idleness.
    #[must_use]
    pub fn schedule(&self, xid: Xid, timeout: Duration) -> AutoRollback {
        let slot = self.shared.insert(xid.clone(), timeout);
        AutoRollback {
            shared: Arc::clone(&self.shared),
            xid,
            slot: Mutex::new(slot),
        }
    }

    /// Returns the number of pending deadlines.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stops the scheduler thread. Pending deadlines are dropped.
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.changed.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RollbackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RollbackScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackScheduler")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

fn run_scheduler(shared: &SchedulerShared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some((&slot, _)) = state.queue.iter().next() else {
            shared.changed.wait(&mut state);
            continue;
        };
        if slot.0 > Instant::now() {
            shared.changed.wait_until(&mut state, slot.0);
            continue;
        }
        let Some(xid) = state.queue.remove(&slot) else {
            continue;
        };
        let Some(target) = state.target.as_ref().and_then(Weak::upgrade) else {
            continue;
        };
        drop(state);
        warn!(%xid, "transaction idle past its deadline, rolling back");
        let spawned = thread::Builder::new()
            .name(format!("xfstore-rollback-{xid}"))
            .spawn(move || target.auto_rollback(&xid));
        if let Err(error) = spawned {
            warn!(%error, "could not start auto-rollback thread");
        }
        state = shared.state.lock();
    }
}

/// A transaction's pending auto-rollback.
pub struct AutoRollback {
    shared: Arc<SchedulerShared>,
    xid: Xid,
    slot: Mutex<Option<Slot>>,
}

impl AutoRollback {
    /// Replaces the deadline with `timeout` from now.
    pub fn reschedule(&self, timeout: Duration) {
        let mut slot = self.slot.lock();
        if let Some(old) = slot.take() {
            self.shared.remove(old);
        }
        *slot = self.shared.insert(self.xid.clone(), timeout);
    }

    /// Cancels the pending rollback.
    pub fn cancel(&self) {
        if let Some(old) = self.slot.lock().take() {
            self.shared.remove(old);
        }
    }

    /// Returns the deadline, or `None` if cancelled or unbounded.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.slot.lock().map(|(deadline, _)| deadline)
    }

    /// Returns the deadline as wall-clock time.
    #[must_use]
    pub fn deadline_time(&self) -> Option<SystemTime> {
        let deadline = self.deadline()?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        SystemTime::now().checked_add(remaining)
    }
}

impl Drop for AutoRollback {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for AutoRollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoRollback")
            .field("xid", &self.xid)
            .field("deadline", &self.deadline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Recorder(Mutex<mpsc::Sender<Xid>>);

    impl RollbackTarget for Recorder {
        fn auto_rollback(&self, xid: &Xid) {
            let _ = self.0.lock().send(xid.clone());
        }
    }

    fn scheduler() -> (RollbackScheduler, Arc<Recorder>, mpsc::Receiver<Xid>) {
        let (tx, rx) = mpsc::channel();
        let recorder = Arc::new(Recorder(Mutex::new(tx)));
        let scheduler = RollbackScheduler::start().unwrap();
        let target: Arc<dyn RollbackTarget> = recorder.clone();
        scheduler.set_target(Arc::downgrade(&target));
        (scheduler, recorder, rx)
    }

    #[test]
    fn deadline_fires_rollback() {
        let (scheduler, _recorder, rx) = scheduler();
        let _handle = scheduler.schedule(Xid::Local(7), Duration::from_millis(20));
        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fired, Xid::Local(7));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn cancelled_deadline_does_not_fire() {
        let (scheduler, _recorder, rx) = scheduler();
        let handle = scheduler.schedule(Xid::Local(1), Duration::from_millis(30));
        handle.cancel();
        assert!(handle.deadline().is_none());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn reschedule_pushes_deadline_back() {
        let (scheduler, _recorder, rx) = scheduler();
        let handle = scheduler.schedule(Xid::Local(2), Duration::from_millis(30));
        let first = handle.deadline().unwrap();
        handle.reschedule(Duration::from_secs(60));
        assert!(handle.deadline().unwrap() > first);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(scheduler.pending(), 1);
        assert!(handle.deadline_time().is_some());
    }

    #[test]
    fn dropping_handle_cancels() {
        let (scheduler, _recorder, _rx) = scheduler();
        drop(scheduler.schedule(Xid::Local(3), Duration::from_secs(60)));
        assert_eq!(scheduler.pending(), 0);
    }
}
