//! Keyed single-producer, multi-consumer fan-out.
//!
//! A [`Router`] drains a source of work items on a producer thread and hands
//! each item to one of several consumers, each owning a bounded queue. Routing
//! is key-sticky: the first time a key is seen it goes to
//! `key % current consumer count`, and every later item with that key goes to
//! the same consumer. Items for one key are therefore processed in order by a
//! single thread.
//!
//! Consumers can be added while the router runs, either by
//! [`Router::add_consumers`] or by a blocked thread donating itself through
//! [`Router::use_me_as_consumer`]. The producer admits new consumers only after
//! every existing consumer has acknowledged a pause message.
//!
//! The first error from the source or a consumer is latched, cancels the run,
//! and is returned by [`Router::wait_for_completion`].

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const PROGRESS_EVERY: u64 = 16_384;
const PAUSE_REPORT_AFTER: Duration = Duration::from_secs(10);

/// Supplies the key an item is routed by.
pub trait RoutingKey {
    /// Returns the routing key. Equal keys always reach the same consumer.
    fn routing_key(&self) -> u64;
}

/// Processes routed items.
pub trait Consumer<T>: Send + Sync {
    /// Consumes one item.
    ///
    /// # Errors
    ///
    /// Any error cancels the run and is reported to the waiter.
    fn consume(&self, item: T) -> CoreResult<()>;
}

impl<T, F> Consumer<T> for F
where
    F: Fn(T) -> CoreResult<()> + Send + Sync,
{
    fn consume(&self, item: T) -> CoreResult<()> {
        self(item)
    }
}

/// A running fan-out that a blocked thread can join as an extra consumer.
pub trait Donatable: Send + Sync {
    /// Runs a consumer loop on the calling thread until the run ends.
    ///
    /// Returns false without blocking if the run no longer accepts donors.
    fn donate(&self) -> bool;
}

/// The work source drained by the producer.
pub type WorkSource<T> = Box<dyn Iterator<Item = CoreResult<T>> + Send>;

/// Final counts of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterSummary {
    /// Items consumed successfully.
    pub consumed: u64,
    /// Consumers that took part, including donated threads.
    pub consumers: usize,
}

enum Message<T> {
    Work(T),
    Pause(Arc<PauseGate>),
    Terminate,
}

/// Rendezvous used to hold consumers while a queue is added.
struct PauseGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

struct GateState {
    acked: usize,
    released: bool,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                acked: 0,
                released: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn ack_and_wait(&self) {
        let mut state = self.state.lock();
        state.acked += 1;
        self.changed.notify_all();
        while !state.released {
            self.changed.wait(&mut state);
        }
    }

    fn wait_for_acks(&self, expected: usize, router: &str) {
        let mut state = self.state.lock();
        while state.acked < expected {
            if self
                .changed
                .wait_for(&mut state, PAUSE_REPORT_AFTER)
                .timed_out()
                && state.acked < expected
            {
                warn!(
                    router,
                    acked = state.acked,
                    expected,
                    "consumers slow to acknowledge pause"
                );
            }
        }
    }

    fn release(&self) {
        self.state.lock().released = true;
        self.changed.notify_all();
    }
}

struct Donations<T> {
    closed: bool,
    pending: Vec<SyncSender<Message<T>>>,
}

#[derive(Default)]
struct Progress {
    producer_done: bool,
    live: usize,
    consumers: usize,
    consumed: u64,
    error: Option<CoreError>,
}

struct Shared<T> {
    name: String,
    consumer: Arc<dyn Consumer<T>>,
    queue_length: usize,
    donations: Mutex<Donations<T>>,
    donors_waiting: AtomicBool,
    cancelled: AtomicBool,
    progress: Mutex<Progress>,
    finished: Condvar,
}

impl<T> Shared<T> {
    fn latch(&self, error: CoreError) {
        self.cancelled.store(true, Ordering::SeqCst);
        let mut progress = self.progress.lock();
        if progress.error.is_none() {
            debug!(router = %self.name, %error, "router run failed");
            progress.error = Some(error);
        }
    }
}

/// A running fan-out over items of type `T`.
pub struct Router<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Router<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Router<T>
where
    T: RoutingKey + Send + 'static,
{
    /// Starts a run with `consumers` dedicated consumer threads.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a thread cannot be spawned.
    pub fn start(
        name: impl Into<String>,
        source: WorkSource<T>,
        consumer: Arc<dyn Consumer<T>>,
        consumers: usize,
        queue_length: usize,
    ) -> CoreResult<Self> {
        let consumers = consumers.max(1);
        let shared = Arc::new(Shared {
            name: name.into(),
            consumer,
            queue_length: queue_length.max(1),
            donations: Mutex::new(Donations {
                closed: false,
                pending: Vec::new(),
            }),
            donors_waiting: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            progress: Mutex::new(Progress {
                live: consumers,
                consumers,
                ..Progress::default()
            }),
            finished: Condvar::new(),
        });

        let mut senders = Vec::with_capacity(consumers);
        for index in 0..consumers {
            let (tx, rx) = mpsc::sync_channel(shared.queue_length);
            senders.push(tx);
            let worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-c{index}", shared.name))
                .spawn(move || run_consumer(&worker, &rx));
            if let Err(error) = spawned {
                // Threads already started see their queues close and exit.
                let mut progress = shared.progress.lock();
                progress.live -= consumers - index;
                progress.producer_done = true;
                return Err(error.into());
            }
        }

        let producer = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-producer", shared.name))
            .spawn(move || run_producer(&producer, source, senders));
        if let Err(error) = spawned {
            let mut progress = shared.progress.lock();
            progress.producer_done = true;
            return Err(error.into());
        }

        Ok(Self { shared })
    }

    /// Starts a run and waits for it.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by the source or a consumer.
    pub fn run(
        name: impl Into<String>,
        source: WorkSource<T>,
        consumer: Arc<dyn Consumer<T>>,
        consumers: usize,
        queue_length: usize,
    ) -> CoreResult<RouterSummary> {
        Self::start(name, source, consumer, consumers, queue_length)?.wait_for_completion()
    }

    /// Adds `count` dedicated consumer threads to the running fan-out.
    ///
    /// Returns how many were added; zero once the producer has finished.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a thread cannot be spawned.
    pub fn add_consumers(&self, count: usize) -> CoreResult<usize> {
        let mut added = 0;
        for _ in 0..count {
            let Some(rx) = self.register() else { break };
            let worker = Arc::clone(&self.shared);
            let index = self.shared.progress.lock().consumers;
            let spawned = thread::Builder::new()
                .name(format!("{}-c{index}", self.shared.name))
                .spawn(move || run_consumer(&worker, &rx));
            if let Err(error) = spawned {
                // The receiver was dropped, so the producer's terminate send fails
                // harmlessly; only the live count needs correcting.
                let mut progress = self.shared.progress.lock();
                progress.live -= 1;
                drop(progress);
                self.shared.finished.notify_all();
                return Err(error.into());
            }
            added += 1;
        }
        Ok(added)
    }

    /// Runs a consumer loop on the calling thread until the run terminates.
    ///
    /// Returns false immediately if the producer has already finished.
    pub fn use_me_as_consumer(&self) -> bool {
        match self.register() {
            Some(rx) => {
                run_consumer(&self.shared, &rx);
                true
            }
            None => false,
        }
    }

    fn register(&self) -> Option<Receiver<Message<T>>> {
        let mut donations = self.shared.donations.lock();
        if donations.closed {
            return None;
        }
        let (tx, rx) = mpsc::sync_channel(self.shared.queue_length);
        donations.pending.push(tx);
        {
            let mut progress = self.shared.progress.lock();
            progress.live += 1;
            progress.consumers += 1;
        }
        self.shared.donors_waiting.store(true, Ordering::SeqCst);
        Some(rx)
    }
}

impl<T> Router<T> {
    /// Requests cooperative cancellation.
    ///
    /// The producer stops draining and consumers discard queued work.
    pub fn cancel(&self) {
        self.shared
            .latch(CoreError::interrupted(format!("router {} cancelled", self.shared.name)));
    }

    /// Returns true once cancellation was requested or an error was latched.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Returns true when the producer has finished and every consumer exited.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let progress = self.shared.progress.lock();
        progress.producer_done && progress.live == 0
    }

    /// Blocks until the run completes.
    ///
    /// # Errors
    ///
    /// Returns the first latched error. Only the first waiter receives it.
    pub fn wait_for_completion(&self) -> CoreResult<RouterSummary> {
        let mut progress = self.shared.progress.lock();
        while !(progress.producer_done && progress.live == 0) {
            self.shared.finished.wait(&mut progress);
        }
        if let Some(error) = progress.error.take() {
            return Err(error);
        }
        Ok(RouterSummary {
            consumed: progress.consumed,
            consumers: progress.consumers,
        })
    }
}

impl<T> Donatable for Router<T>
where
    T: RoutingKey + Send + 'static,
{
    fn donate(&self) -> bool {
        self.use_me_as_consumer()
    }
}

impl<T> fmt::Debug for Router<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = self.shared.progress.lock();
        f.debug_struct("Router")
            .field("name", &self.shared.name)
            .field("consumers", &progress.consumers)
            .field("consumed", &progress.consumed)
            .finish_non_exhaustive()
    }
}

fn run_producer<T: RoutingKey>(
    shared: &Shared<T>,
    source: WorkSource<T>,
    mut senders: Vec<SyncSender<Message<T>>>,
) {
    let mut assignment: HashMap<u64, usize> = HashMap::new();
    let mut produced = 0u64;

    for item in source {
        if shared.cancelled.load(Ordering::SeqCst) {
            break;
        }
        let item = match item {
            Ok(item) => item,
            Err(error) => {
                shared.latch(error);
                break;
            }
        };
        if shared.donors_waiting.swap(false, Ordering::SeqCst) {
            admit_pending(shared, &mut senders);
        }

        let key = item.routing_key();
        let count = senders.len() as u64;
        let index = *assignment
            .entry(key)
            .or_insert_with(|| (key % count) as usize);
        if senders[index].send(Message::Work(item)).is_err() {
            shared.latch(CoreError::interrupted(format!(
                "router {} lost consumer {index}",
                shared.name
            )));
            break;
        }

        produced += 1;
        if produced % PROGRESS_EVERY == 0 {
            debug!(router = %shared.name, produced, consumers = senders.len(), "router progress");
        }
    }

    {
        let mut donations = shared.donations.lock();
        donations.closed = true;
        senders.append(&mut donations.pending);
    }
    for sender in &senders {
        let _ = sender.send(Message::Terminate);
    }
    drop(senders);

    shared.progress.lock().producer_done = true;
    shared.finished.notify_all();
}

fn admit_pending<T>(shared: &Shared<T>, senders: &mut Vec<SyncSender<Message<T>>>) {
    let mut joining = std::mem::take(&mut shared.donations.lock().pending);
    if joining.is_empty() {
        return;
    }
    let gate = Arc::new(PauseGate::new());
    let mut paused = 0;
    for sender in senders.iter() {
        if sender.send(Message::Pause(Arc::clone(&gate))).is_ok() {
            paused += 1;
        }
    }
    gate.wait_for_acks(paused, &shared.name);
    senders.append(&mut joining);
    gate.release();
    debug!(router = %shared.name, consumers = senders.len(), "router resized");
}

fn run_consumer<T>(shared: &Shared<T>, rx: &Receiver<Message<T>>) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Work(item) => {
                if shared.cancelled.load(Ordering::SeqCst) {
                    continue;
                }
                let consumer = &shared.consumer;
                match panic::catch_unwind(AssertUnwindSafe(|| consumer.consume(item))) {
                    Ok(Ok(())) => shared.progress.lock().consumed += 1,
                    Ok(Err(error)) => shared.latch(error),
                    Err(_) => shared.latch(CoreError::interrupted(format!(
                        "router {} consumer panicked",
                        shared.name
                    ))),
                }
            }
            Message::Pause(gate) => gate.ack_and_wait(),
            Message::Terminate => break,
        }
    }
    shared.progress.lock().live -= 1;
    shared.finished.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU64;
    use std::thread::ThreadId;

    #[derive(Debug)]
    struct Work {
        key: u64,
        seq: u64,
    }

    impl RoutingKey for Work {
        fn routing_key(&self) -> u64 {
            self.key
        }
    }

    type Seen = Arc<Mutex<HashMap<u64, HashSet<ThreadId>>>>;

    fn recording_consumer(seen: &Seen) -> Arc<dyn Consumer<Work>> {
        let seen = Arc::clone(seen);
        Arc::new(move |work: Work| -> CoreResult<()> {
            seen.lock()
                .entry(work.key)
                .or_default()
                .insert(thread::current().id());
            Ok(())
        })
    }

    fn source(items: Vec<(u64, u64)>) -> WorkSource<Work> {
        Box::new(
            items
                .into_iter()
                .map(|(key, seq)| Ok::<_, CoreError>(Work { key, seq })),
        )
    }

    #[test]
    fn every_item_is_consumed_once() {
        let seen: Seen = Arc::default();
        let items: Vec<_> = (0..1000).map(|i| (i % 37, i)).collect();
        let summary =
            Router::run("t", source(items), recording_consumer(&seen), 4, 8).unwrap();
        assert_eq!(summary.consumed, 1000);
        assert_eq!(summary.consumers, 4);
        assert!(seen.lock().values().all(|threads| threads.len() == 1));
    }

    #[test]
    fn keys_stay_ordered_within_consumer() {
        let last: Arc<Mutex<HashMap<u64, u64>>> = Arc::default();
        let check = Arc::clone(&last);
        let consumer: Arc<dyn Consumer<Work>> = Arc::new(move |work: Work| -> CoreResult<()> {
            let mut last = check.lock();
            let previous = last.insert(work.key, work.seq);
            if previous.is_some_and(|p| p >= work.seq) {
                return Err(CoreError::invalid_operation("out of order"));
            }
            Ok(())
        });
        let items: Vec<_> = (0..2000).map(|i| (i % 11, i)).collect();
        Router::run("order", source(items), consumer, 3, 4).unwrap();
    }

    #[test]
    fn live_resize_keeps_keys_sticky() {
        let seen: Seen = Arc::default();
        let (tx, rx) = mpsc::channel::<CoreResult<Work>>();
        let router = Router::start(
            "resize",
            Box::new(rx.into_iter()),
            recording_consumer(&seen),
            2,
            4,
        )
        .unwrap();

        for i in 0..500 {
            tx.send(Ok(Work { key: i % 13, seq: i })).unwrap();
        }
        assert_eq!(router.add_consumers(1).unwrap(), 1);
        for i in 500..1000 {
            tx.send(Ok(Work { key: i % 29, seq: i })).unwrap();
        }
        drop(tx);

        let summary = router.wait_for_completion().unwrap();
        assert_eq!(summary.consumed, 1000);
        assert_eq!(summary.consumers, 3);
        assert!(seen.lock().values().all(|threads| threads.len() == 1));
    }

    #[test]
    fn donated_thread_consumes_work() {
        let consumed_here = Arc::new(AtomicU64::new(0));
        let donor_thread = Arc::new(Mutex::new(None::<ThreadId>));
        let (tx, rx) = mpsc::channel::<CoreResult<Work>>();
        let counter = Arc::clone(&consumed_here);
        let donor = Arc::clone(&donor_thread);
        let consumer: Arc<dyn Consumer<Work>> = Arc::new(move |_work: Work| -> CoreResult<()> {
            if *donor.lock() == Some(thread::current().id()) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });
        let router = Router::start("donate", Box::new(rx.into_iter()), consumer, 1, 2).unwrap();

        let helper = {
            let router = router.clone();
            let donor = Arc::clone(&donor_thread);
            thread::spawn(move || {
                *donor.lock() = Some(thread::current().id());
                router.use_me_as_consumer()
            })
        };
        thread::sleep(Duration::from_millis(20));
        for i in 0..200 {
            tx.send(Ok(Work { key: i, seq: i })).unwrap();
        }
        drop(tx);

        assert!(helper.join().unwrap());
        let summary = router.wait_for_completion().unwrap();
        assert_eq!(summary.consumed, 200);
        assert_eq!(summary.consumers, 2);
        assert!(consumed_here.load(Ordering::SeqCst) > 0);
        assert!(!router.use_me_as_consumer());
    }

    #[test]
    fn first_error_wins_and_cancels() {
        let consumer: Arc<dyn Consumer<Work>> = Arc::new(|work: Work| -> CoreResult<()> {
            if work.seq == 10 {
                Err(CoreError::storage_corruption("bad item"))
            } else {
                Ok(())
            }
        });
        let items: Vec<_> = (0..10_000).map(|i| (i, i)).collect();
        let err = Router::run("fail", source(items), consumer, 2, 2).unwrap_err();
        assert!(matches!(err, CoreError::StorageCorruption { .. }));
    }

    #[test]
    fn source_error_is_reported() {
        let items: WorkSource<Work> = Box::new(
            vec![
                Ok(Work { key: 1, seq: 1 }),
                Err(CoreError::journal_corruption("torn entry")),
            ]
            .into_iter(),
        );
        let consumer: Arc<dyn Consumer<Work>> = Arc::new(|_work: Work| -> CoreResult<()> { Ok(()) });
        let err = Router::run("src", items, consumer, 1, 1).unwrap_err();
        assert!(matches!(err, CoreError::JournalCorruption { .. }));
    }

    #[test]
    fn consumer_panic_is_latched() {
        let consumer: Arc<dyn Consumer<Work>> = Arc::new(|_work: Work| -> CoreResult<()> { panic!("consumer bug") });
        let err = Router::run("panic", source(vec![(1, 1)]), consumer, 1, 1).unwrap_err();
        assert!(matches!(err, CoreError::Interrupted { .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn partition_is_complete_and_sticky(
            keys in prop::collection::vec(0u64..64, 1..400),
            consumers in 1usize..5,
            grow in 0usize..3,
        ) {
            let seen: Seen = Arc::default();
            let items: Vec<_> = keys.iter().enumerate().map(|(i, k)| (*k, i as u64)).collect();
            let router = Router::start("prop", source(items), recording_consumer(&seen), consumers, 2).unwrap();
            router.add_consumers(grow).unwrap();
            let summary = router.wait_for_completion().unwrap();
            prop_assert_eq!(summary.consumed, keys.len() as u64);
            prop_assert!(seen.lock().values().all(|threads| threads.len() == 1));
        }
    }
}
