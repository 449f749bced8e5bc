//! The default [`Queue`] implementation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::rate_limiter::{RateLimiter, default_controller_rate_limiter};
use super::{Queue, QueueItem};

/// Longest delay `add_after` honours. Longer delays are clamped to it.
pub const MAX_DELAY: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Items handed out by `get`.
struct Fifo<T> {
    queue: VecDeque<T>,
    /// Items that need processing, queued or deferred behind `processing`.
    dirty: HashSet<T>,
    /// Items currently held by a worker.
    processing: HashSet<T>,
    shutting_down: bool,
}

/// Items waiting for their ready time.
struct Waiting<T> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    /// Live heap entry per item. Entries superseded by an earlier ready time
    /// stay in the heap and are skipped when popped.
    entries: HashMap<T, (Instant, u64)>,
    by_seq: HashMap<u64, T>,
    next_seq: u64,
}

impl<T: QueueItem> Waiting<T> {
    /// Schedule `item`, keeping the earlier ready time if it already waits.
    fn insert(&mut self, item: T, ready_at: Instant) -> bool {
        if let Some((existing, _)) = self.entries.get(&item) {
            if *existing <= ready_at {
                return false;
            }
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        if let Some((_, stale)) = self.entries.insert(item.clone(), (ready_at, seq)) {
            self.by_seq.remove(&stale);
        }
        self.by_seq.insert(seq, item);
        self.heap.push(Reverse((ready_at, seq)));
        true
    }

    /// Remove every item whose ready time has passed.
    fn pop_ready(&mut self, now: Instant) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(Reverse((at, seq))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            if let Some(item) = self.by_seq.remove(&seq) {
                self.entries.remove(&item);
                ready.push(item);
            }
        }
        ready
    }

    fn next_ready(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }
}

struct Inner<T> {
    name: String,
    fifo: Mutex<Fifo<T>>,
    item_added: Notify,
    waiting: Mutex<Waiting<T>>,
    waiting_changed: Notify,
    waiting_loop_started: AtomicBool,
    shutdown: CancellationToken,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T: QueueItem> Inner<T> {
    fn add(&self, item: T) {
        let mut fifo = lock(&self.fifo);
        if fifo.shutting_down || fifo.dirty.contains(&item) {
            return;
        }
        fifo.dirty.insert(item.clone());
        if fifo.processing.contains(&item) {
            return;
        }
        fifo.queue.push_back(item);
        drop(fifo);
        self.item_added.notify_one();
    }

    /// Move ready items to the FIFO, then sleep until the next ready time or
    /// until a new item starts waiting.
    async fn waiting_loop(self: Arc<Self>) {
        debug!(queue = %self.name, "Starting delayed-add loop");
        loop {
            let changed = self.waiting_changed.notified();
            let mut changed = pin!(changed);
            changed.as_mut().enable();

            let (ready, next) = {
                let mut waiting = lock(&self.waiting);
                let ready = waiting.pop_ready(Instant::now());
                (ready, waiting.next_ready())
            };
            for item in ready {
                self.add(item);
            }

            match next {
                Some(at) => tokio::select! {
                    () = self.shutdown.cancelled() => break,
                    () = tokio::time::sleep_until(at) => {}
                    () = &mut changed => {}
                },
                None => tokio::select! {
                    () = self.shutdown.cancelled() => break,
                    () = &mut changed => {}
                },
            }
        }
        debug!(queue = %self.name, "Delayed-add loop stopped");
    }
}

/// FIFO work queue with deduplication, delayed adds and per-item rate limiting.
///
/// Cloning yields another handle to the same queue.
pub struct RateLimitingQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RateLimitingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: QueueItem> RateLimitingQueue<T> {
    /// Create a queue named `name` (used in logs) backed by `limiter`.
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        Self::with_boxed_limiter(name, Box::new(limiter))
    }

    pub fn with_boxed_limiter(name: impl Into<String>, limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                fifo: Mutex::new(Fifo {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                item_added: Notify::new(),
                waiting: Mutex::new(Waiting {
                    heap: BinaryHeap::new(),
                    entries: HashMap::new(),
                    by_seq: HashMap::new(),
                    next_seq: 0,
                }),
                waiting_changed: Notify::new(),
                waiting_loop_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                limiter,
            }),
        }
    }

    /// A queue using [`default_controller_rate_limiter`].
    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    /// Number of items waiting for a delayed add.
    pub fn num_waiting(&self) -> usize {
        lock(&self.inner.waiting).entries.len()
    }

    fn ensure_waiting_loop(&self) {
        if self.inner.waiting_loop_started.load(Ordering::Acquire) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                if self
                    .inner
                    .waiting_loop_started
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    handle.spawn(Arc::clone(&self.inner).waiting_loop());
                }
            }
            Err(e) => {
                warn!(queue = %self.inner.name, error = %e, "No runtime for delayed adds");
            }
        }
    }
}

#[async_trait]
impl<T: QueueItem> Queue<T> for RateLimitingQueue<T> {
    fn add(&self, item: T) {
        self.inner.add(item);
    }

    async fn get(&self) -> Option<T> {
        loop {
            let added = self.inner.item_added.notified();
            let mut added = pin!(added);
            added.as_mut().enable();

            {
                let mut fifo = lock(&self.inner.fifo);
                if let Some(item) = fifo.queue.pop_front() {
                    fifo.dirty.remove(&item);
                    fifo.processing.insert(item.clone());
                    let more = !fifo.queue.is_empty();
                    drop(fifo);
                    if more {
                        // Pass the wakeup on in case another worker is parked.
                        self.inner.item_added.notify_one();
                    }
                    return Some(item);
                }
                if fifo.shutting_down {
                    return None;
                }
            }

            added.await;
        }
    }

    fn done(&self, item: &T) {
        let mut fifo = lock(&self.inner.fifo);
        fifo.processing.remove(item);
        if fifo.dirty.contains(item) {
            fifo.queue.push_back(item.clone());
            drop(fifo);
            self.inner.item_added.notify_one();
        }
    }

    fn forget(&self, item: &T) {
        self.inner.limiter.forget(item);
    }

    fn add_rate_limited(&self, item: T) {
        let delay = self.inner.limiter.when(&item);
        self.add_after(item, delay);
    }

    fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        if delay > MAX_DELAY {
            warn!(queue = %self.inner.name, ?delay, "Clamping delayed add");
        }
        let now = Instant::now();
        let ready_at = now.checked_add(delay.min(MAX_DELAY)).unwrap_or(now);
        let earlier = lock(&self.inner.waiting).insert(item, ready_at);
        if earlier {
            self.ensure_waiting_loop();
            self.inner.waiting_changed.notify_one();
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.inner.limiter.num_requeues(item)
    }

    fn len(&self) -> usize {
        lock(&self.inner.fifo).queue.len()
    }

    fn shut_down(&self) {
        lock(&self.inner.fifo).shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.item_added.notify_waiters();
        debug!(queue = %self.inner.name, "Queue shut down");
    }

    fn is_shutting_down(&self) -> bool {
        lock(&self.inner.fifo).shutting_down
    }
}
