//! Implements the LRU eviction policy, with optional time-based expiry.
//!
//! A single worker task owns the recency order. Producers talk to it over a bounded channel, so
//! recording an access never blocks on a lock shared with other requests. Evicted keys are handed
//! to a [`Deleter`], one spawned task per key, and the deleter may refuse: a [`Eviction::Retained`]
//! key goes back to the most-recently-used end of the queue and is considered again by a later
//! cull or sweep.

use std::{future::Future, hash::Hash, time::Duration};

use crate::sync::{
    Arc,
    atomic::{self, AtomicU64, AtomicUsize},
};

use hashlink::LinkedHashMap;
use tokio::{
    sync::mpsc::{Receiver, Sender, WeakSender, error::TrySendError},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::trace;

/// Types that carry a monotonic version for deduplication of out-of-order messages.
pub trait Versioned {
    /// Returns the monotonic version of this value.
    fn version(&self) -> u64;
}

/// Types that stop being fresh at a fixed instant.
pub trait Expiring {
    /// The instant after which the value is eligible for eviction.
    fn expires_at(&self) -> Instant;
}

/// What a [`Deleter`] did with a key it was asked to evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// The key is gone; stop tracking it.
    Removed,
    /// The key must stay; track it again as most recently used.
    Retained,
}

/// A trait for deleting keys from the cache. This is used by the LRU eviction tracker to delete
/// keys when they are evicted.
pub trait Deleter<K, Ctx>: Send + Clone + 'static {
    /// Try to delete `key`. Returning [`Eviction::Retained`] puts the key back into the queue with
    /// the same context.
    fn delete(&mut self, key: K, ctx: Ctx) -> impl Future<Output = Eviction> + Send;
}

/// Messages sent to the LRU eviction tracker worker.
#[derive(Debug, Clone)]
enum Message<K, C> {
    /// Notify the LRU eviction tracker that the given key was accessed.
    Accessed(K, usize),
    /// Request an eviction set of the given size.
    Evict(u32),
    /// Evict every key whose context expired at or before the given instant.
    Expire(Instant),
    /// Stop tracking a key without deleting it, if it still carries the given version.
    Forget(K, u64),
    /// Notify the LRU eviction tracker that a key was inserted or overwritten.
    Upserted(K, C),
}

/// Tracks in-flight eviction batches and individual deletions using a single packed `AtomicU64`.
///
/// Layout: `[upper 32 bits: pending batches | lower 32 bits: active deletions]`
///
/// 1. A producer calls `submit_batch()` before enqueueing `Evict`/`Expire`.
/// 2. The worker calls `process_batch(n)` when it picks the batch up, moving one unit from the
///    upper half to `n` units in the lower half.
/// 3. Each deletion task calls `observe_deletion()` when it finishes.
///
/// The indicator reads zero only when no batches are pending and no deletions are in flight.
#[derive(Debug)]
struct DeletionIndicator {
    underlying: AtomicU64,
}

impl DeletionIndicator {
    const BATCH: u64 = 1 << 32;

    fn new() -> Self {
        Self {
            underlying: AtomicU64::new(0),
        }
    }

    fn submit_batch(&self) {
        self.underlying
            .fetch_add(Self::BATCH, atomic::Ordering::Relaxed);
    }

    /// Undo a `submit_batch` call after `try_send` failed.
    fn undo_submit_batch(&self) {
        self.underlying
            .fetch_sub(Self::BATCH, atomic::Ordering::Relaxed);
    }

    fn process_batch(&self, count: u32) {
        // Add the deletions before retiring the batch so the value never passes through zero.
        self.underlying
            .fetch_add(u64::from(count), atomic::Ordering::Relaxed);
        self.underlying
            .fetch_sub(Self::BATCH, atomic::Ordering::Relaxed);
    }

    fn observe_deletion(&self) {
        self.underlying.fetch_sub(1, atomic::Ordering::Relaxed);
    }

    fn have_pending_work(&self) -> bool {
        self.underlying.load(atomic::Ordering::Relaxed) != 0
    }
}

#[derive(Debug)]
struct WorkerState {
    /// See `DeletionIndicator` for the protocol.
    active_deletions: DeletionIndicator,
    eviction_generation: AtomicUsize,
}

/// Drop guard so `observe_deletion()` runs even if a deletion task is cancelled or panics.
struct DeletionGuard(Arc<WorkerState>);

impl Drop for DeletionGuard {
    fn drop(&mut self) {
        self.0.active_deletions.observe_deletion();
    }
}

#[derive(Debug)]
struct LruProcessingTask<K, C, D> {
    receiver: Receiver<Message<K, C>>,

    /// Used by deletion tasks to put retained keys back. Weak, so the worker does not keep its
    /// own channel open after the tracker is dropped.
    requeue: WeakSender<Message<K, C>>,

    /// The ordered set of keys, least recently used first.
    ordered_key_map: LinkedHashMap<K, C>,

    /// The deleter to call when we need to evict keys.
    deleter: D,

    shared: Arc<WorkerState>,
}

impl<K, C, D> LruProcessingTask<K, C, D>
where
    K: Clone + Eq + Hash + Send + 'static,
    C: Versioned + Expiring + Copy + Send + 'static,
    D: Deleter<K, C>,
{
    fn spawn_task(
        deleter: D,
        receiver: Receiver<Message<K, C>>,
        requeue: WeakSender<Message<K, C>>,
        shared: Arc<WorkerState>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut task = Self {
                receiver,
                requeue,
                ordered_key_map: LinkedHashMap::new(),
                deleter,
                shared,
            };
            task.work().await;
        })
    }

    async fn work(&mut self) {
        while let Some(msg) = self.receiver.recv().await {
            self.service_message(msg);
        }
    }

    fn service_message(&mut self, message: Message<K, C>) {
        match message {
            Message::Accessed(k, ev_gen) => {
                // An access recorded before the latest eviction may refer to a key that eviction
                // already took. Dropping those keeps evicted keys from being resurrected; under
                // contention the policy is a fuzzy LRU rather than a strict one.
                if ev_gen
                    < self
                        .shared
                        .eviction_generation
                        .load(atomic::Ordering::Relaxed)
                {
                    return;
                }

                if let Some(entry) = self.ordered_key_map.remove(&k) {
                    self.ordered_key_map.insert(k, entry);
                }
            }
            Message::Evict(max_count) => {
                self.bump_generation();
                let take_count = self.ordered_key_map.len().min(max_count as usize);
                let mut victims = Vec::with_capacity(take_count);
                for _ in 0..take_count {
                    let Some(victim) = self.ordered_key_map.pop_front() else {
                        break;
                    };
                    victims.push(victim);
                }
                self.spawn_deletions(victims);
            }
            Message::Expire(now) => {
                self.bump_generation();
                let expired: Vec<K> = self
                    .ordered_key_map
                    .iter()
                    .filter(|(_, ctx)| ctx.expires_at() <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                let victims = expired
                    .into_iter()
                    .filter_map(|k| self.ordered_key_map.remove(&k).map(|ctx| (k, ctx)))
                    .collect();
                self.spawn_deletions(victims);
            }
            Message::Forget(k, version) => {
                if self
                    .ordered_key_map
                    .get(&k)
                    .is_some_and(|ctx| ctx.version() == version)
                {
                    self.ordered_key_map.remove(&k);
                }
            }
            Message::Upserted(k, ctx) => {
                if let Some(existing) = self.ordered_key_map.get(&k)
                    && ctx.version() < existing.version()
                {
                    // Stale message from a previous incarnation; drop it.
                    return;
                }
                self.ordered_key_map.remove(&k);
                self.ordered_key_map.insert(k, ctx);
            }
        }
    }

    fn bump_generation(&self) {
        self.shared
            .eviction_generation
            .fetch_add(1, atomic::Ordering::Relaxed);
    }

    fn spawn_deletions(&self, victims: Vec<(K, C)>) {
        // Batches never exceed u32::MAX keys: `Evict` caps at its u32 argument and the map of a
        // bounded cache stays far below that.
        #[expect(clippy::cast_possible_truncation)]
        let count = victims.len() as u32;
        self.shared.active_deletions.process_batch(count);

        for (key, ctx) in victims {
            let mut deleter = self.deleter.clone();
            let requeue = self.requeue.clone();
            let guard = DeletionGuard(Arc::clone(&self.shared));
            tokio::spawn(async move {
                let _guard = guard;
                if deleter.delete(key.clone(), ctx).await == Eviction::Retained
                    && let Some(sender) = requeue.upgrade()
                {
                    let _ = sender.send(Message::Upserted(key, ctx)).await;
                }
            });
        }
    }
}

/// An LRU eviction tracker. This is used to track the least recently used keys in the cache, and
/// to evict keys when necessary.
#[derive(Debug)]
pub struct LruEvictionTracker<K, C> {
    worker_message_sender: Sender<Message<K, C>>,
    worker_state: Arc<WorkerState>,
    sweeper: Option<JoinHandle<()>>,
}

impl<K, C> LruEvictionTracker<K, C>
where
    K: Clone + Eq + Hash + Send + 'static,
    C: Versioned + Expiring + Copy + Send + 'static,
{
    /// Spawn a new LRU eviction tracker with the given deleter and channel size.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<D: Deleter<K, C>>(deleter: D, channel_size: usize) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel(channel_size);

        let worker_state = Arc::new(WorkerState {
            active_deletions: DeletionIndicator::new(),
            eviction_generation: AtomicUsize::new(0),
        });
        drop(LruProcessingTask::spawn_task(
            deleter,
            rx,
            tx.downgrade(),
            Arc::clone(&worker_state),
        ));

        Self {
            worker_message_sender: tx,
            worker_state,
            sweeper: None,
        }
    }

    /// Periodically evict expired keys. The sweep stops when the tracker is dropped.
    #[must_use]
    pub fn with_expiry_sweep(mut self, every: Duration) -> Self {
        let sender = self.worker_message_sender.downgrade();
        let state = Arc::clone(&self.worker_state);
        self.sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(sender) = sender.upgrade() else {
                    break;
                };
                if !submit(&state, &sender, Message::Expire(Instant::now())) {
                    trace!("eviction channel full, skipping expiry sweep");
                }
            }
        }));
        self
    }

    /// Notify the LRU tracker that a key was inserted or overwritten.
    ///
    /// Non-cancellable: uses `try_send` (sync) with a `tokio::spawn` fallback so that the
    /// notification cannot be lost to task cancellation.
    pub fn upsert(&self, key: K, ctx: C) {
        self.send_reliably(Message::Upserted(key, ctx));
    }

    /// Notify the LRU eviction tracker that the given key was accessed.
    pub fn access(&self, key: K) {
        let generation = self
            .worker_state
            .eviction_generation
            .load(atomic::Ordering::Relaxed);
        self.send_reliably(Message::Accessed(key, generation));
    }

    /// Stop tracking `key` if the tracked context still has `version`. Used when the owner removed
    /// the key itself.
    pub fn forget(&self, key: K, version: u64) {
        self.send_reliably(Message::Forget(key, version));
    }

    fn send_reliably(&self, msg: Message<K, C>) {
        match self.worker_message_sender.try_send(msg) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(msg)) => {
                let sender = self.worker_message_sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send(msg).await;
                });
            }
        }
    }

    /// Try to cull up to `max_count` of the least recently used keys.
    ///
    /// Returns `true` if the eviction message was successfully enqueued, or `false` if the
    /// channel is full. In the latter case, the caller should yield and retry.
    #[must_use]
    pub fn try_cull(&self, max_count: u32) -> bool {
        submit(
            &self.worker_state,
            &self.worker_message_sender,
            Message::Evict(max_count),
        )
    }

    /// Try to evict every key that expired at or before `now`.
    ///
    /// Same return convention as [`try_cull`](Self::try_cull).
    #[must_use]
    pub fn try_expire(&self, now: Instant) -> bool {
        submit(
            &self.worker_state,
            &self.worker_message_sender,
            Message::Expire(now),
        )
    }

    /// Check whether there are culls that are already scheduled or actively in progress.
    #[must_use]
    pub fn have_pending_culls(&self) -> bool {
        self.worker_state.active_deletions.have_pending_work()
    }
}

impl<K, C> Drop for LruEvictionTracker<K, C> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Enqueue a batch-producing message.
///
/// `submit_batch()` runs *before* `try_send()` so that `have_pending_work()` is already `true`
/// by the time anyone observes the enqueued message. A failed send rolls back with
/// `undo_submit_batch()`.
fn submit<K, C>(state: &WorkerState, sender: &Sender<Message<K, C>>, msg: Message<K, C>) -> bool {
    state.active_deletions.submit_batch();
    if sender.try_send(msg).is_ok() {
        true
    } else {
        state.active_deletions.undo_submit_batch();
        false
    }
}
