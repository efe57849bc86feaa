//! Change notification bus.
//!
//! Every source owns one [`ListenerCollection`]. Consumers call
//! [`ListenerCollection::subscribe`] and receive a [`Subscription`], which is
//! nothing more than a private queue of [`Change`]s plus the batching state
//! for that consumer. Producers never call into consumers: they push changes
//! into the collection, the collection coalesces appends per subscription and
//! the consumer drains its queue from its own tick.
//!
//! ```text
//! ┌──────────┐ notify()  ┌────────────────────┐  queue   ┌──────────────┐
//! │ producer │ ────────> │ ListenerCollection │ ───────> │ Subscription │
//! └──────────┘           └────────────────────┘          └──────┬───────┘
//!                                                                │ drain()
//!                                                         ┌──────▼───────┐
//!                                                         │   consumer   │
//!                                                         └──────────────┘
//! ```
//!
//! Appends are delivered in chunks of at most `max_batch` rows, and rows that
//! do not fill a chunk are flushed once `max_wait` has elapsed since the last
//! delivery. Invalidations and resets are never delayed.

use crate::change::Change;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::{Duration, Instant},
};
use uuid::Uuid;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking reader must not wedge the engine
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Slot {
    queue: VecDeque<Change>,
    /// rows already announced to the consumer
    delivered: usize,
    /// rows the producer currently has
    known: usize,
    max_wait: Duration,
    max_batch: usize,
    last_flush: Instant,
}

impl Slot {
    fn new(max_wait: Duration, max_batch: usize) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(Change::Reset);
        Self {
            queue,
            delivered: 0,
            known: 0,
            max_wait,
            max_batch: max_batch.max(1),
            last_flush: Instant::now(),
        }
    }

    fn on_read(&mut self, count: usize, now: Instant) {
        if count < self.delivered {
            self.invalidate(count, self.delivered - count, now);
        }
        self.known = count;
        self.pump(now);
    }

    fn invalidate(&mut self, start: usize, count: usize, now: Instant) {
        if count == 0 {
            return;
        }

        self.known = self.known.min(start);
        if start < self.delivered {
            // everything from `start` onwards is void for the consumer,
            // regardless of how far the producer said the damage goes
            self.queue
                .push_back(Change::invalidate(start, self.delivered - start));
            self.delivered = start;
            self.last_flush = now;
        }
    }

    fn reset(&mut self, now: Instant) {
        // consecutive resets coalesce
        if self.queue.back() != Some(&Change::Reset) {
            self.queue.push_back(Change::Reset);
        }
        self.delivered = 0;
        self.known = 0;
        self.last_flush = now;
    }

    fn pump(&mut self, now: Instant) {
        self.pump_inner(now, false);
    }

    fn pump_inner(&mut self, now: Instant, force: bool) {
        while self.known - self.delivered >= self.max_batch {
            self.queue
                .push_back(Change::append(self.delivered, self.max_batch));
            self.delivered += self.max_batch;
            self.last_flush = now;
        }

        let pending = self.known - self.delivered;
        let due = force || now.duration_since(self.last_flush) >= self.max_wait;
        if pending > 0 && due {
            self.queue.push_back(Change::append(self.delivered, pending));
            self.delivered = self.known;
            self.last_flush = now;
        }
    }
}

/// Consumer end of a subscription to one source.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    id: Uuid,
    slot: Arc<Mutex<Slot>>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// take every pending change, in emission order (non-blocking)
    pub fn drain(&self) -> Vec<Change> {
        let mut slot = lock(&self.slot);
        slot.pump(Instant::now());
        slot.queue.drain(..).collect()
    }

    /// take the next pending change, if any (non-blocking)
    pub fn try_next(&self) -> Option<Change> {
        let mut slot = lock(&self.slot);
        if slot.queue.is_empty() {
            slot.pump(Instant::now());
        }
        slot.queue.pop_front()
    }

    /// whether changes are queued or an idle flush is due
    pub fn has_pending(&self) -> bool {
        let mut slot = lock(&self.slot);
        slot.pump(Instant::now());
        !slot.queue.is_empty()
    }

    /// Whether every row the producer announced has been drained.
    ///
    /// Unlike [`Subscription::has_pending`] this also accounts for rows that
    /// are still held back waiting for a full batch or the idle flush.
    pub fn is_caught_up(&self) -> bool {
        let mut slot = lock(&self.slot);
        slot.pump(Instant::now());
        slot.queue.is_empty() && slot.delivered == slot.known
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[derive(Default)]
struct Registry {
    slots: Vec<(Uuid, Weak<Mutex<Slot>>)>,
    count: usize,
}

/// Producer end of the bus: the set of subscriptions of one source.
#[derive(Default)]
pub struct ListenerCollection {
    registry: Mutex<Registry>,
}

impl ListenerCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new consumer.
    ///
    /// The consumer first observes a [`Change::Reset`], followed by appends
    /// describing whatever rows the producer already has.
    pub fn subscribe(&self, max_wait: Duration, max_batch: usize) -> Subscription {
        let mut registry = lock(&self.registry);
        let id = Uuid::new_v4();
        let mut slot = Slot::new(max_wait, max_batch);
        slot.known = registry.count;
        // existing rows are due immediately
        slot.pump_inner(Instant::now(), true);

        let slot = Arc::new(Mutex::new(slot));
        registry.slots.push((id, Arc::downgrade(&slot)));
        log::debug!("Listener {} subscribed ({} rows known)", id, registry.count);

        Subscription { id, slot }
    }

    /// stop delivering to the given subscription
    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut registry = lock(&self.registry);
        registry.slots.retain(|(id, _)| *id != subscription.id);
        log::debug!("Listener {} unsubscribed", subscription.id);
    }

    pub fn len(&self) -> usize {
        lock(&self.registry)
            .slots
            .iter()
            .filter(|(_, slot)| slot.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Single producer-facing entry point: publish one change.
    pub fn notify(&self, change: Change) {
        match change {
            Change::Append(section) => self.on_read(section.end()),
            Change::Invalidate(section) => self.invalidate(section.start, section.count),
            Change::Reset => self.reset(),
        }
    }

    /// the producer now has `count` rows in total
    pub fn on_read(&self, count: usize) {
        let now = Instant::now();
        let mut registry = lock(&self.registry);
        Self::for_each_slot(&mut registry, |slot| slot.on_read(count, now));
        registry.count = count;
    }

    /// rows the producer has announced so far
    pub fn count(&self) -> usize {
        lock(&self.registry).count
    }

    /// convenience for `notify(Change::append(..))`
    pub fn append(&self, start: usize, count: usize) {
        self.on_read(start + count);
    }

    pub fn invalidate(&self, start: usize, count: usize) {
        let now = Instant::now();
        let mut registry = lock(&self.registry);
        Self::for_each_slot(&mut registry, |slot| slot.invalidate(start, count, now));
        if count > 0 {
            registry.count = registry.count.min(start);
        }
    }

    pub fn reset(&self) {
        let now = Instant::now();
        let mut registry = lock(&self.registry);
        Self::for_each_slot(&mut registry, |slot| slot.reset(now));
        registry.count = 0;
    }

    /// deliver rows whose idle timeout expired
    pub fn flush(&self) {
        let now = Instant::now();
        Self::for_each_slot(&mut lock(&self.registry), |slot| slot.pump(now));
    }

    // callers keep the registry locked until `count` matches the slots,
    // otherwise a concurrent subscribe starts from a stale count
    fn for_each_slot(registry: &mut Registry, mut f: impl FnMut(&mut Slot)) {
        registry.slots.retain(|(_, weak)| match weak.upgrade() {
            Some(slot) => {
                f(&mut lock(&slot));
                true
            }
            None => false,
        });
    }
}
