//! Live update fan-out.
//!
//! The backend owns one [`UpdateHub`] and publishes a [`ChangeEvent`] after
//! every mutation. Each watching connection holds a [`Subscription`] with a
//! bounded channel; publication never waits on a subscriber.
//!
//! ```text
//!                        ┌──► slot 1 (filter, Sender) ──► Subscription 1
//!   publish(event) ──────┼──► slot 2 (filter, Sender) ──► Subscription 2
//!     try_send only      └──► slot 3  full ─► removed, ClosedBackpressure
//! ```
//!
//! A subscriber whose channel is full when an event arrives is removed from
//! the hub. Its sender is dropped with the slot, so once the receiver drains
//! what was queued it observes the closed channel and reports backpressure.

pub mod stream;

use crate::model::events::LocationIndex;
use crate::model::{ChangeEvent, UpdateFilter};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default per-subscriber channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Registered,
    Streaming,
    ClosedClean,
    ClosedBackpressure,
    ClosedError,
}

impl SubscriptionState {
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            Self::ClosedClean | Self::ClosedBackpressure | Self::ClosedError
        )
    }
}

/// Hub counters.
#[derive(Debug, Default)]
pub struct HubStats {
    pub active_subscriptions: AtomicU64,
    pub events_published: AtomicU64,
    pub deliveries: AtomicU64,
    pub backpressure_drops: AtomicU64,
}

/// Point-in-time copy of [`HubStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubStatsSnapshot {
    pub active_subscriptions: u64,
    pub events_published: u64,
    pub deliveries: u64,
    pub backpressure_drops: u64,
}

/// Outcome of one publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishReport {
    pub delivered: usize,
    pub filtered: usize,
    pub dropped: usize,
}

struct Slot {
    filter: UpdateFilter,
    sender: mpsc::Sender<Arc<ChangeEvent>>,
    state: Arc<Mutex<SubscriptionState>>,
}

#[derive(Default)]
struct HubInner {
    slots: HashMap<SubscriptionId, Slot>,
    index: LocationIndex,
}

struct HubShared {
    inner: Mutex<HubInner>,
    capacity: usize,
    next_id: AtomicU64,
    stats: HubStats,
}

impl HubShared {
    fn deregister(&self, id: SubscriptionId) {
        if self.inner.lock().slots.remove(&id).is_some() {
            self.stats
                .active_subscriptions
                .fetch_sub(1, Ordering::Relaxed);
            tracing::debug!(subscription = %id, "subscription deregistered");
        }
    }
}

/// Broadcast hub for change events. Cloning shares the hub.
#[derive(Clone)]
pub struct UpdateHub {
    shared: Arc<HubShared>,
}

impl Default for UpdateHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl fmt::Debug for UpdateHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateHub")
            .field("capacity", &self.shared.capacity)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl UpdateHub {
    /// Hub whose subscribers each buffer at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(HubShared {
                inner: Mutex::new(HubInner::default()),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                stats: HubStats::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Register a subscriber.
    pub fn register(&self, filter: UpdateFilter) -> Subscription {
        self.register_inner(filter, None)
    }

    /// Register a subscriber whose channel starts with the filtered
    /// projection of `snapshot`.
    pub fn register_with_snapshot(&self, filter: UpdateFilter, snapshot: ChangeEvent) -> Subscription {
        self.register_inner(filter, Some(snapshot))
    }

    fn register_inner(&self, filter: UpdateFilter, snapshot: Option<ChangeEvent>) -> Subscription {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.shared.capacity);
        let state = Arc::new(Mutex::new(SubscriptionState::Registered));

        let mut inner = self.shared.inner.lock();
        if let Some(snapshot) = snapshot {
            inner.index.learn(&snapshot);
            let projected = filter.apply(&snapshot, &inner.index);
            if !projected.is_empty() {
                // Fresh channel with capacity >= 1 cannot be full.
                let _ = sender.try_send(Arc::new(projected));
            }
        }
        inner.slots.insert(
            id,
            Slot {
                filter: filter.clone(),
                sender,
                state: state.clone(),
            },
        );
        drop(inner);

        self.shared
            .stats
            .active_subscriptions
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(subscription = %id, location = %filter.location, "subscription registered");

        Subscription {
            id,
            receiver,
            filter,
            registered_at: Utc::now(),
            state,
            hub: Arc::downgrade(&self.shared),
        }
    }

    /// Deliver an event to every subscriber whose filter selects part of it.
    /// Never blocks on a subscriber.
    pub fn publish(&self, event: ChangeEvent) -> PublishReport {
        let mut report = PublishReport::default();
        let event = Arc::new(event);
        let mut inner = self.shared.inner.lock();
        let HubInner { slots, index } = &mut *inner;
        index.learn(&event);

        let mut removed = Vec::new();
        for (id, slot) in slots.iter() {
            let payload = if slot.filter.is_unfiltered() {
                event.clone()
            } else {
                let projected = slot.filter.apply(&event, index);
                if projected.is_empty() {
                    report.filtered += 1;
                    continue;
                }
                Arc::new(projected)
            };
            match slot.sender.try_send(payload) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    *slot.state.lock() = SubscriptionState::ClosedBackpressure;
                    report.dropped += 1;
                    removed.push(*id);
                    tracing::warn!(subscription = %id, "subscriber not keeping up; dropping");
                }
                Err(TrySendError::Closed(_)) => removed.push(*id),
            }
        }
        index.forget(&event);
        for id in &removed {
            slots.remove(id);
        }
        drop(inner);

        let stats = &self.shared.stats;
        stats.events_published.fetch_add(1, Ordering::Relaxed);
        stats
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        stats
            .backpressure_drops
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        stats
            .active_subscriptions
            .fetch_sub(removed.len() as u64, Ordering::Relaxed);
        report
    }

    /// Remove a subscription explicitly. Dropping it has the same effect.
    pub fn deregister(&self, subscription: Subscription) {
        drop(subscription);
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.inner.lock().slots.len()
    }

    pub fn stats(&self) -> HubStatsSnapshot {
        let stats = &self.shared.stats;
        HubStatsSnapshot {
            active_subscriptions: stats.active_subscriptions.load(Ordering::Relaxed),
            events_published: stats.events_published.load(Ordering::Relaxed),
            deliveries: stats.deliveries.load(Ordering::Relaxed),
            backpressure_drops: stats.backpressure_drops.load(Ordering::Relaxed),
        }
    }
}

/// A registered subscriber. Dropping it deregisters it from the hub.
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::Receiver<Arc<ChangeEvent>>,
    filter: UpdateFilter,
    registered_at: DateTime<Utc>,
    state: Arc<Mutex<SubscriptionState>>,
    hub: Weak<HubShared>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn filter(&self) -> &UpdateFilter {
        &self.filter
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    /// Next event; `None` once the hub has closed the channel.
    pub async fn recv(&mut self) -> Option<Arc<ChangeEvent>> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Arc<ChangeEvent>> {
        self.receiver.try_recv().ok()
    }

    /// Events currently queued.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub(crate) fn mark_streaming(&self) {
        let mut state = self.state.lock();
        if *state == SubscriptionState::Registered {
            *state = SubscriptionState::Streaming;
        }
    }

    /// Record the terminal state. A backpressure close set by the hub is
    /// never overwritten.
    pub(crate) fn finish(&self, terminal: SubscriptionState) {
        let mut state = self.state.lock();
        if !state.is_closed() {
            *state = terminal;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.finish(SubscriptionState::ClosedClean);
        if let Some(hub) = self.hub.upgrade() {
            hub.deregister(self.id);
        }
    }
}
