//! Event Bus
//!
//! Ordered publish/subscribe core for every domain event.
//!
//! - `publish` assigns the next per-run sequence number under that run's own
//!   lock, so publishes for one run are serialized while different runs never
//!   contend. The event is kept in a bounded per-run history and pushed into
//!   the queue of every matching subscriber before the run lock is released,
//!   which fixes each subscriber's per-run order to the sequence order.
//! - Subscriber queues are bounded. A full queue never blocks the publisher;
//!   the configured [`OverflowPolicy`] either drops the oldest queued event
//!   and records a gap, or disconnects the subscriber.
//! - `subscribe` with a [`Cursor`] replays retained history for that run
//!   before live delivery, or reports a gap when the history no longer
//!   reaches back that far. Cursors on runs without a stream are refused.

use quay_core::domain::event::{Event, EventDraft};
use quay_core::topic::{TopicError, TopicPattern};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::OverflowPolicy;

/// Errors returned to producers and subscribers
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The run's event history is inconsistent; writes for it are refused
    #[error("event stream for run {0} is unavailable")]
    RunUnavailable(Uuid),

    /// No retained stream for the run, either never published or forgotten
    #[error("no event stream for run {0}")]
    UnknownRun(Uuid),

    #[error("invalid topic pattern: {0}")]
    InvalidPattern(#[from] TopicError),
}

/// Why a subscription stopped delivering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// Disconnected because its queue overflowed; resubscribe from the cursor
    #[error("subscriber disconnected after its delivery queue overflowed")]
    Overflow,

    /// The bus shut down
    #[error("event bus closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, EventBusError>;

/// Position to resume a run's stream from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub run_id: Uuid,
    /// First sequence number the subscriber wants to receive
    pub sequence: u64,
}

/// Events of `run_id` in `from..=to` matching the subscription were not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Gap {
    pub run_id: Uuid,
    pub from: u64,
    pub to: u64,
}

/// One item handed to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(Arc<Event>),
    Gap(Gap),
}

struct RunStream {
    next_sequence: u64,
    history: VecDeque<Arc<Event>>,
}

impl RunStream {
    fn new() -> Self {
        Self {
            next_sequence: 1,
            history: VecDeque::new(),
        }
    }

    fn oldest_retained(&self) -> u64 {
        self.history
            .front()
            .map_or(self.next_sequence, |e| e.sequence)
    }
}

#[derive(Default)]
struct SubscriberQueue {
    events: VecDeque<Arc<Event>>,
    gaps: Vec<Gap>,
    closed: Option<SubscriptionError>,
}

impl SubscriberQueue {
    fn record_gap(&mut self, run_id: Uuid, sequence: u64) {
        match self.gaps.iter_mut().find(|g| g.run_id == run_id) {
            Some(gap) => gap.to = gap.to.max(sequence),
            None => self.gaps.push(Gap {
                run_id,
                from: sequence,
                to: sequence,
            }),
        }
    }

    fn pop(&mut self) -> Option<Delivery> {
        if !self.gaps.is_empty() {
            return Some(Delivery::Gap(self.gaps.remove(0)));
        }
        self.events.pop_front().map(Delivery::Event)
    }
}

struct Subscriber {
    pattern: TopicPattern,
    queue: Mutex<SubscriberQueue>,
    notify: Notify,
}

impl Subscriber {
    fn lock(&self) -> std::sync::MutexGuard<'_, SubscriberQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self, reason: SubscriptionError) {
        let mut queue = self.lock();
        queue.events.clear();
        queue.gaps.clear();
        queue.closed = Some(reason);
        drop(queue);
        self.notify.notify_one();
    }

    /// Push without blocking. Returns false when the subscriber must be
    /// disconnected.
    fn offer(&self, event: &Arc<Event>, capacity: usize, policy: OverflowPolicy) -> bool {
        let mut queue = self.lock();
        if queue.closed.is_some() {
            return true;
        }

        if queue.events.len() >= capacity {
            match policy {
                OverflowPolicy::DropOldest => {
                    if let Some(dropped) = queue.events.pop_front() {
                        queue.record_gap(dropped.run_id, dropped.sequence);
                    }
                }
                OverflowPolicy::Disconnect => {
                    drop(queue);
                    self.close(SubscriptionError::Overflow);
                    return false;
                }
            }
        }

        queue.events.push_back(Arc::clone(event));
        drop(queue);
        self.notify.notify_one();
        true
    }
}

struct BusInner {
    streams: RwLock<HashMap<Uuid, Arc<Mutex<RunStream>>>>,
    subscribers: RwLock<HashMap<u64, Arc<Subscriber>>>,
    next_subscriber_id: AtomicU64,
    history_capacity: usize,
    queue_capacity: usize,
    overflow_policy: OverflowPolicy,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        let subscribers = self
            .subscribers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for subscriber in subscribers.values() {
            subscriber.close(SubscriptionError::Closed);
        }
    }
}

/// Handle to the shared event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(history_capacity: usize, queue_capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Arc::new(BusInner {
                streams: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
                history_capacity: history_capacity.max(1),
                queue_capacity: queue_capacity.max(1),
                overflow_policy: policy,
            }),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.history_capacity,
            config.subscriber_queue_capacity,
            config.overflow_policy,
        )
    }

    fn stream(&self, run_id: Uuid) -> Arc<Mutex<RunStream>> {
        if let Some(stream) = self
            .inner
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&run_id)
        {
            return Arc::clone(stream);
        }

        let mut streams = self
            .inner
            .streams
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            streams
                .entry(run_id)
                .or_insert_with(|| Arc::new(Mutex::new(RunStream::new()))),
        )
    }

    fn existing_stream(&self, run_id: Uuid) -> Option<Arc<Mutex<RunStream>>> {
        self.inner
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&run_id)
            .cloned()
    }

    /// Sequence, retain and fan out one event.
    ///
    /// Never waits on subscribers. Fails only when the run's stream was left
    /// inconsistent by a panic, in which case every later publish for that
    /// run fails too while other runs are unaffected.
    pub fn publish(&self, draft: EventDraft) -> Result<Arc<Event>> {
        let run_id = draft.run_id;
        let mut events = self.publish_all(run_id, vec![draft])?;
        events.pop().ok_or(EventBusError::RunUnavailable(run_id))
    }

    /// Publish a batch on `run_id`'s stream under one hold of its lock.
    ///
    /// Either every draft gets a consecutive sequence number or none is
    /// published. Drafts are stamped with `run_id`.
    pub fn publish_all(&self, run_id: Uuid, drafts: Vec<EventDraft>) -> Result<Vec<Arc<Event>>> {
        let stream = self.stream(run_id);
        let mut stream = stream
            .lock()
            .map_err(|_| EventBusError::RunUnavailable(run_id))?;

        let mut published = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let event = Arc::new(Event {
                topic: draft.topic,
                run_id,
                sequence: stream.next_sequence,
                timestamp: chrono::Utc::now(),
                payload: draft.payload,
            });
            stream.next_sequence += 1;

            stream.history.push_back(Arc::clone(&event));
            while stream.history.len() > self.inner.history_capacity {
                stream.history.pop_front();
            }

            self.fan_out(&event);
            tracing::trace!(topic = %event.topic, sequence = event.sequence, "Event published");
            published.push(event);
        }

        Ok(published)
    }

    fn fan_out(&self, event: &Arc<Event>) {
        let mut disconnected = Vec::new();
        {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, subscriber) in subscribers.iter() {
                if !subscriber.pattern.matches(&event.topic) {
                    continue;
                }
                if !subscriber.offer(
                    event,
                    self.inner.queue_capacity,
                    self.inner.overflow_policy,
                ) {
                    disconnected.push(*id);
                }
            }
        }

        if !disconnected.is_empty() {
            let mut subscribers = self
                .inner
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for id in disconnected {
                subscribers.remove(&id);
                tracing::warn!(subscriber = id, "Subscriber disconnected after queue overflow");
            }
        }
    }

    /// Register a subscription.
    ///
    /// With a cursor, retained events of that run from `cursor.sequence` on are
    /// queued before any live event. If the history no longer reaches back
    /// that far, a [`Gap`] covering the lost range is delivered first. A
    /// cursor on a run with no retained stream fails with
    /// [`EventBusError::UnknownRun`].
    pub fn subscribe(&self, pattern: TopicPattern, from: Option<Cursor>) -> Result<Subscription> {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            pattern,
            queue: Mutex::new(SubscriberQueue::default()),
            notify: Notify::new(),
        });

        match from {
            Some(cursor) => {
                let stream = self
                    .existing_stream(cursor.run_id)
                    .ok_or(EventBusError::UnknownRun(cursor.run_id))?;
                let stream = stream
                    .lock()
                    .map_err(|_| EventBusError::RunUnavailable(cursor.run_id))?;

                {
                    let mut queue = subscriber.lock();
                    let oldest = stream.oldest_retained();
                    if cursor.sequence < oldest {
                        queue.gaps.push(Gap {
                            run_id: cursor.run_id,
                            from: cursor.sequence,
                            to: oldest - 1,
                        });
                    }
                    queue.events.extend(
                        stream
                            .history
                            .iter()
                            .filter(|e| e.sequence >= cursor.sequence)
                            .filter(|e| subscriber.pattern.matches(&e.topic))
                            .cloned(),
                    );
                }

                // Registered while the run is locked so no event falls between
                // the replay and live delivery.
                self.register(id, &subscriber);
                drop(stream);
            }
            None => self.register(id, &subscriber),
        }

        tracing::debug!(subscriber = id, pattern = %subscriber.pattern, "Subscription created");

        Ok(Subscription {
            id,
            subscriber,
            bus: Arc::downgrade(&self.inner),
            cursors: HashMap::new(),
        })
    }

    fn register(&self, id: u64, subscriber: &Arc<Subscriber>) {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(subscriber));
    }

    /// Retained events of a run with sequences in `from..=to`.
    ///
    /// Empty when the run is unknown or its history no longer reaches back.
    pub fn history(&self, run_id: Uuid, from: u64, to: u64) -> Result<Vec<Arc<Event>>> {
        let Some(stream) = self.existing_stream(run_id) else {
            return Ok(Vec::new());
        };
        let stream = stream
            .lock()
            .map_err(|_| EventBusError::RunUnavailable(run_id))?;
        Ok(stream
            .history
            .iter()
            .filter(|e| (from..=to).contains(&e.sequence))
            .cloned()
            .collect())
    }

    /// Last sequence assigned for a run, if it has published anything
    pub fn last_sequence(&self, run_id: Uuid) -> Option<u64> {
        let streams = self
            .inner
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let stream = streams.get(&run_id)?.lock().ok()?;
        (stream.next_sequence > 1).then(|| stream.next_sequence - 1)
    }

    /// Drop a run's stream and history once it leaves the live working set
    pub fn forget_run(&self, run_id: Uuid) {
        self.inner
            .streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&run_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A consumer's registration on the bus
///
/// Dropping the subscription unregisters it.
pub struct Subscription {
    id: u64,
    subscriber: Arc<Subscriber>,
    bus: Weak<BusInner>,
    cursors: HashMap<Uuid, u64>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next delivery
    pub async fn recv(&mut self) -> std::result::Result<Delivery, SubscriptionError> {
        loop {
            if let Some(delivery) = self.try_recv()? {
                return Ok(delivery);
            }
            self.subscriber.notify.notified().await;
        }
    }

    /// Take the next delivery if one is queued
    pub fn try_recv(&mut self) -> std::result::Result<Option<Delivery>, SubscriptionError> {
        let mut queue = self.subscriber.lock();
        if let Some(delivery) = queue.pop() {
            return Ok(Some(delivery));
        }
        match queue.closed {
            Some(reason) => Err(reason),
            None => Ok(None),
        }
    }

    /// Record that everything up to `sequence` of `run_id` has been handled
    pub fn acknowledge(&mut self, run_id: Uuid, sequence: u64) {
        let cursor = self.cursors.entry(run_id).or_insert(0);
        *cursor = (*cursor).max(sequence);
    }

    /// Last acknowledged sequence for a run
    pub fn acknowledged(&self, run_id: Uuid) -> Option<u64> {
        self.cursors.get(&run_id).copied()
    }

    /// Cursor to resubscribe with after a disconnect
    pub fn resume_cursor(&self, run_id: Uuid) -> Cursor {
        Cursor {
            run_id,
            sequence: self.acknowledged(run_id).map_or(1, |s| s + 1),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_core::topic::Topic;

    fn bus(queue: usize, policy: OverflowPolicy) -> EventBus {
        EventBus::new(8, queue, policy)
    }

    fn draft(run_id: Uuid, kind: &str) -> EventDraft {
        EventDraft::for_run(
            run_id,
            Topic::new(format!("run.{run_id}.{kind}")).unwrap(),
            serde_json::Value::Null,
        )
    }

    fn pattern(s: &str) -> TopicPattern {
        TopicPattern::new(s).unwrap()
    }

    fn expect_event(delivery: Option<Delivery>) -> Arc<Event> {
        match delivery {
            Some(Delivery::Event(event)) => event,
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_sequences_are_gapless_per_run() {
        let bus = bus(16, OverflowPolicy::DropOldest);
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        let a: Vec<u64> = (0..5)
            .map(|_| bus.publish(draft(run_a, "running")).unwrap().sequence)
            .collect();
        let b: Vec<u64> = (0..3)
            .map(|_| bus.publish(draft(run_b, "running")).unwrap().sequence)
            .collect();

        assert_eq!(a, vec![1, 2, 3, 4, 5]);
        assert_eq!(b, vec![1, 2, 3]);
        assert_eq!(bus.last_sequence(run_a), Some(5));
        assert_eq!(bus.last_sequence(Uuid::new_v4()), None);
    }

    #[test]
    fn test_concurrent_publishes_stay_gapless() {
        let bus = bus(16, OverflowPolicy::DropOldest);
        let run_id = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| bus.publish(draft(run_id, "running")).unwrap().sequence)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();

        assert_eq!(all, (1..=400).collect::<Vec<_>>());
    }

    #[test]
    fn test_pattern_filtering() {
        let bus = bus(16, OverflowPolicy::DropOldest);
        let run_id = Uuid::new_v4();
        let mut started = bus
            .subscribe(pattern(&format!("run.{run_id}.started")), None)
            .unwrap();
        let mut everything = bus.subscribe(pattern("run.**"), None).unwrap();

        bus.publish(draft(run_id, "queued")).unwrap();
        bus.publish(draft(run_id, "started")).unwrap();

        let event = expect_event(started.try_recv().unwrap());
        assert_eq!(event.sequence, 2);
        assert_eq!(started.try_recv().unwrap(), None);

        assert_eq!(expect_event(everything.try_recv().unwrap()).sequence, 1);
        assert_eq!(expect_event(everything.try_recv().unwrap()).sequence, 2);
    }

    #[test]
    fn test_replay_from_retained_window_then_live() {
        let bus = bus(16, OverflowPolicy::DropOldest);
        let run_id = Uuid::new_v4();
        for _ in 0..5 {
            bus.publish(draft(run_id, "running")).unwrap();
        }

        let mut sub = bus
            .subscribe(
                pattern("run.**"),
                Some(Cursor {
                    run_id,
                    sequence: 3,
                }),
            )
            .unwrap();
        bus.publish(draft(run_id, "completed")).unwrap();

        let seen: Vec<u64> = std::iter::from_fn(|| sub.try_recv().unwrap())
            .map(|d| match d {
                Delivery::Event(e) => e.sequence,
                Delivery::Gap(g) => panic!("unexpected gap {:?}", g),
            })
            .collect();
        assert_eq!(seen, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_replay_outside_window_reports_gap() {
        // History keeps 8 events per run
        let bus = bus(64, OverflowPolicy::DropOldest);
        let run_id = Uuid::new_v4();
        for _ in 0..12 {
            bus.publish(draft(run_id, "running")).unwrap();
        }

        let mut sub = bus
            .subscribe(
                pattern("run.**"),
                Some(Cursor {
                    run_id,
                    sequence: 2,
                }),
            )
            .unwrap();

        assert_eq!(
            sub.try_recv().unwrap(),
            Some(Delivery::Gap(Gap {
                run_id,
                from: 2,
                to: 4
            }))
        );
        assert_eq!(expect_event(sub.try_recv().unwrap()).sequence, 5);
    }

    #[test]
    fn test_drop_oldest_marks_gap_without_blocking() {
        let bus = bus(2, OverflowPolicy::DropOldest);
        let run_id = Uuid::new_v4();
        let mut sub = bus.subscribe(pattern("run.**"), None).unwrap();

        for _ in 0..5 {
            bus.publish(draft(run_id, "running")).unwrap();
        }

        assert_eq!(
            sub.try_recv().unwrap(),
            Some(Delivery::Gap(Gap {
                run_id,
                from: 1,
                to: 3
            }))
        );
        assert_eq!(expect_event(sub.try_recv().unwrap()).sequence, 4);
        assert_eq!(expect_event(sub.try_recv().unwrap()).sequence, 5);
        assert_eq!(sub.try_recv().unwrap(), None);
    }

    #[test]
    fn test_disconnect_policy_drops_subscriber() {
        let bus = bus(2, OverflowPolicy::Disconnect);
        let run_id = Uuid::new_v4();
        let mut slow = bus.subscribe(pattern("run.**"), None).unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        for _ in 0..3 {
            bus.publish(draft(run_id, "running")).unwrap();
        }

        assert_eq!(slow.try_recv(), Err(SubscriptionError::Overflow));
        assert_eq!(bus.subscriber_count(), 0);

        // Producers keep going
        assert_eq!(bus.publish(draft(run_id, "running")).unwrap().sequence, 4);
    }

    #[test]
    fn test_dropping_subscription_unregisters() {
        let bus = bus(4, OverflowPolicy::DropOldest);
        let sub = bus.subscribe(TopicPattern::all(), None).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_cursor_tracking() {
        let bus = bus(4, OverflowPolicy::DropOldest);
        let run_id = Uuid::new_v4();
        let mut sub = bus.subscribe(TopicPattern::all(), None).unwrap();

        assert_eq!(sub.resume_cursor(run_id).sequence, 1);
        sub.acknowledge(run_id, 7);
        sub.acknowledge(run_id, 5);
        assert_eq!(sub.acknowledged(run_id), Some(7));
        assert_eq!(sub.resume_cursor(run_id).sequence, 8);
    }

    #[test]
    fn test_poisoned_run_rejects_writes_only_for_that_run() {
        let bus = bus(4, OverflowPolicy::DropOldest);
        let broken = Uuid::new_v4();
        let healthy = Uuid::new_v4();
        bus.publish(draft(broken, "queued")).unwrap();

        let stream = bus.stream(broken);
        let _ = std::thread::spawn(move || {
            let _guard = stream.lock().unwrap();
            panic!("simulated corruption");
        })
        .join();

        assert!(matches!(
            bus.publish(draft(broken, "running")),
            Err(EventBusError::RunUnavailable(id)) if id == broken
        ));
        assert_eq!(bus.publish(draft(healthy, "queued")).unwrap().sequence, 1);
    }

    #[test]
    fn test_batch_is_sequenced_together_or_not_at_all() {
        let bus = bus(16, OverflowPolicy::DropOldest);
        let broken = Uuid::new_v4();
        let healthy = Uuid::new_v4();
        bus.publish(draft(broken, "queued")).unwrap();
        let mut sub = bus.subscribe(TopicPattern::all(), None).unwrap();

        let events = bus
            .publish_all(
                healthy,
                vec![draft(healthy, "queued"), draft(healthy, "running")],
            )
            .unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(expect_event(sub.try_recv().unwrap()).sequence, 1);
        assert_eq!(expect_event(sub.try_recv().unwrap()).sequence, 2);

        let stream = bus.stream(broken);
        let _ = std::thread::spawn(move || {
            let _guard = stream.lock().unwrap();
            panic!("simulated corruption");
        })
        .join();

        assert!(
            bus.publish_all(
                broken,
                vec![draft(broken, "running"), draft(broken, "completed")],
            )
            .is_err()
        );
        assert_eq!(sub.try_recv().unwrap(), None);
    }

    #[test]
    fn test_cursor_on_forgotten_run_is_refused() {
        let bus = bus(16, OverflowPolicy::DropOldest);
        let run_id = Uuid::new_v4();
        for _ in 0..5 {
            bus.publish(draft(run_id, "running")).unwrap();
        }
        bus.forget_run(run_id);

        let cursor = Cursor {
            run_id,
            sequence: 3,
        };
        assert!(matches!(
            bus.subscribe(pattern("run.**"), Some(cursor)),
            Err(EventBusError::UnknownRun(id)) if id == run_id
        ));

        let never_seen = Uuid::new_v4();
        assert!(
            bus.subscribe(
                pattern("run.**"),
                Some(Cursor {
                    run_id: never_seen,
                    sequence: 1,
                }),
            )
            .is_err()
        );
        assert!(bus.inner.streams.read().unwrap().is_empty());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_history_reads_retained_range() {
        // History keeps 8 events per run
        let bus = bus(16, OverflowPolicy::DropOldest);
        let run_id = Uuid::new_v4();
        for _ in 0..10 {
            bus.publish(draft(run_id, "running")).unwrap();
        }

        let sequences: Vec<u64> = bus
            .history(run_id, 2, 5)
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, vec![3, 4, 5]);
        assert!(bus.history(Uuid::new_v4(), 1, 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let bus = bus(4, OverflowPolicy::DropOldest);
        let run_id = Uuid::new_v4();
        let mut sub = bus.subscribe(TopicPattern::all(), None).unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish(draft(run_id, "queued")).unwrap();
        });

        match sub.recv().await.unwrap() {
            Delivery::Event(event) => assert_eq!(event.run_id, run_id),
            other => panic!("unexpected delivery {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recv_reports_closed_bus() {
        let bus = bus(4, OverflowPolicy::DropOldest);
        let mut sub = bus.subscribe(TopicPattern::all(), None).unwrap();
        drop(bus);
        assert_eq!(sub.recv().await, Err(SubscriptionError::Closed));
    }
}
