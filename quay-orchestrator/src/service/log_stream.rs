//! Log Stream Controller
//!
//! Step output arrives on the event bus as `run.{id}.step.{id}.output`
//! events. This controller keeps a bounded window of recent chunks per step
//! and fans new chunks out to live tails. A tail replays the retained window
//! from the requested per-step sequence and then follows live output, so a
//! reconnecting consumer picks up where it left off as long as the window
//! still covers its position.
//!
//! Per-step sequences are contiguous, so any skipped range, whether older
//! than the window or lost on the way in, reaches the tail as a gap.

use quay_core::domain::event::{Event, OutputChunk};
use quay_core::topic::TopicPattern;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::service::event_bus::{Delivery, EventBus, Gap, SubscriptionError};

/// Log stream errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogStreamError {
    /// The tail fell behind live output; reopen it from `resume_from`
    #[error("tail of step {step_id} fell behind, resume from {resume_from}")]
    Lagged { step_id: Uuid, resume_from: u64 },
}

pub type Result<T> = std::result::Result<T, LogStreamError>;

/// One item read from a tail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailItem {
    Chunk(OutputChunk),
    /// Chunks `from..=to` are not available
    Gap { from: u64, to: u64 },
}

struct StepBuffer {
    chunks: VecDeque<OutputChunk>,
    last_sequence: u64,
    live: Option<broadcast::Sender<OutputChunk>>,
}

struct StepLog {
    run_id: Uuid,
    buffer: Mutex<StepBuffer>,
}

struct LogInner {
    steps: RwLock<HashMap<Uuid, Arc<StepLog>>>,
    retained_chunks: usize,
    live_capacity: usize,
}

/// Per-step output windows and live tails. Cheap to clone.
#[derive(Clone)]
pub struct LogStreamController {
    inner: Arc<LogInner>,
}

impl LogStreamController {
    pub fn new(retained_chunks: usize, live_capacity: usize) -> Self {
        Self {
            inner: Arc::new(LogInner {
                steps: RwLock::new(HashMap::new()),
                retained_chunks: retained_chunks.max(1),
                live_capacity: live_capacity.max(1),
            }),
        }
    }

    fn step(&self, run_id: Uuid, step_id: Uuid) -> Arc<StepLog> {
        self.step_or_insert(run_id, step_id, true)
    }

    fn step_or_insert(&self, run_id: Uuid, step_id: Uuid, open: bool) -> Arc<StepLog> {
        if let Some(log) = self
            .inner
            .steps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&step_id)
        {
            return Arc::clone(log);
        }

        let capacity = self.inner.live_capacity;
        let mut steps = self
            .inner
            .steps
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(steps.entry(step_id).or_insert_with(|| {
            Arc::new(StepLog {
                run_id,
                buffer: Mutex::new(StepBuffer {
                    chunks: VecDeque::new(),
                    last_sequence: 0,
                    live: open.then(|| broadcast::channel(capacity).0),
                }),
            })
        }))
    }

    /// Take one output event off the bus.
    ///
    /// Returns false when the chunk was a duplicate or the payload was not
    /// an output chunk.
    pub fn ingest(&self, event: &Event) -> bool {
        match serde_json::from_value::<OutputChunk>(event.payload.clone()) {
            Ok(chunk) => self.ingest_chunk(event.run_id, chunk),
            Err(e) => {
                tracing::warn!(topic = %event.topic, "Ignoring malformed output event: {}", e);
                false
            }
        }
    }

    /// Append a chunk to its step's window and hand it to live tails
    pub fn ingest_chunk(&self, run_id: Uuid, chunk: OutputChunk) -> bool {
        let log = self.step(run_id, chunk.step_id);
        let mut buffer = log.buffer.lock().unwrap_or_else(PoisonError::into_inner);

        if chunk.step_sequence <= buffer.last_sequence {
            return false;
        }
        if chunk.step_sequence > buffer.last_sequence + 1 {
            tracing::warn!(
                step_id = %chunk.step_id,
                "Output chunks {}..={} lost before ingestion",
                buffer.last_sequence + 1,
                chunk.step_sequence - 1
            );
        }
        buffer.last_sequence = chunk.step_sequence;

        if let Some(live) = &buffer.live {
            // No receivers is fine
            let _ = live.send(chunk.clone());
        }

        buffer.chunks.push_back(chunk);
        while buffer.chunks.len() > self.inner.retained_chunks {
            buffer.chunks.pop_front();
        }
        true
    }

    /// Mark a step's output as complete. Open tails end after draining and
    /// later tails end once the window is replayed, even for a step that
    /// never produced output.
    pub fn finish(&self, run_id: Uuid, step_id: Uuid) {
        let log = self.step_or_insert(run_id, step_id, false);
        log.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live = None;
    }

    /// Open a tail on a step, starting at per-step sequence `from`.
    ///
    /// The retained window is copied and the live receiver attached under the
    /// step's lock, so no chunk is missed or repeated between the two.
    pub fn tail(&self, run_id: Uuid, step_id: Uuid, from: u64) -> LogTail {
        let log = self.step(run_id, step_id);
        let buffer = log.buffer.lock().unwrap_or_else(PoisonError::into_inner);

        let from = from.max(1);
        let mut replay: VecDeque<TailItem> = VecDeque::new();
        let mut next = from;
        for chunk in buffer.chunks.iter().filter(|c| c.step_sequence >= from) {
            if chunk.step_sequence > next {
                replay.push_back(TailItem::Gap {
                    from: next,
                    to: chunk.step_sequence - 1,
                });
            }
            replay.push_back(TailItem::Chunk(chunk.clone()));
            next = chunk.step_sequence + 1;
        }
        if next <= buffer.last_sequence {
            replay.push_back(TailItem::Gap {
                from: next,
                to: buffer.last_sequence,
            });
        }

        LogTail {
            step_id,
            replay,
            live: buffer.live.as_ref().map(broadcast::Sender::subscribe),
            last_delivered: from - 1,
        }
    }

    /// Drop every step window belonging to a run
    pub fn forget_run(&self, run_id: Uuid) -> usize {
        let mut steps = self
            .inner
            .steps
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = steps.len();
        steps.retain(|_, log| log.run_id != run_id);
        before - steps.len()
    }

    /// Feed the controller from the event bus until shutdown.
    ///
    /// Output events are ingested; a step's `completed` event ends its tails.
    /// Events dropped from the pump's own queue are read back from the run's
    /// history before anything newer is handled.
    pub async fn run_pump(self, bus: EventBus, mut shutdown: watch::Receiver<bool>) {
        let pattern = match TopicPattern::new("run.*.step.*.*") {
            Ok(pattern) => pattern,
            Err(e) => {
                tracing::error!("Log pump pattern rejected: {}", e);
                return;
            }
        };

        let mut subscription = match bus.subscribe(pattern.clone(), None) {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!("Log pump could not subscribe: {}", e);
                return;
            }
        };

        tracing::info!("Log stream pump started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                delivery = subscription.recv() => match delivery {
                    Ok(Delivery::Event(event)) => self.handle(&event),
                    Ok(Delivery::Gap(gap)) => self.recover(&bus, &pattern, &gap),
                    Err(SubscriptionError::Overflow) => {
                        tracing::warn!("Log pump disconnected after overflow, resubscribing");
                        match bus.subscribe(pattern.clone(), None) {
                            Ok(next) => subscription = next,
                            Err(e) => {
                                tracing::error!("Log pump could not resubscribe: {}", e);
                                break;
                            }
                        }
                    }
                    Err(SubscriptionError::Closed) => break,
                },
            }
        }

        tracing::info!("Log stream pump stopped");
    }

    fn recover(&self, bus: &EventBus, pattern: &TopicPattern, gap: &Gap) {
        let events = match bus.history(gap.run_id, gap.from, gap.to) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(run_id = %gap.run_id, "Log pump could not read history: {}", e);
                return;
            }
        };

        let mut recovered = 0;
        for event in events.iter().filter(|event| pattern.matches(&event.topic)) {
            self.handle(event);
            recovered += 1;
        }
        tracing::debug!(
            run_id = %gap.run_id,
            "Log pump recovered {} events of {}..={}",
            recovered,
            gap.from,
            gap.to
        );
    }

    fn handle(&self, event: &Event) {
        match event.topic.kind() {
            "output" => {
                self.ingest(event);
            }
            "completed" => {
                if let Some(step_id) = event
                    .payload
                    .get("step_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
                {
                    self.finish(event.run_id, step_id);
                }
            }
            _ => {}
        }
    }
}

/// Replay-then-live reader over one step's output
pub struct LogTail {
    step_id: Uuid,
    replay: VecDeque<TailItem>,
    live: Option<broadcast::Receiver<OutputChunk>>,
    last_delivered: u64,
}

impl LogTail {
    pub fn step_id(&self) -> Uuid {
        self.step_id
    }

    /// Highest per-step sequence handed out so far
    pub fn last_delivered(&self) -> u64 {
        self.last_delivered
    }

    /// Next item, or `None` once the step's output is complete
    pub async fn recv(&mut self) -> Result<Option<TailItem>> {
        if let Some(item) = self.replay.pop_front() {
            self.last_delivered = match &item {
                TailItem::Chunk(chunk) => chunk.step_sequence,
                TailItem::Gap { to, .. } => self.last_delivered.max(*to),
            };
            return Ok(Some(item));
        }

        let Some(live) = self.live.as_mut() else {
            return Ok(None);
        };

        loop {
            match live.recv().await {
                Ok(chunk) if chunk.step_sequence <= self.last_delivered => continue,
                Ok(chunk) if chunk.step_sequence > self.last_delivered + 1 => {
                    let gap = TailItem::Gap {
                        from: self.last_delivered + 1,
                        to: chunk.step_sequence - 1,
                    };
                    self.last_delivered = chunk.step_sequence - 1;
                    self.replay.push_back(TailItem::Chunk(chunk));
                    return Ok(Some(gap));
                }
                Ok(chunk) => {
                    self.last_delivered = chunk.step_sequence;
                    return Ok(Some(TailItem::Chunk(chunk)));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return Err(LogStreamError::Lagged {
                        step_id: self.step_id,
                        resume_from: self.last_delivered + 1,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.live = None;
                    return Ok(None);
                }
            }
        }
    }
}
