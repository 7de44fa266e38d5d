//! Topic-based position relay with a bounded resume buffer.
//!
//! Every event published to a topic is assigned the next sequence number of
//! that topic, appended to the topic's resume buffer and offered to every
//! live subscriber except its originator. All three happen under the
//! topic's lock, which gives a single total order per topic: subscribers
//! see events in sequence order, and a subscriber registering concurrently
//! with a publish either gets the event from replay or live, never both.
//!
//! Delivery never blocks the publisher. Each subscriber has a bounded
//! queue. When it is full the subscriber is marked as lagging from that
//! sequence number and stops receiving live events; once it has drained its
//! queue it refills from the resume buffer and goes live again. If the
//! missed events have already left the buffer the subscription ends, and the
//! client is expected to reconnect with its last seen `seq`.
//!
//! Subscribers whose receiving side has gone away are dropped on the next
//! publish or sweep.

mod buffer;
mod subscription;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use pulsewire_types::{PositionEvent, SenderId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cancel::CancelSignal;

use buffer::ResumeBuffer;
pub use subscription::Subscription;

/// Relay tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Keep a resume buffer and stamp outbound events with `seq`.
    pub resume: bool,
    /// How long a published event stays replayable.
    pub retention: Duration,
    /// Most events kept per topic regardless of age.
    pub resume_capacity: usize,
    /// Per-subscriber queue depth before the subscriber falls back to
    /// catching up from the resume buffer.
    pub subscriber_buffer: usize,
    /// Deliver events back to the connection that sent them.
    pub echo: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            resume: true,
            retention: Duration::from_secs(120),
            resume_capacity: 4096,
            subscriber_buffer: 256,
            echo: false,
        }
    }
}

/// An event as stored and delivered by the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEvent {
    /// Position in the topic's total order, starting at 1.
    pub seq: u64,
    pub event: PositionEvent,
    pub published_at: Instant,
}

/// Outcome of a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub seq: u64,
    /// Subscribers the event was queued for.
    pub delivered: usize,
    /// Subscribers that were full or still catching up; they will pick the
    /// event up from the resume buffer.
    pub lagged: usize,
    /// Subscribers found closed and removed.
    pub closed: usize,
}

/// Subscription parameters.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Identity of the subscribing connection, used to suppress echo.
    pub origin: Option<SenderId>,
    /// Last sequence number the subscriber saw; replay resumes after it.
    pub resume_after: Option<u64>,
}

impl SubscribeOptions {
    pub fn origin(mut self, origin: SenderId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn resume_after(mut self, seq: u64) -> Self {
        self.resume_after = Some(seq);
        self
    }
}

struct Subscriber {
    origin: Option<SenderId>,
    tx: mpsc::Sender<Arc<RelayEvent>>,
    /// First sequence number that did not fit in the queue.
    lagging_from: Option<u64>,
}

impl Subscriber {
    fn is_origin_of(&self, event: &PositionEvent) -> bool {
        self.origin
            .as_ref()
            .is_some_and(|origin| origin.as_str() == event.id)
    }
}

struct TopicState {
    last_seq: u64,
    buffer: ResumeBuffer,
    subscribers: BTreeMap<u64, Subscriber>,
}

/// Result of a lagging subscriber asking to be brought up to date.
#[derive(Debug)]
pub(crate) enum CatchUp {
    /// Not lagging; keep reading the live queue.
    Current,
    /// Missed events, in order. The subscriber is live again.
    Refilled(VecDeque<Arc<RelayEvent>>),
    /// Events from this sequence number are no longer buffered.
    Missed(u64),
    /// The subscriber is no longer registered.
    Gone,
}

pub(crate) struct Topic {
    name: String,
    echo: bool,
    state: Mutex<TopicState>,
}

impl Topic {
    pub(crate) fn remove(&self, id: u64) -> bool {
        self.state.lock().subscribers.remove(&id).is_some()
    }

    /// Clear subscriber `id`'s lag marker and hand back what it missed.
    ///
    /// Runs under the topic lock, so every event up to the current `seq`
    /// comes from the buffer and every later one from the live queue.
    pub(crate) fn catch_up(&self, id: u64) -> CatchUp {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(subscriber) = state.subscribers.get_mut(&id) else {
            return CatchUp::Gone;
        };
        let Some(from) = subscriber.lagging_from.take() else {
            return CatchUp::Current;
        };

        let now = Instant::now();
        if !state.buffer.covers(from, now) {
            return CatchUp::Missed(from);
        }
        let missed = state
            .buffer
            .since(from - 1, now)
            .filter(|entry| self.echo || !subscriber.is_origin_of(&entry.event))
            .cloned()
            .collect();
        CatchUp::Refilled(missed)
    }
}

/// Publish/subscribe hub for position events.
///
/// Shared as `Arc<Relay>`; every method takes `&self`.
pub struct Relay {
    config: RelayConfig,
    topics: RwLock<BTreeMap<String, Arc<Topic>>>,
    next_subscription: AtomicU64,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            topics: RwLock::new(BTreeMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn resume_enabled(&self) -> bool {
        self.config.resume
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        // Fast path: topic already exists
        {
            let topics = self.topics.read();
            if let Some(topic) = topics.get(name) {
                return topic.clone();
            }
        }

        // Slow path: create it
        let mut topics = self.topics.write();
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Topic {
                    name: name.to_string(),
                    echo: self.config.echo,
                    state: Mutex::new(TopicState {
                        last_seq: 0,
                        buffer: ResumeBuffer::new(
                            self.config.retention,
                            self.config.resume_capacity,
                        ),
                        subscribers: BTreeMap::new(),
                    }),
                })
            })
            .clone()
    }

    /// Publish `event` to every subscriber of `topic` but its originator.
    ///
    /// The originator is whoever subscribed with `origin == event.id`. The
    /// caller is responsible for checking that the sender is entitled to
    /// that id.
    pub fn publish(&self, topic: &str, event: PositionEvent) -> PublishReport {
        let topic = self.topic(topic);
        let mut state = topic.state.lock();

        state.last_seq += 1;
        let event = Arc::new(RelayEvent {
            seq: state.last_seq,
            event,
            published_at: Instant::now(),
        });
        if self.config.resume {
            state.buffer.push(event.clone());
        }

        let mut report = PublishReport {
            seq: event.seq,
            ..Default::default()
        };
        let mut dead = Vec::new();

        for (id, subscriber) in state.subscribers.iter_mut() {
            if !self.config.echo && subscriber.is_origin_of(&event.event) {
                continue;
            }
            if subscriber.lagging_from.is_some() {
                report.lagged += 1;
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.lagged += 1;
                    subscriber.lagging_from = Some(event.seq);
                    debug!(topic = %topic.name, subscription = id, seq = event.seq, "subscriber lagging");
                }
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }

        for id in &dead {
            state.subscribers.remove(id);
        }
        report.closed = dead.len();
        if report.closed > 0 {
            debug!(topic = %topic.name, closed = report.closed, "removed closed subscribers");
        }

        trace!(topic = %topic.name, seq = event.seq, delivered = report.delivered, "published");
        report
    }

    /// Register a subscriber on `topic`.
    ///
    /// With resume enabled and `options.resume_after` set, buffered events
    /// with a greater sequence number are yielded first, then live events.
    /// The subscription ends when `cancel` fires, when it is dropped, or
    /// when [`Subscription::unsubscribe`] is called.
    pub fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
        cancel: CancelSignal,
    ) -> Subscription {
        let topic = self.topic(topic);
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let subscriber = Subscriber {
            origin: options.origin,
            tx,
            lagging_from: None,
        };

        let replay: VecDeque<Arc<RelayEvent>> = {
            let mut state = topic.state.lock();
            let replay = match options.resume_after {
                Some(after) if self.config.resume => state
                    .buffer
                    .since(after, Instant::now())
                    .filter(|entry| self.config.echo || !subscriber.is_origin_of(&entry.event))
                    .cloned()
                    .collect(),
                _ => VecDeque::new(),
            };
            state.subscribers.insert(id, subscriber);
            replay
        };

        debug!(topic = %topic.name, subscription = id, replay = replay.len(), "subscribed");
        Subscription::new(id, topic, rx, replay, cancel)
    }

    /// Live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|topic| topic.state.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// Events currently held in `topic`'s resume buffer, including any
    /// expired ones not yet pruned.
    pub fn buffered(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|topic| topic.state.lock().buffer.len())
            .unwrap_or(0)
    }

    /// Prune expired events and closed subscribers on every topic.
    ///
    /// Returns the number of events pruned.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let topics: Vec<Arc<Topic>> = self.topics.read().values().cloned().collect();

        let mut pruned = 0;
        for topic in topics {
            let mut state = topic.state.lock();
            pruned += state.buffer.prune(now);
            state.subscribers.retain(|_, subscriber| !subscriber.tx.is_closed());
        }
        if pruned > 0 {
            debug!(pruned, "swept resume buffers");
        }
        pruned
    }

    /// Run [`Relay::sweep`] every `every` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        mut cancel: CancelSignal,
    ) -> JoinHandle<()> {
        let relay = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(relay) = relay.upgrade() else { break };
                        relay.sweep();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.config)
            .field("topics", &self.topics.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
