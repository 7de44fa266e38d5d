//! Receiving side of a relay subscription.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::warn;

use super::{CatchUp, RelayEvent, Topic};
use crate::cancel::CancelSignal;

enum Ready {
    Event(Arc<RelayEvent>),
    Empty,
    Ended,
}

/// A live registration on one relay topic.
///
/// Yields replayed events first (if any were requested), then live events,
/// in sequence order. A subscriber that fell behind is refilled from the
/// resume buffer once its queue is empty; if that is no longer possible the
/// subscription ends. Unregisters itself when cancelled, unsubscribed or
/// dropped.
pub struct Subscription {
    id: u64,
    topic: Arc<Topic>,
    rx: mpsc::Receiver<Arc<RelayEvent>>,
    replay: VecDeque<Arc<RelayEvent>>,
    cancel: CancelSignal,
    detached: bool,
}

impl Subscription {
    pub(super) fn new(
        id: u64,
        topic: Arc<Topic>,
        rx: mpsc::Receiver<Arc<RelayEvent>>,
        replay: VecDeque<Arc<RelayEvent>>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            id,
            topic,
            rx,
            replay,
            cancel,
            detached: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Events still waiting in the replay queue.
    pub fn pending_replay(&self) -> usize {
        self.replay.len()
    }

    /// Next event, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Arc<RelayEvent>> {
        if self.detached {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.unsubscribe();
            return None;
        }
        match self.ready() {
            Ready::Event(event) => return Some(event),
            Ready::Ended => {
                self.unsubscribe();
                return None;
            }
            Ready::Empty => {}
        }

        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        };
        if next.is_none() {
            self.unsubscribe();
        }
        next
    }

    /// Next event if one is ready, without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<RelayEvent>> {
        if self.detached {
            return None;
        }
        match self.ready() {
            Ready::Event(event) => Some(event),
            Ready::Ended => {
                self.unsubscribe();
                None
            }
            Ready::Empty => None,
        }
    }

    /// Replay, then the live queue, then a catch-up from the topic's buffer
    /// if the queue overflowed.
    fn ready(&mut self) -> Ready {
        loop {
            if let Some(event) = self.replay.pop_front() {
                return Ready::Event(event);
            }
            match self.rx.try_recv() {
                Ok(event) => return Ready::Event(event),
                Err(TryRecvError::Disconnected) => return Ready::Ended,
                Err(TryRecvError::Empty) => {}
            }
            match self.topic.catch_up(self.id) {
                CatchUp::Current => return Ready::Empty,
                CatchUp::Refilled(missed) => self.replay = missed,
                CatchUp::Missed(from) => {
                    warn!(topic = %self.topic.name, subscription = self.id, from, "subscriber fell behind the resume buffer");
                    return Ready::Ended;
                }
                CatchUp::Gone => return Ready::Ended,
            }
        }
    }

    /// Stop receiving and unregister from the topic. Idempotent.
    pub fn unsubscribe(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.topic.remove(self.id);
        self.replay.clear();
        self.rx.close();
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<RelayEvent>> + Send {
        futures_util::stream::unfold(self, |mut subscription| async move {
            let event = subscription.recv().await?;
            Some((event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic.name)
            .field("pending_replay", &self.replay.len())
            .field("detached", &self.detached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::cancel::cancel_pair;
    use crate::relay::{Relay, SubscribeOptions};
    use futures_util::StreamExt;
    use pulsewire_types::{PositionEvent, SenderId};

    #[tokio::test]
    async fn stream_yields_replay_then_live_and_ends_on_cancel() {
        let relay = Relay::default();
        relay.publish("t", PositionEvent::new("a", 1.0, 0.0));

        let (canceller, signal) = cancel_pair();
        let sub = relay.subscribe(
            "t",
            SubscribeOptions::default()
                .origin(SenderId::from("me"))
                .resume_after(0),
            signal,
        );
        assert_eq!(sub.pending_replay(), 1);

        let mut stream = Box::pin(sub.into_stream());
        relay.publish("t", PositionEvent::new("b", 2.0, 0.0));

        assert_eq!(stream.next().await.map(|e| e.seq), Some(1));
        assert_eq!(stream.next().await.map(|e| e.seq), Some(2));

        canceller.cancel();
        assert!(stream.next().await.is_none());
        assert_eq!(relay.subscriber_count("t"), 0);
    }
}
