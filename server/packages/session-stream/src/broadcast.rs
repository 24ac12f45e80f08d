use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;

use crate::session::SessionStream;

/// What a subscriber receives. The channel closing marks end of stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    Frame(Bytes),
    Error(String),
}

impl SubscriberEvent {
    /// Wire bytes for the downstream connection. Frames are forwarded
    /// untouched; errors are rendered as a final `error` event.
    pub fn into_bytes(self) -> Bytes {
        match self {
            SubscriberEvent::Frame(raw) => raw,
            SubscriberEvent::Error(message) => {
                let payload = json!({ "type": "error", "content": message });
                Bytes::from(format!("data: {payload}\n\n"))
            }
        }
    }
}

/// Live subscriber set for one session. Only reachable through the
/// session's lock, so every operation here is atomic relative to frame
/// appends.
#[derive(Debug, Default)]
pub(crate) struct Broadcaster {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<SubscriberEvent>>,
}

impl Broadcaster {
    /// Register a subscriber, queueing the replay ahead of any live frame.
    pub(crate) fn join(
        &mut self,
        replay: &[Bytes],
    ) -> (u64, mpsc::UnboundedReceiver<SubscriberEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        for raw in replay {
            // The receiver is still held here, so this cannot fail.
            let _ = tx.send(SubscriberEvent::Frame(raw.clone()));
        }

        self.next_id += 1;
        let id = self.next_id;
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    /// Deliver to every subscriber, evicting the ones whose receiver is gone.
    /// Returns how many were evicted.
    pub(crate) fn deliver(&mut self, raw: &Bytes) -> usize {
        let before = self.subscribers.len();
        self.subscribers
            .retain(|_, tx| tx.send(SubscriberEvent::Frame(raw.clone())).is_ok());
        before - self.subscribers.len()
    }

    /// Close every subscriber, sending the error first when there is one.
    pub(crate) fn notify_terminal(&mut self, error: Option<&str>) -> usize {
        let count = self.subscribers.len();
        for (_, tx) in self.subscribers.drain() {
            if let Some(error) = error {
                let _ = tx.send(SubscriberEvent::Error(error.to_string()));
            }
        }
        count
    }

    pub(crate) fn leave(&mut self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

/// A downstream attachment to a session. Dropping it leaves the session;
/// the upstream keeps running regardless.
#[derive(Debug)]
pub struct Subscription {
    session: Arc<SessionStream>,
    id: u64,
    rx: mpsc::UnboundedReceiver<SubscriberEvent>,
}

impl Subscription {
    pub(crate) fn new(
        session: Arc<SessionStream>,
        id: u64,
        rx: mpsc::UnboundedReceiver<SubscriberEvent>,
    ) -> Self {
        Self { session, id, rx }
    }

    pub async fn recv(&mut self) -> Option<SubscriberEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = SubscriberEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.session.leave(self.id);
    }
}
