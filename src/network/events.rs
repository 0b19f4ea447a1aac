//! Event bus between the network and the host application.
//!
//! Producers (the inbound handler, the gossip loop, local calls) push without
//! waiting on the consumer. The host drains the whole buffer at once with
//! [`EventBus::drain`]; each event is handed out exactly once.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{unix_millis, PeerId, Tag};

/// Kind of network event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Connection,
    Disconnection,
    TrustChange,
}

/// Text message carried by a `Message` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessageBody {
    pub message: String,
    pub tags: Tag,
}

/// A network event awaiting collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub peer: PeerId,
    pub timestamp: u64,
    pub message: Option<MessageBody>,
}

impl Event {
    pub fn message(origin: PeerId, payload: impl Into<String>, tag: Tag) -> Self {
        Self {
            kind: EventKind::Message,
            peer: origin,
            timestamp: unix_millis(),
            message: Some(MessageBody {
                message: payload.into(),
                tags: tag,
            }),
        }
    }

    pub fn connection(peer: PeerId) -> Self {
        Self::bare(EventKind::Connection, peer)
    }

    pub fn disconnection(peer: PeerId) -> Self {
        Self::bare(EventKind::Disconnection, peer)
    }

    pub fn trust_change(peer: PeerId) -> Self {
        Self::bare(EventKind::TrustChange, peer)
    }

    fn bare(kind: EventKind, peer: PeerId) -> Self {
        Self {
            kind,
            peer,
            timestamp: unix_millis(),
            message: None,
        }
    }

    /// Host-facing JSON form:
    /// `{"type": ..., "data": {"peer": ..., "message"?: {"message": ..., "tags": ...}}}`
    pub fn to_json(&self) -> String {
        let wire = WireEvent {
            kind: self.kind,
            data: WireData {
                peer: self.peer.to_string(),
                message: self.message.as_ref(),
            },
        };
        // Plain strings and enums only, serialization cannot fail.
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct WireEvent<'a> {
    #[serde(rename = "type")]
    kind: EventKind,
    data: WireData<'a>,
}

#[derive(Serialize)]
struct WireData<'a> {
    peer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a MessageBody>,
}

/// Bounded FIFO of events. When full, the oldest event is dropped.
pub struct EventBus {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append an event, evicting the oldest one if the bus is full.
    pub fn push(&self, event: Event) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
    }

    /// Take every buffered event, oldest first.
    pub fn drain(&self) -> Vec<Event> {
        let mut queue = self.queue.lock();
        queue.drain(..).collect()
    }

    /// Take every buffered event as host JSON.
    pub fn drain_json(&self) -> Vec<String> {
        self.drain().iter().map(Event::to_json).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events lost to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}
