use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::fanout::ChatMessage;

/// Mesh lifecycle events emitted by the coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    StatusChanged {
        self_id: String,
        status: String,
    },
    PeerJoined {
        self_id: String,
        peer_id: String,
    },
    PeerLeft {
        self_id: String,
        peer_id: String,
    },
    LinkEstablished {
        self_id: String,
        peer_id: String,
    },
    LinkLost {
        self_id: String,
        peer_id: String,
        reason: String,
    },
    ChatReceived {
        message: ChatMessage,
    },
    ChatSent {
        message: ChatMessage,
        delivered: usize,
    },
}

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast-based event bus for observers of a mesh session.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast an event to all subscribers. Returns the number of receivers.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(Event::PeerJoined {
            self_id: "peer:alice".into(),
            peer_id: "peer:bob".into(),
        });

        match rx.recv().await.unwrap() {
            Event::PeerJoined { self_id, peer_id } => {
                assert_eq!(self_id, "peer:alice");
                assert_eq!(peer_id, "peer:bob");
            }
            _ => panic!("unexpected event variant"),
        }
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let value = serde_json::to_value(Event::StatusChanged {
            self_id: "peer:alice".into(),
            status: "connected".into(),
        })
        .unwrap();
        assert_eq!(value["type"], "StatusChanged");
        assert_eq!(value["status"], "connected");
    }

    #[tokio::test]
    async fn no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        let count = bus.emit(Event::PeerLeft {
            self_id: "peer:alice".into(),
            peer_id: "peer:bob".into(),
        });
        assert_eq!(count, 0);
    }
}
