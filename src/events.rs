use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::MessageView;

/// Channel an event is published on. Chat channels are private (clients may
/// only subscribe after a membership check); the users channel is global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    Chat(Uuid),
    Users,
}

impl Channel {
    pub fn name(&self) -> String {
        match self {
            Channel::Chat(id) => format!("chat.{}", id),
            Channel::Users => "users".to_string(),
        }
    }
}

/// Typed broadcast events. Payload shapes are fixed here so drift shows up
/// at compile time instead of in a client.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event")]
pub enum ChatEvent {
    #[serde(rename = "message.sent")]
    MessageSent { message: MessageView },
    #[serde(rename = "message.read")]
    MessageRead {
        message_id: Uuid,
        read_by_user_id: i64,
        read_at: i64,
    },
    #[serde(rename = "user.typing")]
    UserTyping {
        user_id: i64,
        name: String,
        is_typing: bool,
    },
    #[serde(rename = "user.status")]
    UserStatus {
        user_id: i64,
        is_online: bool,
        last_seen_at: Option<i64>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub channel: String,
    #[serde(flatten)]
    pub event: ChatEvent,
    /// The acting user, dropped from delivery; they already know what they
    /// did. Not part of the wire payload.
    #[serde(skip)]
    pub exclude_user: Option<i64>,
}

/// Fire-and-forget publisher. Delivery is at-most-once: a send with no
/// listeners, a lagged receiver or a closed socket never bubbles back into
/// the request that produced the event.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Envelope>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to every subscriber of the channel.
    pub fn publish(&self, channel: Channel, event: ChatEvent) {
        self.send(Envelope {
            channel: channel.name(),
            event,
            exclude_user: None,
        });
    }

    /// Publish to every subscriber except the acting user.
    pub fn publish_to_others(&self, channel: Channel, actor: i64, event: ChatEvent) {
        self.send(Envelope {
            channel: channel.name(),
            event,
            exclude_user: Some(actor),
        });
    }

    fn send(&self, envelope: Envelope) {
        if let Err(e) = self.tx.send(envelope) {
            tracing::debug!(error = %e, "event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}
