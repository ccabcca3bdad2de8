use crate::model::{ChatMessage, GroupMessage, TicketStatus};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Domain events emitted after successful writes. Live views subscribe
/// to the topics they care about; dropping the receiver is the
/// unsubscribe.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum Event {
    Paired {
        chat_id: Uuid,
        users: Vec<String>,
    },
    ChatMessage {
        chat_id: Uuid,
        message: ChatMessage,
    },
    ChatEnded {
        chat_id: Uuid,
    },
    GroupMessage {
        group_id: Uuid,
        message: GroupMessage,
    },
    MemberJoined {
        group_id: Uuid,
        user_id: String,
    },
    MemberLeft {
        group_id: Uuid,
        user_id: String,
    },
    TicketUpdated {
        ticket_id: Uuid,
        status: TicketStatus,
    },
}

impl Event {
    /// Topics this event is delivered to, e.g. `chat:<id>` or `user:<id>`.
    pub fn topics(&self) -> Vec<String> {
        match self {
            Event::Paired { chat_id, users } => {
                let mut t: Vec<String> = users.iter().map(|u| format!("user:{u}")).collect();
                t.push(format!("chat:{chat_id}"));
                t
            }
            Event::ChatMessage { chat_id, .. } | Event::ChatEnded { chat_id } => {
                vec![format!("chat:{chat_id}")]
            }
            Event::GroupMessage { group_id, .. }
            | Event::MemberJoined { group_id, .. }
            | Event::MemberLeft { group_id, .. } => vec![format!("group:{group_id}")],
            Event::TicketUpdated { ticket_id, .. } => vec![format!("ticket:{ticket_id}")],
        }
    }

    pub fn matches(&self, topics: &[String]) -> bool {
        self.topics().iter().any(|t| topics.contains(t))
    }
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publishing with no receivers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
