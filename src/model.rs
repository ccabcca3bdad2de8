use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user waiting to be paired into a new chat. At most one live entry
/// per user, enforced by the primary key.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueEntry {
    pub user_id: String,
    pub display_name: String,
    pub enqueued_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub joined_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatSession {
    pub id: Uuid,
    pub participants: Vec<Participant>,
    pub is_active: bool,
    pub created_at: i64,
    pub last_message_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl ChatSession {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }
}

/// Immutable once created, except for `read_by` additions.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: String,
    pub text: String,
    pub created_at: i64,
    pub read_by: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(MemberRole::Admin),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Membership {
    pub user_id: String,
    pub role: MemberRole,
    pub joined_at: i64,
    pub is_active: bool,
    pub left_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub is_public: bool,
    pub is_anonymous: bool,
    pub created_by: String,
    /// Denormalized count of active members, maintained by atomic ±1
    /// alongside membership writes. `groups::recount_members` is the
    /// repair path if it drifts.
    pub member_count: i64,
    pub created_at: i64,
    pub last_activity: i64,
    /// Truncated preview of the latest message, for list rendering.
    pub last_message: Option<String>,
    pub avatar_url: Option<String>,
    pub tags: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupMessageKind {
    Message,
    System,
}

impl GroupMessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupMessageKind::Message => "message",
            GroupMessageKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(GroupMessageKind::Message),
            "system" => Some(GroupMessageKind::System),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    pub id: Uuid,
    pub group_id: Uuid,
    pub sender_id: String,
    /// Pseudonymous when the group is anonymous.
    pub sender_name: String,
    pub text: String,
    pub kind: GroupMessageKind,
    pub created_at: i64,
    pub is_deleted: bool,
}

/// Best-effort, heartbeat-derived signal. `is_online` already accounts
/// for staleness: a record older than two heartbeat intervals reads as
/// offline even if the client never said goodbye.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PresenceStatus {
    pub is_online: bool,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReportRecord {
    pub id: i64,
    pub reporter_id: String,
    pub target_id: String,
    pub reason: String,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    Processing,
    Resolved,
    Rejected,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::New => "new",
            TicketStatus::Processing => "processing",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(TicketStatus::New),
            "processing" => Some(TicketStatus::Processing),
            "resolved" => Some(TicketStatus::Resolved),
            "rejected" => Some(TicketStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SupportTicket {
    pub id: Uuid,
    pub user_id: String,
    pub body: String,
    pub status: TicketStatus,
    pub assigned_to: Option<String>,
    pub response: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
