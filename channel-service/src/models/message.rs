use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Inbound => "inbound",
            MessageDirection::Outbound => "outbound",
        }
    }
}

/// Delivery progression: pending -> sent -> delivered -> read, or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// Status updates from the wire can arrive out of order; only forward
    /// transitions are applied.
    pub fn is_forward_transition(from: MessageStatus, to: MessageStatus) -> bool {
        if to == MessageStatus::Failed {
            return from != MessageStatus::Read;
        }
        to > from
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub conversation_id: Uuid,
    pub external_id: String,
    pub direction: String,
    pub message_type: String,
    pub content: serde_json::Value,
    pub status: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        use MessageStatus::*;
        assert!(MessageStatus::is_forward_transition(Pending, Sent));
        assert!(MessageStatus::is_forward_transition(Sent, Delivered));
        assert!(MessageStatus::is_forward_transition(Delivered, Read));
        assert!(MessageStatus::is_forward_transition(Sent, Read));
        assert!(!MessageStatus::is_forward_transition(Read, Delivered));
        assert!(!MessageStatus::is_forward_transition(Delivered, Sent));
        assert!(!MessageStatus::is_forward_transition(Sent, Sent));
        // A read message can no longer fail
        assert!(!MessageStatus::is_forward_transition(Read, Failed));
        assert!(MessageStatus::is_forward_transition(Pending, Failed));
    }
}
