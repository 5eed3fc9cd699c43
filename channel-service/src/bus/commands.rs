//! Wire format of the command bus.
//!
//! Other services drive channels by publishing a [`CommandEnvelope`] on the
//! shared command topic; the reply lands on a per-correlation response
//! topic. Payloads are JSON with an `op` tag so the set of operations can
//! grow without breaking older publishers.

use crate::protocol::MediaPayload;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const COMMAND_TOPIC: &str = "bus:commands";

pub fn response_topic(correlation_id: &str) -> String {
    format!("bus:resp:{correlation_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    StartSession {
        channel_id: Uuid,
    },
    StopSession {
        channel_id: Uuid,
    },
    /// Steal the channel from whichever instance currently holds it.
    TakeoverSession {
        channel_id: Uuid,
    },
    Logout {
        channel_id: Uuid,
    },
    RequestPairingCode {
        channel_id: Uuid,
        phone: String,
    },
    SendText {
        channel_id: Uuid,
        to: String,
        body: String,
    },
    SendMedia {
        channel_id: Uuid,
        to: String,
        media: MediaPayload,
    },
    SendReaction {
        channel_id: Uuid,
        to: String,
        external_id: String,
        emoji: String,
    },
    MarkRead {
        channel_id: Uuid,
        conversation_id: Uuid,
        external_ids: Vec<String>,
    },
    /// Tear the session down and bring it straight back up on this
    /// instance; the operator's remedy for a wedged connection.
    Reconnect {
        channel_id: Uuid,
    },
    FetchProfilePicture {
        channel_id: Uuid,
        remote_id: String,
    },
    FetchGroupMetadata {
        channel_id: Uuid,
        group_id: String,
    },
    CloseConversation {
        channel_id: Uuid,
        conversation_id: Uuid,
    },
    AssignConversation {
        channel_id: Uuid,
        conversation_id: Uuid,
        assignee_id: Option<Uuid>,
    },
    GetStatus {
        channel_id: Uuid,
    },
}

impl Command {
    pub fn channel_id(&self) -> Uuid {
        match self {
            Command::StartSession { channel_id }
            | Command::StopSession { channel_id }
            | Command::TakeoverSession { channel_id }
            | Command::Logout { channel_id }
            | Command::RequestPairingCode { channel_id, .. }
            | Command::SendText { channel_id, .. }
            | Command::SendMedia { channel_id, .. }
            | Command::SendReaction { channel_id, .. }
            | Command::MarkRead { channel_id, .. }
            | Command::Reconnect { channel_id }
            | Command::FetchProfilePicture { channel_id, .. }
            | Command::FetchGroupMetadata { channel_id, .. }
            | Command::CloseConversation { channel_id, .. }
            | Command::AssignConversation { channel_id, .. }
            | Command::GetStatus { channel_id } => *channel_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub correlation_id: String,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub correlation_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn success(correlation_id: &str, result: serde_json::Value) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(correlation_id: &str, error: String) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}
