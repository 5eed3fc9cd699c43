//! Redis pub/sub fan-out of channel lifecycle and conversation activity.
//!
//! Every event is published on the channel topic for consumers following
//! one connection (QR screens, status widgets) and on the tenant topic for
//! inbox-wide consumers. Conversation activity additionally lands on the
//! assigned agent's private topic. Fan-out is best-effort; the durable
//! write has already happened by the time anything is published.

use crate::models::{Contact, Conversation, Message};
use crate::redis_client::RedisClient;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub fn channel_topic(channel_id: Uuid) -> String {
    format!("channel:{channel_id}:events")
}

pub fn tenant_topic(tenant_id: Uuid) -> String {
    format!("tenant:{tenant_id}:events")
}

/// Private topic of the agent a conversation is assigned to.
pub fn assignee_topic(user_id: Uuid) -> String {
    format!("user:{user_id}:events")
}

/// Everything downstream consumers can observe about a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    QrCode {
        channel_id: Uuid,
        qr: String,
        generation: u32,
    },
    PairingCode {
        channel_id: Uuid,
        code: String,
    },
    StatusChanged {
        channel_id: Uuid,
        status: String,
        reason: Option<String>,
    },
    MessageCreated {
        channel_id: Uuid,
        message: Message,
        conversation: Conversation,
        contact: Contact,
    },
    MessageStatusUpdated {
        channel_id: Uuid,
        message_id: Uuid,
        conversation_id: Uuid,
        status: String,
    },
    ConversationUpdated {
        channel_id: Uuid,
        conversation: Conversation,
    },
    ContactUpdated {
        channel_id: Uuid,
        contact: Contact,
    },
    HistorySyncProgress {
        channel_id: Uuid,
        batch_size: usize,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct EventFanout {
    redis: RedisClient,
}

impl EventFanout {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    /// Publish to the channel topic and the owning tenant's topic. Errors
    /// are logged and swallowed; a pub/sub outage must not fail ingestion.
    pub async fn publish(&self, channel_id: Uuid, tenant_id: Uuid, event: &ChannelEvent) {
        self.publish_with_assignee(channel_id, tenant_id, None, event)
            .await;
    }

    /// [`publish`](Self::publish), plus the assigned agent's private topic
    /// when the conversation has one.
    pub async fn publish_with_assignee(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        assignee_id: Option<Uuid>,
        event: &ChannelEvent,
    ) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(%channel_id, error = %e, "failed to serialize fanout event");
                return;
            }
        };

        let mut topics = vec![channel_topic(channel_id), tenant_topic(tenant_id)];
        if let Some(assignee) = assignee_id {
            topics.push(assignee_topic(assignee));
        }

        let mut conn = self.redis.connection().await;
        for topic in topics {
            if let Err(e) = conn.publish::<_, _, ()>(&topic, &payload).await {
                warn!(%channel_id, topic, error = %e, "fanout publish failed");
            }
        }
    }
}
