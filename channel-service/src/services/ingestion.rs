//! Inbound persistence pipeline: identity resolution, contact and
//! conversation upserts, idempotent message insert, status updates and
//! history-sync batches.
//!
//! The protocol redelivers messages after reconnects, so the insert is
//! anchored on the unique (channel_id, external_id) pair: duplicates are
//! silently skipped and cause no unread bump and no fan-out.

use crate::error::{is_unique_violation, AppError, AppResult};
use crate::models::{Contact, Conversation, Message, MessageDirection, MessageStatus};
use crate::protocol::{ContactSync, GroupMetadata, InboundMessage};
use crate::redis_client::RedisClient;
use crate::services::contact_service::ContactService;
use crate::services::fanout::{ChannelEvent, EventFanout};
use crate::services::identity::{self, IdentityService};
use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channel kind recorded on contacts created by this service.
pub const CHANNEL_KIND: &str = "whatsapp";

const HISTORY_QUEUE_KEY: &str = "history:pending";
const HISTORY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const GROUP_META_TTL_SECS: u64 = 3600;

/// Whether a message arrives from the live stream or a history-sync batch.
/// History items never bump unread counts and are stored as already
/// delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    Live,
    History,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryJob {
    channel_id: Uuid,
    tenant_id: Uuid,
    messages: Vec<InboundMessage>,
}

#[derive(Clone)]
pub struct IngestionPipeline {
    db: Pool<Postgres>,
    redis: RedisClient,
    fanout: EventFanout,
    fallback_batch: usize,
}

impl IngestionPipeline {
    pub fn new(
        db: Pool<Postgres>,
        redis: RedisClient,
        fanout: EventFanout,
        fallback_batch: usize,
    ) -> Self {
        Self {
            db,
            redis,
            fanout,
            fallback_batch,
        }
    }

    /// Persist one message end to end. Returns the stored message, or
    /// `None` when the external id was already seen.
    pub async fn ingest_message(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        msg: &InboundMessage,
        direction: MessageDirection,
        source: IngestSource,
    ) -> AppResult<Option<Message>> {
        let canonical = IdentityService::resolve(&self.db, channel_id, &msg.remote_id).await?;
        if canonical.is_empty() {
            warn!(%channel_id, remote = %msg.remote_id, "unresolvable remote id, dropping message");
            return Ok(None);
        }
        let is_group = identity::is_group(&msg.remote_id);

        let contact = ContactService::get_or_create_contact(
            &self.db,
            tenant_id,
            CHANNEL_KIND,
            &canonical,
            is_group,
        )
        .await?;
        if let Some(push_name) = msg.push_name.as_deref() {
            ContactService::apply_profile(&self.db, &contact, Some(push_name), None).await?;
        }

        let conversation =
            ContactService::get_or_create_conversation(&self.db, channel_id, contact.id).await?;

        let initial_status = match (direction, source) {
            (MessageDirection::Outbound, _) => MessageStatus::Sent,
            (MessageDirection::Inbound, IngestSource::History) => MessageStatus::Delivered,
            (MessageDirection::Inbound, IngestSource::Live) => MessageStatus::Delivered,
        };

        let insert = sqlx::query_as::<_, Message>(
            "INSERT INTO messages \
                 (id, channel_id, conversation_id, external_id, direction, message_type, \
                  content, status, sent_at, delivered_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (channel_id, external_id) DO NOTHING \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(channel_id)
        .bind(conversation.id)
        .bind(&msg.external_id)
        .bind(direction.as_str())
        .bind(&msg.message_type)
        .bind(&msg.content)
        .bind(initial_status.as_str())
        .bind(msg.timestamp)
        .bind((direction == MessageDirection::Inbound).then_some(msg.timestamp))
        .fetch_optional(&self.db)
        .await;

        let stored = match insert {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(%channel_id, external_id = %msg.external_id, "duplicate message skipped");
                return Ok(None);
            }
            // A concurrent inserter can still win the race; the row exists,
            // which is all idempotency requires.
            Err(e) if is_unique_violation(&e) => {
                debug!(%channel_id, external_id = %msg.external_id, "duplicate message skipped");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match (direction, source) {
            (MessageDirection::Inbound, IngestSource::Live) => {
                ContactService::touch_inbound(&self.db, conversation.id, msg.timestamp).await?;
            }
            _ => {
                ContactService::touch_outbound(&self.db, conversation.id, msg.timestamp).await?;
            }
        }

        if source == IngestSource::Live {
            let conversation = self.reload_conversation(conversation.id).await?;
            let assignee_id = conversation.assignee_id;
            self.fanout
                .publish_with_assignee(
                    channel_id,
                    tenant_id,
                    assignee_id,
                    &ChannelEvent::MessageCreated {
                        channel_id,
                        message: stored.clone(),
                        conversation,
                        contact,
                    },
                )
                .await;
        }

        Ok(Some(stored))
    }

    /// Apply a wire status receipt. Out-of-order receipts (a `delivered`
    /// arriving after `read`) are dropped; unknown external ids are ignored,
    /// they belong to messages sent before this service tracked the channel.
    pub async fn apply_status_update(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        external_id: &str,
        status: MessageStatus,
    ) -> AppResult<()> {
        let row = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE channel_id = $1 AND external_id = $2",
        )
        .bind(channel_id)
        .bind(external_id)
        .fetch_optional(&self.db)
        .await?;

        let Some(message) = row else {
            debug!(%channel_id, external_id, "status update for unknown message ignored");
            return Ok(());
        };

        let current = MessageStatus::parse(&message.status).unwrap_or(MessageStatus::Pending);
        if !MessageStatus::is_forward_transition(current, status) {
            debug!(
                %channel_id, external_id, from = %message.status, to = status.as_str(),
                "non-forward status transition ignored"
            );
            return Ok(());
        }

        let timestamp_column = match status {
            MessageStatus::Sent => Some("sent_at"),
            MessageStatus::Delivered => Some("delivered_at"),
            MessageStatus::Read => Some("read_at"),
            _ => None,
        };
        let query = match timestamp_column {
            Some(col) => format!(
                "UPDATE messages SET status = $2, {col} = COALESCE({col}, NOW()) WHERE id = $1"
            ),
            None => "UPDATE messages SET status = $2 WHERE id = $1".to_string(),
        };
        sqlx::query(&query)
            .bind(message.id)
            .bind(status.as_str())
            .execute(&self.db)
            .await?;

        let assignee_id: Option<Uuid> =
            sqlx::query_scalar("SELECT assignee_id FROM conversations WHERE id = $1")
                .bind(message.conversation_id)
                .fetch_optional(&self.db)
                .await?
                .flatten();
        self.fanout
            .publish_with_assignee(
                channel_id,
                tenant_id,
                assignee_id,
                &ChannelEvent::MessageStatusUpdated {
                    channel_id,
                    message_id: message.id,
                    conversation_id: message.conversation_id,
                    status: status.as_str().to_string(),
                },
            )
            .await;
        Ok(())
    }

    /// Apply a contact roster sync from the wire.
    pub async fn apply_contact_sync(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        contacts: &[ContactSync],
    ) -> AppResult<()> {
        for sync in contacts {
            let canonical = IdentityService::resolve(&self.db, channel_id, &sync.remote_id).await?;
            if canonical.is_empty() {
                continue;
            }
            let contact = ContactService::get_or_create_contact(
                &self.db,
                tenant_id,
                CHANNEL_KIND,
                &canonical,
                identity::is_group(&sync.remote_id),
            )
            .await?;
            ContactService::apply_profile(
                &self.db,
                &contact,
                sync.display_name.as_deref(),
                sync.avatar_url.as_deref(),
            )
            .await?;
        }
        debug!(%channel_id, count = contacts.len(), "contact sync applied");
        Ok(())
    }

    /// Record a freshly fetched avatar URL on the contact.
    pub async fn store_avatar(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        remote_id: &str,
        avatar_url: &str,
    ) -> AppResult<()> {
        let canonical = IdentityService::resolve(&self.db, channel_id, remote_id).await?;
        if canonical.is_empty() {
            return Ok(());
        }
        let contact = ContactService::get_or_create_contact(
            &self.db,
            tenant_id,
            CHANNEL_KIND,
            &canonical,
            identity::is_group(remote_id),
        )
        .await?;
        ContactService::apply_profile(&self.db, &contact, None, Some(avatar_url)).await
    }

    /// Apply a group metadata update: subject through the naming policy,
    /// participants into a short-lived Redis cache for quick lookup.
    pub async fn apply_group_metadata(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        meta: &GroupMetadata,
    ) -> AppResult<()> {
        let canonical = identity::normalize(&meta.group_id);
        let contact = ContactService::get_or_create_contact(
            &self.db,
            tenant_id,
            CHANNEL_KIND,
            &canonical,
            true,
        )
        .await?;
        ContactService::apply_profile(&self.db, &contact, Some(&meta.subject), None).await?;

        let mut conn = self.redis.connection().await;
        let cache_key = format!("group:{channel_id}:{canonical}");
        match serde_json::to_string(meta) {
            Ok(payload) => {
                if let Err(e) = conn
                    .set_ex::<_, _, ()>(&cache_key, payload, GROUP_META_TTL_SECS)
                    .await
                {
                    warn!(%channel_id, error = %e, "group metadata cache write failed");
                }
            }
            Err(e) => warn!(%channel_id, error = %e, "group metadata serialize failed"),
        }

        let updated = ContactService::get_or_create_contact(
            &self.db,
            tenant_id,
            CHANNEL_KIND,
            &canonical,
            true,
        )
        .await?;
        self.fanout
            .publish(
                channel_id,
                tenant_id,
                &ChannelEvent::ContactUpdated {
                    channel_id,
                    contact: updated,
                },
            )
            .await;
        Ok(())
    }

    /// Hand a history batch to the background worker through the Redis
    /// queue. If the queue is unreachable, process a capped slice of the
    /// newest messages synchronously rather than dropping the batch.
    pub async fn enqueue_history(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        messages: Vec<InboundMessage>,
    ) -> AppResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let batch_size = messages.len();

        let job = HistoryJob {
            channel_id,
            tenant_id,
            messages,
        };
        let payload = serde_json::to_string(&job)
            .map_err(|e| AppError::Protocol(format!("serialize history job: {e}")))?;

        let mut conn = self.redis.connection().await;
        match conn.rpush::<_, _, ()>(HISTORY_QUEUE_KEY, payload).await {
            Ok(()) => {
                debug!(%channel_id, batch_size, "history batch queued");
            }
            Err(e) => {
                warn!(%channel_id, error = %e, "history queue unreachable, processing inline");
                let mut messages = job.messages;
                // Newest first, capped: recent history is what the inbox
                // needs right away.
                messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                messages.truncate(self.fallback_batch);
                self.process_history_messages(channel_id, tenant_id, &messages)
                    .await;
            }
        }

        self.fanout
            .publish(
                channel_id,
                tenant_id,
                &ChannelEvent::HistorySyncProgress {
                    channel_id,
                    batch_size,
                    timestamp: Utc::now(),
                },
            )
            .await;
        Ok(())
    }

    /// Drain the history queue until shutdown. One worker per process is
    /// enough; the idempotent insert makes accidental double-processing
    /// harmless.
    pub async fn run_history_worker(&self, mut shutdown: watch::Receiver<bool>) {
        info!("history worker started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("history worker stopping");
                        break;
                    }
                }
                job = self.pop_history_job() => {
                    match job {
                        Some(job) => {
                            self.process_history_messages(
                                job.channel_id,
                                job.tenant_id,
                                &job.messages,
                            )
                            .await;
                        }
                        None => tokio::time::sleep(HISTORY_POLL_INTERVAL).await,
                    }
                }
            }
        }
    }

    async fn pop_history_job(&self) -> Option<HistoryJob> {
        let mut conn = self.redis.connection().await;
        let payload: Option<String> = match conn.lpop(HISTORY_QUEUE_KEY, None).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "history queue pop failed");
                return None;
            }
        };
        let payload = payload?;
        match serde_json::from_str(&payload) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(error = %e, "corrupt history job dropped");
                None
            }
        }
    }

    async fn process_history_messages(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        messages: &[InboundMessage],
    ) {
        let mut stored = 0usize;
        for msg in messages {
            match self
                .ingest_message(
                    channel_id,
                    tenant_id,
                    msg,
                    MessageDirection::Inbound,
                    IngestSource::History,
                )
                .await
            {
                Ok(Some(_)) => stored += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(%channel_id, external_id = %msg.external_id, error = %e,
                        "history message failed, continuing batch");
                }
            }
        }
        info!(%channel_id, total = messages.len(), stored, "history batch processed");
    }

    async fn reload_conversation(&self, conversation_id: Uuid) -> AppResult<Conversation> {
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn conversation_contact(&self, conversation_id: Uuid) -> AppResult<Contact> {
        sqlx::query_as::<_, Contact>(
            "SELECT c.* FROM contacts c \
             JOIN conversations v ON v.contact_id = c.id \
             WHERE v.id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(AppError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(id: &str, ts: i64) -> InboundMessage {
        InboundMessage {
            external_id: id.to_string(),
            remote_id: "60123456789@s.whatsapp.net".into(),
            push_name: None,
            message_type: "text".into(),
            content: serde_json::json!({"body": "hi"}),
            timestamp: Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now),
        }
    }

    #[test]
    fn history_jobs_round_trip_through_json() {
        let job = HistoryJob {
            channel_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            messages: vec![msg("a", 100), msg("b", 200)],
        };
        let payload = serde_json::to_string(&job).unwrap();
        let decoded: HistoryJob = serde_json::from_str(&payload).unwrap();
        assert_eq!(decoded.channel_id, job.channel_id);
        assert_eq!(decoded.messages.len(), 2);
        assert_eq!(decoded.messages[0].external_id, "a");
    }

    #[test]
    fn fallback_takes_newest_first() {
        let mut messages = vec![msg("old", 100), msg("new", 300), msg("mid", 200)];
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        messages.truncate(2);
        assert_eq!(messages[0].external_id, "new");
        assert_eq!(messages[1].external_id, "mid");
    }
}
