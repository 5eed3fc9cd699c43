//! Contact and conversation row management.
//!
//! Concurrent event handling makes get-or-create race-prone, so every
//! creation path goes through `ON CONFLICT DO NOTHING` followed by a
//! fetch. Display names follow an asymmetric trust policy: group subjects
//! come from wire metadata and overwrite, individual names are only filled
//! in while unknown so operator edits survive.

use crate::error::{AppError, AppResult};
use crate::models::{Contact, Conversation, ConversationStatus};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use tracing::debug;
use uuid::Uuid;

/// Name given to a group before its real subject is known.
pub const GROUP_NAME_PLACEHOLDER: &str = "Group";

/// Whether an incoming display name should replace the current one.
///
/// Groups: wire metadata is authoritative, but a placeholder subject never
/// clobbers a real name. Individuals: push names are unreliable, so they
/// only fill a gap.
pub fn should_update_name(is_group: bool, current: Option<&str>, incoming: &str) -> bool {
    if incoming.is_empty() {
        return false;
    }
    if !is_group {
        return current.is_none();
    }
    match current {
        None => true,
        Some(cur) => cur != incoming && incoming != GROUP_NAME_PLACEHOLDER,
    }
}

pub struct ContactService;

impl ContactService {
    /// Fetch or create the contact for a canonical identifier. The unique
    /// index on (tenant, kind, identifier) makes the insert race-safe.
    pub async fn get_or_create_contact(
        db: &Pool<Postgres>,
        tenant_id: Uuid,
        channel_kind: &str,
        identifier: &str,
        is_group: bool,
    ) -> AppResult<Contact> {
        let inserted = sqlx::query_as::<_, Contact>(
            "INSERT INTO contacts (id, tenant_id, channel_kind, identifier, display_name, is_group) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (tenant_id, channel_kind, identifier) DO NOTHING \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(channel_kind)
        .bind(identifier)
        .bind(if is_group { Some(GROUP_NAME_PLACEHOLDER) } else { None })
        .bind(is_group)
        .fetch_optional(db)
        .await?;

        if let Some(contact) = inserted {
            debug!(tenant = %tenant_id, identifier, "contact created");
            return Ok(contact);
        }

        sqlx::query_as::<_, Contact>(
            "SELECT * FROM contacts \
             WHERE tenant_id = $1 AND channel_kind = $2 AND identifier = $3",
        )
        .bind(tenant_id)
        .bind(channel_kind)
        .bind(identifier)
        .fetch_optional(db)
        .await?
        .ok_or(AppError::NotFound)
    }

    /// Apply a wire-reported profile update (name and avatar) under the
    /// naming policy.
    pub async fn apply_profile(
        db: &Pool<Postgres>,
        contact: &Contact,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> AppResult<()> {
        let name_update = display_name
            .filter(|name| {
                should_update_name(contact.is_group, contact.display_name.as_deref(), name)
            })
            .map(|s| s.to_string());

        if name_update.is_none() && avatar_url.is_none() {
            return Ok(());
        }

        sqlx::query(
            "UPDATE contacts SET \
                 display_name = COALESCE($2, display_name), \
                 avatar_url = COALESCE($3, avatar_url), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(contact.id)
        .bind(name_update)
        .bind(avatar_url)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Fetch or create the single conversation for a (channel, contact)
    /// pair.
    pub async fn get_or_create_conversation(
        db: &Pool<Postgres>,
        channel_id: Uuid,
        contact_id: Uuid,
    ) -> AppResult<Conversation> {
        let inserted = sqlx::query_as::<_, Conversation>(
            "INSERT INTO conversations (id, channel_id, contact_id, status, unread_count) \
             VALUES ($1, $2, $3, 'open', 0) \
             ON CONFLICT (channel_id, contact_id) DO NOTHING \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(channel_id)
        .bind(contact_id)
        .fetch_optional(db)
        .await?;

        if let Some(conv) = inserted {
            return Ok(conv);
        }

        sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE channel_id = $1 AND contact_id = $2",
        )
        .bind(channel_id)
        .bind(contact_id)
        .fetch_optional(db)
        .await?
        .ok_or(AppError::NotFound)
    }

    /// Record inbound activity: reopen if closed, bump unread, advance the
    /// activity timestamp.
    pub async fn touch_inbound(
        db: &Pool<Postgres>,
        conversation_id: Uuid,
        message_at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE conversations SET \
                 status = 'open', \
                 unread_count = unread_count + 1, \
                 last_message_at = GREATEST(COALESCE(last_message_at, $2), $2), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(message_at)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Record outbound activity. Agent replies do not touch unread.
    pub async fn touch_outbound(
        db: &Pool<Postgres>,
        conversation_id: Uuid,
        message_at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE conversations SET \
                 last_message_at = GREATEST(COALESCE(last_message_at, $2), $2), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(message_at)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn reset_unread(db: &Pool<Postgres>, conversation_id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE conversations SET unread_count = 0, updated_at = NOW() WHERE id = $1")
            .bind(conversation_id)
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn set_status(
        db: &Pool<Postgres>,
        conversation_id: Uuid,
        status: ConversationStatus,
    ) -> AppResult<()> {
        sqlx::query("UPDATE conversations SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(conversation_id)
            .bind(status.as_str())
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn assign(
        db: &Pool<Postgres>,
        conversation_id: Uuid,
        assignee_id: Option<Uuid>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE conversations SET assignee_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(conversation_id)
            .bind(assignee_id)
            .execute(db)
            .await?;
        Ok(())
    }
}
