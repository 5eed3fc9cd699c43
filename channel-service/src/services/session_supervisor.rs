//! Per-channel session lifecycle: login, event loop, disconnect
//! classification, reconnection and outbound sends.
//!
//! Each connected channel is one spawned task consuming the session's event
//! stream. The task owns the full lifecycle: QR regeneration ceiling during
//! login, reconnect backoff on retryable disconnects, credential wipe on
//! terminal ones, and lock release when it ends for any reason.

use crate::error::{AppError, AppResult};
use crate::models::{ChannelStatus, MessageDirection};
use crate::protocol::{
    Credentials, DisconnectReason, InboundMessage, MediaPayload, ProtocolConnector, ProtocolEvent,
    ProtocolHandle, ProtocolSession,
};
use crate::services::channel_lock::ChannelLock;
use crate::services::credential_store::CredentialStore;
use crate::services::fanout::{ChannelEvent, EventFanout};
use crate::services::ingestion::{IngestSource, IngestionPipeline};
use crate::services::rate_limiter::RateLimiter;
use chrono::Utc;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Exponential backoff: `base * 2^(attempt-1)`, saturating.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16))
}

struct SessionEntry {
    tenant_id: Uuid,
    handle: Arc<dyn ProtocolHandle>,
    shutdown: watch::Sender<bool>,
}

struct Inner {
    db: Pool<Postgres>,
    store: CredentialStore,
    lock: ChannelLock,
    limiter: RateLimiter,
    ingestion: IngestionPipeline,
    fanout: EventFanout,
    connector: Arc<dyn ProtocolConnector>,
    config: crate::config::SessionConfig,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
}

#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<Inner>,
}

impl SessionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Pool<Postgres>,
        store: CredentialStore,
        lock: ChannelLock,
        limiter: RateLimiter,
        ingestion: IngestionPipeline,
        fanout: EventFanout,
        connector: Arc<dyn ProtocolConnector>,
        config: crate::config::SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                store,
                lock,
                limiter,
                ingestion,
                fanout,
                connector,
                config,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start (or resume) the session for a channel. Exactly one instance
    /// may hold a channel's connection, enforced by the distributed lock.
    pub async fn start_session(&self, channel_id: Uuid) -> AppResult<()> {
        self.start_inner(channel_id, false).await
    }

    /// Admin override: steal the channel lock from whichever instance holds
    /// it and run the session here. The previous holder's heartbeat notices
    /// the ownership loss and its session winds down.
    pub async fn takeover_session(&self, channel_id: Uuid) -> AppResult<()> {
        self.start_inner(channel_id, true).await
    }

    async fn start_inner(&self, channel_id: Uuid, force: bool) -> AppResult<()> {
        {
            let sessions = self.inner.sessions.lock().await;
            if sessions.contains_key(&channel_id) {
                info!(%channel_id, "session already running locally");
                return Ok(());
            }
        }

        let tenant_id = self.tenant_of(channel_id).await?;

        if force {
            self.inner.lock.force_acquire(&channel_id.to_string()).await?;
        } else if !self.inner.lock.acquire(&channel_id.to_string()).await? {
            return Err(AppError::ChannelLocked(channel_id));
        }

        self.set_status(channel_id, tenant_id, ChannelStatus::Connecting, None)
            .await?;

        let creds = match self.inner.store.load(channel_id).await {
            Ok(creds) => creds,
            Err(e) => {
                let _ = self.inner.lock.release(&channel_id.to_string()).await;
                return Err(e);
            }
        };

        let session = match self.inner.connector.connect(channel_id, creds).await {
            Ok(session) => session,
            Err(e) => {
                let _ = self.inner.lock.release(&channel_id.to_string()).await;
                self.set_status(
                    channel_id,
                    tenant_id,
                    ChannelStatus::Error,
                    Some(e.to_string()),
                )
                .await?;
                return Err(AppError::Protocol(e.to_string()));
            }
        };

        self.install_session(channel_id, tenant_id, session).await;
        info!(%channel_id, "session started");
        Ok(())
    }

    /// Resume every channel that was connected or mid-connect before the
    /// last shutdown. Lock contention is normal here: another instance may
    /// already own some of them.
    pub async fn resume_all(&self) {
        let rows: Vec<Uuid> = match sqlx::query_scalar(
            "SELECT id FROM channels WHERE status IN ('connected', 'connecting')",
        )
        .fetch_all(&self.inner.db)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to list resumable channels");
                return;
            }
        };

        info!(count = rows.len(), "resuming previously-connected channels");
        for channel_id in rows {
            match self.start_session(channel_id).await {
                Ok(()) => {}
                Err(AppError::ChannelLocked(_)) => {
                    info!(%channel_id, "channel held by another instance, skipping");
                }
                Err(e) => warn!(%channel_id, error = %e, "resume failed"),
            }
        }
    }

    /// Gracefully stop one session: close the handle, mark disconnected,
    /// release the lock. Credentials stay so the session can resume later.
    pub async fn stop_session(&self, channel_id: Uuid) -> AppResult<()> {
        let entry = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.remove(&channel_id)
        };
        let Some(entry) = entry else {
            return Err(AppError::NotConnected(channel_id));
        };

        let _ = entry.shutdown.send(true);
        entry.handle.close().await;
        self.set_status(
            channel_id,
            entry.tenant_id,
            ChannelStatus::Disconnected,
            Some("Stopped by operator".into()),
        )
        .await?;
        self.inner.lock.release(&channel_id.to_string()).await?;
        info!(%channel_id, "session stopped");
        Ok(())
    }

    /// Log the account out remotely. The wire confirms with a terminal
    /// `LoggedOut` disconnect, which wipes credentials through the normal
    /// event path.
    pub async fn logout(&self, channel_id: Uuid) -> AppResult<()> {
        let handle = self.handle_of(channel_id).await?;
        handle
            .logout()
            .await
            .map_err(|e| AppError::Protocol(e.to_string()))?;
        Ok(())
    }

    /// Request a phone-pairing code as an alternative to QR scanning.
    pub async fn request_pairing_code(&self, channel_id: Uuid, phone: &str) -> AppResult<String> {
        let handle = self.handle_of(channel_id).await?;
        handle
            .request_pairing_code(phone)
            .await
            .map_err(|e| AppError::Protocol(e.to_string()))
    }

    pub async fn send_text(&self, channel_id: Uuid, to: &str, body: &str) -> AppResult<String> {
        let (handle, tenant_id) = self.sendable_handle(channel_id).await?;
        let external_id = handle
            .send_text(to, body)
            .await
            .map_err(|e| AppError::SendFailed(e.to_string()))?;
        self.record_outbound(
            channel_id,
            tenant_id,
            to,
            &external_id,
            "text",
            serde_json::json!({ "body": body }),
        )
        .await?;
        Ok(external_id)
    }

    pub async fn send_media(
        &self,
        channel_id: Uuid,
        to: &str,
        media: MediaPayload,
    ) -> AppResult<String> {
        let (handle, tenant_id) = self.sendable_handle(channel_id).await?;
        let content = serde_json::to_value(&media)
            .map_err(|e| AppError::Protocol(format!("serialize media payload: {e}")))?;
        let message_type = format!("{:?}", media.kind).to_lowercase();
        let external_id = handle
            .send_media(to, media)
            .await
            .map_err(|e| AppError::SendFailed(e.to_string()))?;
        self.record_outbound(channel_id, tenant_id, to, &external_id, &message_type, content)
            .await?;
        Ok(external_id)
    }

    pub async fn send_reaction(
        &self,
        channel_id: Uuid,
        to: &str,
        target_external_id: &str,
        emoji: &str,
    ) -> AppResult<String> {
        let (handle, tenant_id) = self.sendable_handle(channel_id).await?;
        let external_id = handle
            .send_reaction(to, target_external_id, emoji)
            .await
            .map_err(|e| AppError::SendFailed(e.to_string()))?;
        self.record_outbound(
            channel_id,
            tenant_id,
            to,
            &external_id,
            "reaction",
            serde_json::json!({ "target": target_external_id, "emoji": emoji }),
        )
        .await?;
        Ok(external_id)
    }

    /// Send read receipts upstream and clear the local unread counter.
    pub async fn mark_read(
        &self,
        channel_id: Uuid,
        conversation_id: Uuid,
        external_ids: &[String],
    ) -> AppResult<()> {
        let handle = self.handle_of(channel_id).await?;
        let contact = self.inner.ingestion.conversation_contact(conversation_id).await?;
        handle
            .mark_read(&contact.identifier, external_ids)
            .await
            .map_err(|e| AppError::Protocol(e.to_string()))?;
        crate::services::contact_service::ContactService::reset_unread(
            &self.inner.db,
            conversation_id,
        )
        .await?;
        Ok(())
    }

    /// Fetch a contact's current profile picture from the wire. Persisting
    /// the avatar is best-effort; the fetch result is returned either way.
    pub async fn fetch_profile_picture(
        &self,
        channel_id: Uuid,
        remote_id: &str,
    ) -> AppResult<Option<String>> {
        let (handle, tenant_id) = {
            let sessions = self.inner.sessions.lock().await;
            let entry = sessions
                .get(&channel_id)
                .ok_or(AppError::NotConnected(channel_id))?;
            (entry.handle.clone(), entry.tenant_id)
        };
        let url = handle
            .fetch_profile_picture(remote_id)
            .await
            .map_err(|e| AppError::Protocol(e.to_string()))?;

        if let Some(url) = url.as_deref() {
            if let Err(e) = self
                .inner
                .ingestion
                .store_avatar(channel_id, tenant_id, remote_id, url)
                .await
            {
                warn!(%channel_id, remote = %remote_id, error = %e, "avatar persist failed");
            }
        }
        Ok(url)
    }

    /// Fetch live group metadata from the wire and fold it into the local
    /// contact and cache.
    pub async fn fetch_group_metadata(
        &self,
        channel_id: Uuid,
        group_id: &str,
    ) -> AppResult<crate::protocol::GroupMetadata> {
        let (handle, tenant_id) = {
            let sessions = self.inner.sessions.lock().await;
            let entry = sessions
                .get(&channel_id)
                .ok_or(AppError::NotConnected(channel_id))?;
            (entry.handle.clone(), entry.tenant_id)
        };
        let meta = handle
            .fetch_group_metadata(group_id)
            .await
            .map_err(|e| AppError::Protocol(e.to_string()))?;
        if let Err(e) = self
            .inner
            .ingestion
            .apply_group_metadata(channel_id, tenant_id, &meta)
            .await
        {
            warn!(%channel_id, group = %group_id, error = %e, "group metadata persist failed");
        }
        Ok(meta)
    }

    /// Stop every local session and release all locks. Called at shutdown.
    pub async fn shutdown_all(&self) {
        let entries: Vec<(Uuid, SessionEntry)> = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.drain().collect()
        };
        for (channel_id, entry) in entries {
            let _ = entry.shutdown.send(true);
            entry.handle.close().await;
            if let Err(e) = self
                .set_status(
                    channel_id,
                    entry.tenant_id,
                    ChannelStatus::Disconnected,
                    Some("Service shutting down".into()),
                )
                .await
            {
                warn!(%channel_id, error = %e, "failed to persist shutdown status");
            }
        }
        self.inner.lock.release_all().await;
        info!("all sessions shut down");
    }

    pub async fn is_running(&self, channel_id: Uuid) -> bool {
        self.inner.sessions.lock().await.contains_key(&channel_id)
    }

    async fn sendable_handle(
        &self,
        channel_id: Uuid,
    ) -> AppResult<(Arc<dyn ProtocolHandle>, Uuid)> {
        let (handle, tenant_id) = {
            let sessions = self.inner.sessions.lock().await;
            let entry = sessions
                .get(&channel_id)
                .ok_or(AppError::NotConnected(channel_id))?;
            (entry.handle.clone(), entry.tenant_id)
        };
        if let Some(window) = self.inner.limiter.check(channel_id).await {
            let limit = match window {
                crate::services::rate_limiter::LimitWindow::Minute => {
                    self.inner.limiter.per_minute()
                }
                crate::services::rate_limiter::LimitWindow::Hour => self.inner.limiter.per_hour(),
            };
            return Err(AppError::RateLimited(channel_id, window.describe(limit)));
        }
        Ok((handle, tenant_id))
    }

    async fn handle_of(&self, channel_id: Uuid) -> AppResult<Arc<dyn ProtocolHandle>> {
        let sessions = self.inner.sessions.lock().await;
        sessions
            .get(&channel_id)
            .map(|e| e.handle.clone())
            .ok_or(AppError::NotConnected(channel_id))
    }

    async fn record_outbound(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        to: &str,
        external_id: &str,
        message_type: &str,
        content: serde_json::Value,
    ) -> AppResult<()> {
        let msg = InboundMessage {
            external_id: external_id.to_string(),
            remote_id: to.to_string(),
            push_name: None,
            message_type: message_type.to_string(),
            content,
            timestamp: Utc::now(),
        };
        self.inner
            .ingestion
            .ingest_message(
                channel_id,
                tenant_id,
                &msg,
                MessageDirection::Outbound,
                IngestSource::Live,
            )
            .await?;
        Ok(())
    }

    async fn tenant_of(&self, channel_id: Uuid) -> AppResult<Uuid> {
        sqlx::query_scalar("SELECT tenant_id FROM channels WHERE id = $1")
            .bind(channel_id)
            .fetch_optional(&self.inner.db)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn set_status(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        status: ChannelStatus,
        reason: Option<String>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE channels SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(channel_id)
            .bind(status.as_str())
            .execute(&self.inner.db)
            .await?;
        self.inner
            .fanout
            .publish(
                channel_id,
                tenant_id,
                &ChannelEvent::StatusChanged {
                    channel_id,
                    status: status.as_str().to_string(),
                    reason,
                },
            )
            .await;
        Ok(())
    }

    async fn mark_connected(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        phone_number: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE channels SET status = 'connected', phone_number = $2, \
             last_connected_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(channel_id)
        .bind(phone_number)
        .execute(&self.inner.db)
        .await?;
        self.inner
            .fanout
            .publish(
                channel_id,
                tenant_id,
                &ChannelEvent::StatusChanged {
                    channel_id,
                    status: ChannelStatus::Connected.as_str().to_string(),
                    reason: None,
                },
            )
            .await;
        Ok(())
    }

    async fn install_session(&self, channel_id: Uuid, tenant_id: Uuid, session: ProtocolSession) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.insert(
                channel_id,
                SessionEntry {
                    tenant_id,
                    handle: session.handle.clone(),
                    shutdown: shutdown_tx,
                },
            );
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor
                .run_event_loop(channel_id, tenant_id, session, shutdown_rx)
                .await;
        });
    }

    /// Drive one channel's session until a terminal disconnect, retry
    /// exhaustion or shutdown. The loop re-enters after a successful
    /// reconnect with the fresh event stream.
    async fn run_event_loop(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        mut session: ProtocolSession,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut qr_generation: u32 = 0;
        let mut reconnect_attempt: u32 = 0;

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                event = session.events.recv() => event,
            };

            // A dropped stream without a close event is a connector crash,
            // handled like any retryable disconnect.
            let event = match event {
                Some(event) => event,
                None => ProtocolEvent::ConnectionClose(DisconnectReason::Other(
                    "event stream ended".into(),
                )),
            };

            match event {
                ProtocolEvent::Qr(qr) => {
                    qr_generation += 1;
                    if qr_generation > self.inner.config.max_qr_regenerations {
                        warn!(%channel_id, "QR regeneration ceiling reached, abandoning login");
                        session.handle.close().await;
                        self.teardown(
                            channel_id,
                            tenant_id,
                            ChannelStatus::Disconnected,
                            Some("QR code expired. Start the connection again to retry.".into()),
                        )
                        .await;
                        return;
                    }
                    self.inner
                        .fanout
                        .publish(
                            channel_id,
                            tenant_id,
                            &ChannelEvent::QrCode {
                                channel_id,
                                qr,
                                generation: qr_generation,
                            },
                        )
                        .await;
                }
                ProtocolEvent::PairingCode(code) => {
                    self.inner
                        .fanout
                        .publish(
                            channel_id,
                            tenant_id,
                            &ChannelEvent::PairingCode { channel_id, code },
                        )
                        .await;
                }
                ProtocolEvent::ConnectionOpen { phone_number } => {
                    qr_generation = 0;
                    reconnect_attempt = 0;
                    if let Err(e) = self.mark_connected(channel_id, tenant_id, &phone_number).await
                    {
                        error!(%channel_id, error = %e, "failed to persist connected status");
                    }
                    self.spawn_group_roster_sync(channel_id, tenant_id, session.handle.clone());
                    info!(%channel_id, phone = %phone_number, "channel connected");
                }
                ProtocolEvent::CredentialsRotated(creds) => {
                    if let Err(e) = self.inner.store.save(channel_id, &creds).await {
                        error!(%channel_id, error = %e, "failed to persist rotated credentials");
                    }
                }
                ProtocolEvent::SyncKeysRotated(updates) => {
                    if let Err(e) = self.inner.store.set_keys(channel_id, &updates).await {
                        error!(%channel_id, error = %e, "failed to persist sync keys");
                    }
                }
                ProtocolEvent::MessageReceived(msg) => {
                    if let Err(e) = self
                        .inner
                        .ingestion
                        .ingest_message(
                            channel_id,
                            tenant_id,
                            &msg,
                            MessageDirection::Inbound,
                            IngestSource::Live,
                        )
                        .await
                    {
                        error!(%channel_id, external_id = %msg.external_id, error = %e,
                            "failed to ingest message");
                    }
                }
                ProtocolEvent::MessageStatusUpdated {
                    external_id,
                    status,
                } => {
                    if let Err(e) = self
                        .inner
                        .ingestion
                        .apply_status_update(channel_id, tenant_id, &external_id, status)
                        .await
                    {
                        warn!(%channel_id, external_id, error = %e, "status update failed");
                    }
                }
                ProtocolEvent::ContactsChanged(contacts) => {
                    if let Err(e) = self
                        .inner
                        .ingestion
                        .apply_contact_sync(channel_id, tenant_id, &contacts)
                        .await
                    {
                        warn!(%channel_id, error = %e, "contact sync failed");
                    }
                }
                ProtocolEvent::AliasDiscovered { alias, canonical } => {
                    if let Err(e) = crate::services::identity::IdentityService::store_alias_mapping(
                        &self.inner.db,
                        channel_id,
                        &alias,
                        &canonical,
                    )
                    .await
                    {
                        warn!(%channel_id, alias, canonical, error = %e, "alias mapping failed");
                    }
                }
                ProtocolEvent::GroupMetadataChanged(meta) => {
                    if let Err(e) = self
                        .inner
                        .ingestion
                        .apply_group_metadata(channel_id, tenant_id, &meta)
                        .await
                    {
                        warn!(%channel_id, error = %e, "group metadata update failed");
                    }
                }
                ProtocolEvent::HistorySync(messages) => {
                    if let Err(e) = self
                        .inner
                        .ingestion
                        .enqueue_history(channel_id, tenant_id, messages)
                        .await
                    {
                        warn!(%channel_id, error = %e, "history enqueue failed");
                    }
                }
                ProtocolEvent::ConnectionClose(reason) => {
                    session.handle.close().await;

                    if reason.is_terminal() {
                        if reason.should_wipe_credentials() {
                            if let Err(e) = self.inner.store.delete(channel_id).await {
                                error!(%channel_id, error = %e, "failed to wipe credentials");
                            }
                        }
                        info!(%channel_id, ?reason, "terminal disconnect");
                        self.teardown(
                            channel_id,
                            tenant_id,
                            ChannelStatus::Disconnected,
                            Some(reason.human_reason()),
                        )
                        .await;
                        return;
                    }

                    reconnect_attempt += 1;
                    if reconnect_attempt > self.inner.config.max_reconnect_attempts {
                        warn!(%channel_id, attempts = reconnect_attempt - 1,
                            "reconnect attempts exhausted");
                        self.teardown(
                            channel_id,
                            tenant_id,
                            ChannelStatus::Error,
                            Some(reason.human_reason()),
                        )
                        .await;
                        return;
                    }

                    let delay =
                        backoff_delay(self.inner.config.reconnect_base_delay, reconnect_attempt);
                    info!(%channel_id, attempt = reconnect_attempt, ?delay, "reconnecting");
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    match self.reconnect(channel_id, tenant_id).await {
                        Ok(new_session) => {
                            session = new_session;
                            tokio::time::sleep(self.inner.config.reconnect_settle_delay).await;
                        }
                        Err(e) => {
                            warn!(%channel_id, error = %e, "reconnect failed");
                            // Feed the failure back through the close path on
                            // the next iteration by synthesizing a dead stream.
                            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
                            session.events = rx;
                        }
                    }
                }
            }
        }
    }

    async fn reconnect(&self, channel_id: Uuid, tenant_id: Uuid) -> AppResult<ProtocolSession> {
        self.set_status(channel_id, tenant_id, ChannelStatus::Connecting, None)
            .await?;
        let creds = self.inner.store.load(channel_id).await?;
        let session = self
            .inner
            .connector
            .connect(channel_id, creds)
            .await
            .map_err(|e| AppError::Protocol(e.to_string()))?;

        let mut sessions = self.inner.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(&channel_id) {
            entry.handle = session.handle.clone();
        }
        Ok(session)
    }

    /// Refresh the group roster in the background after a connect; send
    /// paths must not wait on it.
    fn spawn_group_roster_sync(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        handle: Arc<dyn ProtocolHandle>,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let groups = match handle.list_groups().await {
                Ok(groups) => groups,
                Err(e) => {
                    warn!(%channel_id, error = %e, "group roster fetch failed");
                    return;
                }
            };
            for meta in &groups {
                if let Err(e) = supervisor
                    .inner
                    .ingestion
                    .apply_group_metadata(channel_id, tenant_id, meta)
                    .await
                {
                    warn!(%channel_id, group = %meta.group_id, error = %e,
                        "group roster entry failed");
                }
            }
            info!(%channel_id, count = groups.len(), "group roster synced");
        });
    }

    /// Common end-of-life path: drop the registry entry, persist the final
    /// status, release the lock.
    async fn teardown(
        &self,
        channel_id: Uuid,
        tenant_id: Uuid,
        status: ChannelStatus,
        reason: Option<String>,
    ) {
        {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.remove(&channel_id);
        }
        if let Err(e) = self.set_status(channel_id, tenant_id, status, reason).await {
            error!(%channel_id, error = %e, "failed to persist final channel status");
        }
        if let Err(e) = self.inner.lock.release(&channel_id.to_string()).await {
            warn!(%channel_id, error = %e, "failed to release channel lock");
        }
    }

    /// Fetch stored credentials without opening a session. Used by the
    /// command bridge to report whether a channel can resume silently.
    pub async fn stored_credentials(&self, channel_id: Uuid) -> AppResult<Credentials> {
        self.inner.store.load(channel_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 5), Duration::from_secs(32));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let base = Duration::from_secs(2);
        let huge = backoff_delay(base, 100);
        assert!(huge >= backoff_delay(base, 17));
    }
}
