//! Redis pub/sub command bridge.
//!
//! The inbox backend and admin tooling never call this service directly;
//! they publish commands on a shared topic and await the per-correlation
//! response topic. Each command is handled on its own task so a slow send
//! cannot block unrelated channels.

pub mod commands;

use crate::error::{AppError, AppResult};
use crate::models::{Conversation, ConversationStatus};
use crate::services::contact_service::ContactService;
use crate::services::fanout::ChannelEvent;
use crate::state::AppState;
use commands::{Command, CommandEnvelope, CommandResponse, COMMAND_TOPIC};
use futures_util::StreamExt;
use redis::AsyncCommands;
use sqlx::Row;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

pub struct CommandBus {
    state: AppState,
}

impl CommandBus {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Subscribe and dispatch until shutdown. The subscription uses its own
    /// dedicated connection; pub/sub and regular commands cannot share one.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let client = redis::Client::open(self.state.config.redis_url.as_str())?;
        let conn = client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(COMMAND_TOPIC).await?;
        info!(topic = COMMAND_TOPIC, "command bus listening");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("command bus stopping");
                        return Ok(());
                    }
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Err(AppError::Redis(redis::RedisError::from((
                            redis::ErrorKind::IoError,
                            "command subscription closed",
                        ))));
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "unreadable command payload dropped");
                            continue;
                        }
                    };
                    let envelope: CommandEnvelope = match serde_json::from_str(&payload) {
                        Ok(env) => env,
                        Err(e) => {
                            warn!(error = %e, "malformed command dropped");
                            continue;
                        }
                    };

                    let handler = Handler {
                        state: self.state.clone(),
                    };
                    tokio::spawn(async move { handler.dispatch(envelope).await });
                }
            }
        }
    }
}

struct Handler {
    state: AppState,
}

impl Handler {
    async fn dispatch(self, envelope: CommandEnvelope) {
        let correlation_id = envelope.correlation_id.clone();
        let channel_id = envelope.command.channel_id();

        let response = match self.execute(envelope.command).await {
            Ok(result) => CommandResponse::success(&correlation_id, result),
            Err(e) => {
                warn!(%channel_id, correlation = %correlation_id, error = %e, "command failed");
                CommandResponse::failure(&correlation_id, e.to_string())
            }
        };

        let payload = match serde_json::to_string(&response) {
            Ok(p) => p,
            Err(e) => {
                warn!(correlation = %correlation_id, error = %e, "response serialize failed");
                return;
            }
        };
        let mut conn = self.state.redis.connection().await;
        if let Err(e) = conn
            .publish::<_, _, ()>(commands::response_topic(&correlation_id), payload)
            .await
        {
            warn!(correlation = %correlation_id, error = %e, "response publish failed");
        }
    }

    async fn execute(&self, command: Command) -> AppResult<serde_json::Value> {
        match command {
            Command::StartSession { channel_id } => {
                self.state.supervisor.start_session(channel_id).await?;
                Ok(serde_json::json!({ "started": true }))
            }
            Command::StopSession { channel_id } => {
                self.state.supervisor.stop_session(channel_id).await?;
                Ok(serde_json::json!({ "stopped": true }))
            }
            Command::TakeoverSession { channel_id } => {
                self.state.supervisor.takeover_session(channel_id).await?;
                Ok(serde_json::json!({ "taken_over": true }))
            }
            Command::Logout { channel_id } => {
                self.state.supervisor.logout(channel_id).await?;
                Ok(serde_json::json!({ "logout_requested": true }))
            }
            Command::RequestPairingCode { channel_id, phone } => {
                let code = self
                    .state
                    .supervisor
                    .request_pairing_code(channel_id, &phone)
                    .await?;
                Ok(serde_json::json!({ "pairing_code": code }))
            }
            Command::SendText {
                channel_id,
                to,
                body,
            } => {
                let external_id = self.state.supervisor.send_text(channel_id, &to, &body).await?;
                Ok(serde_json::json!({ "external_id": external_id }))
            }
            Command::SendMedia {
                channel_id,
                to,
                media,
            } => {
                let external_id = self.state.supervisor.send_media(channel_id, &to, media).await?;
                Ok(serde_json::json!({ "external_id": external_id }))
            }
            Command::SendReaction {
                channel_id,
                to,
                external_id,
                emoji,
            } => {
                let sent = self
                    .state
                    .supervisor
                    .send_reaction(channel_id, &to, &external_id, &emoji)
                    .await?;
                Ok(serde_json::json!({ "external_id": sent }))
            }
            Command::MarkRead {
                channel_id,
                conversation_id,
                external_ids,
            } => {
                self.state.supervisor
                    .mark_read(channel_id, conversation_id, &external_ids)
                    .await?;
                Ok(serde_json::json!({ "marked": external_ids.len() }))
            }
            Command::Reconnect { channel_id } => {
                if self.state.supervisor.is_running(channel_id).await {
                    self.state.supervisor.stop_session(channel_id).await?;
                }
                self.state.supervisor.start_session(channel_id).await?;
                Ok(serde_json::json!({ "reconnected": true }))
            }
            Command::FetchProfilePicture {
                channel_id,
                remote_id,
            } => {
                let url = self
                    .state
                    .supervisor
                    .fetch_profile_picture(channel_id, &remote_id)
                    .await?;
                Ok(serde_json::json!({ "avatar_url": url }))
            }
            Command::FetchGroupMetadata {
                channel_id,
                group_id,
            } => {
                let meta = self
                    .state
                    .supervisor
                    .fetch_group_metadata(channel_id, &group_id)
                    .await?;
                Ok(serde_json::to_value(meta)
                    .map_err(|e| AppError::Protocol(format!("serialize group metadata: {e}")))?)
            }
            Command::CloseConversation {
                channel_id,
                conversation_id,
            } => {
                ContactService::set_status(&self.state.db, conversation_id, ConversationStatus::Closed)
                    .await?;
                self.broadcast_conversation(channel_id, conversation_id).await
            }
            Command::AssignConversation {
                channel_id,
                conversation_id,
                assignee_id,
            } => {
                ContactService::assign(&self.state.db, conversation_id, assignee_id).await?;
                self.broadcast_conversation(channel_id, conversation_id).await
            }
            Command::GetStatus { channel_id } => {
                let row = sqlx::query(
                    "SELECT status, phone_number, last_connected_at FROM channels WHERE id = $1",
                )
                .bind(channel_id)
                .fetch_optional(&self.state.db)
                .await?
                .ok_or(AppError::NotFound)?;
                let status: String = row.get("status");
                let phone_number: Option<String> = row.get("phone_number");
                let last_connected_at: Option<chrono::DateTime<chrono::Utc>> =
                    row.get("last_connected_at");
                let registered = self
                    .state
                    .supervisor
                    .stored_credentials(channel_id)
                    .await
                    .map(|c| c.is_registered())
                    .unwrap_or(false);
                Ok(serde_json::json!({
                    "status": status,
                    "phone_number": phone_number,
                    "last_connected_at": last_connected_at,
                    "running_here": self.state.supervisor.is_running(channel_id).await,
                    "has_credentials": registered,
                }))
            }
        }
    }

    /// Re-read the conversation after a lifecycle update and fan the fresh
    /// row out to subscribers, returning it as the command result.
    async fn broadcast_conversation(
        &self,
        channel_id: Uuid,
        conversation_id: Uuid,
    ) -> AppResult<serde_json::Value> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.state.db)
        .await?
        .ok_or(AppError::NotFound)?;

        let tenant_id: Uuid = sqlx::query("SELECT tenant_id FROM channels WHERE id = $1")
            .bind(channel_id)
            .fetch_optional(&self.state.db)
            .await?
            .ok_or(AppError::NotFound)?
            .get("tenant_id");

        self.state
            .fanout
            .publish_with_assignee(
                channel_id,
                tenant_id,
                conversation.assignee_id,
                &ChannelEvent::ConversationUpdated {
                    channel_id,
                    conversation: conversation.clone(),
                },
            )
            .await;
        Ok(serde_json::to_value(conversation)
            .map_err(|e| AppError::Protocol(format!("serialize conversation: {e}")))?)
    }
}
