//! The opaque protocol capability the supervisor orchestrates.
//!
//! The wire protocol itself lives behind [`ProtocolConnector`] /
//! [`ProtocolHandle`]; this service only consumes "send text/media/reaction",
//! "receive message/status/contact events" and the QR/pairing login flow.
//! Events arrive as one typed enum through a single mpsc receiver per
//! session, so per-channel ordering is exactly channel emission order.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::MessageStatus;

/// Long-lived identity material required to re-establish a connection
/// without re-authenticating. Opaque to everything but the protocol layer;
/// this service only serializes, encrypts and persists it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub device_id: Option<String>,
    pub phone_number: Option<String>,
    pub identity: serde_json::Value,
}

impl Credentials {
    /// Synthesize fresh empty credentials for a first connection attempt.
    pub fn fresh() -> Self {
        Self {
            device_id: None,
            phone_number: None,
            identity: serde_json::json!({}),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.device_id.is_some()
    }
}

/// Kinds of short-lived keyed secrets rotated by the protocol layer.
///
/// A closed enum instead of free-form `"<type>-<id>"` strings, so a kind/id
/// mismatch is a compile error rather than a silent cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyKind {
    PreKey,
    Session,
    SenderKey,
    AppStateSyncKey,
    AppStateSyncVersion,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::PreKey => "pre-key",
            KeyKind::Session => "session",
            KeyKind::SenderKey => "sender-key",
            KeyKind::AppStateSyncKey => "app-state-sync-key",
            KeyKind::AppStateSyncVersion => "app-state-sync-version",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pre-key" => Some(KeyKind::PreKey),
            "session" => Some(KeyKind::Session),
            "sender-key" => Some(KeyKind::SenderKey),
            "app-state-sync-key" => Some(KeyKind::AppStateSyncKey),
            "app-state-sync-version" => Some(KeyKind::AppStateSyncVersion),
            _ => None,
        }
    }
}

/// One rotated sync key. `value: None` means the key was invalidated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncKeyUpdate {
    pub kind: KeyKind,
    pub key_id: String,
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Protocol-level message id, the idempotency anchor.
    pub external_id: String,
    /// Raw wire identifier of the counterparty (not yet normalized).
    pub remote_id: String,
    /// Push name advertised by the sender, if any.
    pub push_name: Option<String>,
    pub message_type: String,
    pub content: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSync {
    pub remote_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub group_id: String,
    pub subject: String,
    pub participants: Vec<String>,
}

/// Why the wire connection closed, as reported by the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Explicit logout from the paired device.
    LoggedOut,
    /// Session material is corrupted and cannot be resumed.
    BadSession,
    /// The credential set was registered by a different device.
    MultideviceMismatch,
    /// Another live session took over this credential set.
    ConnectionReplaced,
    /// Anything else: network failure, server restart, stream error.
    Other(String),
}

impl DisconnectReason {
    /// Terminal reasons are never retried.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DisconnectReason::Other(_))
    }

    /// Whether the stored credentials are unusable and must be wiped.
    /// A superseded session keeps its credentials; the other device owns
    /// them now and wiping would log that device out too.
    pub fn should_wipe_credentials(&self) -> bool {
        matches!(self, DisconnectReason::LoggedOut | DisconnectReason::BadSession)
    }

    /// Plain-language reason for UI display.
    pub fn human_reason(&self) -> String {
        match self {
            DisconnectReason::LoggedOut => "Logged out from the paired device. Scan the QR code to reconnect.".into(),
            DisconnectReason::BadSession => "Session is corrupted. Scan the QR code to reconnect.".into(),
            DisconnectReason::MultideviceMismatch => "This account was registered on another device.".into(),
            DisconnectReason::ConnectionReplaced => "Connection was replaced by another session.".into(),
            DisconnectReason::Other(detail) => format!("Connection lost: {detail}"),
        }
    }
}

/// Everything the connection handle can emit, in wire order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolEvent {
    Qr(String),
    PairingCode(String),
    ConnectionOpen { phone_number: String },
    ConnectionClose(DisconnectReason),
    CredentialsRotated(Credentials),
    SyncKeysRotated(Vec<SyncKeyUpdate>),
    MessageReceived(InboundMessage),
    MessageStatusUpdated { external_id: String, status: MessageStatus },
    ContactsChanged(Vec<ContactSync>),
    /// The wire revealed that two identifiers address the same account,
    /// typically a linkable id resolving to its phone-number identity.
    AliasDiscovered { alias: String, canonical: String },
    GroupMetadataChanged(GroupMetadata),
    HistorySync(Vec<InboundMessage>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    VoiceNote,
    Document,
    Sticker,
    Gif,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    pub kind: MediaKind,
    pub url: String,
    pub mime_type: String,
    pub caption: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("not connected")]
    NotConnected,
    #[error("timed out")]
    Timeout,
    #[error("send failed: {0}")]
    Send(String),
    #[error("io error: {0}")]
    Io(String),
}

/// A live connection: the handle plus the single-consumer event stream.
pub struct ProtocolSession {
    pub handle: std::sync::Arc<dyn ProtocolHandle>,
    pub events: mpsc::UnboundedReceiver<ProtocolEvent>,
}

#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    /// Open a connection for `channel_id` using `creds`. Fresh credentials
    /// start the QR/pairing flow; registered credentials resume the session.
    async fn connect(
        &self,
        channel_id: Uuid,
        creds: Credentials,
    ) -> Result<ProtocolSession, ProtocolError>;
}

#[async_trait]
pub trait ProtocolHandle: Send + Sync {
    /// Returns the protocol-level message id of the sent message.
    async fn send_text(&self, to: &str, body: &str) -> Result<String, ProtocolError>;
    async fn send_media(&self, to: &str, media: MediaPayload) -> Result<String, ProtocolError>;
    async fn send_reaction(
        &self,
        to: &str,
        external_id: &str,
        emoji: &str,
    ) -> Result<String, ProtocolError>;
    async fn mark_read(&self, to: &str, external_ids: &[String]) -> Result<(), ProtocolError>;
    async fn fetch_profile_picture(&self, id: &str) -> Result<Option<String>, ProtocolError>;
    async fn fetch_group_metadata(&self, group_id: &str) -> Result<GroupMetadata, ProtocolError>;
    /// All groups this account participates in; used by the background
    /// roster sync after a connection opens.
    async fn list_groups(&self) -> Result<Vec<GroupMetadata>, ProtocolError>;
    async fn request_pairing_code(&self, phone: &str) -> Result<String, ProtocolError>;
    async fn logout(&self) -> Result<(), ProtocolError>;
    /// Close the underlying handle. Best-effort and idempotent.
    async fn close(&self);
}
