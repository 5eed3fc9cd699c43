//! In-process protocol connector.
//!
//! Deterministic loopback implementation of [`ProtocolConnector`]: sends are
//! recorded instead of hitting the wire, and inbound traffic is injected by
//! the caller. Used by local runs without a real connector build and by the
//! integration tests. A production connector plugs in behind the same trait.

use super::{
    Credentials, DisconnectReason, GroupMetadata, MediaPayload, ProtocolConnector, ProtocolError,
    ProtocolEvent, ProtocolHandle, ProtocolSession,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SentRecord {
    pub channel_id: Uuid,
    pub to: String,
    pub kind: String,
    pub body: String,
    pub external_id: String,
}

#[derive(Default)]
struct Inner {
    /// Events queued before `connect` is called, drained into the session.
    scripts: HashMap<Uuid, Vec<ProtocolEvent>>,
    /// Live event senders, for injecting events after connect.
    senders: HashMap<Uuid, mpsc::UnboundedSender<ProtocolEvent>>,
    sent: Vec<SentRecord>,
    groups: Vec<GroupMetadata>,
}

pub struct MemoryConnector {
    inner: Arc<Mutex<Inner>>,
    /// When set, every send fails; lets callers exercise failure paths.
    fail_sends: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Queue events to be emitted as soon as `connect` runs for `channel_id`.
    pub async fn script_events(&self, channel_id: Uuid, events: Vec<ProtocolEvent>) {
        let mut inner = self.inner.lock().await;
        inner.scripts.entry(channel_id).or_default().extend(events);
    }

    /// Inject an event into a live session. Returns false if the session is
    /// gone (receiver dropped or never connected).
    pub async fn inject(&self, channel_id: Uuid, event: ProtocolEvent) -> bool {
        let inner = self.inner.lock().await;
        match inner.senders.get(&channel_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub async fn sent_messages(&self) -> Vec<SentRecord> {
        self.inner.lock().await.sent.clone()
    }

    pub async fn set_groups(&self, groups: Vec<GroupMetadata>) {
        self.inner.lock().await.groups = groups;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProtocolConnector for MemoryConnector {
    async fn connect(
        &self,
        channel_id: Uuid,
        creds: Credentials,
    ) -> Result<ProtocolSession, ProtocolError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock().await;
        let scripted = inner.scripts.remove(&channel_id);
        match scripted {
            Some(events) => {
                for event in events {
                    let _ = tx.send(event);
                }
            }
            None if creds.is_registered() => {
                // Resuming a registered session: open immediately.
                let _ = tx.send(ProtocolEvent::ConnectionOpen {
                    phone_number: creds.phone_number.clone().unwrap_or_default(),
                });
            }
            None => {
                // Fresh credentials start the pairing flow.
                let _ = tx.send(ProtocolEvent::Qr(format!("qr:{channel_id}")));
            }
        }
        inner.senders.insert(channel_id, tx.clone());
        drop(inner);

        debug!(%channel_id, "memory connector session opened");

        let handle = Arc::new(MemoryHandle {
            channel_id,
            events: tx,
            inner: self.inner.clone(),
            fail_sends: self.fail_sends.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        });

        Ok(ProtocolSession { handle, events: rx })
    }
}

struct MemoryHandle {
    channel_id: Uuid,
    events: mpsc::UnboundedSender<ProtocolEvent>,
    inner: Arc<Mutex<Inner>>,
    fail_sends: bool,
    closed: AtomicBool,
}

impl MemoryHandle {
    async fn record(&self, to: &str, kind: &str, body: String) -> Result<String, ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        if self.fail_sends {
            return Err(ProtocolError::Send("simulated send failure".into()));
        }
        let external_id = format!("mem-{}", Uuid::new_v4());
        let mut inner = self.inner.lock().await;
        inner.sent.push(SentRecord {
            channel_id: self.channel_id,
            to: to.to_string(),
            kind: kind.to_string(),
            body,
            external_id: external_id.clone(),
        });
        Ok(external_id)
    }
}

#[async_trait]
impl ProtocolHandle for MemoryHandle {
    async fn send_text(&self, to: &str, body: &str) -> Result<String, ProtocolError> {
        self.record(to, "text", body.to_string()).await
    }

    async fn send_media(&self, to: &str, media: MediaPayload) -> Result<String, ProtocolError> {
        let kind = format!("{:?}", media.kind).to_lowercase();
        self.record(to, &kind, media.url).await
    }

    async fn send_reaction(
        &self,
        to: &str,
        external_id: &str,
        emoji: &str,
    ) -> Result<String, ProtocolError> {
        self.record(to, "reaction", format!("{external_id}:{emoji}")).await
    }

    async fn mark_read(&self, _to: &str, _external_ids: &[String]) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        Ok(())
    }

    async fn fetch_profile_picture(&self, id: &str) -> Result<Option<String>, ProtocolError> {
        Ok(Some(format!("https://avatars.invalid/{id}.jpg")))
    }

    async fn fetch_group_metadata(&self, group_id: &str) -> Result<GroupMetadata, ProtocolError> {
        let inner = self.inner.lock().await;
        inner
            .groups
            .iter()
            .find(|g| g.group_id == group_id)
            .cloned()
            .ok_or_else(|| ProtocolError::Send(format!("unknown group {group_id}")))
    }

    async fn list_groups(&self) -> Result<Vec<GroupMetadata>, ProtocolError> {
        Ok(self.inner.lock().await.groups.clone())
    }

    async fn request_pairing_code(&self, phone: &str) -> Result<String, ProtocolError> {
        // Last four characters, not bytes; phones can carry non-ASCII digits.
        let skip = phone.chars().count().saturating_sub(4);
        let tail: String = phone.chars().skip(skip).collect();
        let code = format!("PAIR-{tail}");
        let _ = self.events.send(ProtocolEvent::PairingCode(code.clone()));
        Ok(code)
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        let _ = self
            .events
            .send(ProtocolEvent::ConnectionClose(DisconnectReason::LoggedOut));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        inner.senders.remove(&self.channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_credentials_start_pairing() {
        let connector = MemoryConnector::new();
        let channel_id = Uuid::new_v4();
        let mut session = connector
            .connect(channel_id, Credentials::fresh())
            .await
            .unwrap();
        match session.events.recv().await {
            Some(ProtocolEvent::Qr(_)) => {}
            other => panic!("expected QR event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn registered_credentials_resume() {
        let connector = MemoryConnector::new();
        let channel_id = Uuid::new_v4();
        let creds = Credentials {
            device_id: Some("dev-1".into()),
            phone_number: Some("60123456789".into()),
            identity: serde_json::json!({"noise": "abc"}),
        };
        let mut session = connector.connect(channel_id, creds).await.unwrap();
        match session.events.recv().await {
            Some(ProtocolEvent::ConnectionOpen { phone_number }) => {
                assert_eq!(phone_number, "60123456789");
            }
            other => panic!("expected open event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sends_are_recorded_and_close_stops_them() {
        let connector = MemoryConnector::new();
        let channel_id = Uuid::new_v4();
        let session = connector
            .connect(channel_id, Credentials::fresh())
            .await
            .unwrap();

        let id = session.handle.send_text("60111", "hello").await.unwrap();
        assert!(id.starts_with("mem-"));
        assert_eq!(connector.sent_messages().await.len(), 1);

        session.handle.close().await;
        assert!(matches!(
            session.handle.send_text("60111", "again").await,
            Err(ProtocolError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn pairing_codes_respect_character_boundaries() {
        let connector = MemoryConnector::new();
        let session = connector
            .connect(Uuid::new_v4(), Credentials::fresh())
            .await
            .unwrap();

        let code = session.handle.request_pairing_code("60123456789").await.unwrap();
        assert_eq!(code, "PAIR-6789");

        // Fullwidth digits are three bytes each; a byte-indexed tail
        // would split a character here.
        let code = session.handle.request_pairing_code("０１２３４").await.unwrap();
        assert_eq!(code, "PAIR-１２３４");

        let code = session.handle.request_pairing_code("12").await.unwrap();
        assert_eq!(code, "PAIR-12");
    }
}
