//! Session lifecycle end to end: the supervisor driving the loopback
//! connector against live Postgres and Redis.

mod common;

use channel_service::config::{RateLimitConfig, SessionConfig};
use channel_service::error::AppError;
use channel_service::protocol::memory::MemoryConnector;
use channel_service::protocol::{
    Credentials, DisconnectReason, InboundMessage, ProtocolEvent,
};
use channel_service::services::{
    channel_lock::ChannelLock, credential_store::CredentialStore, fanout::EventFanout,
    identity::IdentityService, ingestion::IngestionPipeline, rate_limiter::RateLimiter,
    session_supervisor::SessionSupervisor,
};
use chrono::Utc;
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const MASTER_KEY: [u8; 32] = [9u8; 32];

struct Harness {
    db: Pool<Postgres>,
    store: CredentialStore,
    connector: Arc<MemoryConnector>,
    supervisor: SessionSupervisor,
}

async fn harness() -> Harness {
    let db = common::test_pool().await;
    let redis = common::test_redis().await;

    let store = CredentialStore::new(
        db.clone(),
        redis.clone(),
        MASTER_KEY,
        Duration::from_secs(60),
    );
    let lock = ChannelLock::new(
        redis.clone(),
        Duration::from_secs(10),
        Duration::from_millis(50),
    );
    let limiter = RateLimiter::new(
        redis.clone(),
        RateLimitConfig {
            per_minute: 1000,
            per_hour: 10000,
        },
    );
    let fanout = EventFanout::new(redis.clone());
    let ingestion = IngestionPipeline::new(db.clone(), redis.clone(), fanout.clone(), 50);
    let connector = MemoryConnector::new();

    let supervisor = SessionSupervisor::new(
        db.clone(),
        store.clone(),
        lock,
        limiter,
        ingestion,
        fanout,
        connector.clone(),
        SessionConfig {
            reconnect_base_delay: Duration::from_millis(10),
            max_reconnect_attempts: 2,
            max_qr_regenerations: 3,
            reconnect_settle_delay: Duration::from_millis(1),
        },
    );

    Harness {
        db,
        store,
        connector,
        supervisor,
    }
}

async fn channel_status(db: &Pool<Postgres>, channel_id: Uuid) -> String {
    sqlx::query_scalar("SELECT status FROM channels WHERE id = $1")
        .bind(channel_id)
        .fetch_one(db)
        .await
        .unwrap()
}

fn settle() -> tokio::time::Sleep {
    tokio::time::sleep(Duration::from_millis(300))
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn connection_open_marks_the_channel_connected() {
    let h = harness().await;
    let (channel_id, tenant_id) = common::seed_channel(&h.db).await;

    h.connector
        .script_events(
            channel_id,
            vec![ProtocolEvent::ConnectionOpen {
                phone_number: "60123456789".into(),
            }],
        )
        .await;

    h.supervisor.start_session(channel_id).await.unwrap();
    settle().await;

    assert_eq!(channel_status(&h.db, channel_id).await, "connected");
    let phone: Option<String> =
        sqlx::query_scalar("SELECT phone_number FROM channels WHERE id = $1")
            .bind(channel_id)
            .fetch_one(&h.db)
            .await
            .unwrap();
    assert_eq!(phone.as_deref(), Some("60123456789"));
    assert!(h.supervisor.is_running(channel_id).await);

    h.supervisor.stop_session(channel_id).await.unwrap();
    settle().await;
    assert_eq!(channel_status(&h.db, channel_id).await, "disconnected");
    assert!(!h.supervisor.is_running(channel_id).await);

    common::cleanup_channel(&h.db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn injected_messages_flow_into_the_inbox() {
    let h = harness().await;
    let (channel_id, tenant_id) = common::seed_channel(&h.db).await;

    h.connector
        .script_events(
            channel_id,
            vec![ProtocolEvent::ConnectionOpen {
                phone_number: "60123456789".into(),
            }],
        )
        .await;
    h.supervisor.start_session(channel_id).await.unwrap();
    settle().await;

    let delivered = h
        .connector
        .inject(
            channel_id,
            ProtocolEvent::MessageReceived(InboundMessage {
                external_id: "wire-flow-1".into(),
                remote_id: "60125551234@s.whatsapp.net".into(),
                push_name: Some("Customer".into()),
                message_type: "text".into(),
                content: serde_json::json!({ "body": "I need help" }),
                timestamp: Utc::now(),
            }),
        )
        .await;
    assert!(delivered);
    settle().await;

    let (count, unread): (i64, i32) = sqlx::query_as(
        "SELECT COUNT(m.id), MAX(v.unread_count)::int \
         FROM messages m JOIN conversations v ON v.id = m.conversation_id \
         WHERE m.channel_id = $1",
    )
    .bind(channel_id)
    .fetch_one(&h.db)
    .await
    .unwrap();
    assert_eq!(count, 1);
    assert_eq!(unread, 1);

    h.supervisor.stop_session(channel_id).await.unwrap();
    common::cleanup_channel(&h.db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn send_text_persists_an_outbound_message() {
    let h = harness().await;
    let (channel_id, tenant_id) = common::seed_channel(&h.db).await;

    h.connector
        .script_events(
            channel_id,
            vec![ProtocolEvent::ConnectionOpen {
                phone_number: "60123456789".into(),
            }],
        )
        .await;
    h.supervisor.start_session(channel_id).await.unwrap();
    settle().await;

    let external_id = h
        .supervisor
        .send_text(channel_id, "60127779999", "Thanks for reaching out")
        .await
        .unwrap();
    assert!(external_id.starts_with("mem-"));

    let sent = h.connector.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "60127779999");

    let (direction, unread): (String, i32) = sqlx::query_as(
        "SELECT m.direction, v.unread_count \
         FROM messages m JOIN conversations v ON v.id = m.conversation_id \
         WHERE m.channel_id = $1 AND m.external_id = $2",
    )
    .bind(channel_id)
    .bind(&external_id)
    .fetch_one(&h.db)
    .await
    .unwrap();
    assert_eq!(direction, "outbound");
    // Agent replies never count as unread.
    assert_eq!(unread, 0);

    h.supervisor.stop_session(channel_id).await.unwrap();
    common::cleanup_channel(&h.db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn alias_discovery_merges_the_contact_histories() {
    let h = harness().await;
    let (channel_id, tenant_id) = common::seed_channel(&h.db).await;

    h.connector
        .script_events(
            channel_id,
            vec![ProtocolEvent::ConnectionOpen {
                phone_number: "60123456789".into(),
            }],
        )
        .await;
    h.supervisor.start_session(channel_id).await.unwrap();
    settle().await;

    // The same customer writes in under their phone identity and, later,
    // under a linkable id; two contacts grow independently.
    for (external_id, remote_id) in [
        ("wire-alias-1", "60129998888@s.whatsapp.net"),
        ("wire-alias-2", "777000111@lid"),
    ] {
        h.connector
            .inject(
                channel_id,
                ProtocolEvent::MessageReceived(InboundMessage {
                    external_id: external_id.into(),
                    remote_id: remote_id.into(),
                    push_name: Some("Customer".into()),
                    message_type: "text".into(),
                    content: serde_json::json!({ "body": "hi" }),
                    timestamp: Utc::now(),
                }),
            )
            .await;
    }
    settle().await;

    let contacts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contacts WHERE tenant_id = $1")
        .bind(tenant_id)
        .fetch_one(&h.db)
        .await
        .unwrap();
    assert_eq!(contacts, 2);

    // The wire reveals the equivalence; the supervisor must fold the two
    // histories into the canonical contact.
    h.connector
        .inject(
            channel_id,
            ProtocolEvent::AliasDiscovered {
                alias: "777000111@lid".into(),
                canonical: "60129998888@s.whatsapp.net".into(),
            },
        )
        .await;
    settle().await;

    let (contacts, identifier): (i64, String) = sqlx::query_as(
        "SELECT COUNT(*), MIN(identifier) FROM contacts WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_one(&h.db)
    .await
    .unwrap();
    assert_eq!(contacts, 1);
    assert_eq!(identifier, "60129998888");

    let messages: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages m \
         JOIN conversations v ON v.id = m.conversation_id \
         JOIN contacts c ON c.id = v.contact_id \
         WHERE c.identifier = '60129998888' AND m.channel_id = $1",
    )
    .bind(channel_id)
    .fetch_one(&h.db)
    .await
    .unwrap();
    assert_eq!(messages, 2);

    // Future alias traffic resolves straight to the canonical id.
    let resolved = IdentityService::resolve(&h.db, channel_id, "777000111@lid")
        .await
        .unwrap();
    assert_eq!(resolved, "60129998888");

    h.supervisor.stop_session(channel_id).await.unwrap();
    common::cleanup_channel(&h.db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn sends_on_a_stopped_channel_are_rejected() {
    let h = harness().await;
    let (channel_id, tenant_id) = common::seed_channel(&h.db).await;

    let err = h
        .supervisor
        .send_text(channel_id, "60127779999", "hello?")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotConnected(_)));

    common::cleanup_channel(&h.db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn logout_wipes_credentials_and_disconnects() {
    let h = harness().await;
    let (channel_id, tenant_id) = common::seed_channel(&h.db).await;

    h.store
        .save(
            channel_id,
            &Credentials {
                device_id: Some("device-1".into()),
                phone_number: Some("60123456789".into()),
                identity: serde_json::json!({"noise": "x"}),
            },
        )
        .await
        .unwrap();

    h.supervisor.start_session(channel_id).await.unwrap();
    settle().await;
    assert_eq!(channel_status(&h.db, channel_id).await, "connected");

    h.supervisor.logout(channel_id).await.unwrap();
    settle().await;

    assert!(!h.supervisor.is_running(channel_id).await);
    assert_eq!(channel_status(&h.db, channel_id).await, "disconnected");
    // LoggedOut is terminal and wipes stored credentials.
    let creds = h.store.load(channel_id).await.unwrap();
    assert!(!creds.is_registered());

    common::cleanup_channel(&h.db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn superseded_session_keeps_its_credentials() {
    let h = harness().await;
    let (channel_id, tenant_id) = common::seed_channel(&h.db).await;

    h.store
        .save(
            channel_id,
            &Credentials {
                device_id: Some("device-1".into()),
                phone_number: Some("60123456789".into()),
                identity: serde_json::json!({"noise": "x"}),
            },
        )
        .await
        .unwrap();

    h.supervisor.start_session(channel_id).await.unwrap();
    settle().await;

    h.connector
        .inject(
            channel_id,
            ProtocolEvent::ConnectionClose(DisconnectReason::ConnectionReplaced),
        )
        .await;
    settle().await;

    assert!(!h.supervisor.is_running(channel_id).await);
    assert_eq!(channel_status(&h.db, channel_id).await, "disconnected");
    // The other device owns the credentials now; they must survive.
    let creds = h.store.load(channel_id).await.unwrap();
    assert!(creds.is_registered());

    common::cleanup_channel(&h.db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn qr_regeneration_ceiling_abandons_the_login() {
    let h = harness().await;
    let (channel_id, tenant_id) = common::seed_channel(&h.db).await;

    // One more QR than the harness ceiling of 3.
    h.connector
        .script_events(
            channel_id,
            (0..4)
                .map(|i| ProtocolEvent::Qr(format!("qr-{i}")))
                .collect(),
        )
        .await;

    h.supervisor.start_session(channel_id).await.unwrap();
    settle().await;

    assert!(!h.supervisor.is_running(channel_id).await);
    assert_eq!(channel_status(&h.db, channel_id).await, "disconnected");

    common::cleanup_channel(&h.db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn retryable_disconnects_exhaust_into_error_state() {
    let h = harness().await;
    let (channel_id, tenant_id) = common::seed_channel(&h.db).await;

    h.supervisor.start_session(channel_id).await.unwrap();
    settle().await;

    // Attempts only reset on a successful open; three consecutive
    // retryable closes exceed the harness ceiling of 2.
    for _ in 0..3 {
        h.connector
            .inject(
                channel_id,
                ProtocolEvent::ConnectionClose(DisconnectReason::Other("stream error".into())),
            )
            .await;
        settle().await;
    }

    assert!(!h.supervisor.is_running(channel_id).await);
    assert_eq!(channel_status(&h.db, channel_id).await, "error");

    common::cleanup_channel(&h.db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn a_second_instance_cannot_start_a_held_channel() {
    let first = harness().await;
    let second = harness().await;
    let (channel_id, tenant_id) = common::seed_channel(&first.db).await;

    // The second harness must see the same channel row.
    sqlx::query("INSERT INTO channels (id, tenant_id, status) VALUES ($1, $2, 'disconnected') ON CONFLICT DO NOTHING")
        .bind(channel_id)
        .bind(tenant_id)
        .execute(&second.db)
        .await
        .unwrap();

    first
        .connector
        .script_events(
            channel_id,
            vec![ProtocolEvent::ConnectionOpen {
                phone_number: "60123456789".into(),
            }],
        )
        .await;
    first.supervisor.start_session(channel_id).await.unwrap();
    settle().await;

    let err = second.supervisor.start_session(channel_id).await.unwrap_err();
    assert!(matches!(err, AppError::ChannelLocked(_)));

    // Takeover steals the lock; the channel runs on the second instance.
    second
        .connector
        .script_events(
            channel_id,
            vec![ProtocolEvent::ConnectionOpen {
                phone_number: "60123456789".into(),
            }],
        )
        .await;
    second.supervisor.takeover_session(channel_id).await.unwrap();
    settle().await;
    assert!(second.supervisor.is_running(channel_id).await);

    second.supervisor.stop_session(channel_id).await.unwrap();
    common::cleanup_channel(&first.db, channel_id, tenant_id).await;
}
