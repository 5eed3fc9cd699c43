//! Credential store round-trips against live Postgres and Redis.

mod common;

use channel_service::protocol::{Credentials, KeyKind, SyncKeyUpdate};
use channel_service::services::credential_store::CredentialStore;
use redis::AsyncCommands;
use std::time::Duration;
use uuid::Uuid;

const MASTER_KEY: [u8; 32] = [7u8; 32];

async fn store() -> (
    CredentialStore,
    sqlx::Pool<sqlx::Postgres>,
    channel_service::redis_client::RedisClient,
) {
    let db = common::test_pool().await;
    let redis = common::test_redis().await;
    let store = CredentialStore::new(
        db.clone(),
        redis.clone(),
        MASTER_KEY,
        Duration::from_secs(60),
    );
    (store, db, redis)
}

fn registered_creds() -> Credentials {
    Credentials {
        device_id: Some("device-1".into()),
        phone_number: Some("60123456789".into()),
        identity: serde_json::json!({"noise_key": "abc", "signed_prekey": "def"}),
    }
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn save_then_load_round_trips() {
    let (store, db, _redis) = store().await;
    let (channel_id, tenant_id) = common::seed_channel(&db).await;

    store.save(channel_id, &registered_creds()).await.unwrap();

    let loaded = store.load(channel_id).await.unwrap();
    assert_eq!(loaded.device_id.as_deref(), Some("device-1"));
    assert_eq!(loaded.phone_number.as_deref(), Some("60123456789"));
    assert!(loaded.is_registered());

    common::cleanup_channel(&db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn load_survives_a_cold_cache() {
    let (store, db, redis) = store().await;
    let (channel_id, tenant_id) = common::seed_channel(&db).await;

    store.save(channel_id, &registered_creds()).await.unwrap();

    // Drop the cache entry; the durable store must still answer.
    let mut conn = redis.connection().await;
    let _: () = conn.del(format!("creds:{channel_id}")).await.unwrap();

    let loaded = store.load(channel_id).await.unwrap();
    assert!(loaded.is_registered());

    common::cleanup_channel(&db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn corrupt_cache_entry_falls_back_to_durable_store() {
    let (store, db, redis) = store().await;
    let (channel_id, tenant_id) = common::seed_channel(&db).await;

    store.save(channel_id, &registered_creds()).await.unwrap();

    let mut conn = redis.connection().await;
    let _: () = conn
        .set(format!("creds:{channel_id}"), "not-base64!!!")
        .await
        .unwrap();

    let loaded = store.load(channel_id).await.unwrap();
    assert!(loaded.is_registered());

    common::cleanup_channel(&db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn missing_credentials_synthesize_fresh() {
    let (store, db, _redis) = store().await;
    let (channel_id, tenant_id) = common::seed_channel(&db).await;

    let loaded = store.load(channel_id).await.unwrap();
    assert!(!loaded.is_registered());
    assert!(loaded.device_id.is_none());

    common::cleanup_channel(&db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn delete_wipes_credentials_and_sync_keys() {
    let (store, db, _redis) = store().await;
    let (channel_id, tenant_id) = common::seed_channel(&db).await;

    store.save(channel_id, &registered_creds()).await.unwrap();
    store
        .set_keys(
            channel_id,
            &[SyncKeyUpdate {
                kind: KeyKind::Session,
                key_id: "peer-1".into(),
                value: Some(serde_json::json!({"ratchet": 1})),
            }],
        )
        .await
        .unwrap();

    store.delete(channel_id).await.unwrap();

    let loaded = store.load(channel_id).await.unwrap();
    assert!(!loaded.is_registered());
    let keys = store
        .get_keys(channel_id, KeyKind::Session, &["peer-1".into()])
        .await
        .unwrap();
    assert!(keys.is_empty());

    // Deleting again is still a success.
    store.delete(channel_id).await.unwrap();

    common::cleanup_channel(&db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn sync_keys_load_per_id_and_delete_on_none() {
    let (store, db, _redis) = store().await;
    let (channel_id, tenant_id) = common::seed_channel(&db).await;

    store
        .set_keys(
            channel_id,
            &[
                SyncKeyUpdate {
                    kind: KeyKind::PreKey,
                    key_id: "1".into(),
                    value: Some(serde_json::json!({"key": "a"})),
                },
                SyncKeyUpdate {
                    kind: KeyKind::PreKey,
                    key_id: "2".into(),
                    value: Some(serde_json::json!({"key": "b"})),
                },
            ],
        )
        .await
        .unwrap();

    // Only the requested ids come back; missing ids are simply absent.
    let keys = store
        .get_keys(channel_id, KeyKind::PreKey, &["1".into(), "99".into()])
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys["1"], serde_json::json!({"key": "a"}));

    // Kinds are separate namespaces.
    let wrong_kind = store
        .get_keys(channel_id, KeyKind::SenderKey, &["1".into()])
        .await
        .unwrap();
    assert!(wrong_kind.is_empty());

    store
        .set_keys(
            channel_id,
            &[SyncKeyUpdate {
                kind: KeyKind::PreKey,
                key_id: "1".into(),
                value: None,
            }],
        )
        .await
        .unwrap();
    let after_delete = store
        .get_keys(channel_id, KeyKind::PreKey, &["1".into(), "2".into()])
        .await
        .unwrap();
    assert_eq!(after_delete.len(), 1);
    assert!(after_delete.contains_key("2"));

    common::cleanup_channel(&db, channel_id, tenant_id).await;
}

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn blobs_are_not_plaintext_at_rest() {
    let (store, db, _redis) = store().await;
    let (channel_id, tenant_id) = common::seed_channel(&db).await;

    store.save(channel_id, &registered_creds()).await.unwrap();

    let blob: Vec<u8> =
        sqlx::query_scalar("SELECT creds FROM channel_credentials WHERE channel_id = $1")
            .bind(channel_id)
            .fetch_one(&db)
            .await
            .unwrap();
    let as_text = String::from_utf8_lossy(&blob);
    assert!(!as_text.contains("60123456789"));
    assert!(!as_text.contains("noise_key"));

    common::cleanup_channel(&db, channel_id, tenant_id).await;
}
