//! Durable, encrypted storage of per-channel session secrets.
//!
//! Postgres is the source of truth; Redis shadows the encrypted creds blob
//! for fast reconnects. The cache is advisory: a cache failure never fails
//! the operation it rides alongside, and nothing is ever cached or persisted
//! in plaintext.

use crate::error::{AppError, AppResult};
use crate::protocol::{Credentials, KeyKind, SyncKeyUpdate};
use crate::redis_client::RedisClient;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use redis::AsyncCommands;
use sqlx::{Pool, Postgres, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const CREDS_AAD: &[u8] = b"channel-creds";

fn cache_key(channel_id: Uuid) -> String {
    format!("creds:{channel_id}")
}

#[derive(Clone)]
pub struct CredentialStore {
    db: Pool<Postgres>,
    redis: RedisClient,
    master_key: [u8; 32],
    cache_ttl: Duration,
}

impl CredentialStore {
    pub fn new(
        db: Pool<Postgres>,
        redis: RedisClient,
        master_key: [u8; 32],
        cache_ttl: Duration,
    ) -> Self {
        Self {
            db,
            redis,
            master_key,
            cache_ttl,
        }
    }

    fn channel_key(&self, channel_id: Uuid) -> [u8; 32] {
        crypto_core::derive_channel_key(&self.master_key, channel_id.as_bytes())
    }

    fn seal(&self, channel_id: Uuid, plaintext: &[u8], aad: &[u8]) -> AppResult<Vec<u8>> {
        crypto_core::encrypt_at_rest(plaintext, &self.channel_key(channel_id), aad)
            .map_err(|e| AppError::Encryption(e.to_string()))
    }

    fn open(&self, channel_id: Uuid, blob: &[u8], aad: &[u8]) -> AppResult<Vec<u8>> {
        crypto_core::decrypt_at_rest(blob, &self.channel_key(channel_id), aad)
            .map_err(|e| AppError::Encryption(e.to_string()))
    }

    /// Load credentials for a channel: cache first, durable store second,
    /// fresh empty credentials on total miss.
    pub async fn load(&self, channel_id: Uuid) -> AppResult<Credentials> {
        if let Some(creds) = self.load_cached(channel_id).await {
            return Ok(creds);
        }

        let row = sqlx::query("SELECT creds FROM channel_credentials WHERE channel_id = $1")
            .bind(channel_id)
            .fetch_optional(&self.db)
            .await?;

        let Some(row) = row else {
            debug!(%channel_id, "no stored credentials, synthesizing fresh");
            return Ok(Credentials::fresh());
        };

        let blob: Vec<u8> = row.get("creds");
        let plaintext = self.open(channel_id, &blob, CREDS_AAD)?;
        let creds: Credentials = serde_json::from_slice(&plaintext)
            .map_err(|e| AppError::Encryption(format!("corrupt credential blob: {e}")))?;

        self.cache_blob(channel_id, &blob).await;
        Ok(creds)
    }

    /// Write-through save: durable store first, then best-effort cache.
    pub async fn save(&self, channel_id: Uuid, creds: &Credentials) -> AppResult<()> {
        let plaintext = serde_json::to_vec(creds)
            .map_err(|e| AppError::Encryption(format!("serialize credentials: {e}")))?;
        let blob = self.seal(channel_id, &plaintext, CREDS_AAD)?;

        sqlx::query(
            "INSERT INTO channel_credentials (channel_id, creds, updated_at) \
             VALUES ($1, $2, NOW()) \
             ON CONFLICT (channel_id) DO UPDATE SET creds = $2, updated_at = NOW()",
        )
        .bind(channel_id)
        .bind(&blob)
        .execute(&self.db)
        .await?;

        self.cache_blob(channel_id, &blob).await;
        Ok(())
    }

    /// Remove cache entry, durable record and all sync keys. "Already
    /// absent" counts as success.
    pub async fn delete(&self, channel_id: Uuid) -> AppResult<()> {
        let mut conn = self.redis.connection().await;
        if let Err(e) = conn.del::<_, ()>(cache_key(channel_id)).await {
            warn!(%channel_id, error = %e, "failed to drop credential cache entry");
        }

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM channel_sync_keys WHERE channel_id = $1")
            .bind(channel_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM channel_credentials WHERE channel_id = $1")
            .bind(channel_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(%channel_id, "credentials deleted");
        Ok(())
    }

    /// Fetch sync keys lazily, per id. Missing ids are simply absent from
    /// the returned map; a channel can hold thousands of keys and bulk
    /// loading them at startup is the latency bug this design avoids.
    pub async fn get_keys(
        &self,
        channel_id: Uuid,
        kind: KeyKind,
        ids: &[String],
    ) -> AppResult<HashMap<String, serde_json::Value>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            "SELECT key_id, value FROM channel_sync_keys \
             WHERE channel_id = $1 AND kind = $2 AND key_id = ANY($3)",
        )
        .bind(channel_id)
        .bind(kind.as_str())
        .bind(ids)
        .fetch_all(&self.db)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let key_id: String = row.get("key_id");
            let blob: Vec<u8> = row.get("value");
            let plaintext = self.open(channel_id, &blob, kind.as_str().as_bytes())?;
            let value: serde_json::Value = serde_json::from_slice(&plaintext)
                .map_err(|e| AppError::Encryption(format!("corrupt sync key {key_id}: {e}")))?;
            out.insert(key_id, value);
        }
        Ok(out)
    }

    /// Apply a batch of key rotations in one transaction. `None` values
    /// delete the key.
    pub async fn set_keys(&self, channel_id: Uuid, updates: &[SyncKeyUpdate]) -> AppResult<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self.db.begin().await?;
        for update in updates {
            match &update.value {
                Some(value) => {
                    let plaintext = serde_json::to_vec(value)
                        .map_err(|e| AppError::Encryption(format!("serialize sync key: {e}")))?;
                    let blob =
                        self.seal(channel_id, &plaintext, update.kind.as_str().as_bytes())?;
                    sqlx::query(
                        "INSERT INTO channel_sync_keys (channel_id, kind, key_id, value, updated_at) \
                         VALUES ($1, $2, $3, $4, NOW()) \
                         ON CONFLICT (channel_id, kind, key_id) \
                         DO UPDATE SET value = $4, updated_at = NOW()",
                    )
                    .bind(channel_id)
                    .bind(update.kind.as_str())
                    .bind(&update.key_id)
                    .bind(&blob)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "DELETE FROM channel_sync_keys \
                         WHERE channel_id = $1 AND kind = $2 AND key_id = $3",
                    )
                    .bind(channel_id)
                    .bind(update.kind.as_str())
                    .bind(&update.key_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_cached(&self, channel_id: Uuid) -> Option<Credentials> {
        let mut conn = self.redis.connection().await;
        let cached: Option<String> = match conn.get(cache_key(channel_id)).await {
            Ok(v) => v,
            Err(e) => {
                warn!(%channel_id, error = %e, "credential cache read failed");
                return None;
            }
        };
        let encoded = cached?;

        // Refresh the TTL on every hit so active channels stay warm.
        if let Err(e) = conn
            .expire::<_, ()>(cache_key(channel_id), self.cache_ttl.as_secs() as i64)
            .await
        {
            warn!(%channel_id, error = %e, "credential cache TTL refresh failed");
        }

        let blob = match STANDARD.decode(&encoded) {
            Ok(b) => b,
            Err(e) => {
                warn!(%channel_id, error = %e, "corrupt credential cache entry, falling back to store");
                return None;
            }
        };
        match self
            .open(channel_id, &blob, CREDS_AAD)
            .and_then(|plain| {
                serde_json::from_slice(&plain)
                    .map_err(|e| AppError::Encryption(e.to_string()))
            }) {
            Ok(creds) => {
                debug!(%channel_id, "credential cache hit");
                Some(creds)
            }
            Err(e) => {
                warn!(%channel_id, error = %e, "undecryptable credential cache entry, falling back to store");
                None
            }
        }
    }

    async fn cache_blob(&self, channel_id: Uuid, blob: &[u8]) {
        let mut conn = self.redis.connection().await;
        let encoded = STANDARD.encode(blob);
        if let Err(e) = conn
            .set_ex::<_, _, ()>(cache_key(channel_id), encoded, self.cache_ttl.as_secs())
            .await
        {
            warn!(%channel_id, error = %e, "credential cache write failed");
        }
    }
}
