//! Wire-identifier normalization and alias reconciliation.
//!
//! The chat network addresses the same human through several identifier
//! formats: phone-number JIDs with optional device suffixes, and
//! privacy-preserving linkable ids (`@lid`). Everything is reduced to one
//! canonical key before any row is created, and a late-discovered
//! alias-canonical equivalence triggers a transactional merge of the two
//! contact histories.

use crate::error::{AppError, AppResult};
use crate::services::ingestion::CHANNEL_KIND;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

/// Domain suffix carried by alias (linkable) identifiers.
const ALIAS_DOMAIN: &str = "lid";
/// Domain suffix carried by group identifiers.
const GROUP_DOMAIN: &str = "g.us";

/// Reduce a raw wire identifier to its canonical form.
///
/// Individuals collapse to digits only: the protocol-domain suffix, the
/// `:<device>` multiplicity suffix, a leading `+` and any separators are all
/// dropped. Group identifiers keep their full structure (separators
/// included) because digit-stripping would collide distinct groups.
pub fn normalize(raw_id: &str) -> String {
    let (local, domain) = match raw_id.split_once('@') {
        Some((l, d)) => (l, Some(d)),
        None => (raw_id, None),
    };

    if domain == Some(GROUP_DOMAIN) || (domain.is_none() && is_group_shape(local)) {
        return local.to_string();
    }

    let local = local.split(':').next().unwrap_or(local);
    local.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Whether a domain-less identifier already has group structure
/// (`<digits>-<digits>`), so re-normalization leaves it untouched.
fn is_group_shape(local: &str) -> bool {
    let mut parts = local.split('-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => {
            !a.is_empty()
                && !b.is_empty()
                && a.chars().all(|c| c.is_ascii_digit())
                && b.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// Whether the raw identifier carries the alias (linkable-id) marker.
pub fn is_alias(raw_id: &str) -> bool {
    raw_id
        .split_once('@')
        .map(|(_, domain)| domain == ALIAS_DOMAIN)
        .unwrap_or(false)
}

pub fn is_group(raw_id: &str) -> bool {
    raw_id
        .split_once('@')
        .map(|(_, domain)| domain == GROUP_DOMAIN)
        .unwrap_or_else(|| is_group_shape(raw_id))
}

pub struct IdentityService;

impl IdentityService {
    /// Resolve a raw wire id to the best-known canonical id. Alias-marked
    /// ids consult the stored mapping; everything else just normalizes.
    pub async fn resolve(
        db: &Pool<Postgres>,
        channel_id: Uuid,
        raw_id: &str,
    ) -> AppResult<String> {
        let normalized = normalize(raw_id);
        if !is_alias(raw_id) {
            return Ok(normalized);
        }

        let mapped: Option<String> = sqlx::query_scalar(
            "SELECT canonical_id FROM contact_aliases WHERE channel_id = $1 AND alias_id = $2",
        )
        .bind(channel_id)
        .bind(&normalized)
        .fetch_optional(db)
        .await?;

        if let Some(canonical) = mapped {
            return Ok(canonical);
        }

        // No mapping yet: the alias id itself is the best-known identity.
        // A contact may already exist under it, which simply means no
        // mapping was ever needed.
        Ok(normalized)
    }

    /// Persist both directions of an alias-canonical equivalence, then
    /// unify any contact histories that grew independently under the two
    /// identifiers. Discovery of a mapping is exactly the moment a merge
    /// might be needed, so the merge runs unconditionally.
    pub async fn store_alias_mapping(
        db: &Pool<Postgres>,
        channel_id: Uuid,
        alias: &str,
        canonical: &str,
    ) -> AppResult<()> {
        let alias = normalize(alias);
        let canonical = normalize(canonical);
        if alias == canonical || alias.is_empty() || canonical.is_empty() {
            return Ok(());
        }

        let mut tx = db.begin().await?;
        for (a, c) in [(&alias, &canonical), (&canonical, &alias)] {
            sqlx::query(
                "INSERT INTO contact_aliases (channel_id, alias_id, canonical_id) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (channel_id, alias_id) DO UPDATE SET canonical_id = $3",
            )
            .bind(channel_id)
            .bind(a)
            .bind(c)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(%channel_id, %alias, %canonical, "alias mapping stored");
        Self::merge_duplicates(db, channel_id, &alias, &canonical).await
    }

    /// Unify the contact graphs behind an alias and its canonical id.
    ///
    /// Cheap path: only the alias-side contact exists, so it is renamed in
    /// place. Full path: conversations move to the canonical contact inside
    /// one transaction, coalescing per-channel pairs (messages re-parented,
    /// unread counts summed), null fields backfilled, alias contact
    /// deleted. Partial merges would orphan messages, hence the single
    /// transaction.
    pub async fn merge_duplicates(
        db: &Pool<Postgres>,
        channel_id: Uuid,
        alias: &str,
        canonical: &str,
    ) -> AppResult<()> {
        let tenant_id: Uuid = sqlx::query_scalar("SELECT tenant_id FROM channels WHERE id = $1")
            .bind(channel_id)
            .fetch_optional(db)
            .await?
            .ok_or(AppError::NotFound)?;

        let mut tx = db.begin().await?;

        // Contacts are unique per (tenant_id, channel_kind, identifier);
        // the kind filter keeps the merge away from other channel kinds.
        let alias_row = sqlx::query(
            "SELECT id, display_name, avatar_url FROM contacts \
             WHERE tenant_id = $1 AND channel_kind = $2 AND identifier = $3 FOR UPDATE",
        )
        .bind(tenant_id)
        .bind(CHANNEL_KIND)
        .bind(alias)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(alias_row) = alias_row else {
            // Nothing ever recorded under the alias; the mapping alone is
            // enough to route future traffic.
            tx.commit().await?;
            return Ok(());
        };
        let alias_contact_id: Uuid = alias_row.get("id");

        let canonical_row = sqlx::query(
            "SELECT id FROM contacts \
             WHERE tenant_id = $1 AND channel_kind = $2 AND identifier = $3 FOR UPDATE",
        )
        .bind(tenant_id)
        .bind(CHANNEL_KIND)
        .bind(canonical)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(canonical_row) = canonical_row else {
            // Only the alias side exists: rename it in place, keeping its
            // conversations and messages untouched.
            sqlx::query("UPDATE contacts SET identifier = $1, updated_at = NOW() WHERE id = $2")
                .bind(canonical)
                .bind(alias_contact_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(%channel_id, %alias, %canonical, "alias contact renamed to canonical identifier");
            return Ok(());
        };
        let canonical_contact_id: Uuid = canonical_row.get("id");

        let alias_convs = sqlx::query(
            "SELECT id, channel_id, unread_count FROM conversations WHERE contact_id = $1",
        )
        .bind(alias_contact_id)
        .fetch_all(&mut *tx)
        .await?;

        for conv in alias_convs {
            let alias_conv_id: Uuid = conv.get("id");
            let conv_channel: Uuid = conv.get("channel_id");
            let alias_unread: i32 = conv.get("unread_count");

            let existing: Option<Uuid> = sqlx::query_scalar(
                "SELECT id FROM conversations WHERE channel_id = $1 AND contact_id = $2",
            )
            .bind(conv_channel)
            .bind(canonical_contact_id)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(canonical_conv_id) => {
                    // Coalesce: move messages, sum unread, keep the newest
                    // activity timestamp. Cross-conversation duplicates are
                    // impossible here: (channel_id, external_id) is unique
                    // at insert time.
                    sqlx::query("UPDATE messages SET conversation_id = $1 WHERE conversation_id = $2")
                        .bind(canonical_conv_id)
                        .bind(alias_conv_id)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(
                        "UPDATE conversations c SET \
                             unread_count = c.unread_count + $2, \
                             last_message_at = GREATEST(c.last_message_at, \
                                 (SELECT a.last_message_at FROM conversations a WHERE a.id = $3)), \
                             updated_at = NOW() \
                         WHERE c.id = $1",
                    )
                    .bind(canonical_conv_id)
                    .bind(alias_unread)
                    .bind(alias_conv_id)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query("DELETE FROM conversations WHERE id = $1")
                        .bind(alias_conv_id)
                        .execute(&mut *tx)
                        .await?;
                }
                None => {
                    sqlx::query(
                        "UPDATE conversations SET contact_id = $1, updated_at = NOW() WHERE id = $2",
                    )
                    .bind(canonical_contact_id)
                    .bind(alias_conv_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        // Backfill fields the canonical contact never learned.
        sqlx::query(
            "UPDATE contacts SET \
                 display_name = COALESCE(display_name, $2), \
                 avatar_url = COALESCE(avatar_url, $3), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(canonical_contact_id)
        .bind(alias_row.get::<Option<String>, _>("display_name"))
        .bind(alias_row.get::<Option<String>, _>("avatar_url"))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM contacts WHERE id = $1")
            .bind(alias_contact_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(%channel_id, %alias, %canonical, "duplicate contacts merged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_domain_device_and_separators() {
        assert_eq!(normalize("60123456789@s.whatsapp.net"), "60123456789");
        assert_eq!(normalize("60123456789:12@s.whatsapp.net"), "60123456789");
        assert_eq!(normalize("+60 12-345 6789"), "60123456789");
        assert_eq!(normalize("601234@lid"), "601234");
    }

    #[test]
    fn groups_keep_full_structure() {
        assert_eq!(normalize("123456789-987654@g.us"), "123456789-987654");
        assert_eq!(normalize("123456789-987654"), "123456789-987654");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [
            "60123456789@s.whatsapp.net",
            "60123:2@s.whatsapp.net",
            "+60123456789",
            "123456789-987654@g.us",
            "601234@lid",
        ] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {raw}");
        }
    }

    #[test]
    fn individual_ids_reduce_to_digits() {
        for raw in ["60123456789@s.whatsapp.net", "+60 12 345", "601:9@c.us"] {
            assert!(normalize(raw).chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn alias_and_group_detection() {
        assert!(is_alias("601234@lid"));
        assert!(!is_alias("601234@s.whatsapp.net"));
        assert!(!is_alias("601234"));
        assert!(is_group("123-456@g.us"));
        assert!(is_group("123-456"));
        assert!(!is_group("60123456789@s.whatsapp.net"));
    }
}
