use sqlx::{Pool, Postgres};

// Embed SQL migrations at compile time for deterministic startup
const MIG_0001: &str = include_str!("../migrations/0001_create_channels.sql");
const MIG_0002: &str = include_str!("../migrations/0002_create_channel_credentials.sql");
const MIG_0003: &str = include_str!("../migrations/0003_create_contacts.sql");
const MIG_0004: &str = include_str!("../migrations/0004_create_conversations.sql");
const MIG_0005: &str = include_str!("../migrations/0005_create_messages.sql");

pub async fn run_all(db: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    // Run sequentially; each migration may contain multiple statements
    for (i, sql) in [MIG_0001, MIG_0002, MIG_0003, MIG_0004, MIG_0005]
        .into_iter()
        .enumerate()
    {
        let label = i + 1;
        match sqlx::raw_sql(sql).execute(db).await {
            Ok(_) => tracing::info!(migration = %label, "channel-service migration applied"),
            Err(e) => {
                // All statements are IF NOT EXISTS; a failure here means the
                // migration raced another replica or was applied already.
                tracing::warn!(migration = %label, error = %e, "migration may have been applied already");
            }
        }
    }
    Ok(())
}
