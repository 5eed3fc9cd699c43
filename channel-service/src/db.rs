use db_pool::{create_pool, DbConfig};
use sqlx::{Pool, Postgres};

pub async fn init_pool(database_url: &str) -> Result<Pool<Postgres>, sqlx::Error> {
    let config = DbConfig {
        service_name: "channel-service".into(),
        database_url: database_url.to_string(),
        ..DbConfig::default()
    };
    config.log_config();
    create_pool(config).await
}
