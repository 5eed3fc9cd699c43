use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("startup failure: {0}")]
    Startup(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("channel {0} is not connected")]
    NotConnected(uuid::Uuid),

    #[error("channel {0} rate limited: {1}")]
    RateLimited(uuid::Uuid, String),

    #[error("channel {0} is locked by another instance")]
    ChannelLocked(uuid::Uuid),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not found")]
    NotFound,
}

impl AppError {
    /// Whether retrying the same operation can reasonably succeed.
    ///
    /// Rate limits and lock contention are deliberately NOT retryable here:
    /// they are surfaced to the caller as distinct conditions rather than
    /// silently re-queued.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            AppError::Redis(e) => e.is_io_error() || e.is_timeout(),
            AppError::Protocol(_) => true,
            _ => false,
        }
    }
}

/// Whether a sqlx error is a unique-constraint violation.
///
/// Concurrent inserts of the same message or contact are an expected race;
/// callers convert this case into "fetch existing and proceed".
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn rate_limited_is_not_retryable() {
        let err = AppError::RateLimited(Uuid::new_v4(), "minute window".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn lock_contention_is_not_retryable() {
        assert!(!AppError::ChannelLocked(Uuid::new_v4()).is_retryable());
    }

    #[test]
    fn protocol_errors_are_retryable() {
        assert!(AppError::Protocol("stream closed".into()).is_retryable());
    }
}
