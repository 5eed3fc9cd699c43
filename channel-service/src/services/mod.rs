pub mod channel_lock;
pub mod contact_service;
pub mod credential_store;
pub mod fanout;
pub mod identity;
pub mod ingestion;
pub mod rate_limiter;
pub mod session_supervisor;
