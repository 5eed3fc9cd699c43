pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod migrations;
pub mod models;
pub mod protocol;
pub mod redis_client;
pub mod services;
pub mod state;
