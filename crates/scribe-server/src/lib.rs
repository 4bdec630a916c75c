//! # scribe-server
//!
//! HTTP surface of the Scribe collaboration hub: configuration, bearer-token
//! authentication, the document WebSocket route, health and stats endpoints,
//! and Prometheus metrics.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{router, run_server, serve, AppState};
