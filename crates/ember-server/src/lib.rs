//! # ember-server
//!
//! The Ember chat server: per-room hubs coupling client sessions, the
//! plugin pipeline, the history ring and the expression-based target
//! filter.
//!
//! The binary lives in `main.rs`; everything else is a library so the
//! integration tests can run a real server in-process.

pub mod auth;
pub mod config;
pub mod cron;
pub mod guest;
pub mod handlers;
pub mod hub;
pub mod metrics;
pub mod registry;
pub mod session;

pub use config::Config;
pub use handlers::{router, run_server, serve_on, AppState};
pub use hub::{Hub, PluginMap, PluginSpec};
pub use registry::{HostBridge, Registry};
