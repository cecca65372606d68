//! Persistent delayed-message queue.
//!
//! - [`engine`] - the storage contract and its fjall and redb backends
//! - [`store`] - async facade over an engine
//! - [`server`] - Redis-protocol TCP front-end
//! - [`config`] - TOML configuration

pub mod config;
pub mod engine;
pub mod server;
pub mod store;
