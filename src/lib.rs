//! # bloomkv - A Network Counting Service
//!
//! bloomkv serves approximate per-key occurrence counts over TCP. Clients
//! send short commands (`SET`, `GET`, `DEL`, ...) in either the multibulk
//! or the inline form; every connection works against one shared counting
//! bloom filter.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              bloomkv                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │                            │                  │ check/add/remove/flush  │
//! │                            ▼                  ▼                         │
//! │                     ┌─────────────┐    ┌──────────────────────────────┐ │
//! │                     │  Request    │    │   CountingStore              │ │
//! │                     │  Parser     │    │   (ScalingBloom)             │ │
//! │                     └─────────────┘    └──────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use bloomkv::commands::CommandHandler;
//! use bloomkv::connection::{ConnectionStats, DEFAULT_IDLE_TIMEOUT};
//! use bloomkv::server::{bind, Server};
//! use bloomkv::storage::ScalingBloom;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(ScalingBloom::open(100_000, 0.05, "bloom.bin")?);
//!     let listener = bind("0.0.0.0:1234").await?;
//!
//!     Server::new(
//!         listener,
//!         CommandHandler::new(store),
//!         Arc::new(ConnectionStats::new()),
//!         DEFAULT_IDLE_TIMEOUT,
//!     )
//!     .run()
//!     .await;
//!     Ok(())
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `SET key` - count one occurrence
//! - `SETNX key` - count one occurrence unless the key is already present
//! - `GET key` - approximate count, at most 16
//! - `DEL key` - drain the key's count
//! - `EXISTS key` - `1` if present, else `0`
//! - `MGET key [key ...]` - presence flag per key
//! - `SAVE` - persist the store
//!
//! Anything else is answered with `+OK`.
//!
//! ## Module Overview
//!
//! - [`protocol`]: Request parser and reply types
//! - [`commands`]: Command dispatch and per-key locking
//! - [`connection`]: Client connection management
//! - [`server`]: Listener binding and accept loop
//! - [`storage`]: The store capability and the scaling bloom filter
//! - [`config`]: INI configuration

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use config::{ConfigError, ServerConfig};
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{ParseError, Reply, Request, RequestParser};
pub use server::{Server, ServerError};
pub use storage::{CountingStore, ScalingBloom, StoreError};

/// The default listen address: port 1234 on every IPv4 interface
pub const DEFAULT_LISTEN_ADDR: &str = ":1234";

/// Version of bloomkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
