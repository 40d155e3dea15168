//! Command Handler Module
//!
//! This module implements the command processing layer. It receives parsed
//! requests, executes them against the shared store and returns replies.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ RequestParser   │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Dispatch     │
//! │  - Key locks    │
//! │  - Execute      │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CountingStore   │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - `SET`, `SETNX`, `GET`, `DEL`
//! - `EXISTS`, `MGET`
//! - `SAVE`

pub mod handler;
pub mod locks;

// Re-export the main command handler
pub use handler::{CommandHandler, MAX_COUNT_PROBES};
pub use locks::KeyLocks;
