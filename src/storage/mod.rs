//! Storage Module
//!
//! The command layer talks to storage only through [`CountingStore`]: four
//! primitives, no way to read a count directly. [`ScalingBloom`] is the
//! implementation the server runs with.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScalingBloom                           │
//! │                 RwLock<Vec<CountingBloom>>                  │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Stage 0 │ │ Stage 1 │ │ Stage 2 │ │ Stage N │ <── add   │
//! │  │ full    │ │ full    │ │ full    │ │ filling │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ flush()
//!                               ▼
//!                          store file
//! ```
//!
//! ## Example
//!
//! ```
//! use bloomkv::storage::{CountingStore, ScalingBloom};
//! use std::sync::Arc;
//!
//! let store: Arc<dyn CountingStore> =
//!     Arc::new(ScalingBloom::open(10_000, 0.01, "/tmp/bloomkv-example.bin").unwrap());
//!
//! store.add(b"visits:home", 1);
//! assert!(store.check(b"visits:home"));
//! ```

pub mod counting;
pub mod scaling;

use std::io;
use thiserror::Error;

// Re-export commonly used types
pub use counting::CountingBloom;
pub use scaling::ScalingBloom;

/// Errors raised by a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt store file: {0}")]
    Corrupt(String),

    #[error("invalid store parameters: {0}")]
    InvalidParameters(String),
}

/// An approximate membership store with per-key occurrence counts.
///
/// Implementations must be safe to call from many connections at once.
/// No atomicity is promised across separate calls.
pub trait CountingStore: Send + Sync {
    /// Returns true if `key` is (probably) present.
    fn check(&self, key: &[u8]) -> bool;

    /// Adds `delta` occurrences of `key`.
    fn add(&self, key: &[u8], delta: u32);

    /// Removes `delta` occurrences of `key`.
    fn remove(&self, key: &[u8], delta: u32);

    /// Persists the current state.
    fn flush(&self) -> Result<(), StoreError>;
}
