//! Striped Per-Key Locks
//!
//! Commands like GET issue several store calls for one key (drain, then
//! restore). Holding the key's stripe for the whole sequence keeps other
//! commands on the same key from landing in between.
//!
//! Keys are spread across stripes with a hash. Two keys may share a
//! stripe; that only costs some parallelism.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Number of lock stripes.
const NUM_STRIPES: usize = 64;

#[derive(Debug)]
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self {
            stripes: (0..NUM_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    #[inline]
    fn stripe_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    /// Locks the stripe owning `key`.
    pub fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_index(key)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks every stripe, always in index order.
    ///
    /// Callers holding a single stripe must not call this.
    pub fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        self.stripes
            .iter()
            .map(|stripe| stripe.lock().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }
}
