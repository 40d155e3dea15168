//! Counting Bloom Filter
//!
//! A single fixed-size counting bloom filter. The counter array is split
//! into one partition per hash function, so every key touches exactly one
//! counter in each partition.
//!
//! ```text
//!  key ──> h1, h2 ──> index_i = (h1 + i * h2) mod m
//!
//!  ┌──── func 0 ────┬──── func 1 ────┬─── ... ───┬──── func k-1 ──┐
//!  │ 0 2 0 1 0 0 .. │ 1 0 0 0 2 0 .. │           │ 0 0 1 0 0 2 .. │
//!  └────────────────┴────────────────┴───────────┴────────────────┘
//! ```
//!
//! Counters are 8 bits and saturate: once a counter hits 255 it is never
//! decremented again.

use super::StoreError;
use std::f64::consts::LN_2;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const SECOND_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Largest counter array a single stage may hold (4 GiB)
pub(crate) const MAX_STAGE_COUNTERS: usize = u32::MAX as usize;

/// 64-bit FNV-1a, seeded through the offset basis.
///
/// Stable across builds, which matters because counter positions end up in
/// the store file.
#[inline]
fn fnv1a(key: &[u8], seed: u64) -> u64 {
    key.iter().fold(FNV_OFFSET ^ seed, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountingBloom {
    /// Number of items this stage is sized for
    pub(crate) capacity: u64,
    /// False-positive rate this stage is sized for
    pub(crate) error_rate: f64,
    /// Items currently added (adds minus removes)
    pub(crate) count: u64,
    pub(crate) nfuncs: u32,
    pub(crate) counts_per_func: u64,
    pub(crate) counters: Vec<u8>,
}

impl CountingBloom {
    /// Sizes a filter for `capacity` items at `error_rate`.
    ///
    /// Fails if the counter array would not fit in [`MAX_STAGE_COUNTERS`]
    /// or cannot be allocated.
    pub fn new(capacity: u64, error_rate: f64) -> Result<Self, StoreError> {
        let nfuncs = ((1.0 / error_rate).ln() / LN_2).ceil().max(1.0) as u32;
        let counts_per_func = ((capacity as f64 * error_rate.ln().abs())
            / (f64::from(nfuncs) * LN_2 * LN_2))
            .ceil()
            .max(1.0) as u64;

        let len = u64::from(nfuncs)
            .checked_mul(counts_per_func)
            .and_then(|len| usize::try_from(len).ok())
            .filter(|&len| len <= MAX_STAGE_COUNTERS)
            .ok_or_else(|| {
                StoreError::InvalidParameters(format!(
                    "capacity {} at error rate {} needs more than {} counters",
                    capacity, error_rate, MAX_STAGE_COUNTERS
                ))
            })?;

        let mut counters = Vec::new();
        counters.try_reserve_exact(len).map_err(|e| {
            StoreError::InvalidParameters(format!("cannot allocate {} counters: {}", len, e))
        })?;
        counters.resize(len, 0);

        Ok(Self {
            capacity,
            error_rate,
            count: 0,
            nfuncs,
            counts_per_func,
            counters,
        })
    }

    /// Counter positions for `key`, one per partition.
    fn positions(&self, key: &[u8]) -> impl Iterator<Item = usize> {
        let h1 = fnv1a(key, 0);
        let h2 = fnv1a(key, SECOND_SEED) | 1;
        let m = self.counts_per_func;

        (0..u64::from(self.nfuncs)).map(move |i| {
            let offset = h1.wrapping_add(i.wrapping_mul(h2)) % m;
            (i * m + offset) as usize
        })
    }

    /// Returns true if every counter for `key` is non-zero.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.positions(key).all(|pos| self.counters[pos] > 0)
    }

    pub fn add(&mut self, key: &[u8], delta: u32) {
        let step = u8::try_from(delta).unwrap_or(u8::MAX);
        for pos in self.positions(key) {
            self.counters[pos] = self.counters[pos].saturating_add(step);
        }
        self.count = self.count.saturating_add(u64::from(delta));
    }

    pub fn remove(&mut self, key: &[u8], delta: u32) {
        let step = u8::try_from(delta).unwrap_or(u8::MAX);
        for pos in self.positions(key) {
            let counter = &mut self.counters[pos];
            if *counter != u8::MAX {
                *counter = counter.saturating_sub(step);
            }
        }
        self.count = self.count.saturating_sub(u64::from(delta));
    }

    /// Returns true once this stage holds as many items as it was sized for.
    pub fn is_full(&self) -> bool {
        self.count >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizing() {
        let bloom = CountingBloom::new(1000, 0.01).unwrap();
        assert_eq!(bloom.nfuncs, 7);
        assert_eq!(
            bloom.counters.len() as u64,
            u64::from(bloom.nfuncs) * bloom.counts_per_func
        );
    }

    #[test]
    fn test_add_contains_remove() {
        let mut bloom = CountingBloom::new(1000, 0.01).unwrap();
        assert!(!bloom.contains(b"foo"));

        bloom.add(b"foo", 1);
        bloom.add(b"foo", 1);
        assert!(bloom.contains(b"foo"));
        assert_eq!(bloom.count, 2);

        bloom.remove(b"foo", 1);
        assert!(bloom.contains(b"foo"));
        bloom.remove(b"foo", 1);
        assert!(!bloom.contains(b"foo"));
        assert_eq!(bloom.count, 0);
    }

    #[test]
    fn test_saturated_counters_stick() {
        let mut bloom = CountingBloom::new(10, 0.1).unwrap();
        bloom.add(b"hot", 300);
        bloom.remove(b"hot", 1);
        assert!(bloom.contains(b"hot"));
    }

    #[test]
    fn test_is_full() {
        let mut bloom = CountingBloom::new(2, 0.1).unwrap();
        bloom.add(b"a", 1);
        assert!(!bloom.is_full());
        bloom.add(b"b", 1);
        assert!(bloom.is_full());
    }

    #[test]
    fn test_oversized_filter_rejected() {
        assert!(matches!(
            CountingBloom::new(u64::MAX, 0.05),
            Err(StoreError::InvalidParameters(_))
        ));
        assert!(matches!(
            CountingBloom::new(1_000_000_000_000, 0.01),
            Err(StoreError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(fnv1a(b"", 0), FNV_OFFSET);
        assert_eq!(fnv1a(b"a", 0), 0xaf63_dc4c_8601_ec8c);
    }
}
