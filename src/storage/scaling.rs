//! Scaling Counting Bloom Filter
//!
//! A chain of [`CountingBloom`] stages. New items always go into the newest
//! stage; once that stage has taken `capacity` items a fresh one is
//! appended. Stage `i` is sized for `error_rate * (1 - r) * r^i` with
//! `r = 0.9`, so the false-positive rates of all stages sum to at most
//! `error_rate`.
//!
//! ## File Format
//!
//! All integers little-endian:
//!
//! ```text
//! magic "BKVS" | version u8 | capacity u64 | error_rate f64 | stages u32
//! per stage: capacity u64 | error_rate f64 | count u64
//!            | nfuncs u32 | counts_per_func u64 | counters [u8]
//! ```

use super::counting::{CountingBloom, MAX_STAGE_COUNTERS};
use super::{CountingStore, StoreError};
use bytes::{Buf, BufMut, BytesMut};
use std::fs;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"BKVS";
const FORMAT_VERSION: u8 = 1;

/// Ratio between the error rates of consecutive stages
const TIGHTENING_RATIO: f64 = 0.9;

/// Upper bound on hash functions accepted from a file
const MAX_FUNCS: u32 = 64;

fn stage_error_rate(error_rate: f64, stage: usize) -> f64 {
    error_rate * (1.0 - TIGHTENING_RATIO) * TIGHTENING_RATIO.powi(stage as i32)
}

/// A growable counting bloom filter backed by a file.
///
/// All access goes through one `RwLock`: membership checks share it, adds,
/// removes and flushes serialize on it.
///
/// # Example
///
/// ```
/// use bloomkv::storage::{CountingStore, ScalingBloom};
///
/// let store = ScalingBloom::new(1000, 0.01, "/tmp/bloomkv-doc.bin").unwrap();
/// store.add(b"foo", 1);
/// assert!(store.check(b"foo"));
/// store.remove(b"foo", 1);
/// assert!(!store.check(b"foo"));
/// ```
#[derive(Debug)]
pub struct ScalingBloom {
    capacity: u64,
    error_rate: f64,
    path: PathBuf,
    stages: RwLock<Vec<CountingBloom>>,
}

impl ScalingBloom {
    /// Creates an empty filter that will persist to `path`.
    ///
    /// Nothing is written until the first [`flush`](CountingStore::flush).
    pub fn new(capacity: u64, error_rate: f64, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        validate(capacity, error_rate)?;
        let first = CountingBloom::new(capacity, stage_error_rate(error_rate, 0))?;

        Ok(Self {
            capacity,
            error_rate,
            path: path.into(),
            stages: RwLock::new(vec![first]),
        })
    }

    /// Loads a filter previously flushed to `path`.
    ///
    /// Loaded stages keep the sizing they were written with; `capacity` and
    /// `error_rate` apply to stages added from now on.
    pub fn from_file(capacity: u64, error_rate: f64, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        validate(capacity, error_rate)?;
        let path = path.into();

        let raw = fs::read(&path)?;
        let stages = decode(&raw)?;
        info!(path = %path.display(), stages = stages.len(), "Loaded store from file");

        Ok(Self {
            capacity,
            error_rate,
            path,
            stages: RwLock::new(stages),
        })
    }

    /// Loads `path` if it exists, otherwise starts empty.
    pub fn open(capacity: u64, error_rate: f64, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if path.try_exists()? {
            Self::from_file(capacity, error_rate, path)
        } else {
            info!(path = %path.display(), "No store file found, starting empty");
            Self::new(capacity, error_rate, path)
        }
    }

    /// Number of stages currently in the chain.
    pub fn stage_count(&self) -> usize {
        self.stages.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl CountingStore for ScalingBloom {
    fn check(&self, key: &[u8]) -> bool {
        let stages = self.stages.read().unwrap_or_else(PoisonError::into_inner);
        stages.iter().any(|stage| stage.contains(key))
    }

    fn add(&self, key: &[u8], delta: u32) {
        let mut stages = self.stages.write().unwrap_or_else(PoisonError::into_inner);

        if stages.last().map_or(true, CountingBloom::is_full) {
            let error_rate = stage_error_rate(self.error_rate, stages.len());
            match CountingBloom::new(self.capacity, error_rate) {
                Ok(stage) => {
                    stages.push(stage);
                    debug!(stages = stages.len(), error_rate, "Added store stage");
                }
                Err(e) => warn!(error = %e, "Cannot add store stage, newest stage keeps filling"),
            }
        }

        if let Some(newest) = stages.last_mut() {
            newest.add(key, delta);
        }
    }

    fn remove(&self, key: &[u8], delta: u32) {
        let mut stages = self.stages.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(stage) = stages.iter_mut().rev().find(|stage| stage.contains(key)) {
            stage.remove(key, delta);
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        let image = {
            let stages = self.stages.read().unwrap_or_else(PoisonError::into_inner);
            encode(self.capacity, self.error_rate, &stages)
        };

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, &image)?;
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), bytes = image.len(), "Flushed store");
        Ok(())
    }
}

fn validate(capacity: u64, error_rate: f64) -> Result<(), StoreError> {
    if capacity == 0 {
        return Err(StoreError::InvalidParameters(
            "capacity must be greater than zero".to_string(),
        ));
    }
    if !(error_rate > 0.0 && error_rate < 1.0) {
        return Err(StoreError::InvalidParameters(format!(
            "error_rate must be between 0 and 1, got {}",
            error_rate
        )));
    }
    Ok(())
}

fn encode(capacity: u64, error_rate: f64, stages: &[CountingBloom]) -> BytesMut {
    let size: usize = stages.iter().map(|s| 36 + s.counters.len()).sum();
    let mut buf = BytesMut::with_capacity(25 + size);

    buf.put_slice(MAGIC);
    buf.put_u8(FORMAT_VERSION);
    buf.put_u64_le(capacity);
    buf.put_f64_le(error_rate);
    buf.put_u32_le(stages.len() as u32);

    for stage in stages {
        buf.put_u64_le(stage.capacity);
        buf.put_f64_le(stage.error_rate);
        buf.put_u64_le(stage.count);
        buf.put_u32_le(stage.nfuncs);
        buf.put_u64_le(stage.counts_per_func);
        buf.put_slice(&stage.counters);
    }

    buf
}

fn decode(mut buf: &[u8]) -> Result<Vec<CountingBloom>, StoreError> {
    ensure(buf, 25, "header")?;
    if &buf[..4] != MAGIC {
        return Err(StoreError::Corrupt("bad magic".to_string()));
    }
    buf.advance(4);

    let version = buf.get_u8();
    if version != FORMAT_VERSION {
        return Err(StoreError::Corrupt(format!("unsupported version {}", version)));
    }
    let _capacity = buf.get_u64_le();
    let _error_rate = buf.get_f64_le();
    let count = buf.get_u32_le();

    let mut stages = Vec::with_capacity(count.min(1024) as usize);
    for i in 0..count {
        ensure(buf, 36, "stage header")?;
        let capacity = buf.get_u64_le();
        let error_rate = buf.get_f64_le();
        let items = buf.get_u64_le();
        let nfuncs = buf.get_u32_le();
        let counts_per_func = buf.get_u64_le();

        if nfuncs == 0 || nfuncs > MAX_FUNCS || counts_per_func == 0 {
            return Err(StoreError::Corrupt(format!("stage {} has invalid sizing", i)));
        }
        let len = u64::from(nfuncs)
            .checked_mul(counts_per_func)
            .and_then(|len| usize::try_from(len).ok())
            .filter(|&len| len <= MAX_STAGE_COUNTERS)
            .ok_or_else(|| StoreError::Corrupt(format!("stage {} is too large", i)))?;
        ensure(buf, len, "counters")?;

        stages.push(CountingBloom {
            capacity,
            error_rate,
            count: items,
            nfuncs,
            counts_per_func,
            counters: buf[..len].to_vec(),
        });
        buf.advance(len);
    }

    if buf.has_remaining() {
        return Err(StoreError::Corrupt(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }
    if stages.is_empty() {
        return Err(StoreError::Corrupt("no stages".to_string()));
    }

    Ok(stages)
}

fn ensure(buf: &[u8], needed: usize, what: &str) -> Result<(), StoreError> {
    if buf.remaining() < needed {
        return Err(StoreError::Corrupt(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}
