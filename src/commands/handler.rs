//! Command Handler Module
//!
//! Maps each parsed [`Request`] onto calls against the shared
//! [`CountingStore`] and builds the reply.
//!
//! ## Supported Commands
//!
//! | Command                | Store calls                     | Reply            |
//! |------------------------|---------------------------------|------------------|
//! | `SET key`              | add                             | `+1`             |
//! | `SETNX key`            | check, add if absent            | `+1`             |
//! | `GET key`              | drain, then add back            | `:<count>`       |
//! | `DEL key`              | drain                           | `+1`             |
//! | `EXISTS key`           | check                           | `:1` / `:0`      |
//! | `MGET key [key ...]`   | check per key                   | `*N` of `$1` 1/0 |
//! | `SAVE`                 | flush                           | `+1`             |
//! | anything else          | none                            | `+OK`            |
//!
//! ## Reading a Count
//!
//! The store cannot report a count, only whether a key is present. A count
//! is discovered by removing one occurrence at a time until the key stops
//! showing up, capped at [`MAX_COUNT_PROBES`] removals. GET adds the same
//! number back; DEL leaves the key drained. Counts above the cap are
//! reported as the cap.

use crate::commands::locks::KeyLocks;
use crate::protocol::{Reply, Request};
use crate::storage::{CountingStore, StoreError};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tracing::{error, trace};

/// Most removals a single GET or DEL will issue.
pub const MAX_COUNT_PROBES: usize = 16;

/// Executes requests against the shared store.
///
/// Cheap to clone; every clone shares the same store and key locks.
#[derive(Clone)]
pub struct CommandHandler {
    /// The shared store
    store: Arc<dyn CountingStore>,
    /// Serializes multi-call commands per key
    locks: Arc<KeyLocks>,
}

impl CommandHandler {
    /// Creates a new command handler over the given store.
    pub fn new(store: Arc<dyn CountingStore>) -> Self {
        Self {
            store,
            locks: Arc::new(KeyLocks::new()),
        }
    }

    /// Executes a request and returns the reply.
    pub fn execute(&self, request: Request) -> Reply {
        self.dispatch(&request.name, &request.args)
    }

    /// Executes a request from async code.
    ///
    /// SAVE writes a file, so it runs on the blocking pool; every other
    /// command runs inline.
    pub async fn execute_async(&self, request: Request) -> Reply {
        if request.name == "SAVE" {
            return save_reply(self.save_async().await);
        }
        self.execute(request)
    }

    /// Dispatches a command to its handler.
    fn dispatch(&self, cmd: &str, args: &[Bytes]) -> Reply {
        match cmd {
            "SET" => self.cmd_set(args),
            "SETNX" => self.cmd_setnx(args),
            "GET" => self.cmd_get(args),
            "DEL" => self.cmd_del(args),
            "EXISTS" => self.cmd_exists(args),
            "MGET" => self.cmd_mget(args),
            "SAVE" => self.cmd_save(),

            // Unknown commands are accepted and ignored
            _ => Reply::ok(),
        }
    }

    /// Extracts the key every single-key command takes as its first argument.
    fn key<'a>(cmd: &str, args: &'a [Bytes]) -> Result<&'a [u8], Reply> {
        args.first()
            .map(|key| key.as_ref())
            .ok_or_else(|| wrong_arity(cmd))
    }

    /// Removes one occurrence at a time while the key is still present.
    ///
    /// Returns how many removals happened, at most [`MAX_COUNT_PROBES`].
    /// The caller must hold the key's lock.
    fn drain(&self, key: &[u8]) -> usize {
        let mut removed = 0;
        while removed < MAX_COUNT_PROBES && self.store.check(key) {
            self.store.remove(key, 1);
            removed += 1;
        }
        removed
    }

    /// SET key
    fn cmd_set(&self, args: &[Bytes]) -> Reply {
        let key = match Self::key("SET", args) {
            Ok(key) => key,
            Err(reply) => return reply,
        };

        let _guard = self.locks.lock(key);
        self.store.add(key, 1);
        Reply::one()
    }

    /// SETNX key
    fn cmd_setnx(&self, args: &[Bytes]) -> Reply {
        let key = match Self::key("SETNX", args) {
            Ok(key) => key,
            Err(reply) => return reply,
        };

        let _guard = self.locks.lock(key);
        if !self.store.check(key) {
            self.store.add(key, 1);
        }
        Reply::one()
    }

    /// GET key
    fn cmd_get(&self, args: &[Bytes]) -> Reply {
        let key = match Self::key("GET", args) {
            Ok(key) => key,
            Err(reply) => return reply,
        };

        let _guard = self.locks.lock(key);
        let count = self.drain(key);
        for _ in 0..count {
            self.store.add(key, 1);
        }

        trace!(count, "Counted key");
        Reply::integer(count as i64)
    }

    /// DEL key
    fn cmd_del(&self, args: &[Bytes]) -> Reply {
        let key = match Self::key("DEL", args) {
            Ok(key) => key,
            Err(reply) => return reply,
        };

        let _guard = self.locks.lock(key);
        let removed = self.drain(key);

        trace!(removed, "Drained key");
        Reply::one()
    }

    /// EXISTS key
    fn cmd_exists(&self, args: &[Bytes]) -> Reply {
        let key = match Self::key("EXISTS", args) {
            Ok(key) => key,
            Err(reply) => return reply,
        };

        let _guard = self.locks.lock(key);
        Reply::integer(i64::from(self.store.check(key)))
    }

    /// MGET key [key ...]
    fn cmd_mget(&self, args: &[Bytes]) -> Reply {
        if args.is_empty() {
            return wrong_arity("MGET");
        }

        let flags = args
            .iter()
            .map(|key| {
                let _guard = self.locks.lock(key);
                Reply::flag(self.store.check(key))
            })
            .collect();

        Reply::array(flags)
    }

    /// Flushes the store while no command is touching any key.
    pub fn save(&self) -> Result<(), StoreError> {
        let _guards = self.locks.lock_all();
        self.store.flush()
    }

    /// Runs [`save`](Self::save) on the blocking thread pool.
    pub async fn save_async(&self) -> Result<(), StoreError> {
        let handler = self.clone();
        tokio::task::spawn_blocking(move || handler.save())
            .await
            .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    /// SAVE
    fn cmd_save(&self) -> Reply {
        save_reply(self.save())
    }
}

fn save_reply(result: Result<(), StoreError>) -> Reply {
    match result {
        Ok(()) => Reply::one(),
        Err(e) => {
            error!(error = %e, "Failed to flush store");
            Reply::error(format!("ERR {}", e))
        }
    }
}

fn wrong_arity(cmd: &str) -> Reply {
    Reply::error(format!(
        "ERR wrong number of arguments for '{}' command",
        cmd
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ScalingBloom;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    /// Exact-count store that records how often each primitive was called.
    #[derive(Default)]
    struct RecordingStore {
        counts: Mutex<HashMap<Vec<u8>, u32>>,
        adds: AtomicUsize,
        removes: AtomicUsize,
        flushes: AtomicUsize,
        fail_flush: bool,
        flush_delay: Duration,
    }

    impl RecordingStore {
        fn with_count(key: &[u8], count: u32) -> Self {
            let store = Self::default();
            store.counts.lock().unwrap().insert(key.to_vec(), count);
            store
        }

        fn count(&self, key: &[u8]) -> u32 {
            self.counts.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    impl CountingStore for RecordingStore {
        fn check(&self, key: &[u8]) -> bool {
            self.count(key) > 0
        }

        fn add(&self, key: &[u8], delta: u32) {
            self.adds.fetch_add(1, Ordering::SeqCst);
            *self.counts.lock().unwrap().entry(key.to_vec()).or_insert(0) += delta;
        }

        fn remove(&self, key: &[u8], delta: u32) {
            self.removes.fetch_add(1, Ordering::SeqCst);
            if let Some(count) = self.counts.lock().unwrap().get_mut(key) {
                *count = count.saturating_sub(delta);
            }
        }

        fn flush(&self) -> Result<(), StoreError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.flush_delay);
            if self.fail_flush {
                return Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "read-only",
                )));
            }
            Ok(())
        }
    }

    fn create_handler() -> CommandHandler {
        let path = std::env::temp_dir().join(format!("bloomkv-cmd-{}.bin", std::process::id()));
        let store = ScalingBloom::new(10_000, 0.01, path).unwrap();
        CommandHandler::new(Arc::new(store))
    }

    fn make_request(args: &[&str]) -> Request {
        Request::new(
            args[0],
            args[1..]
                .iter()
                .map(|s| Bytes::from(s.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_set_get() {
        let handler = create_handler();

        let response = handler.execute(make_request(&["SET", "foo"]));
        assert_eq!(response, Reply::one());

        let first = handler.execute(make_request(&["GET", "foo"]));
        let count = first.as_integer().unwrap();
        assert!((1..=16).contains(&count));

        let second = handler.execute(make_request(&["GET", "foo"]));
        assert_eq!(second, first);
    }

    #[test]
    fn test_get_counts_repeated_sets() {
        let handler = create_handler();
        for _ in 0..3 {
            handler.execute(make_request(&["SET", "page:home", "ignored"]));
        }
        let response = handler.execute(make_request(&["GET", "page:home"]));
        assert_eq!(response, Reply::integer(3));
    }

    #[test]
    fn test_get_nonexistent() {
        let handler = create_handler();
        let response = handler.execute(make_request(&["GET", "missing"]));
        assert_eq!(response, Reply::integer(0));
    }

    #[test]
    fn test_get_caps_removals() {
        let store = Arc::new(RecordingStore::with_count(b"hot", 40));
        let handler = CommandHandler::new(store.clone());

        let response = handler.execute(make_request(&["GET", "hot"]));
        assert_eq!(response, Reply::integer(16));
        assert_eq!(store.removes.load(Ordering::SeqCst), MAX_COUNT_PROBES);
        assert_eq!(store.adds.load(Ordering::SeqCst), MAX_COUNT_PROBES);
        assert_eq!(store.count(b"hot"), 40);
    }

    #[test]
    fn test_del_then_exists() {
        let handler = create_handler();
        for _ in 0..5 {
            handler.execute(make_request(&["SET", "foo"]));
        }

        let response = handler.execute(make_request(&["DEL", "foo"]));
        assert_eq!(response, Reply::one());

        let response = handler.execute(make_request(&["EXISTS", "foo"]));
        assert_eq!(response, Reply::integer(0));
    }

    #[test]
    fn test_del_drains_at_most_cap() {
        let store = Arc::new(RecordingStore::with_count(b"hot", 20));
        let handler = CommandHandler::new(store.clone());

        handler.execute(make_request(&["DEL", "hot"]));
        assert_eq!(store.count(b"hot"), 4);
        assert_eq!(store.adds.load(Ordering::SeqCst), 0);
        assert_eq!(store.removes.load(Ordering::SeqCst), MAX_COUNT_PROBES);
    }

    #[test]
    fn test_exists_and_setnx() {
        let handler = create_handler();

        let response = handler.execute(make_request(&["EXISTS", "fresh"]));
        assert_eq!(response, Reply::integer(0));

        let response = handler.execute(make_request(&["SETNX", "fresh"]));
        assert_eq!(response, Reply::one());

        let response = handler.execute(make_request(&["EXISTS", "fresh"]));
        assert_eq!(response, Reply::integer(1));
    }

    #[test]
    fn test_setnx_does_not_increment_present_key() {
        let store = Arc::new(RecordingStore::default());
        let handler = CommandHandler::new(store.clone());

        handler.execute(make_request(&["SETNX", "once"]));
        let response = handler.execute(make_request(&["SETNX", "once"]));
        assert_eq!(response, Reply::one());
        assert_eq!(store.count(b"once"), 1);
    }

    #[test]
    fn test_mget() {
        let handler = create_handler();
        handler.execute(make_request(&["SET", "a"]));
        handler.execute(make_request(&["SET", "b"]));

        let response = handler.execute(make_request(&["MGET", "a", "b", "c"]));
        assert_eq!(
            response,
            Reply::array(vec![Reply::flag(true), Reply::flag(true), Reply::flag(false)])
        );
        assert_eq!(
            response.serialize(),
            b"*3\r\n$1\r\n1\r\n$1\r\n1\r\n$1\r\n0\r\n"
        );
    }

    #[test]
    fn test_save_flushes_once() {
        let store = Arc::new(RecordingStore::default());
        let handler = CommandHandler::new(store.clone());

        let response = handler.execute(make_request(&["SAVE"]));
        assert_eq!(response, Reply::one());
        assert_eq!(store.flushes.load(Ordering::SeqCst), 1);

        handler.execute(make_request(&["SAVE"]));
        assert_eq!(store.flushes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_save_failure_is_reported() {
        let store = Arc::new(RecordingStore {
            fail_flush: true,
            ..Default::default()
        });
        let handler = CommandHandler::new(store);

        let response = handler.execute(make_request(&["SAVE"]));
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_save_does_not_block_runtime() {
        let store = Arc::new(RecordingStore {
            flush_delay: Duration::from_millis(300),
            ..Default::default()
        });
        let handler = CommandHandler::new(store.clone());

        let save = tokio::spawn({
            let handler = handler.clone();
            async move { handler.execute_async(make_request(&["SAVE"])).await }
        });

        // The current-thread runtime only gets back here if the flush is
        // not running on it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!save.is_finished());

        assert_eq!(save.await.unwrap(), Reply::one());
        assert_eq!(store.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_async_runs_other_commands_inline() {
        let store = Arc::new(RecordingStore::default());
        let handler = CommandHandler::new(store.clone());

        let response = handler.execute_async(make_request(&["SET", "k"])).await;
        assert_eq!(response, Reply::one());
        let response = handler.execute_async(make_request(&["GET", "k"])).await;
        assert_eq!(response, Reply::integer(1));
        assert_eq!(store.flushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_save_async_reports_failure() {
        let store = Arc::new(RecordingStore {
            fail_flush: true,
            ..Default::default()
        });
        let handler = CommandHandler::new(store);

        assert!(matches!(handler.save_async().await, Err(StoreError::Io(_))));
        let response = handler.execute_async(make_request(&["SAVE"])).await;
        assert!(response.is_error());
    }

    #[test]
    fn test_unknown_command() {
        let handler = create_handler();
        assert_eq!(handler.execute(make_request(&["PING"])), Reply::ok());
        assert_eq!(handler.execute(Request::new("", vec![])), Reply::ok());
    }

    #[test]
    fn test_missing_key() {
        let handler = create_handler();
        for cmd in ["SET", "SETNX", "GET", "DEL", "EXISTS", "MGET"] {
            let response = handler.execute(make_request(&[cmd]));
            assert_eq!(
                response,
                Reply::error(format!("ERR wrong number of arguments for '{}' command", cmd))
            );
        }
    }

    #[test]
    fn test_concurrent_get_and_set_keep_count() {
        let store = Arc::new(RecordingStore::default());
        let handler = CommandHandler::new(store.clone());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handler = handler.clone();
                thread::spawn(move || {
                    for _ in 0..3 {
                        handler.execute(make_request(&["SET", "shared"]));
                        handler.execute(make_request(&["GET", "shared"]));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(store.count(b"shared"), 12);
        let response = handler.execute(make_request(&["GET", "shared"]));
        assert_eq!(response, Reply::integer(12));
    }
}
