//! TCP Server
//!
//! Binds the listener and runs the accept loop. Every accepted connection
//! gets its own task; the loop itself never waits on a client.

use crate::commands::CommandHandler;
use crate::connection::{handle_connection, ConnectionStats};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Pause after a failed accept so a persistent failure does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Startup failures. All of them are fatal.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },

    #[error("{0} does not resolve to an IPv4 address")]
    NoIpv4Address(String),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
}

/// Resolves `addr` to its first IPv4 address and binds a listener there.
pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    let resolved = tokio::net::lookup_host(addr)
        .await
        .map_err(|source| ServerError::Resolve {
            addr: addr.to_string(),
            source,
        })?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| ServerError::NoIpv4Address(addr.to_string()))?;

    TcpListener::bind(resolved)
        .await
        .map_err(|source| ServerError::Bind {
            addr: resolved,
            source,
        })
}

/// A bound listener plus everything each connection needs.
pub struct Server {
    listener: TcpListener,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    idle_timeout: Duration,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            command_handler,
            stats,
            idle_timeout,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Listening on {}", addr);
        }

        let listener = &self.listener;
        loop {
            let (stream, addr) = next_connection(move || listener.accept()).await;

            let handler = self.command_handler.clone();
            let stats = Arc::clone(&self.stats);
            let idle_timeout = self.idle_timeout;

            // Spawn a task to handle this connection
            tokio::spawn(async move {
                handle_connection(stream, addr, handler, stats, idle_timeout).await;
            });
        }
    }
}

/// Calls `accept` until it succeeds, logging each failure and pausing
/// [`ACCEPT_BACKOFF`] before the next attempt.
async fn next_connection<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DEFAULT_IDLE_TIMEOUT;
    use crate::storage::ScalingBloom;
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start_server() -> (SocketAddr, Arc<ConnectionStats>) {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let path = std::env::temp_dir().join(format!(
            "bloomkv-server-{}-{}.bin",
            listener.local_addr().unwrap().port(),
            std::process::id()
        ));
        let store = Arc::new(ScalingBloom::new(10_000, 0.01, path).unwrap());
        let stats = Arc::new(ConnectionStats::new());

        let server = Server::new(
            listener,
            CommandHandler::new(store),
            Arc::clone(&stats),
            DEFAULT_IDLE_TIMEOUT,
        );
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        (addr, stats)
    }

    async fn roundtrip(client: &mut TcpStream, request: &[u8], expected: &[u8]) {
        client.write_all(request).await.unwrap();
        let mut buf = vec![0u8; expected.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_connections_share_one_store() {
        let (addr, stats) = start_server().await;

        let mut writer = TcpStream::connect(addr).await.unwrap();
        let mut reader = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut writer, b"SET shared\r\n", b"+1\r\n").await;
        roundtrip(&mut writer, b"SET shared\r\n", b"+1\r\n").await;
        roundtrip(&mut reader, b"GET shared\r\n", b":2\r\n").await;
        roundtrip(&mut reader, b"DEL shared\r\n", b"+1\r\n").await;
        roundtrip(&mut writer, b"EXISTS shared\r\n", b":0\r\n").await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_many_concurrent_clients() {
        let (addr, _) = start_server().await;

        let clients: Vec<_> = (0..8)
            .map(|i| {
                tokio::spawn(async move {
                    let mut client = TcpStream::connect(addr).await.unwrap();
                    let key = format!("client:{}", i);
                    let set = format!("*2\r\n$3\r\nSET\r\n${}\r\n{}\r\n", key.len(), key);
                    roundtrip(&mut client, set.as_bytes(), b"+1\r\n").await;
                    let get = format!("GET {}\r\n", key);
                    roundtrip(&mut client, get.as_bytes(), b":1\r\n").await;
                })
            })
            .collect();

        for client in clients {
            client.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_back_off_and_retry() {
        let mut attempts = 0;
        let started = tokio::time::Instant::now();

        let accepted = next_connection(|| {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt < 3 {
                    Err(io::Error::from(io::ErrorKind::ConnectionAborted))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(accepted, 3);
        assert!(started.elapsed() >= ACCEPT_BACKOFF * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_success_has_no_delay() {
        let started = tokio::time::Instant::now();
        let accepted = next_connection(|| async { Ok::<_, io::Error>("client") }).await;

        assert_eq!(accepted, "client");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_bind_requires_ipv4() {
        let result = bind("[::1]:0").await;
        assert!(matches!(result, Err(ServerError::NoIpv4Address(_))));
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let first = bind("127.0.0.1:0").await.unwrap();
        let taken = first.local_addr().unwrap().to_string();

        let result = bind(&taken).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_bad_address() {
        let result = bind("not an address").await;
        assert!(matches!(result, Err(ServerError::Resolve { .. })));
    }
}
