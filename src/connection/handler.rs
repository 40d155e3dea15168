//! Connection Handler Module
//!
//! This module handles individual client connections. Each client gets its
//! own handler task that runs in a loop, reading requests and sending
//! replies.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Read request            │ │  <- idle timeout armed here
//!    │  └───────────┬─────────────┘ │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Execute command         │ │
//!    │  └───────────┬─────────────┘ │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Send reply              │ │
//!    │  └───────────┬─────────────┘ │
//!    │              ▼               │
//!    │         [Loop back]          │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. EOF / I/O error / protocol error / idle timeout
//!        │
//!        ▼
//! 5. Handler dropped, socket closed
//! ```
//!
//! The stream is owned by the handler and closed when the handler is
//! dropped at the end of [`ConnectionHandler::run`], whichever way the loop
//! ended.

use crate::commands::CommandHandler;
use crate::protocol::{ParseError, Reply, Request, RequestParser};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Default idle timeout before a silent client is dropped
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Connections closed for malformed input
    pub protocol_errors: AtomicU64,
    /// Connections closed for inactivity
    pub idle_timeouts: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
///
/// Generic over the stream so anything readable and writable can be
/// served; the server uses `TcpStream`.
pub struct ConnectionHandler<S> {
    /// Buffered stream for this connection
    stream: BufStream<S>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// The command handler (shared across connections)
    command_handler: CommandHandler,

    parser: RequestParser,

    /// How long a read may wait for the next request
    idle_timeout: Duration,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The stream for this connection
    /// * `addr` - The client's socket address
    /// * `command_handler` - The command handler for executing commands
    /// * `stats` - Shared connection statistics
    /// * `idle_timeout` - How long to wait for each request
    pub fn new(
        stream: S,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
        idle_timeout: Duration,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufStream::new(stream),
            addr,
            command_handler,
            parser: RequestParser::new(),
            idle_timeout,
            stats,
        }
    }

    /// Runs the main connection loop.
    ///
    /// Reads requests, executes them and sends back replies until the
    /// client disconnects, goes idle, sends malformed input or an I/O
    /// error occurs. Consumes the handler, so the stream is closed on
    /// return.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %self.addr, "Client disconnected")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %self.addr, "Connection reset by client")
                }
                ConnectionError::IdleTimeout(_) => {
                    self.stats.idle_timeouts.fetch_add(1, Ordering::Relaxed);
                    info!(client = %self.addr, "Closing idle connection")
                }
                ConnectionError::ParseError(_) => {
                    self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(client = %self.addr, error = %e, "Closing connection after protocol error")
                }
                _ => warn!(client = %self.addr, error = %e, "Connection error"),
            },
        }

        self.stats.connection_closed();
        result
    }

    /// The main read-execute-respond loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let request = match self.next_request().await {
                Ok(request) => request,
                Err(ConnectionError::ParseError(e)) => {
                    // Tell the client why before hanging up; the close
                    // happens regardless.
                    let reply = Reply::error(format!("ERR Protocol error: {}", e));
                    if let Err(write_err) = self.send_reply(&reply).await {
                        trace!(client = %self.addr, error = %write_err, "Could not send protocol error");
                    }
                    return Err(ConnectionError::ParseError(e));
                }
                Err(e) => return Err(e),
            };

            trace!(client = %self.addr, command = %request.name, args = request.args.len(), "Parsed request");

            let reply = self.command_handler.execute_async(request).await;
            self.stats.command_processed();

            self.send_reply(&reply).await?;
        }
    }

    /// Reads the next request, giving up after the idle timeout.
    async fn next_request(&mut self) -> Result<Request, ConnectionError> {
        let read = self.parser.read_request(&mut self.stream);

        match tokio::time::timeout(self.idle_timeout, read).await {
            Ok(Ok(Some(request))) => Ok(request),
            Ok(Ok(None)) => Err(ConnectionError::ClientDisconnected),
            Ok(Err(ParseError::Io(e))) => Err(ConnectionError::IoError(e)),
            Ok(Err(e)) => Err(ConnectionError::ParseError(e)),
            Err(_) => Err(ConnectionError::IdleTimeout(self.idle_timeout)),
        }
    }

    /// Sends a reply to the client.
    async fn send_reply(&mut self, reply: &Reply) -> Result<(), ConnectionError> {
        let bytes = reply.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(
            client = %self.addr,
            bytes = bytes.len(),
            "Sent reply"
        );
        Ok(())
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue, or the stream ended mid-request)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed request framing
    #[error("Protocol error: {0}")]
    ParseError(ParseError),

    /// Client disconnected between requests
    #[error("Client disconnected")]
    ClientDisconnected,

    /// No request arrived within the idle timeout
    #[error("Idle for more than {0:?}")]
    IdleTimeout(Duration),
}

/// Handles a client connection.
///
/// This is a convenience function that creates a ConnectionHandler
/// and runs it to completion.
///
/// # Arguments
///
/// * `stream` - The TCP stream for this connection
/// * `addr` - The client's socket address
/// * `command_handler` - The command handler for executing commands
/// * `stats` - Shared connection statistics
/// * `idle_timeout` - How long to wait for each request
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    idle_timeout: Duration,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats, idle_timeout);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}
