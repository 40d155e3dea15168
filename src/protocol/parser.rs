//! Streaming Request Parser
//!
//! This module reads one [`Request`] at a time straight off a buffered
//! reader. Two request forms are accepted, told apart by the first byte of
//! the first line:
//!
//! - **Multibulk**: `*<N>\r\n` followed by N arguments, each encoded as
//!   `$<L>\r\n<L bytes>\r\n`. The first argument is the command name.
//! - **Inline**: anything else. The line is split on spaces; the first token
//!   is the command name.
//!
//! ## How the Parser Works
//!
//! `read_request` returns:
//! - `Ok(Some(request))` - A complete request was read
//! - `Ok(None)` - The stream ended cleanly before the first byte of a request
//! - `Err(ParseError::Io(_))` - The stream failed or ended inside a request
//! - `Err(_)` otherwise - The client sent malformed framing
//!
//! Every argument is read on its own, so a request is never buffered in full
//! before parsing starts; partial reads are handled by the reader.

use crate::protocol::types::{prefix, Request, CRLF};
use bytes::Bytes;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Errors that can occur while reading a request.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The underlying stream failed or ended mid-request
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A framing line did not have the expected shape
    #[error("expected {expected}, got {got:?}")]
    Protocol { expected: &'static str, got: String },

    /// The stream ended before a declared argument was complete
    #[error("truncated argument: expected {expected} bytes followed by CRLF")]
    Truncated { expected: usize },

    /// A bulk argument declared more bytes than allowed
    #[error("argument too large: {size} bytes (max: {max})")]
    ArgumentTooLarge { size: usize, max: usize },

    /// A line ran past the allowed length without a newline
    #[error("line too long (max: {max} bytes)")]
    LineTooLong { max: usize },
}

impl ParseError {
    fn protocol(expected: &'static str, got: &[u8]) -> Self {
        ParseError::Protocol {
            expected,
            got: String::from_utf8_lossy(got).into_owned(),
        }
    }

    /// Returns true if the client sent malformed input, false if the
    /// stream itself failed.
    pub fn is_protocol(&self) -> bool {
        !matches!(self, ParseError::Io(_))
    }
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk argument (512 MB)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum length of a single request line, CRLF included (64 KB)
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Maximum number of elements in a multibulk request
pub const MAX_MULTIBULK_LENGTH: usize = 1024 * 1024;

/// Up-front allocation cap for an argument buffer; larger arguments grow as
/// their bytes arrive.
const INITIAL_ARG_CAPACITY: usize = 4096;

/// Reads requests in either wire form from a buffered reader.
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// use bloomkv::protocol::RequestParser;
///
/// let parser = RequestParser::new();
/// let mut input: &[u8] = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
///
/// let request = parser.read_request(&mut input).await.unwrap().unwrap();
/// assert_eq!(request.name, "GET");
/// assert_eq!(request.args, vec![bytes::Bytes::from("foo")]);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct RequestParser {
    max_bulk_size: usize,
    max_line_length: usize,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    /// Creates a parser with the default limits.
    pub fn new() -> Self {
        Self {
            max_bulk_size: MAX_BULK_SIZE,
            max_line_length: MAX_LINE_LENGTH,
        }
    }

    /// Overrides the largest bulk argument the parser will accept.
    pub fn with_max_bulk_size(mut self, max: usize) -> Self {
        self.max_bulk_size = max;
        self
    }

    /// Reads the next request from `reader`.
    pub async fn read_request<R>(&self, reader: &mut R) -> ParseResult<Option<Request>>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = match self.read_line(reader).await? {
            Some(line) => line,
            None => return Ok(None),
        };

        if line.first() == Some(&prefix::ARRAY) {
            self.read_multibulk(reader, &line).await.map(Some)
        } else {
            Ok(Some(parse_inline(&line)))
        }
    }

    /// Reads the arguments announced by a `*<N>` line.
    async fn read_multibulk<R>(&self, reader: &mut R, header: &[u8]) -> ParseResult<Request>
    where
        R: AsyncBufRead + Unpin,
    {
        let count = parse_length_line(header, prefix::ARRAY)
            .ok_or_else(|| ParseError::protocol("'*<count>\\r\\n'", header))?;

        if count == 0 || count > MAX_MULTIBULK_LENGTH {
            return Err(ParseError::protocol(
                "argument count between 1 and 1048576",
                header,
            ));
        }

        let name = self.read_bulk(reader).await?;
        let mut args = Vec::with_capacity((count - 1).min(64));
        for _ in 1..count {
            args.push(self.read_bulk(reader).await?);
        }

        Ok(Request::new(String::from_utf8_lossy(&name), args))
    }

    /// Reads one `$<L>\r\n<bytes>\r\n` argument.
    async fn read_bulk<R>(&self, reader: &mut R) -> ParseResult<Bytes>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = self
            .read_line(reader)
            .await?
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;

        let length = parse_length_line(&line, prefix::BULK_STRING)
            .ok_or_else(|| ParseError::protocol("'$<length>\\r\\n'", &line))?;

        if length > self.max_bulk_size {
            return Err(ParseError::ArgumentTooLarge {
                size: length,
                max: self.max_bulk_size,
            });
        }

        let mut data = Vec::with_capacity(length.min(INITIAL_ARG_CAPACITY));
        (&mut *reader)
            .take(length as u64)
            .read_to_end(&mut data)
            .await?;
        if data.len() < length {
            return Err(ParseError::Truncated { expected: length });
        }

        let mut terminator = [0u8; 2];
        match reader.read_exact(&mut terminator).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ParseError::Truncated { expected: length });
            }
            Err(e) => return Err(e.into()),
        }
        if terminator != CRLF {
            return Err(ParseError::protocol("CRLF after argument", &terminator));
        }

        Ok(Bytes::from(data))
    }

    /// Reads one newline-terminated line, newline included.
    ///
    /// Returns `None` if the stream is already at its end.
    async fn read_line<R>(&self, reader: &mut R) -> ParseResult<Option<Vec<u8>>>
    where
        R: AsyncBufRead + Unpin,
    {
        let limit = self.max_line_length as u64;
        let mut line = Vec::new();
        let n = (&mut *reader)
            .take(limit)
            .read_until(b'\n', &mut line)
            .await?;

        if n == 0 {
            return Ok(None);
        }

        if line.last() != Some(&b'\n') {
            if n as u64 >= limit {
                return Err(ParseError::LineTooLong {
                    max: self.max_line_length,
                });
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        Ok(Some(line))
    }
}

/// Parses `<prefix><digits>\r\n` into the number it carries.
fn parse_length_line(line: &[u8], expected_prefix: u8) -> Option<usize> {
    let digits = line
        .strip_prefix(&[expected_prefix])?
        .strip_suffix(CRLF)?;

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }

    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Splits an inline command line into a request.
fn parse_inline(line: &[u8]) -> Request {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    // Every single space is a boundary, so doubled spaces yield empty tokens.
    let mut tokens = line.split(|&b| b == b' ');

    let name = tokens
        .next()
        .map(|token| String::from_utf8_lossy(token).into_owned())
        .unwrap_or_default();
    let args = tokens.map(Bytes::copy_from_slice).collect();

    Request::new(name, args)
}

/// Convenience helper that reads one request with the default limits.
pub async fn read_request<R>(reader: &mut R) -> ParseResult<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    RequestParser::new().read_request(reader).await
}
