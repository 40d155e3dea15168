//! Request and Reply Types
//!
//! A [`Request`] is what the parser hands to the command handler: an
//! uppercased command name plus the raw argument bytes. A [`Reply`] is what
//! the command handler hands back, and knows how to put itself on the wire.
//!
//! ## Reply Formats
//!
//! - `+` Status: `+OK\r\n`, `+1\r\n`
//! - `-` Error: `-ERR wrong number of arguments for 'GET' command\r\n`
//! - `:` Integer: `:3\r\n`
//! - `$` Bulk String: `$1\r\n1\r\n`
//! - `*` Array: `*2\r\n$1\r\n1\r\n$1\r\n0\r\n`

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used on the wire
pub const CRLF: &[u8] = b"\r\n";

/// Type prefixes for request and reply lines
pub mod prefix {
    pub const STATUS: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A single parsed client command.
///
/// Built fresh for every command read off a connection and dropped once
/// it has been dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command token, uppercased
    pub name: String,
    /// Remaining arguments, byte-for-byte as received
    pub args: Vec<Bytes>,
}

impl Request {
    /// Creates a request, uppercasing the command name.
    pub fn new(name: impl AsRef<str>, args: Vec<Bytes>) -> Self {
        Self {
            name: name.as_ref().to_uppercase(),
            args,
        }
    }
}

/// A reply sent back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Single-line status.
    /// Format: `+<token>\r\n`
    Status(String),

    /// Single-line error.
    /// Format: `-<message>\r\n`
    Error(String),

    /// Signed integer.
    /// Format: `:<n>\r\n`
    Integer(i64),

    /// Binary-safe string.
    /// Format: `$<length>\r\n<data>\r\n`
    Bulk(Bytes),

    /// Sequence of replies.
    /// Format: `*<count>\r\n<element1><element2>...`
    Array(Vec<Reply>),
}

impl Reply {
    /// Creates a status reply.
    ///
    /// # Example
    /// ```
    /// use bloomkv::protocol::types::Reply;
    /// assert_eq!(Reply::status("1").serialize(), b"+1\r\n");
    /// ```
    pub fn status(s: impl Into<String>) -> Self {
        Reply::Status(s.into())
    }

    /// Creates an error reply.
    pub fn error(s: impl Into<String>) -> Self {
        Reply::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        Reply::Integer(n)
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    pub fn array(values: Vec<Reply>) -> Self {
        Reply::Array(values)
    }

    /// `+1`, the acknowledgement for every mutating command
    pub fn one() -> Self {
        Reply::Status("1".to_string())
    }

    /// `+OK`, the reply to commands the server does not know
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    /// `$1\r\n1\r\n` or `$1\r\n0\r\n`
    pub fn flag(present: bool) -> Self {
        Reply::bulk(Bytes::from_static(if present { b"1" } else { b"0" }))
    }

    /// Serializes the reply to its wire format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the reply into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Status(s) => {
                buf.push(prefix::STATUS);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Bulk(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            Reply::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Returns true if this reply is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(s) => write!(f, "(error) {}", s),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            Reply::Array(values) => {
                if values.is_empty() {
                    write!(f, "(empty array)")
                } else {
                    for (i, v) in values.iter().enumerate() {
                        writeln!(f, "{}) {}", i + 1, v)?;
                    }
                    Ok(())
                }
            }
        }
    }
}
