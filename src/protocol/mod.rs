//! Wire Protocol Implementation
//!
//! This module covers both directions of the wire protocol: reading client
//! requests (multibulk or inline) and writing replies.
//!
//! ## Modules
//!
//! - `types`: Defines `Request`, `Reply` and reply serialization
//! - `parser`: Streaming parser for incoming requests
//!
//! ## Example
//!
//! ```ignore
//! use bloomkv::protocol::{Reply, RequestParser};
//!
//! // Reading a request off a buffered stream
//! let request = RequestParser::new().read_request(&mut reader).await?;
//!
//! // Creating replies
//! let reply = Reply::integer(3);
//! let bytes = reply.serialize();
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{read_request, ParseError, ParseResult, RequestParser};
pub use types::{Reply, Request};
