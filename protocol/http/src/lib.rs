//! HTTP/1.1 message parsing and WebSocket frame codec.
//!
//! This crate provides the wire-level pieces for HTTP/1.1 and RFC 6455
//! WebSocket framing:
//! - [`Message::parse`] parses a request or response start line plus headers
//!   from a byte slice, returning the parsed message and the number of bytes
//!   consumed, or [`ParseError::Incomplete`] when more data is needed.
//! - [`websocket::FrameHeader`] decodes and encodes frame headers, and
//!   [`websocket::accept_key`] computes the `Sec-WebSocket-Accept` value.
//!
//! Parsing is pure: no I/O, no allocation beyond the header list, and all
//! string slices borrow from the input buffer.
//!
//! # Example
//!
//! ```
//! use protocol_http::{Message, StartLine};
//!
//! let data = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
//! let (message, consumed) = Message::parse(data).unwrap();
//! assert_eq!(consumed, data.len());
//! match message.start {
//!     StartLine::Request { method, uri, .. } => {
//!         assert_eq!(method, "GET");
//!         assert_eq!(uri, "/index.html");
//!     }
//!     _ => unreachable!(),
//! }
//! assert_eq!(message.header("host"), Some("example.com"));
//! ```

mod message;
pub mod websocket;

pub use message::{
    BodyLen, Header, MAX_HEADERS, Message, ParseError, StartLine, chunked_body_len,
    encode_response_head, status_reason,
};
