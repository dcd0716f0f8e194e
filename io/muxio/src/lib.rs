//! muxio - a small, embeddable, single-threaded networking substrate.
//!
//! One [`Manager`] drives arbitrarily many TCP, UDP and TLS sockets from a
//! single thread through a uniform event-callback contract: create
//! connections with [`Manager::bind`], [`Manager::connect`] or
//! [`Manager::add_socket`], then call [`Manager::poll`] in a loop. Each
//! iteration waits for OS readiness up to the caller's timeout and delivers
//! typed [`Event`]s to each connection's [`EventHandler`].
//!
//! Per-connection ordering is strict: `(Accept|Connect)?` then any number of
//! `Recv`/`Sent`/`Poll`/protocol events, then exactly one `Close`. Across
//! connections no ordering is promised.
//!
//! The optional HTTP/1.1 + WebSocket protocol handler
//! ([`Manager::attach_http_websocket`]) turns raw receive-buffer contents
//! into `HttpRequest`/`HttpReply` events and handles the WebSocket upgrade
//! and frame codec, including continuation reassembly.
//!
//! The manager is owned by one thread; only [`WakeHandle`] (obtained from
//! [`Manager::wake_handle`]) may cross threads, delivering broadcast records
//! through the wake-up channel.
//!
//! # Example
//!
//! ```no_run
//! use muxio::{ConnToken, Event, Manager};
//! use std::time::Duration;
//!
//! fn echo(mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
//!     if matches!(event, Event::Recv(_)) {
//!         let data = mgr.recv_take(conn).unwrap();
//!         let _ = mgr.send(conn, data.as_slice());
//!     }
//! }
//!
//! let mut mgr = Manager::new()?;
//! mgr.bind("127.0.0.1:7878", echo)?;
//! loop {
//!     mgr.poll(Some(Duration::from_millis(100)))?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod buffer;
pub mod endpoint;

mod connection;
mod error;
mod handler;
mod http;
mod manager;
#[cfg(feature = "tls")]
mod tls;
mod wake;

// Public API re-exports
pub use buffer::IoBuf;
pub use connection::{ConnToken, Flags};
pub use endpoint::{Endpoint, Proto};
pub use error::Error;
pub use handler::{Event, EventHandler, WsFrame};
pub use manager::Manager;
#[cfg(feature = "tls")]
pub use tls::TlsSettings;
pub use wake::{BroadcastFn, WakeHandle};

// Protocol types that appear in event payloads.
pub use protocol_http::websocket::OpCode;
pub use protocol_http::{BodyLen, Header, Message, StartLine};
