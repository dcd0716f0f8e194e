//! Events and the per-connection event handler contract.

use std::io;
use std::net::SocketAddr;

use protocol_http::Message;
use protocol_http::websocket::OpCode;

use crate::connection::ConnToken;
use crate::manager::Manager;

/// A reassembled WebSocket message delivered to the handler.
#[derive(Debug, Clone, Copy)]
pub struct WsFrame<'a> {
    /// The effective opcode: for fragmented messages, the opcode of the
    /// first fragment.
    pub opcode: OpCode,
    /// Always set on delivery; reassembly completes before dispatch.
    pub fin: bool,
    pub payload: &'a [u8],
}

/// Event tags plus their typed payloads.
///
/// Borrowed payloads are valid only for the duration of the handler call.
#[derive(Debug)]
pub enum Event<'a> {
    /// Emitted to every connection once per loop iteration.
    Poll,
    /// A new accepted connection was created; the payload is the peer.
    Accept(SocketAddr),
    /// A client connection's non-blocking connect resolved.
    Connect(io::Result<()>),
    /// Bytes were appended to the receive buffer.
    Recv(usize),
    /// Bytes were drained from the send buffer.
    Sent(usize),
    /// The socket is about to be freed.
    Close,
    /// A complete HTTP request (start line, headers and body buffered).
    HttpRequest(&'a Message<'a>),
    /// A complete HTTP response.
    HttpReply(&'a Message<'a>),
    /// A WebSocket upgrade request arrived; if the handler queues no
    /// response, the manager answers with a 101 itself.
    WsHandshakeRequest(&'a Message<'a>),
    /// The upgrade completed; the connection now speaks WebSocket framing.
    WsHandshakeDone,
    /// A complete (reassembled) WebSocket message.
    WsFrame(WsFrame<'a>),
    /// HTTP parsing or WebSocket framing failed; a `Close` follows.
    ProtocolError(&'a str),
}

/// Per-connection event callback.
///
/// Handlers run synchronously on the manager's thread and must not block,
/// must not call [`Manager::poll`] reentrantly, and must not retain the
/// token past the `Close` event. Connections accepted by a listener share
/// the listener's handler.
pub trait EventHandler {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>);
}

impl<F> EventHandler for F
where
    F: for<'a> FnMut(&mut Manager, ConnToken, Event<'a>),
{
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        self(mgr, conn, event)
    }
}
