//! Connection state: socket, flags, buffers, handler and protocol slots.

use std::any::Any;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use mio::net::{TcpListener, TcpStream, UdpSocket};

use crate::buffer::IoBuf;
use crate::handler::EventHandler;
use crate::http::HttpWsState;

bitflags::bitflags! {
    /// Per-connection flag bits.
    ///
    /// `FINISHED_SENDING`, `HOLD_SEND`, `CLOSE_NOW`, `KEEP_ALIVE` and the
    /// four user bits may be set by the caller; the rest are owned by the
    /// manager.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u16 {
        /// Passive listener; only accept events are serviced.
        const LISTENING          = 1 << 0;
        /// Datagram socket.
        const UDP                = 1 << 1;
        /// Non-blocking connect is pending; resolved on write readiness.
        const CONNECTING         = 1 << 2;
        /// TLS handshake has completed.
        const TLS_HANDSHAKE_DONE = 1 << 3;
        /// Graceful close: once the send buffer drains, the connection is
        /// flagged `CLOSE_NOW`.
        const FINISHED_SENDING   = 1 << 4;
        /// Buffer output but do not write to the socket until cleared.
        const HOLD_SEND          = 1 << 5;
        /// Close the socket at the end of the current iteration and deliver
        /// `Close`.
        const CLOSE_NOW          = 1 << 6;
        /// Keep a UDP pseudo-connection alive past the iteration that
        /// created it.
        const KEEP_ALIVE         = 1 << 7;
        /// Caller-defined state bits.
        const USER_1             = 1 << 8;
        const USER_2             = 1 << 9;
        const USER_3             = 1 << 10;
        const USER_4             = 1 << 11;
    }
}

impl Flags {
    /// The bits callers may set or clear directly.
    pub const USER_SETTABLE: Flags = Flags::FINISHED_SENDING
        .union(Flags::HOLD_SEND)
        .union(Flags::CLOSE_NOW)
        .union(Flags::KEEP_ALIVE)
        .union(Flags::USER_1)
        .union(Flags::USER_2)
        .union(Flags::USER_3)
        .union(Flags::USER_4);
}

/// Opaque connection identifier: slab index plus a generation counter so a
/// stale token never addresses a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ConnToken {
    /// The connection slot index, usable for per-connection side tables.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// The socket a connection wraps.
pub(crate) enum Sock {
    Tcp(TcpStream),
    Listener(TcpListener),
    Udp(UdpSocket),
    /// Ephemeral per-datagram peer of a UDP listener; sends go through the
    /// parent socket.
    UdpPeer { parent: usize },
}

pub(crate) type Handler = Rc<RefCell<dyn EventHandler>>;

/// Per-connection state, owned by the manager.
pub(crate) struct Connection {
    pub sock: Sock,
    pub flags: Flags,
    pub generation: u32,
    pub recv: IoBuf,
    pub send: IoBuf,
    /// Edge-triggered readiness latches; cleared when a read/write returns
    /// `WouldBlock`.
    pub readable: bool,
    pub writable: bool,
    pub handler: Handler,
    pub proto: Option<HttpWsState>,
    pub user: Option<Box<dyn Any>>,
    pub peer: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
    /// Tick of the last successful read or write.
    pub last_io: u64,
    /// Created by `connect`; controls WebSocket mask direction.
    pub client: bool,
    /// Deliver `Connect(Ok)` on the next iteration (UDP connect path).
    pub pending_connect: bool,
    /// Hostname from the connect endpoint, kept for TLS SNI.
    pub host: Option<String>,
    #[cfg(feature = "tls")]
    pub tls: Option<crate::tls::TlsSession>,
    /// Server-side TLS configuration installed on a listener; accepted
    /// connections get a session built from it.
    #[cfg(feature = "tls")]
    pub tls_server: Option<std::sync::Arc<rustls::ServerConfig>>,
    /// Client-side TLS configuration, pending until connect resolves.
    #[cfg(feature = "tls")]
    pub tls_client: Option<(
        std::sync::Arc<rustls::ClientConfig>,
        rustls::pki_types::ServerName<'static>,
    )>,
}

impl Connection {
    pub fn new(sock: Sock, flags: Flags, generation: u32, handler: Handler) -> Self {
        Connection {
            sock,
            flags,
            generation,
            recv: IoBuf::new(),
            send: IoBuf::new(),
            readable: false,
            writable: false,
            handler,
            proto: None,
            user: None,
            peer: None,
            local: None,
            last_io: 0,
            client: false,
            pending_connect: false,
            host: None,
            #[cfg(feature = "tls")]
            tls: None,
            #[cfg(feature = "tls")]
            tls_server: None,
            #[cfg(feature = "tls")]
            tls_client: None,
        }
    }

    /// Whether everything queued for the wire has left the send path.
    pub fn send_drained(&self) -> bool {
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            return self.send.is_empty() && !tls.wants_write();
        }
        self.send.is_empty()
    }
}
