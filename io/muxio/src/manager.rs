//! The connection manager and its readiness loop.
//!
//! A [`Manager`] owns a set of connections and drives them from one thread:
//! each call to [`Manager::poll`] waits for OS readiness up to the caller's
//! timeout, then services accepts, connect completions, reads, writes,
//! broadcasts and the per-iteration `Poll` tick, delivering typed events to
//! each connection's handler. Only the [`WakeHandle`] may be used from other
//! threads.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::connection::{ConnToken, Connection, Flags, Handler, Sock};
use crate::endpoint::{Endpoint, Proto};
use crate::error::Error;
use crate::handler::{Event, EventHandler};
use crate::http::HttpWsState;
use crate::wake::{Broadcast, WakeHandle};

/// Token reserved for the cross-thread waker.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Minimum tail reservation before a TCP read.
const RECV_CHUNK: usize = 4096;

const LISTEN_BACKLOG: i32 = 1024;

/// The connection manager. See the crate docs for the event contract.
pub struct Manager {
    poll: Poll,
    events: Events,
    pub(crate) conns: Slab<Connection>,
    waker: Arc<Waker>,
    wake_tx: crossbeam_channel::Sender<Broadcast>,
    wake_rx: crossbeam_channel::Receiver<Broadcast>,
    start: Instant,
    pub(crate) tick: u64,
    next_generation: u32,
    in_poll: bool,
    user: Option<Box<dyn Any>>,
    /// Scratch for datagram reads and TLS ciphertext reads.
    scratch: Vec<u8>,
    /// Readiness info copied out of the mio event buffer each iteration.
    event_scratch: Vec<(usize, bool, bool, bool)>,
}

impl Manager {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (wake_tx, wake_rx) = crossbeam_channel::unbounded();
        Ok(Manager {
            poll,
            events: Events::with_capacity(1024),
            conns: Slab::with_capacity(64),
            waker,
            wake_tx,
            wake_rx,
            start: Instant::now(),
            tick: 0,
            next_generation: 1,
            in_poll: false,
            user: None,
            scratch: vec![0u8; 65536],
            event_scratch: Vec::with_capacity(256),
        })
    }

    /// A cloneable, thread-safe handle for [`WakeHandle::broadcast`].
    pub fn wake_handle(&self) -> WakeHandle {
        WakeHandle {
            tx: self.wake_tx.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Seconds since the manager was created, as of the last `poll`.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Number of live connections (listeners included).
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Snapshot of the tokens of all live connections, in list order.
    pub fn connections(&self) -> Vec<ConnToken> {
        self.conns
            .iter()
            .map(|(index, conn)| ConnToken {
                index: index as u32,
                generation: conn.generation,
            })
            .collect()
    }

    pub fn set_user_data(&mut self, data: Box<dyn Any>) {
        self.user = Some(data);
    }

    pub fn user_data_mut(&mut self) -> Option<&mut Box<dyn Any>> {
        self.user.as_mut()
    }

    pub fn set_conn_user_data(
        &mut self,
        conn: ConnToken,
        data: Box<dyn Any>,
    ) -> Result<(), Error> {
        self.conn_entry(conn)?.user = Some(data);
        Ok(())
    }

    pub fn conn_user_data_mut(
        &mut self,
        conn: ConnToken,
    ) -> Result<Option<&mut Box<dyn Any>>, Error> {
        Ok(self.conn_entry(conn)?.user.as_mut())
    }

    pub fn peer_addr(&self, conn: ConnToken) -> Result<Option<SocketAddr>, Error> {
        Ok(self.conn_ref(conn)?.peer)
    }

    pub fn local_addr(&self, conn: ConnToken) -> Result<Option<SocketAddr>, Error> {
        Ok(self.conn_ref(conn)?.local)
    }

    /// Tick of the connection's last successful read or write. Compare with
    /// [`Manager::tick`] in a `Poll` handler to implement idle timeouts.
    pub fn last_io(&self, conn: ConnToken) -> Result<u64, Error> {
        Ok(self.conn_ref(conn)?.last_io)
    }

    pub fn flags(&self, conn: ConnToken) -> Result<Flags, Error> {
        Ok(self.conn_ref(conn)?.flags)
    }

    /// Set user-settable flag bits; manager-owned bits are ignored.
    pub fn set_flags(&mut self, conn: ConnToken, flags: Flags) -> Result<(), Error> {
        let conn = self.conn_entry(conn)?;
        conn.flags.insert(flags & Flags::USER_SETTABLE);
        Ok(())
    }

    /// Clear user-settable flag bits; manager-owned bits are ignored.
    pub fn clear_flags(&mut self, conn: ConnToken, flags: Flags) -> Result<(), Error> {
        let conn = self.conn_entry(conn)?;
        conn.flags.remove(flags & Flags::USER_SETTABLE);
        Ok(())
    }

    /// Flag the connection for closing at the end of the current iteration.
    pub fn close(&mut self, conn: ConnToken) -> Result<(), Error> {
        self.set_flags(conn, Flags::CLOSE_NOW)
    }

    /// Create a listening connection for `[proto://]host:port`.
    ///
    /// TCP listeners accept with `SO_REUSEADDR`; UDP sockets surface each
    /// datagram through an ephemeral per-peer pseudo-connection. The host
    /// may be omitted to bind all interfaces and port `0` lets the OS pick.
    pub fn bind(
        &mut self,
        addr: &str,
        handler: impl EventHandler + 'static,
    ) -> Result<ConnToken, Error> {
        self.bind_handler(addr, Rc::new(RefCell::new(handler)))
    }

    fn bind_handler(&mut self, addr: &str, handler: Handler) -> Result<ConnToken, Error> {
        let ep = Endpoint::parse(addr, false)?;
        match ep.proto {
            Proto::Tcp => {
                let socket = socket2::Socket::new(
                    match ep.addr {
                        SocketAddr::V4(_) => socket2::Domain::IPV4,
                        SocketAddr::V6(_) => socket2::Domain::IPV6,
                    },
                    socket2::Type::STREAM,
                    Some(socket2::Protocol::TCP),
                )?;
                socket.set_reuse_address(true)?;
                socket.set_nonblocking(true)?;
                socket.bind(&ep.addr.into())?;
                socket.listen(LISTEN_BACKLOG)?;
                let listener = TcpListener::from_std(socket.into());
                let local = listener.local_addr().ok();

                let mut conn =
                    Connection::new(Sock::Listener(listener), Flags::LISTENING, 0, handler);
                conn.local = local;
                let token = self.insert(conn, Some(Interest::READABLE))?;
                debug!(addr, ?local, "tcp listener bound");
                Ok(token)
            }
            Proto::Udp => {
                let socket = UdpSocket::bind(ep.addr)?;
                let local = socket.local_addr().ok();

                let mut conn = Connection::new(
                    Sock::Udp(socket),
                    Flags::LISTENING | Flags::UDP,
                    0,
                    handler,
                );
                conn.local = local;
                let token = self.insert(conn, Some(Interest::READABLE))?;
                debug!(addr, ?local, "udp socket bound");
                Ok(token)
            }
        }
    }

    /// Create an outbound connection for `[proto://]host:port`.
    ///
    /// Names are resolved with a blocking lookup. TCP connections start
    /// non-blocking and deliver `Connect` when the connect resolves; UDP
    /// connections deliver `Connect(Ok)` on the next iteration and send
    /// immediately.
    pub fn connect(
        &mut self,
        addr: &str,
        handler: impl EventHandler + 'static,
    ) -> Result<ConnToken, Error> {
        self.connect_handler(addr, Rc::new(RefCell::new(handler)))
    }

    fn connect_handler(&mut self, addr: &str, handler: Handler) -> Result<ConnToken, Error> {
        let ep = Endpoint::parse(addr, true)?;
        match ep.proto {
            Proto::Tcp => {
                let stream = TcpStream::connect(ep.addr)?;
                let mut conn = Connection::new(Sock::Tcp(stream), Flags::CONNECTING, 0, handler);
                conn.client = true;
                conn.peer = Some(ep.addr);
                conn.host = ep.host;
                let token = self.insert(conn, Some(Interest::READABLE | Interest::WRITABLE))?;
                debug!(addr, conn = token.index, "tcp connect started");
                Ok(token)
            }
            Proto::Udp => {
                let bind_addr: SocketAddr = if ep.addr.is_ipv4() {
                    "0.0.0.0:0".parse().unwrap()
                } else {
                    "[::]:0".parse().unwrap()
                };
                let socket = UdpSocket::bind(bind_addr)?;
                socket.connect(ep.addr)?;
                let local = socket.local_addr().ok();

                let mut conn = Connection::new(Sock::Udp(socket), Flags::UDP, 0, handler);
                conn.client = true;
                conn.peer = Some(ep.addr);
                conn.local = local;
                conn.host = ep.host;
                conn.pending_connect = true;
                let token = self.insert(conn, Some(Interest::READABLE))?;
                debug!(addr, conn = token.index, "udp socket connected");
                Ok(token)
            }
        }
    }

    /// Wrap an externally acquired TCP socket. The caller is responsible for
    /// its state; the connection joins the manager like any other.
    pub fn add_socket(
        &mut self,
        stream: std::net::TcpStream,
        handler: impl EventHandler + 'static,
    ) -> Result<ConnToken, Error> {
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        let stream = TcpStream::from_std(stream);

        let mut conn = Connection::new(
            Sock::Tcp(stream),
            Flags::empty(),
            0,
            Rc::new(RefCell::new(handler)),
        );
        conn.peer = peer;
        conn.local = local;
        self.insert(conn, Some(Interest::READABLE | Interest::WRITABLE))
    }

    /// Queue bytes for a TCP/TLS connection, or transmit immediately for
    /// UDP. Returns the number of bytes queued or sent.
    pub fn send(&mut self, conn: ConnToken, data: &[u8]) -> Result<usize, Error> {
        let tick = self.tick;

        enum Kind {
            Stream,
            Datagram,
            Peer(usize, SocketAddr),
        }
        let kind = {
            let conn = self.conn_entry(conn)?;
            if conn.flags.contains(Flags::LISTENING) {
                return Err(Error::Unsupported);
            }
            match &conn.sock {
                Sock::Tcp(_) => Kind::Stream,
                Sock::Udp(_) => Kind::Datagram,
                Sock::UdpPeer { parent } => {
                    Kind::Peer(*parent, conn.peer.ok_or(Error::Unsupported)?)
                }
                Sock::Listener(_) => return Err(Error::Unsupported),
            }
        };

        match kind {
            Kind::Stream => {
                let conn = self.conn_entry(conn)?;
                conn.send.append(data);
                Ok(data.len())
            }
            Kind::Datagram => {
                let conn = self.conn_entry(conn)?;
                let Sock::Udp(socket) = &conn.sock else {
                    unreachable!()
                };
                let n = socket.send(data)?;
                conn.last_io = tick;
                Ok(n)
            }
            Kind::Peer(parent, peer) => {
                let Some(pconn) = self.conns.get(parent) else {
                    return Err(Error::InvalidConnection);
                };
                let Sock::Udp(socket) = &pconn.sock else {
                    return Err(Error::Unsupported);
                };
                Ok(socket.send_to(data, peer)?)
            }
        }
    }

    /// Formatted append-to-send-buffer, the `printf` analogue.
    pub fn send_fmt(&mut self, conn: ConnToken, args: fmt::Arguments<'_>) -> Result<usize, Error> {
        let text = fmt::format(args);
        self.send(conn, text.as_bytes())
    }

    /// The unconsumed contents of the receive buffer.
    pub fn recv_data(&self, conn: ConnToken) -> Result<&[u8], Error> {
        Ok(self.conn_ref(conn)?.recv.as_slice())
    }

    /// Drop `n` bytes from the head of the receive buffer (a parser that
    /// consumed them calls this). `n` beyond the buffered length is an
    /// error.
    pub fn recv_consume(&mut self, conn: ConnToken, n: usize) -> Result<(), Error> {
        let conn = self.conn_entry(conn)?;
        if n > conn.recv.len() {
            return Err(Error::Unsupported);
        }
        conn.recv.remove_head(n);
        Ok(())
    }

    /// Take the whole receive buffer, leaving it empty.
    pub fn recv_take(&mut self, conn: ConnToken) -> Result<crate::buffer::IoBuf, Error> {
        let conn = self.conn_entry(conn)?;
        Ok(std::mem::take(&mut conn.recv))
    }

    /// Bytes queued in the send buffer, not yet written to the wire.
    pub fn send_queued(&self, conn: ConnToken) -> Result<usize, Error> {
        Ok(self.conn_ref(conn)?.send.len())
    }

    /// Install TLS on a listener (server certificate) or on a connection
    /// whose connect is still pending (client).
    #[cfg(feature = "tls")]
    pub fn set_tls(
        &mut self,
        conn: ConnToken,
        settings: crate::tls::TlsSettings,
    ) -> Result<(), Error> {
        let flags = self.conn_ref(conn)?.flags;
        if flags.contains(Flags::UDP) {
            return Err(Error::Unsupported);
        }
        if flags.contains(Flags::LISTENING) {
            let cert = settings
                .cert
                .ok_or_else(|| Error::Tls("listener requires a certificate".into()))?;
            let config = crate::tls::load_server_config(&cert)?;
            self.conn_entry(conn)?.tls_server = Some(config);
            Ok(())
        } else if flags.contains(Flags::CONNECTING) {
            let config = crate::tls::load_client_config(settings.ca.as_deref())?;
            let name = settings
                .server_name
                .or_else(|| self.conn_ref(conn).ok().and_then(|c| c.host.clone()))
                .ok_or_else(|| Error::Tls("no server name for SNI".into()))?;
            let name = rustls::pki_types::ServerName::try_from(name)
                .map_err(|e| Error::Tls(e.to_string()))?;
            self.conn_entry(conn)?.tls_client = Some((config, name));
            Ok(())
        } else {
            Err(Error::Unsupported)
        }
    }

    /// Run one iteration of the readiness loop, waiting up to `timeout`.
    /// Returns the current tick.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<u64> {
        if self.in_poll {
            return Err(io::Error::other("Manager::poll reentered from a handler"));
        }
        self.in_poll = true;
        let result = self.poll_inner(timeout);
        self.in_poll = false;
        result
    }

    fn poll_inner(&mut self, timeout: Option<Duration>) -> io::Result<u64> {
        self.tick = self.start.elapsed().as_secs();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let mut wake = false;
        self.event_scratch.clear();
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                wake = true;
                continue;
            }
            self.event_scratch.push((
                event.token().0,
                event.is_readable(),
                event.is_writable(),
                event.is_read_closed() || event.is_write_closed() || event.is_error(),
            ));
        }
        trace!(events = self.event_scratch.len(), wake, "readiness");

        // Latch readiness; reads and writes reset the latches on WouldBlock.
        for i in 0..self.event_scratch.len() {
            let (index, readable, writable, closed) = self.event_scratch[i];
            if let Some(conn) = self.conns.get_mut(index) {
                if readable {
                    conn.readable = true;
                }
                if writable {
                    conn.writable = true;
                }
                if closed {
                    // Let the read path observe EOF or the error; a pending
                    // connect resolves through writability.
                    conn.readable = true;
                    if conn.flags.contains(Flags::CONNECTING) {
                        conn.writable = true;
                    }
                }
            }
        }

        // Service every connection in list order; reads before writes.
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for index in keys {
            self.service(index);
        }

        // Broadcast records observed through the waker, each delivered to
        // every live connection in list order.
        if wake {
            while let Ok(mut record) = self.wake_rx.try_recv() {
                let targets: Vec<(usize, u32)> = self
                    .conns
                    .iter()
                    .map(|(k, c)| (k, c.generation))
                    .collect();
                for (index, generation) in targets {
                    let alive = self
                        .conns
                        .get(index)
                        .is_some_and(|c| c.generation == generation);
                    if alive {
                        let token = ConnToken {
                            index: index as u32,
                            generation,
                        };
                        (record.func)(self, token, &record.data);
                    }
                }
            }
        }

        // Per-iteration poll tick.
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for index in keys {
            self.deliver(index, Event::Poll);
        }

        self.end_of_iteration();

        Ok(self.tick)
    }

    /// Service one connection: accept, connect resolution, reads, then
    /// writes.
    fn service(&mut self, index: usize) {
        let (flags, readable, writable, pending_connect) = {
            let Some(conn) = self.conns.get(index) else {
                return;
            };
            (
                conn.flags,
                conn.readable,
                conn.writable,
                conn.pending_connect,
            )
        };
        if flags.contains(Flags::CLOSE_NOW) {
            return;
        }

        if pending_connect {
            if let Some(conn) = self.conns.get_mut(index) {
                conn.pending_connect = false;
            }
            self.deliver(index, Event::Connect(Ok(())));
        }

        if flags.contains(Flags::LISTENING) {
            if readable {
                if flags.contains(Flags::UDP) {
                    self.service_udp_listener(index);
                } else {
                    self.accept_pending(index);
                }
            }
            return;
        }

        if flags.contains(Flags::CONNECTING) {
            if writable {
                self.resolve_connect(index);
            } else {
                return;
            }
        }

        self.read_ready(index);
        self.flush_send(index);
    }

    /// Accept pending connections on a TCP listener, creating a connection
    /// per accept. New connections inherit the listener's handler, protocol
    /// attachment and TLS configuration.
    fn accept_pending(&mut self, index: usize) {
        loop {
            let accepted = {
                let Some(conn) = self.conns.get_mut(index) else {
                    return;
                };
                let Sock::Listener(listener) = &mut conn.sock else {
                    return;
                };
                match listener.accept() {
                    Ok(pair) => Some(pair),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        conn.readable = false;
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        conn.readable = false;
                        None
                    }
                }
            };
            let Some((stream, peer)) = accepted else {
                return;
            };

            let (handler, want_proto, local) = {
                let Some(listener) = self.conns.get(index) else {
                    return;
                };
                (listener.handler.clone(), listener.proto.is_some(), listener.local)
            };
            #[cfg(feature = "tls")]
            let tls_server = self
                .conns
                .get(index)
                .and_then(|c| c.tls_server.clone());

            let mut conn = Connection::new(Sock::Tcp(stream), Flags::empty(), 0, handler);
            conn.peer = Some(peer);
            conn.local = local;
            conn.writable = true;
            if want_proto {
                conn.proto = Some(HttpWsState::new());
            }
            #[cfg(feature = "tls")]
            if let Some(config) = tls_server {
                match crate::tls::TlsSession::new_server(config) {
                    Ok(session) => conn.tls = Some(session),
                    Err(e) => {
                        warn!(error = %e, "tls server session");
                        continue;
                    }
                }
            }

            match self.insert(conn, Some(Interest::READABLE | Interest::WRITABLE)) {
                Ok(token) => {
                    debug!(%peer, conn = token.index, "accepted");
                    self.deliver(token.index as usize, Event::Accept(peer));
                }
                Err(e) => {
                    warn!(error = %e, "register accepted connection");
                }
            }
        }
    }

    /// Surface pending datagrams on a UDP listener. Each datagram arrives on
    /// a per-peer pseudo-connection so the handler can respond in place;
    /// pseudo-connections last one iteration unless `KEEP_ALIVE` is set.
    fn service_udp_listener(&mut self, index: usize) {
        loop {
            let received = {
                let Some(conn) = self.conns.get_mut(index) else {
                    return;
                };
                let Sock::Udp(socket) = &conn.sock else {
                    return;
                };
                match socket.recv_from(&mut self.scratch) {
                    Ok((n, peer)) => Some((n, peer)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        conn.readable = false;
                        None
                    }
                    Err(e) => {
                        // Transient datagram errors (e.g. ICMP-induced) do
                        // not invalidate the socket.
                        debug!(error = %e, "udp recv");
                        conn.readable = false;
                        None
                    }
                }
            };
            let Some((n, peer)) = received else {
                return;
            };

            // Route follow-up datagrams to a kept-alive pseudo-connection.
            let existing = self
                .conns
                .iter()
                .find(|(_, c)| {
                    matches!(c.sock, Sock::UdpPeer { parent } if parent == index)
                        && c.peer == Some(peer)
                })
                .map(|(k, _)| k);

            let (peer_index, fresh) = match existing {
                Some(k) => (k, false),
                None => {
                    let (handler, local) = {
                        let Some(parent) = self.conns.get(index) else {
                            return;
                        };
                        (parent.handler.clone(), parent.local)
                    };
                    let mut conn =
                        Connection::new(Sock::UdpPeer { parent: index }, Flags::UDP, 0, handler);
                    conn.peer = Some(peer);
                    conn.local = local;
                    match self.insert(conn, None) {
                        Ok(token) => (token.index as usize, true),
                        Err(_) => return,
                    }
                }
            };

            {
                let Some(conn) = self.conns.get_mut(peer_index) else {
                    return;
                };
                conn.recv.append(&self.scratch[..n]);
                conn.last_io = self.tick;
            }
            if fresh {
                self.deliver(peer_index, Event::Accept(peer));
            }
            self.deliver(peer_index, Event::Recv(n));
        }
    }

    /// Resolve a pending non-blocking connect on write readiness.
    fn resolve_connect(&mut self, index: usize) {
        let result: Option<io::Result<()>> = {
            let Some(conn) = self.conns.get_mut(index) else {
                return;
            };
            let Sock::Tcp(stream) = &conn.sock else {
                return;
            };
            match stream.take_error() {
                Ok(Some(e)) => Some(Err(e)),
                Err(e) => Some(Err(e)),
                Ok(None) => match stream.peer_addr() {
                    Ok(peer) => {
                        conn.peer = Some(peer);
                        conn.local = stream.local_addr().ok();
                        Some(Ok(()))
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                        // Spurious writability; wait for the next event.
                        conn.writable = false;
                        None
                    }
                    Err(e) => Some(Err(e)),
                },
            }
        };
        let Some(result) = result else {
            return;
        };

        match result {
            Ok(()) => {
                {
                    let conn = self.conns.get_mut(index).expect("connection present");
                    conn.flags.remove(Flags::CONNECTING);
                    conn.last_io = self.tick;
                    #[cfg(feature = "tls")]
                    if let Some((config, name)) = conn.tls_client.take() {
                        match crate::tls::TlsSession::new_client(config, name) {
                            Ok(session) => conn.tls = Some(session),
                            Err(e) => {
                                warn!(error = %e, "tls client session");
                                conn.flags.insert(Flags::CLOSE_NOW);
                            }
                        }
                    }
                }
                debug!(conn = index, "connected");
                self.deliver(index, Event::Connect(Ok(())));
            }
            Err(e) => {
                {
                    let conn = self.conns.get_mut(index).expect("connection present");
                    conn.flags.remove(Flags::CONNECTING);
                    conn.flags.insert(Flags::CLOSE_NOW);
                }
                debug!(conn = index, error = %e, "connect failed");
                self.deliver(index, Event::Connect(Err(e)));
            }
        }
    }

    /// Drain readable data: TCP into the receive buffer tail, TLS through
    /// the session, connected UDP per datagram. Each successful read
    /// delivers `Recv(n)` and runs the protocol handler.
    #[cfg_attr(not(feature = "tls"), allow(unused_labels))]
    fn read_ready(&mut self, index: usize) {
        enum Step {
            Block,
            Retry,
            Closed,
            Read {
                n: usize,
                handshake_done: bool,
                peer_eof: bool,
            },
        }

        loop {
            let step = {
                let Some(conn) = self.conns.get_mut(index) else {
                    return;
                };
                if !conn.readable
                    || conn.flags.contains(Flags::CLOSE_NOW)
                    || conn.flags.contains(Flags::CONNECTING)
                {
                    return;
                }
                let tick = self.tick;

                match &mut conn.sock {
                    Sock::Tcp(stream) => 'tcp: {
                        // Ciphertext goes through the TLS session; plaintext
                        // lands in the receive buffer like any other read.
                        #[cfg(feature = "tls")]
                        if conn.tls.is_some() {
                            break 'tcp match stream.read(&mut self.scratch) {
                                Ok(0) => Step::Closed,
                                Ok(n) => {
                                    conn.last_io = tick;
                                    let tls = conn.tls.as_mut().expect("tls session");
                                    if let Err(e) = tls.feed(&self.scratch[..n]) {
                                        warn!(conn = index, error = %e, "tls");
                                        Step::Closed
                                    } else {
                                        let mut handshake_done = false;
                                        if !conn.flags.contains(Flags::TLS_HANDSHAKE_DONE)
                                            && !tls.is_handshaking()
                                        {
                                            conn.flags.insert(Flags::TLS_HANDSHAKE_DONE);
                                            handshake_done = true;
                                        }
                                        match tls.read_plaintext(&mut conn.recv) {
                                            Ok(plain) => Step::Read {
                                                n: plain,
                                                handshake_done,
                                                peer_eof: tls.peer_closed(),
                                            },
                                            Err(_) => Step::Closed,
                                        }
                                    }
                                }
                                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                    conn.readable = false;
                                    Step::Block
                                }
                                Err(e) if e.kind() == io::ErrorKind::Interrupted => Step::Retry,
                                Err(e) => {
                                    debug!(conn = index, error = %e, "read failed");
                                    Step::Closed
                                }
                            };
                        }

                        conn.recv.reserve(RECV_CHUNK);
                        match stream.read(conn.recv.spare_mut()) {
                            Ok(0) => Step::Closed,
                            Ok(n) => {
                                conn.recv.commit(n);
                                conn.last_io = tick;
                                Step::Read {
                                    n,
                                    handshake_done: false,
                                    peer_eof: false,
                                }
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                conn.readable = false;
                                Step::Block
                            }
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => Step::Retry,
                            Err(e) => {
                                debug!(conn = index, error = %e, "read failed");
                                Step::Closed
                            }
                        }
                    }
                    Sock::Udp(socket) => match socket.recv(&mut self.scratch) {
                        Ok(n) => {
                            conn.recv.append(&self.scratch[..n]);
                            conn.last_io = tick;
                            Step::Read {
                                n,
                                handshake_done: false,
                                peer_eof: false,
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            conn.readable = false;
                            Step::Block
                        }
                        Err(e) => {
                            debug!(conn = index, error = %e, "udp recv");
                            conn.readable = false;
                            Step::Block
                        }
                    },
                    Sock::Listener(_) | Sock::UdpPeer { .. } => return,
                }
            };

            match step {
                Step::Block => return,
                Step::Retry => continue,
                Step::Closed => {
                    if let Some(conn) = self.conns.get_mut(index) {
                        conn.flags.insert(Flags::CLOSE_NOW);
                    }
                    return;
                }
                Step::Read {
                    n,
                    handshake_done,
                    peer_eof,
                } => {
                    if handshake_done {
                        debug!(conn = index, "tls handshake complete");
                    }
                    if n > 0 {
                        self.deliver(index, Event::Recv(n));
                        self.drive_protocol(index);
                    }
                    if peer_eof {
                        if let Some(conn) = self.conns.get_mut(index) {
                            conn.flags.insert(Flags::CLOSE_NOW);
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Flush queued output while the socket is writable and sending is not
    /// held. Each drain from the send buffer delivers `Sent(n)`.
    fn flush_send(&mut self, index: usize) {
        loop {
            let mut sent = 0usize;
            let mut progress = false;
            {
                let Some(conn) = self.conns.get_mut(index) else {
                    return;
                };
                if conn.flags.contains(Flags::CLOSE_NOW)
                    || conn.flags.contains(Flags::CONNECTING)
                    || conn.flags.contains(Flags::LISTENING)
                {
                    return;
                }
                let hold = conn.flags.contains(Flags::HOLD_SEND);
                let tick = self.tick;

                #[cfg(feature = "tls")]
                let has_tls = conn.tls.is_some();
                #[cfg(not(feature = "tls"))]
                let has_tls = false;

                if has_tls {
                    #[cfg(feature = "tls")]
                    {
                        let tls = conn.tls.as_mut().expect("tls session");
                        // Plaintext moves into the session only after the
                        // handshake, so handshake records always precede
                        // application data.
                        if conn.flags.contains(Flags::TLS_HANDSHAKE_DONE)
                            && !hold
                            && !conn.send.is_empty()
                        {
                            match tls.write_plaintext(conn.send.as_slice()) {
                                Ok(n) if n > 0 => {
                                    conn.send.remove_head(n);
                                    sent = n;
                                    progress = true;
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!(conn = index, error = %e, "tls write");
                                    conn.flags.insert(Flags::CLOSE_NOW);
                                    return;
                                }
                            }
                        }
                        // Ciphertext (handshake included) to the socket.
                        if let Sock::Tcp(stream) = &mut conn.sock {
                            while conn.writable && !tls.pending_output().is_empty() {
                                match stream.write(tls.pending_output()) {
                                    Ok(0) => {
                                        conn.flags.insert(Flags::CLOSE_NOW);
                                        return;
                                    }
                                    Ok(n) => {
                                        tls.advance_output(n);
                                        conn.last_io = tick;
                                        progress = true;
                                    }
                                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                        conn.writable = false;
                                    }
                                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                                    Err(e) => {
                                        debug!(conn = index, error = %e, "write failed");
                                        conn.flags.insert(Flags::CLOSE_NOW);
                                        return;
                                    }
                                }
                            }
                        }
                    }
                } else if let Sock::Tcp(stream) = &mut conn.sock {
                    if conn.writable && !hold && !conn.send.is_empty() {
                        match stream.write(conn.send.as_slice()) {
                            Ok(0) => {
                                conn.flags.insert(Flags::CLOSE_NOW);
                                return;
                            }
                            Ok(n) => {
                                conn.send.remove_head(n);
                                conn.last_io = tick;
                                sent = n;
                                progress = true;
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                conn.writable = false;
                            }
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                                progress = true;
                            }
                            Err(e) => {
                                debug!(conn = index, error = %e, "write failed");
                                conn.flags.insert(Flags::CLOSE_NOW);
                                return;
                            }
                        }
                    }
                }
            }

            if sent > 0 {
                self.deliver(index, Event::Sent(sent));
            }
            if !progress {
                return;
            }
        }
    }

    /// End-of-iteration state transitions: reclaim one-shot UDP
    /// pseudo-connections, close flagged connections (delivering `Close`),
    /// and promote drained graceful closes.
    fn end_of_iteration(&mut self) {
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        let mut to_close = Vec::new();
        for index in keys {
            let Some(conn) = self.conns.get_mut(index) else {
                continue;
            };
            if matches!(conn.sock, Sock::UdpPeer { .. }) && !conn.flags.contains(Flags::KEEP_ALIVE)
            {
                conn.flags.insert(Flags::CLOSE_NOW);
            }
            if conn.flags.contains(Flags::CLOSE_NOW) {
                to_close.push(index);
            } else if conn.flags.contains(Flags::FINISHED_SENDING) && conn.send_drained() {
                conn.flags.insert(Flags::CLOSE_NOW);
            }
        }
        for index in to_close {
            self.remove_conn(index);
        }
    }

    /// Deliver `Close`, deregister and free one connection.
    fn remove_conn(&mut self, index: usize) {
        self.deliver(index, Event::Close);
        if let Some(mut conn) = self.conns.try_remove(index) {
            let registry = self.poll.registry();
            let _ = match &mut conn.sock {
                Sock::Tcp(stream) => registry.deregister(stream),
                Sock::Listener(listener) => registry.deregister(listener),
                Sock::Udp(socket) => registry.deregister(socket),
                Sock::UdpPeer { .. } => Ok(()),
            };
            trace!(conn = index, "connection freed");
        }
    }

    /// Invoke a connection's handler with an event.
    pub(crate) fn deliver(&mut self, index: usize, event: Event<'_>) {
        let Some(conn) = self.conns.get(index) else {
            return;
        };
        let token = ConnToken {
            index: index as u32,
            generation: conn.generation,
        };
        let handler = conn.handler.clone();
        handler.borrow_mut().on_event(self, token, event);
    }

    fn insert(
        &mut self,
        mut conn: Connection,
        interest: Option<Interest>,
    ) -> Result<ConnToken, Error> {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        conn.generation = generation;
        conn.last_io = self.tick;

        let entry = self.conns.vacant_entry();
        let index = entry.key();
        if let Some(interest) = interest {
            let registry = self.poll.registry();
            match &mut conn.sock {
                Sock::Tcp(stream) => registry.register(stream, Token(index), interest)?,
                Sock::Listener(listener) => registry.register(listener, Token(index), interest)?,
                Sock::Udp(socket) => registry.register(socket, Token(index), interest)?,
                Sock::UdpPeer { .. } => {}
            }
        }
        entry.insert(conn);
        Ok(ConnToken {
            index: index as u32,
            generation,
        })
    }

    pub(crate) fn conn_entry(&mut self, token: ConnToken) -> Result<&mut Connection, Error> {
        match self.conns.get_mut(token.index as usize) {
            Some(conn) if conn.generation == token.generation => Ok(conn),
            _ => Err(Error::InvalidConnection),
        }
    }

    fn conn_ref(&self, token: ConnToken) -> Result<&Connection, Error> {
        match self.conns.get(token.index as usize) {
            Some(conn) if conn.generation == token.generation => Ok(conn),
            _ => Err(Error::InvalidConnection),
        }
    }
}

impl Drop for Manager {
    /// Closing the manager closes and frees every connection, delivering
    /// `Close` to each.
    fn drop(&mut self) {
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for index in keys {
            self.remove_conn(index);
        }
    }
}
