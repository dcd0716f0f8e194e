//! HTTP/1.1 and WebSocket protocol dispatch.
//!
//! The built-in protocol handler consumes a connection's receive buffer
//! after every read: in HTTP mode it waits for a complete message (start
//! line, headers and body) and emits `HttpRequest`/`HttpReply`, recognizing
//! the WebSocket upgrade along the way; in WebSocket mode it decodes frames,
//! reassembles continuations, enforces mask direction and answers pings.
//! Parse failures emit `ProtocolError` and flag the connection for closing.

use bytes::BytesMut;
use tracing::{debug, warn};

use base64::Engine;
use protocol_http::websocket::{self, FrameError, FrameHeader, OpCode};
use protocol_http::{BodyLen, Message, ParseError, StartLine, chunked_body_len};

use crate::buffer::IoBuf;
use crate::connection::{ConnToken, Flags};
use crate::error::Error;
use crate::handler::{Event, WsFrame};
use crate::manager::Manager;

/// Per-connection protocol state for the HTTP/WebSocket handler.
pub(crate) struct HttpWsState {
    mode: Mode,
    /// Opcode of the first fragment of an in-progress fragmented message.
    frag_opcode: Option<OpCode>,
    /// Accumulated fragment payload until FIN.
    frag: BytesMut,
    /// A CLOSE frame has been echoed; never echo twice.
    close_sent: bool,
}

enum Mode {
    Http,
    /// Client sent an upgrade request and awaits the 101; the key is kept
    /// to verify `Sec-WebSocket-Accept`.
    ClientHandshake { key: String },
    Ws { client: bool },
}

impl HttpWsState {
    pub fn new() -> Self {
        HttpWsState {
            mode: Mode::Http,
            frag_opcode: None,
            frag: BytesMut::new(),
            close_sent: false,
        }
    }
}

impl Manager {
    /// Attach the built-in HTTP/WebSocket protocol handler.
    ///
    /// On a listener this applies to every accepted connection. Once
    /// attached, complete messages arrive as `HttpRequest`/`HttpReply` (and
    /// WebSocket events after an upgrade) instead of raw buffer contents.
    pub fn attach_http_websocket(&mut self, conn: ConnToken) -> Result<(), Error> {
        let conn = self.conn_entry(conn)?;
        if conn.flags.contains(Flags::UDP) {
            return Err(Error::Unsupported);
        }
        if conn.proto.is_none() {
            conn.proto = Some(HttpWsState::new());
        }
        Ok(())
    }

    /// Queue one WebSocket frame: header immediately followed by payload in
    /// a single contiguous append. Client connections mask with a fresh
    /// random key per frame; servers send unmasked.
    pub fn send_ws_frame(
        &mut self,
        conn: ConnToken,
        opcode: OpCode,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.conn_entry(conn)?;
        self.queue_ws_frame(conn.index as usize, opcode, &[payload], true)
    }

    /// Like [`Manager::send_ws_frame`] but gathers several parts under one
    /// frame header.
    pub fn send_ws_framev(
        &mut self,
        conn: ConnToken,
        opcode: OpCode,
        parts: &[&[u8]],
    ) -> Result<(), Error> {
        self.conn_entry(conn)?;
        self.queue_ws_frame(conn.index as usize, opcode, parts, true)
    }

    /// Queue the 101 Switching Protocols response for an upgrade request.
    ///
    /// Useful from a `WsHandshakeRequest` handler that wants to write the
    /// response itself; if the handler queues nothing, the manager answers
    /// with this response on its own.
    pub fn send_ws_handshake_response(
        &mut self,
        conn: ConnToken,
        request: &Message<'_>,
    ) -> Result<(), Error> {
        let key = request
            .header("sec-websocket-key")
            .ok_or(Error::Unsupported)?;
        let head = upgrade_response(key);
        let conn = self.conn_entry(conn)?;
        conn.send.append(head.as_bytes());
        Ok(())
    }

    /// Queue a client upgrade request and switch the connection into
    /// handshake mode. The 101 response is verified against the generated
    /// key; success emits `WsHandshakeDone` and enables frame decoding.
    pub fn send_ws_handshake_request(
        &mut self,
        conn: ConnToken,
        host: &str,
        uri: &str,
    ) -> Result<(), Error> {
        let key = base64::engine::general_purpose::STANDARD.encode(rand::random::<[u8; 16]>());
        let request = format!(
            "GET {uri} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        let conn = self.conn_entry(conn)?;
        if conn.flags.contains(Flags::UDP) {
            return Err(Error::Unsupported);
        }
        conn.send.append(request.as_bytes());
        let state = conn.proto.get_or_insert_with(HttpWsState::new);
        state.mode = Mode::ClientHandshake { key };
        Ok(())
    }

    /// Run the protocol handler over the receive buffer until it needs more
    /// data. Called after every `Recv` delivery.
    pub(crate) fn drive_protocol(&mut self, index: usize) {
        loop {
            // Take the buffer and state out of the connection so event
            // delivery below can borrow the manager freely.
            let (mut buf, mut state, client) = {
                let Some(conn) = self.conns.get_mut(index) else {
                    return;
                };
                if conn.proto.is_none()
                    || conn.flags.contains(Flags::CLOSE_NOW)
                    || conn.recv.is_empty()
                {
                    return;
                }
                (
                    std::mem::take(&mut conn.recv),
                    conn.proto.take().expect("protocol state present"),
                    conn.client,
                )
            };

            let mut consumed = 0;
            let mut progressed = false;

            match state.mode {
                Mode::Http | Mode::ClientHandshake { .. } => {
                    self.step_http(index, &mut state, &buf, &mut consumed, &mut progressed, client);
                }
                Mode::Ws { client } => {
                    self.step_ws(index, &mut state, &mut buf, &mut consumed, &mut progressed, client);
                }
            }

            buf.remove_head(consumed);
            let Some(conn) = self.conns.get_mut(index) else {
                return;
            };
            if !conn.recv.is_empty() {
                buf.append(conn.recv.as_slice());
            }
            conn.recv = buf;
            if conn.proto.is_none() {
                conn.proto = Some(state);
            }
            if !progressed || conn.flags.contains(Flags::CLOSE_NOW) {
                return;
            }
        }
    }

    /// One HTTP message: parse, wait for the body, dispatch. Advances
    /// `consumed` and `progressed` only when a full message was handled.
    fn step_http(
        &mut self,
        index: usize,
        state: &mut HttpWsState,
        buf: &IoBuf,
        consumed: &mut usize,
        progressed: &mut bool,
        client: bool,
    ) {
        let data = buf.as_slice();
        let (mut msg, header_len) = match Message::parse(data) {
            Ok(parsed) => parsed,
            Err(ParseError::Incomplete) => return,
            Err(e) => {
                self.protocol_error(index, &e.to_string());
                return;
            }
        };

        let total = match msg.body_len() {
            Ok(BodyLen::Fixed(n)) => {
                if data.len() < header_len + n {
                    return;
                }
                msg.body = &data[header_len..header_len + n];
                header_len + n
            }
            Ok(BodyLen::Chunked) => match chunked_body_len(&data[header_len..]) {
                Ok(Some(n)) => {
                    msg.body = &data[header_len..header_len + n];
                    header_len + n
                }
                Ok(None) => return,
                Err(e) => {
                    self.protocol_error(index, &e.to_string());
                    return;
                }
            },
            Ok(BodyLen::None) => header_len,
            Err(e) => {
                self.protocol_error(index, &e.to_string());
                return;
            }
        };

        *consumed = total;
        *progressed = true;

        // Client side: match the 101 against the key we sent.
        if let Mode::ClientHandshake { key } = &state.mode {
            let status_ok = matches!(msg.start, StartLine::Response { status: 101, .. });
            let key_ok = msg
                .header("sec-websocket-accept")
                .is_some_and(|v| v == websocket::accept_key(key));
            if status_ok && key_ok {
                state.mode = Mode::Ws { client: true };
                debug!(conn = index, "websocket client handshake complete");
                self.deliver(index, Event::WsHandshakeDone);
            } else {
                self.protocol_error(index, "websocket handshake rejected");
            }
            return;
        }

        // Server side: recognize the upgrade request.
        if !client && msg.is_websocket_upgrade() {
            let key = msg
                .header("sec-websocket-key")
                .unwrap_or_default()
                .to_string();
            let queued_before = self.conns.get(index).map_or(0, |c| c.send.len());
            self.deliver(index, Event::WsHandshakeRequest(&msg));

            let Some(conn) = self.conns.get_mut(index) else {
                return;
            };
            if conn.flags.contains(Flags::CLOSE_NOW) {
                return;
            }
            if conn.send.len() == queued_before {
                // The handler queued nothing; answer the upgrade ourselves.
                conn.send.append(upgrade_response(&key).as_bytes());
            }
            state.mode = Mode::Ws { client: false };
            debug!(conn = index, "websocket upgrade accepted");
            self.deliver(index, Event::WsHandshakeDone);
            return;
        }

        if msg.is_request() {
            self.deliver(index, Event::HttpRequest(&msg));
        } else {
            self.deliver(index, Event::HttpReply(&msg));
        }
    }

    /// One WebSocket frame: decode, enforce mask direction, unmask in place,
    /// reassemble continuations, answer control frames.
    fn step_ws(
        &mut self,
        index: usize,
        state: &mut HttpWsState,
        buf: &mut IoBuf,
        consumed: &mut usize,
        progressed: &mut bool,
        client: bool,
    ) {
        let (header, header_len) = match FrameHeader::parse(buf.as_slice()) {
            Ok(parsed) => parsed,
            Err(FrameError::Incomplete) => return,
            Err(e) => {
                self.protocol_error(index, &e.to_string());
                return;
            }
        };

        // Clients must mask; servers must not.
        if !client && header.mask.is_none() {
            self.protocol_error(index, "unmasked frame from client");
            return;
        }
        if client && header.mask.is_some() {
            self.protocol_error(index, "masked frame from server");
            return;
        }

        let Ok(payload_len) = usize::try_from(header.payload_len) else {
            self.protocol_error(index, "oversized frame");
            return;
        };
        if buf.len() < header_len + payload_len {
            return;
        }

        if let Some(key) = header.mask {
            websocket::apply_mask(
                key,
                0,
                &mut buf.as_mut_slice()[header_len..header_len + payload_len],
            );
        }
        *consumed = header_len + payload_len;
        *progressed = true;

        let payload = &buf.as_slice()[header_len..header_len + payload_len];

        match header.opcode {
            OpCode::Ping => {
                let echo = payload.to_vec();
                self.deliver(
                    index,
                    Event::WsFrame(WsFrame {
                        opcode: OpCode::Ping,
                        fin: true,
                        payload: &echo,
                    }),
                );
                let _ = self.queue_ws_frame(index, OpCode::Pong, &[&echo], true);
            }
            OpCode::Pong => {
                self.deliver(
                    index,
                    Event::WsFrame(WsFrame {
                        opcode: OpCode::Pong,
                        fin: true,
                        payload,
                    }),
                );
            }
            OpCode::Close => {
                let echo = payload.to_vec();
                self.deliver(
                    index,
                    Event::WsFrame(WsFrame {
                        opcode: OpCode::Close,
                        fin: true,
                        payload: &echo,
                    }),
                );
                if !state.close_sent {
                    state.close_sent = true;
                    let _ = self.queue_ws_frame(index, OpCode::Close, &[&echo], true);
                }
                // Graceful teardown: the echoed CLOSE flushes first.
                if let Some(conn) = self.conns.get_mut(index) {
                    conn.flags.insert(Flags::FINISHED_SENDING);
                }
            }
            OpCode::Continuation => match state.frag_opcode {
                None => self.protocol_error(index, "continuation without initial fragment"),
                Some(opcode) => {
                    state.frag.extend_from_slice(payload);
                    if header.fin {
                        state.frag_opcode = None;
                        self.deliver(
                            index,
                            Event::WsFrame(WsFrame {
                                opcode,
                                fin: true,
                                payload: &state.frag,
                            }),
                        );
                        state.frag.clear();
                    }
                }
            },
            opcode @ (OpCode::Text | OpCode::Binary) => {
                if state.frag_opcode.is_some() {
                    self.protocol_error(index, "data frame interleaved with fragments");
                } else if header.fin {
                    self.deliver(
                        index,
                        Event::WsFrame(WsFrame {
                            opcode,
                            fin: true,
                            payload,
                        }),
                    );
                } else {
                    state.frag_opcode = Some(opcode);
                    state.frag.extend_from_slice(payload);
                }
            }
        }
    }

    fn queue_ws_frame(
        &mut self,
        index: usize,
        opcode: OpCode,
        parts: &[&[u8]],
        fin: bool,
    ) -> Result<(), Error> {
        let Some(conn) = self.conns.get_mut(index) else {
            return Err(Error::InvalidConnection);
        };
        if conn.flags.contains(Flags::LISTENING) || conn.flags.contains(Flags::UDP) {
            return Err(Error::Unsupported);
        }

        let mask = if conn.client {
            Some(rand::random::<[u8; 4]>())
        } else {
            None
        };
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let header = FrameHeader {
            fin,
            opcode,
            mask,
            payload_len: total as u64,
        };
        let mut head = [0u8; websocket::MAX_HEADER_LEN];
        let head_len = header.encode(&mut head);

        // One contiguous append (header then payload) so frames queued in
        // the same iteration never interleave.
        conn.send.reserve(head_len + total);
        conn.send.append(&head[..head_len]);
        let mut offset = 0;
        for part in parts {
            let start = conn.send.len();
            conn.send.append(part);
            if let Some(key) = mask {
                websocket::apply_mask(key, offset, &mut conn.send.as_mut_slice()[start..]);
            }
            offset += part.len();
        }
        Ok(())
    }

    fn protocol_error(&mut self, index: usize, reason: &str) {
        warn!(conn = index, reason, "protocol error");
        self.deliver(index, Event::ProtocolError(reason));
        if let Some(conn) = self.conns.get_mut(index) {
            conn.flags.insert(Flags::CLOSE_NOW);
        }
    }
}

fn upgrade_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        websocket::accept_key(key)
    )
}
