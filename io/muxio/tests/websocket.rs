//! WebSocket scenarios over loopback: upgrade handshake, fragmentation
//! reassembly, echo, ping auto-answer, and mask-direction enforcement.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use muxio::{ConnToken, Event, EventHandler, Manager, OpCode};
use protocol_http::websocket::{FrameHeader, MAX_HEADER_LEN, apply_mask};

fn pump(mgr: &mut Manager, mut done: impl FnMut(&Manager) -> bool) {
    for _ in 0..500 {
        mgr.poll(Some(Duration::from_millis(5))).unwrap();
        if done(mgr) {
            return;
        }
    }
    panic!("scenario did not complete in time");
}

/// Build one raw frame, optionally masked, for byte-level injection.
fn raw_frame(fin: bool, opcode: OpCode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let header = FrameHeader {
        fin,
        opcode,
        mask,
        payload_len: payload.len() as u64,
    };
    let mut head = [0u8; MAX_HEADER_LEN];
    let head_len = header.encode(&mut head);
    let mut out = head[..head_len].to_vec();
    let start = out.len();
    out.extend_from_slice(payload);
    if let Some(key) = mask {
        apply_mask(key, 0, &mut out[start..]);
    }
    out
}

struct WsServer {
    log: Rc<RefCell<Vec<String>>>,
}

impl EventHandler for WsServer {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        match event {
            Event::WsHandshakeRequest(_) => self.log.borrow_mut().push("handshake-request".into()),
            Event::WsHandshakeDone => self.log.borrow_mut().push("handshake-done".into()),
            Event::WsFrame(frame) => {
                self.log.borrow_mut().push(format!(
                    "frame:{:?}:{}",
                    frame.opcode,
                    String::from_utf8_lossy(frame.payload)
                ));
                if matches!(frame.opcode, OpCode::Text | OpCode::Binary) {
                    mgr.send_ws_frame(conn, frame.opcode, frame.payload).unwrap();
                }
            }
            Event::ProtocolError(reason) => {
                self.log.borrow_mut().push(format!("error:{reason}"));
            }
            _ => {}
        }
    }
}

/// Client that completes the upgrade and then injects raw frame bytes.
struct WsClient {
    sends_on_done: Vec<Vec<u8>>,
    log: Rc<RefCell<Vec<String>>>,
}

impl EventHandler for WsClient {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        match event {
            Event::Connect(result) => {
                result.unwrap();
                mgr.send_ws_handshake_request(conn, "localhost", "/chat")
                    .unwrap();
            }
            Event::WsHandshakeDone => {
                self.log.borrow_mut().push("handshake-done".into());
                for bytes in self.sends_on_done.drain(..) {
                    mgr.send(conn, &bytes).unwrap();
                }
            }
            Event::WsFrame(frame) => {
                self.log.borrow_mut().push(format!(
                    "frame:{:?}:{}",
                    frame.opcode,
                    String::from_utf8_lossy(frame.payload)
                ));
            }
            Event::ProtocolError(reason) => {
                self.log.borrow_mut().push(format!("error:{reason}"));
            }
            _ => {}
        }
    }
}

fn ws_pair(
    mgr: &mut Manager,
    sends_on_done: Vec<Vec<u8>>,
) -> (Rc<RefCell<Vec<String>>>, Rc<RefCell<Vec<String>>>) {
    let server_log = Rc::new(RefCell::new(Vec::new()));
    let listener = mgr
        .bind(
            "127.0.0.1:0",
            WsServer {
                log: server_log.clone(),
            },
        )
        .unwrap();
    mgr.attach_http_websocket(listener).unwrap();
    let addr = mgr.local_addr(listener).unwrap().unwrap();

    let client_log = Rc::new(RefCell::new(Vec::new()));
    mgr.connect(
        &format!("127.0.0.1:{}", addr.port()),
        WsClient {
            sends_on_done,
            log: client_log.clone(),
        },
    )
    .unwrap();

    (server_log, client_log)
}

#[test]
fn upgrade_handshake_completes_on_both_sides() {
    let mut mgr = Manager::new().unwrap();
    let (server_log, client_log) = ws_pair(&mut mgr, Vec::new());

    {
        let client_log = client_log.clone();
        pump(&mut mgr, move |_| {
            client_log.borrow().iter().any(|e| e == "handshake-done")
        });
    }

    let server = server_log.borrow();
    assert!(server.iter().any(|e| e == "handshake-request"));
    assert!(server.iter().any(|e| e == "handshake-done"));
    let request = server.iter().position(|e| e == "handshake-request").unwrap();
    let done = server.iter().position(|e| e == "handshake-done").unwrap();
    assert!(request < done);
}

#[test]
fn fragmented_message_reassembles() {
    let key = [0x11, 0x22, 0x33, 0x44];
    let frames = vec![
        raw_frame(false, OpCode::Text, b"He", Some(key)),
        raw_frame(false, OpCode::Continuation, b"ll", Some(key)),
        raw_frame(true, OpCode::Continuation, b"o", Some(key)),
    ];

    let mut mgr = Manager::new().unwrap();
    let (server_log, client_log) = ws_pair(&mut mgr, frames);

    {
        let client_log = client_log.clone();
        pump(&mut mgr, move |_| {
            client_log.borrow().iter().any(|e| e.starts_with("frame:"))
        });
    }

    // One reassembled frame with the first fragment's opcode.
    let server = server_log.borrow();
    let frames: Vec<_> = server.iter().filter(|e| e.starts_with("frame:")).collect();
    assert_eq!(frames, vec!["frame:Text:Hello"]);

    // The server echo arrives at the client as a single unmasked frame.
    let client = client_log.borrow();
    assert!(client.iter().any(|e| e == "frame:Text:Hello"));
}

#[test]
fn ping_is_answered_with_pong() {
    let key = [9, 9, 9, 9];
    let frames = vec![raw_frame(true, OpCode::Ping, b"hb", Some(key))];

    let mut mgr = Manager::new().unwrap();
    let (server_log, client_log) = ws_pair(&mut mgr, frames);

    {
        let client_log = client_log.clone();
        pump(&mut mgr, move |_| {
            client_log.borrow().iter().any(|e| e == "frame:Pong:hb")
        });
    }

    assert!(server_log.borrow().iter().any(|e| e == "frame:Ping:hb"));
}

#[test]
fn unmasked_client_frame_is_rejected() {
    let frames = vec![raw_frame(true, OpCode::Text, b"nope", None)];

    let mut mgr = Manager::new().unwrap();
    let (server_log, _client_log) = ws_pair(&mut mgr, frames);

    {
        let server_log = server_log.clone();
        pump(&mut mgr, move |_| {
            server_log.borrow().iter().any(|e| e.starts_with("error:"))
        });
    }

    let server = server_log.borrow();
    assert!(
        server
            .iter()
            .any(|e| e == "error:unmasked frame from client")
    );
    assert!(!server.iter().any(|e| e.starts_with("frame:")));
}

#[test]
fn large_payload_uses_extended_length() {
    // 70 KiB forces the 64-bit length form on the echo path.
    let payload = vec![b'x'; 70 * 1024];
    let key = [1, 2, 3, 4];
    let frames = vec![raw_frame(true, OpCode::Binary, &payload, Some(key))];

    let mut mgr = Manager::new().unwrap();
    let (server_log, client_log) = ws_pair(&mut mgr, frames);

    {
        let client_log = client_log.clone();
        pump(&mut mgr, move |_| {
            client_log.borrow().iter().any(|e| e.starts_with("frame:Binary:"))
        });
    }

    let server = server_log.borrow();
    let frame = server
        .iter()
        .find(|e| e.starts_with("frame:Binary:"))
        .unwrap();
    assert_eq!(frame.len(), "frame:Binary:".len() + payload.len());
}
