//! HTTP protocol handler scenarios: chunk-at-a-time request assembly,
//! pipelining, response parsing, and parse-error close behavior.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use muxio::{ConnToken, Event, EventHandler, Manager, StartLine};

fn pump(mgr: &mut Manager, mut done: impl FnMut(&Manager) -> bool) {
    for _ in 0..500 {
        mgr.poll(Some(Duration::from_millis(5))).unwrap();
        if done(mgr) {
            return;
        }
    }
    panic!("scenario did not complete in time");
}

#[derive(Default)]
struct SeenRequest {
    method: String,
    uri: String,
    body: Vec<u8>,
}

struct HttpServer {
    requests: Rc<RefCell<Vec<SeenRequest>>>,
    errors: Rc<RefCell<Vec<String>>>,
}

impl EventHandler for HttpServer {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        match event {
            Event::HttpRequest(msg) => {
                let StartLine::Request { method, uri, .. } = msg.start else {
                    panic!("expected a request start line");
                };
                self.requests.borrow_mut().push(SeenRequest {
                    method: method.to_string(),
                    uri: uri.to_string(),
                    body: msg.body.to_vec(),
                });
                mgr.send_fmt(
                    conn,
                    format_args!("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"),
                )
                .unwrap();
            }
            Event::ProtocolError(reason) => {
                self.errors.borrow_mut().push(reason.to_string());
            }
            _ => {}
        }
    }
}

/// Writes one queued chunk per `Poll` iteration once connected, so the
/// request arrives in deliberately split pieces.
struct ChunkedWriter {
    chunks: Vec<Vec<u8>>,
    next: usize,
    connected: bool,
    replies: Rc<RefCell<Vec<u8>>>,
}

impl EventHandler for ChunkedWriter {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        match event {
            Event::Connect(result) => {
                result.unwrap();
                self.connected = true;
            }
            Event::Poll => {
                if self.connected && self.next < self.chunks.len() {
                    let chunk = self.chunks[self.next].clone();
                    self.next += 1;
                    mgr.send(conn, &chunk).unwrap();
                }
            }
            Event::Recv(_) => {
                let data = mgr.recv_take(conn).unwrap();
                self.replies.borrow_mut().extend_from_slice(data.as_slice());
            }
            _ => {}
        }
    }
}

#[test]
fn request_assembled_from_three_chunks() {
    let mut mgr = Manager::new().unwrap();

    let requests = Rc::new(RefCell::new(Vec::new()));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let listener = mgr
        .bind(
            "127.0.0.1:0",
            HttpServer {
                requests: requests.clone(),
                errors: errors.clone(),
            },
        )
        .unwrap();
    mgr.attach_http_websocket(listener).unwrap();
    let addr = mgr.local_addr(listener).unwrap().unwrap();

    let replies = Rc::new(RefCell::new(Vec::new()));
    mgr.connect(
        &format!("127.0.0.1:{}", addr.port()),
        ChunkedWriter {
            chunks: vec![
                b"GET /a HTTP/1.1\r\nHo".to_vec(),
                b"st: h\r\nContent-Length: 3\r\n".to_vec(),
                b"\r\nxyz".to_vec(),
            ],
            next: 0,
            connected: false,
            replies: replies.clone(),
        },
    )
    .unwrap();

    {
        let replies = replies.clone();
        pump(&mut mgr, move |_| !replies.borrow().is_empty());
    }

    let requests = requests.borrow();
    assert_eq!(requests.len(), 1, "exactly one HttpRequest must fire");
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].uri, "/a");
    assert_eq!(requests[0].body, b"xyz");
    assert!(errors.borrow().is_empty());
    assert!(replies.borrow().ends_with(b"ok"));
}

#[test]
fn pipelined_requests_each_fire() {
    let mut mgr = Manager::new().unwrap();

    let requests = Rc::new(RefCell::new(Vec::new()));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let listener = mgr
        .bind(
            "127.0.0.1:0",
            HttpServer {
                requests: requests.clone(),
                errors: errors.clone(),
            },
        )
        .unwrap();
    mgr.attach_http_websocket(listener).unwrap();
    let addr = mgr.local_addr(listener).unwrap().unwrap();

    let replies = Rc::new(RefCell::new(Vec::new()));
    mgr.connect(
        &format!("127.0.0.1:{}", addr.port()),
        ChunkedWriter {
            // Two complete requests in one write.
            chunks: vec![
                b"GET /one HTTP/1.1\r\nHost: h\r\n\r\nGET /two HTTP/1.1\r\nHost: h\r\n\r\n"
                    .to_vec(),
            ],
            next: 0,
            connected: false,
            replies: replies.clone(),
        },
    )
    .unwrap();

    {
        let requests = requests.clone();
        pump(&mut mgr, move |_| requests.borrow().len() >= 2);
    }

    let requests = requests.borrow();
    assert_eq!(requests[0].uri, "/one");
    assert_eq!(requests[1].uri, "/two");
}

/// The client side of the protocol handler: a reply parses into HttpReply.
struct HttpClient {
    statuses: Rc<RefCell<Vec<u16>>>,
    bodies: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl EventHandler for HttpClient {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        match event {
            Event::Connect(result) => {
                result.unwrap();
                mgr.attach_http_websocket(conn).unwrap();
                mgr.send(conn, b"GET /hello HTTP/1.1\r\nHost: h\r\n\r\n")
                    .unwrap();
            }
            Event::HttpReply(msg) => {
                let StartLine::Response { status, .. } = msg.start else {
                    panic!("expected a status line");
                };
                self.statuses.borrow_mut().push(status);
                self.bodies.borrow_mut().push(msg.body.to_vec());
            }
            _ => {}
        }
    }
}

#[test]
fn client_parses_reply() {
    let mut mgr = Manager::new().unwrap();

    let requests = Rc::new(RefCell::new(Vec::new()));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let listener = mgr
        .bind(
            "127.0.0.1:0",
            HttpServer {
                requests: requests.clone(),
                errors: errors.clone(),
            },
        )
        .unwrap();
    mgr.attach_http_websocket(listener).unwrap();
    let addr = mgr.local_addr(listener).unwrap().unwrap();

    let statuses = Rc::new(RefCell::new(Vec::new()));
    let bodies = Rc::new(RefCell::new(Vec::new()));
    mgr.connect(
        &format!("127.0.0.1:{}", addr.port()),
        HttpClient {
            statuses: statuses.clone(),
            bodies: bodies.clone(),
        },
    )
    .unwrap();

    {
        let statuses = statuses.clone();
        pump(&mut mgr, move |_| !statuses.borrow().is_empty());
    }

    assert_eq!(statuses.borrow().as_slice(), &[200]);
    assert_eq!(bodies.borrow()[0], b"ok");
}

#[test]
fn malformed_request_closes_without_http_event() {
    let mut mgr = Manager::new().unwrap();

    let requests = Rc::new(RefCell::new(Vec::new()));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let listener = mgr
        .bind(
            "127.0.0.1:0",
            HttpServer {
                requests: requests.clone(),
                errors: errors.clone(),
            },
        )
        .unwrap();
    mgr.attach_http_websocket(listener).unwrap();
    let addr = mgr.local_addr(listener).unwrap().unwrap();

    let closed = Rc::new(RefCell::new(false));
    {
        struct Garbage {
            closed: Rc<RefCell<bool>>,
        }
        impl EventHandler for Garbage {
            fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
                match event {
                    Event::Connect(result) => {
                        result.unwrap();
                        mgr.send(conn, b"BROKEN\r\nHost: h\r\n\r\n").unwrap();
                    }
                    Event::Close => *self.closed.borrow_mut() = true,
                    _ => {}
                }
            }
        }
        mgr.connect(
            &format!("127.0.0.1:{}", addr.port()),
            Garbage {
                closed: closed.clone(),
            },
        )
        .unwrap();
    }

    {
        let closed = closed.clone();
        pump(&mut mgr, move |_| *closed.borrow());
    }

    assert!(requests.borrow().is_empty());
    assert_eq!(errors.borrow().len(), 1);
}
