//! End-to-end TCP scenarios over loopback: echo, graceful close, event
//! ordering.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use muxio::{ConnToken, Event, EventHandler, Flags, Manager};

type Log = Rc<RefCell<Vec<String>>>;

fn pump(mgr: &mut Manager, mut done: impl FnMut(&Manager) -> bool) {
    for _ in 0..500 {
        mgr.poll(Some(Duration::from_millis(5))).unwrap();
        if done(mgr) {
            return;
        }
    }
    panic!("scenario did not complete in time");
}

/// Shared by the listener and its accepted connections: logs lifecycle
/// events and echoes whatever arrives.
struct EchoServer {
    log: Log,
}

impl EventHandler for EchoServer {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        match event {
            Event::Accept(_) => self.log.borrow_mut().push("accept".into()),
            Event::Recv(n) => {
                self.log.borrow_mut().push(format!("recv:{n}"));
                let data = mgr.recv_take(conn).unwrap();
                mgr.send(conn, data.as_slice()).unwrap();
            }
            Event::Sent(n) => self.log.borrow_mut().push(format!("sent:{n}")),
            Event::Close => self.log.borrow_mut().push("close".into()),
            _ => {}
        }
    }
}

struct EchoClient {
    received: Rc<RefCell<Vec<u8>>>,
    closed: Rc<RefCell<bool>>,
}

impl EventHandler for EchoClient {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        match event {
            Event::Connect(result) => {
                result.unwrap();
                mgr.send(conn, b"hello").unwrap();
            }
            Event::Recv(_) => {
                let data = mgr.recv_take(conn).unwrap();
                self.received.borrow_mut().extend_from_slice(data.as_slice());
                mgr.close(conn).unwrap();
            }
            Event::Close => *self.closed.borrow_mut() = true,
            _ => {}
        }
    }
}

#[test]
fn tcp_echo_roundtrip() {
    let mut mgr = Manager::new().unwrap();

    let server_log: Log = Rc::new(RefCell::new(Vec::new()));
    let listener = mgr
        .bind(
            "127.0.0.1:0",
            EchoServer {
                log: server_log.clone(),
            },
        )
        .unwrap();
    let addr = mgr.local_addr(listener).unwrap().unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(RefCell::new(false));
    mgr.connect(
        &format!("127.0.0.1:{}", addr.port()),
        EchoClient {
            received: received.clone(),
            closed: closed.clone(),
        },
    )
    .unwrap();

    {
        let server_log = server_log.clone();
        pump(&mut mgr, move |_| {
            server_log.borrow().iter().any(|e| e == "close")
        });
    }

    assert_eq!(received.borrow().as_slice(), b"hello");
    assert!(*closed.borrow());

    // The server observed RECV(5) then SENT(5) then CLOSE, after the accept.
    let log = server_log.borrow();
    let accept = log.iter().position(|e| e == "accept").unwrap();
    let recv = log.iter().position(|e| e == "recv:5").unwrap();
    let sent = log.iter().position(|e| e == "sent:5").unwrap();
    let close = log.iter().position(|e| e == "close").unwrap();
    assert!(accept < recv);
    assert!(recv < sent);
    assert!(sent < close);
}

/// The server queues "bye" and requests a graceful close; the client must
/// still receive the full payload before observing EOF.
struct ByeServer {
    log: Log,
}

impl EventHandler for ByeServer {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        match event {
            Event::Accept(_) => {
                mgr.send(conn, b"bye").unwrap();
                mgr.set_flags(conn, Flags::FINISHED_SENDING).unwrap();
            }
            Event::Sent(n) => self.log.borrow_mut().push(format!("sent:{n}")),
            Event::Close => self.log.borrow_mut().push("close".into()),
            _ => {}
        }
    }
}

struct Collector {
    received: Rc<RefCell<Vec<u8>>>,
    closed: Rc<RefCell<bool>>,
}

impl EventHandler for Collector {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        match event {
            Event::Recv(_) => {
                let data = mgr.recv_take(conn).unwrap();
                self.received.borrow_mut().extend_from_slice(data.as_slice());
            }
            Event::Close => *self.closed.borrow_mut() = true,
            _ => {}
        }
    }
}

#[test]
fn graceful_close_flushes_first() {
    let mut mgr = Manager::new().unwrap();

    let server_log: Log = Rc::new(RefCell::new(Vec::new()));
    let listener = mgr
        .bind(
            "127.0.0.1:0",
            ByeServer {
                log: server_log.clone(),
            },
        )
        .unwrap();
    let addr = mgr.local_addr(listener).unwrap().unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(RefCell::new(false));
    mgr.connect(
        &format!("127.0.0.1:{}", addr.port()),
        Collector {
            received: received.clone(),
            closed: closed.clone(),
        },
    )
    .unwrap();

    {
        let closed = closed.clone();
        pump(&mut mgr, move |_| *closed.borrow());
    }

    assert_eq!(received.borrow().as_slice(), b"bye");
    let log = server_log.borrow();
    let sent = log.iter().position(|e| e == "sent:3").unwrap();
    let close = log.iter().position(|e| e == "close").unwrap();
    assert!(sent < close);
}

/// Idle timeout built from `Poll` + `last_io`, the caller-side pattern the
/// manager supports instead of an internal timer wheel.
struct IdleCloser;

impl EventHandler for IdleCloser {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        if matches!(event, Event::Poll)
            && !mgr.flags(conn).unwrap().contains(Flags::LISTENING)
            && mgr.tick() >= mgr.last_io(conn).unwrap()
        {
            // Zero-tolerance idle policy for the test: close on first poll.
            mgr.close(conn).unwrap();
        }
    }
}

#[test]
fn poll_handler_can_close_idle_connections() {
    let mut mgr = Manager::new().unwrap();
    let listener = mgr.bind("127.0.0.1:0", IdleCloser).unwrap();
    let addr = mgr.local_addr(listener).unwrap().unwrap();

    let closed = Rc::new(RefCell::new(false));
    mgr.connect(
        &format!("127.0.0.1:{}", addr.port()),
        Collector {
            received: Rc::new(RefCell::new(Vec::new())),
            closed: closed.clone(),
        },
    )
    .unwrap();

    {
        let closed = closed.clone();
        pump(&mut mgr, move |_| *closed.borrow());
    }
    // Only the listener remains on the server side.
    pump(&mut mgr, |m| m.len() == 1);
}
