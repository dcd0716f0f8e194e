use std::time::Duration;

use muxio::{ConnToken, Event, EventHandler, Flags, Manager, StartLine};

struct HelloHandler;

impl EventHandler for HelloHandler {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        match event {
            Event::HttpRequest(msg) => {
                let StartLine::Request { method, uri, .. } = msg.start else {
                    return;
                };
                eprintln!("{method} {uri}");
                let body = format!("hello from {uri}\n");
                let _ = mgr.send_fmt(
                    conn,
                    format_args!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    ),
                );
                let _ = mgr.set_flags(conn, Flags::FINISHED_SENDING);
            }
            Event::ProtocolError(reason) => eprintln!("bad request: {reason}"),
            _ => {}
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());

    let mut mgr = Manager::new().expect("failed to create manager");
    let listener = mgr.bind(&bind_addr, HelloHandler).expect("failed to bind");
    mgr.attach_http_websocket(listener)
        .expect("attach protocol");

    eprintln!("http server on http://{bind_addr}/");
    loop {
        mgr.poll(Some(Duration::from_millis(500))).expect("poll");
    }
}
