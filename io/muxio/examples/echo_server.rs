use std::time::Duration;

use muxio::{ConnToken, Event, EventHandler, Manager};

struct EchoHandler {
    connections: u32,
}

impl EventHandler for EchoHandler {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        match event {
            Event::Accept(peer) => {
                self.connections += 1;
                eprintln!("accepted {peer} (total: {})", self.connections);
            }
            Event::Recv(_) => {
                let data = mgr.recv_take(conn).unwrap();
                if let Err(e) = mgr.send(conn, data.as_slice()) {
                    eprintln!("send error: {e}");
                }
            }
            Event::Close => {
                self.connections = self.connections.saturating_sub(1);
                eprintln!("connection closed (remaining: {})", self.connections);
            }
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
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());

    let mut mgr = Manager::new().expect("failed to create manager");
    mgr.bind(&bind_addr, EchoHandler { connections: 0 })
        .expect("failed to bind");

    eprintln!("echo server on {bind_addr}");
    loop {
        mgr.poll(Some(Duration::from_millis(500))).expect("poll");
    }
}
