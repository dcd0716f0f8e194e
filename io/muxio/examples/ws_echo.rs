use std::time::Duration;

use muxio::{ConnToken, Event, EventHandler, Manager, OpCode};

struct WsEchoHandler;

impl EventHandler for WsEchoHandler {
    fn on_event(&mut self, mgr: &mut Manager, conn: ConnToken, event: Event<'_>) {
        match event {
            Event::WsHandshakeDone => eprintln!("websocket client connected"),
            Event::WsFrame(frame) => {
                if matches!(frame.opcode, OpCode::Text | OpCode::Binary) {
                    if let Err(e) = mgr.send_ws_frame(conn, frame.opcode, frame.payload) {
                        eprintln!("send error: {e}");
                    }
                }
            }
            Event::ProtocolError(reason) => eprintln!("protocol error: {reason}"),
            Event::Close => eprintln!("connection closed"),
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
        .unwrap_or_else(|| "127.0.0.1:9001".to_string());

    let mut mgr = Manager::new().expect("failed to create manager");
    let listener = mgr.bind(&bind_addr, WsEchoHandler).expect("failed to bind");
    mgr.attach_http_websocket(listener)
        .expect("attach protocol");

    eprintln!("websocket echo on ws://{bind_addr}/");
    loop {
        mgr.poll(Some(Duration::from_millis(500))).expect("poll");
    }
}
