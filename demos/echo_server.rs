//! Echo server demo. Run with:
//!   cargo run --example echo_server -- 127.0.0.1:12355

use reactnet::{
    HandlerContext, HandlerFactory, LengthPrefixFraming, NetMessage, ReactorManager,
    SessionHandler, SessionId, TcpServer,
};
use std::sync::Arc;
use std::time::Duration;

struct Echo;

impl SessionHandler for Echo {
    fn on_connected(&mut self, ctx: &mut HandlerContext) {
        println!("session {} connected from {}", ctx.session_id(), ctx.remote_addr());
    }

    fn on_message(&mut self, ctx: &mut HandlerContext, message: NetMessage) {
        ctx.send(message);
    }

    fn on_closed(&mut self, session_id: SessionId) {
        println!("session {} closed", session_id);
    }
}

pub fn main() {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:12355".to_owned());
    let mgr = ReactorManager::new(3).expect("failed to create reactors");
    let factory: HandlerFactory = Arc::new(|| Box::new(Echo));
    let _server = TcpServer::bind(
        &mgr,
        addr.as_str(),
        factory,
        LengthPrefixFraming::factory(),
        Duration::from_secs(60),
    )
    .expect("failed to bind");
    println!("echo server on {}", addr);
    mgr.run();
}
