//! Echo client demo: sends a batch of pings and prints the echoes. Run with:
//!   cargo run --example echo_client -- 127.0.0.1:12355 5

use reactnet::{
    HandlerContext, LengthPrefixFraming, NetMessage, ReactorManager, SessionHandler, SessionId,
    TcpClient,
};
use std::sync::Arc;
use std::time::Duration;

struct Pinger {
    remaining: usize,
    mgr: Arc<ReactorManager>,
}

impl SessionHandler for Pinger {
    fn on_connected(&mut self, ctx: &mut HandlerContext) {
        println!("connected to {} as session {}", ctx.remote_addr(), ctx.session_id());
        ctx.send(NetMessage::from_slice(b"ping"));
    }

    fn on_message(&mut self, ctx: &mut HandlerContext, message: NetMessage) {
        println!("echo: {}", String::from_utf8_lossy(message.data()));
        self.remaining -= 1;
        if self.remaining == 0 {
            ctx.close();
        } else {
            ctx.send(NetMessage::from_slice(b"ping"));
        }
    }

    fn on_closed(&mut self, session_id: SessionId) {
        println!("session {} closed", session_id);
        self.mgr.stop();
    }
}

pub fn main() {
    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:12355".to_owned());
    let count: usize = args.next().and_then(|n| n.parse().ok()).unwrap_or(5);

    let mgr = ReactorManager::new(2).expect("failed to create reactors");
    TcpClient::connect(
        &mgr,
        addr.as_str(),
        Box::new(Pinger {
            remaining: count,
            mgr: Arc::clone(&mgr),
        }),
        Box::new(LengthPrefixFraming::new()),
        Duration::ZERO,
    )
    .expect("failed to connect");
    mgr.run();
    mgr.join();
}
