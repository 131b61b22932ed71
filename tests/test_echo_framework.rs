//! End-to-end test with a custom stream-oriented framing: newline-delimited
//! text, declared via `ANY_BYTES` so the read loop hands over whatever the
//! socket has.

use reactnet::{
    Error, HandlerContext, HandlerFactory, NetMessage, MessageFraming, ReactorManager,
    SessionHandler, TcpClient, ANY_BYTES,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Messages are lines; the trailing b'\n' is the frame boundary.
struct LineFraming {
    partial: Vec<u8>,
}

impl LineFraming {
    fn new() -> Self {
        Self { partial: Vec::new() }
    }
}

impl MessageFraming for LineFraming {
    fn bytes_wanna_read(&mut self) -> usize {
        ANY_BYTES
    }

    fn bytes_wanna_write(&self, messages: &[NetMessage]) -> usize {
        messages.iter().map(|m| m.readable() + 1).sum()
    }

    fn decode(&mut self, buffer: &[u8], received: &mut Vec<NetMessage>) -> Result<usize, Error> {
        for &byte in buffer {
            if byte == b'\n' {
                received.push(NetMessage::from_slice(&self.partial));
                self.partial.clear();
            } else {
                self.partial.push(byte);
            }
        }
        Ok(buffer.len())
    }

    fn encode(&self, messages: &[NetMessage], buffer: &mut Vec<u8>) -> Result<usize, Error> {
        let mut total = 0;
        for message in messages {
            buffer.extend_from_slice(message.data());
            buffer.push(b'\n');
            total += message.readable() + 1;
        }
        Ok(total)
    }
}

struct LineEcho;

impl SessionHandler for LineEcho {
    fn on_message(&mut self, ctx: &mut HandlerContext, message: NetMessage) {
        ctx.send(message);
    }
}

struct LineClient {
    outstanding: Vec<&'static str>,
    replies: mpsc::Sender<String>,
}

impl SessionHandler for LineClient {
    fn on_connected(&mut self, ctx: &mut HandlerContext) {
        for line in &self.outstanding {
            ctx.send(NetMessage::from_slice(line.as_bytes()));
        }
    }

    fn on_message(&mut self, ctx: &mut HandlerContext, message: NetMessage) {
        let _ = self
            .replies
            .send(String::from_utf8_lossy(message.data()).into_owned());
        self.outstanding.pop();
        if self.outstanding.is_empty() {
            ctx.close();
        }
    }
}

#[test]
pub fn test_line_framed_echo_end_to_end() {
    let mgr = ReactorManager::new(3).unwrap();
    let factory: HandlerFactory = Arc::new(|| Box::new(LineEcho));
    let server = reactnet::TcpServer::bind(
        &mgr,
        "127.0.0.1:0",
        factory,
        Arc::new(|| Box::new(LineFraming::new())),
        Duration::ZERO,
    )
    .unwrap();
    let runner = {
        let mgr = Arc::clone(&mgr);
        std::thread::spawn(move || mgr.run())
    };

    let lines = vec!["alpha", "beta", "gamma"];
    let (tx, rx) = mpsc::channel();
    TcpClient::connect(
        &mgr,
        server.local_addr(),
        Box::new(LineClient {
            outstanding: lines.clone(),
            replies: tx,
        }),
        Box::new(LineFraming::new()),
        Duration::ZERO,
    )
    .unwrap();

    let mut echoed = Vec::new();
    for _ in 0..lines.len() {
        echoed.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    assert_eq!(echoed, lines);

    drop(server);
    mgr.stop();
    runner.join().unwrap();
    mgr.join();
}
