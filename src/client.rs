//! The connecting side. A client session is identical to an accepted one
//! once registered: same handler callbacks, same framing, same placement on
//! the least-loaded reactor.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::framing::MessageFraming;
use crate::logmsg;
use crate::manager::{ReactorManager, SessionHandler};
use crate::reactor::MAIN_THREAD_ID;

pub struct TcpClient;

impl TcpClient {
    /// Connects on the calling thread, then registers the stream as a
    /// session. The session ID is delivered through `on_connected`.
    pub fn connect<A: ToSocketAddrs>(
        mgr: &Arc<ReactorManager>,
        addr: A,
        handler: Box<dyn SessionHandler>,
        framing: Box<dyn MessageFraming>,
        keep_alive: Duration,
    ) -> Result<(), Error> {
        let stream = TcpStream::connect(addr)?;
        mgr.post_to(
            MAIN_THREAD_ID,
            Box::new(move |core, mgr| {
                if let Err(err) =
                    ReactorManager::session_connected(mgr, core, stream, handler, framing, keep_alive)
                {
                    logmsg!("[ERROR] client session setup failed: {}", err);
                }
            }),
        )
    }

    /// Like [`connect`], but the connect itself happens on the main reactor
    /// thread so the caller never blocks. Connect failures go to `on_error`.
    ///
    /// [`connect`]: TcpClient::connect
    pub fn connect_deferred<A>(
        mgr: &Arc<ReactorManager>,
        addr: A,
        handler: Box<dyn SessionHandler>,
        framing: Box<dyn MessageFraming>,
        keep_alive: Duration,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) -> Result<(), Error>
    where
        A: ToSocketAddrs + Send + 'static,
    {
        mgr.post_to(
            MAIN_THREAD_ID,
            Box::new(move |core, mgr| {
                let connected = TcpStream::connect(addr)
                    .map_err(Error::Io)
                    .and_then(|stream| {
                        ReactorManager::session_connected(
                            mgr, core, stream, handler, framing, keep_alive,
                        )
                    });
                if let Err(err) = connected {
                    on_error(err);
                }
            }),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffer::NetMessage;
    use crate::framing::LengthPrefixFraming;
    use crate::manager::{HandlerContext, HandlerFactory};
    use crate::server::TcpServer;
    use std::sync::mpsc;

    struct EchoBack;
    impl SessionHandler for EchoBack {
        fn on_message(&mut self, ctx: &mut HandlerContext, message: NetMessage) {
            ctx.send(message);
        }
    }

    struct PingOnce {
        replies: mpsc::Sender<Vec<u8>>,
    }
    impl SessionHandler for PingOnce {
        fn on_connected(&mut self, ctx: &mut HandlerContext) {
            ctx.send(NetMessage::from_slice(b"ping"));
        }
        fn on_message(&mut self, ctx: &mut HandlerContext, message: NetMessage) {
            let _ = self.replies.send(message.data().to_vec());
            ctx.close();
        }
    }

    #[test]
    pub fn test_client_round_trip() {
        let mgr = ReactorManager::new(2).unwrap();
        let factory: HandlerFactory = Arc::new(|| Box::new(EchoBack));
        let server = TcpServer::bind(
            &mgr,
            "127.0.0.1:0",
            factory,
            LengthPrefixFraming::factory(),
            Duration::ZERO,
        )
        .unwrap();
        let runner = {
            let mgr = Arc::clone(&mgr);
            std::thread::spawn(move || mgr.run())
        };

        let (tx, rx) = mpsc::channel();
        TcpClient::connect(
            &mgr,
            server.local_addr(),
            Box::new(PingOnce { replies: tx }),
            Box::new(LengthPrefixFraming::new()),
            Duration::ZERO,
        )
        .unwrap();

        let reply = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reply, b"ping");

        drop(server);
        mgr.stop();
        runner.join().unwrap();
        mgr.join();
    }

    #[test]
    pub fn test_deferred_connect_reports_failure() {
        let mgr = ReactorManager::new(1).unwrap();
        let runner = {
            let mgr = Arc::clone(&mgr);
            std::thread::spawn(move || mgr.run())
        };

        // a listener that is immediately dropped leaves a port nothing
        // accepts on.
        let vacant = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap()
        };
        let (tx, rx) = mpsc::channel();
        TcpClient::connect_deferred(
            &mgr,
            vacant,
            Box::new(EchoBack),
            Box::new(LengthPrefixFraming::new()),
            Duration::ZERO,
            move |err| {
                let _ = tx.send(err.to_string());
            },
        )
        .unwrap();

        let err = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!err.is_empty());

        mgr.stop();
        runner.join().unwrap();
        mgr.join();
    }
}
