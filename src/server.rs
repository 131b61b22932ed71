//! The accepting side: binds a listener and registers it with the main
//! reactor. Every accepted stream becomes a session with its own handler and
//! framing instance, placed on the least-loaded reactor.

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::framing::FramingFactory;
use crate::logmsg;
use crate::manager::{HandlerFactory, ReactorManager};
use crate::reactor::{Acceptor, MAIN_THREAD_ID};

pub struct TcpServer {
    mgr: Arc<ReactorManager>,
    local_addr: SocketAddr,
    key: usize,
}

impl TcpServer {
    /// Binds `addr` and schedules the listener onto the main reactor.
    /// Accepting starts once the manager's `run` loop is ticking. Pass a
    /// zero `keep_alive` to disable idle expiry for accepted sessions.
    pub fn bind<A: ToSocketAddrs>(
        mgr: &Arc<ReactorManager>,
        addr: A,
        handler_factory: HandlerFactory,
        framing_factory: FramingFactory,
        keep_alive: Duration,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let key = mgr.next_listener_key();
        let acceptor = Acceptor {
            key,
            listener,
            handler_factory,
            framing_factory,
            keep_alive,
        };
        mgr.post_to(
            MAIN_THREAD_ID,
            Box::new(move |core, _mgr| {
                if let Err(err) = core.add_acceptor(acceptor) {
                    logmsg!("[ERROR] failed to register listener: {}", err);
                }
            }),
        )?;
        logmsg!("server listening on {}", local_addr);
        Ok(Self {
            mgr: Arc::clone(mgr),
            local_addr,
            key,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpServer {
    // stops accepting; existing sessions are unaffected.
    fn drop(&mut self) {
        let key = self.key;
        let _ = self.mgr.post_to(
            MAIN_THREAD_ID,
            Box::new(move |core, _mgr| core.remove_acceptor(key)),
        );
    }
}
