//! # Multi-threaded reactor TCP messaging in Rust.
//!
//! Supported platforms: Linux, Windows
//!
//! ReactNet is a small framework for message-oriented TCP servers and
//! clients built on the Reactor pattern. A [`ReactorManager`] owns N reactor
//! threads; each reactor polls the sockets assigned to it and never needs a
//! mutex to process its own events. There are 2 kinds of work per reactor:
//! - socket events. Reads are driven by a per-connection [`MessageFraming`]
//!   that states how many bytes it wants next; writes keep at most one
//!   buffer in flight and coalesce everything queued behind it.
//! - tasks. Through mpsc channels, sessions and control operations are
//!   marshaled onto the reactor thread that owns the socket.
//!
//! Reactor 0 is the main reactor: it owns all listeners and runs every
//! [`SessionHandler`] callback, so application protocol code is effectively
//! single-threaded while socket I/O spreads across the worker reactors.
//! Sessions are placed on the least-loaded worker as they connect.
//!
//! ## Example
//!
//! An echo server and client over the default 2-byte length-prefix framing:
//!
//! ```rust,no_run
//! use reactnet::{
//!     HandlerContext, HandlerFactory, LengthPrefixFraming, NetMessage, ReactorManager,
//!     SessionHandler, TcpServer,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Echo;
//! impl SessionHandler for Echo {
//!     fn on_message(&mut self, ctx: &mut HandlerContext, message: NetMessage) {
//!         ctx.send(message); // send it right back
//!     }
//! }
//!
//! pub fn serve() {
//!     let mgr = ReactorManager::new(3).unwrap(); // main + 2 workers
//!     let factory: HandlerFactory = Arc::new(|| Box::new(Echo));
//!     let _server = TcpServer::bind(
//!         &mgr,
//!         "0.0.0.0:12355",
//!         factory,
//!         LengthPrefixFraming::factory(),
//!         Duration::from_secs(60), // drop sessions idle for a minute
//!     )
//!     .unwrap();
//!     mgr.run(); // blocks until mgr.stop()
//! }
//! ```

pub mod buffer;
pub mod client;
pub mod error;
pub mod framing;
pub mod id_alloc;
pub mod manager;
pub mod server;
pub mod utils;

mod connection;
mod reactor;
mod session_queue;

pub use buffer::{NetMessage, INLINE_CAPACITY};
pub use client::TcpClient;
pub use connection::CLOSE_GRACE;
pub use error::Error;
pub use framing::{
    FramingFactory, LengthPrefixFraming, MessageFraming, ANY_BYTES, FRAME_HEADER_SIZE,
    MAX_FRAME_PAYLOAD,
};
pub use id_alloc::{IdAllocator, SessionId, DEFAULT_RECYCLE_THRESHOLD};
pub use manager::{HandlerContext, HandlerFactory, ReactorManager, SessionHandler};
pub use reactor::{ThreadId, MAIN_THREAD_ID, POLL_TICK, SWEEP_INTERVAL};
pub use server::TcpServer;
