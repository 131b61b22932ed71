//! The thread manager: owns every reactor thread, assigns each new session
//! to the least-loaded worker, and runs all handler callbacks on the main
//! reactor thread.
//!
//! Threading contract: sockets live on their assigned worker reactor, but
//! handler callbacks (`on_connected` / `on_message` / `on_closed`) always
//! execute on the main reactor thread, so handler code never needs its own
//! locking. Sends and closes requested by a handler are marshaled back to
//! the owning worker as tasks.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::NetMessage;
use crate::connection::Connection;
use crate::error::Error;
use crate::framing::MessageFraming;
use crate::id_alloc::{IdAllocator, SessionId};
use crate::reactor::{Reactor, Task, ThreadId, LISTENER_KEY_BASE, MAIN_THREAD_ID, MAX_SESSION_ID};
use crate::{dbglog, logmsg};

/// Application-side protocol logic for one session. All callbacks run on the
/// main reactor thread.
pub trait SessionHandler: Send {
    /// Fired once when the session is established and assigned an ID.
    fn on_connected(&mut self, ctx: &mut HandlerContext) {
        let _ = ctx;
    }

    /// Fired per decoded message.
    fn on_message(&mut self, ctx: &mut HandlerContext, message: NetMessage);

    /// Fired once when the session is gone. No further callbacks follow and
    /// the session ID may eventually be reissued.
    fn on_closed(&mut self, session_id: SessionId) {
        let _ = session_id;
    }
}

/// Factory producing one handler instance per accepted session.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn SessionHandler> + Send + Sync>;

/// Handed to every handler callback. Sends and closes requested here are
/// collected and applied after the callback returns, in order, with sends
/// before any close.
pub struct HandlerContext {
    session_id: SessionId,
    thread_id: ThreadId,
    remote_addr: SocketAddr,
    queued: Vec<NetMessage>,
    close_requested: bool,
}

impl HandlerContext {
    fn new(session_id: SessionId, thread_id: ThreadId, remote_addr: SocketAddr) -> Self {
        Self {
            session_id,
            thread_id,
            remote_addr,
            queued: Vec::new(),
            close_requested: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Index of the reactor thread that owns the session's socket.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Queues one message for this session. Messages queued within one
    /// callback are coalesced into a single framed write where possible.
    pub fn send(&mut self, message: NetMessage) {
        self.queued.push(message);
    }

    /// Requests a graceful close. Queued messages are still flushed first.
    pub fn close(&mut self) {
        self.close_requested = true;
    }
}

struct HandlerEntry {
    // taken out while a callback runs, so callbacks can never re-enter.
    handler: Option<Box<dyn SessionHandler>>,
    thread_id: ThreadId,
    remote: SocketAddr,
}

// All touched only on the main reactor thread; the mutex is uncontended and
// exists to make the container Sync.
struct ManagerState {
    handlers: HashMap<SessionId, HandlerEntry>,
    loads: Vec<usize>,
    ids: IdAllocator,
}

pub struct ReactorManager {
    senders: Vec<Sender<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    main_core: Mutex<Option<Reactor>>,
    stop: Arc<AtomicBool>,
    state: Mutex<ManagerState>,
    next_listener_key: AtomicUsize,
}

impl ReactorManager {
    /// Creates the manager with `num_threads` reactors and spawns the worker
    /// threads. The main reactor (index 0) does not run until [`run`] is
    /// called; with `num_threads == 1` every session lives on it.
    ///
    /// Panics if `num_threads` is 0.
    ///
    /// [`run`]: ReactorManager::run
    pub fn new(num_threads: usize) -> Result<Arc<Self>, Error> {
        assert!(num_threads >= 1, "at least one reactor thread is required");
        let mut senders = Vec::with_capacity(num_threads);
        let mut cores = Vec::with_capacity(num_threads);
        for thread_id in 0..num_threads {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            cores.push(Reactor::new(thread_id, rx)?);
        }
        let stop = Arc::new(AtomicBool::new(false));
        let mut cores = cores.into_iter();
        let mgr = Arc::new(Self {
            senders,
            threads: Mutex::new(Vec::new()),
            main_core: Mutex::new(cores.next()),
            stop: Arc::clone(&stop),
            state: Mutex::new(ManagerState {
                handlers: HashMap::new(),
                loads: vec![0; num_threads],
                // session poll keys must stay below the listener key space.
                ids: IdAllocator::new(1, MAX_SESSION_ID),
            }),
            next_listener_key: AtomicUsize::new(0),
        });
        {
            let mut threads = mgr.threads.lock().unwrap();
            for core in cores {
                let weak = Arc::downgrade(&mgr);
                let stop = Arc::clone(&stop);
                let name = format!("reactor-{}", core.thread_id());
                threads.push(
                    std::thread::Builder::new()
                        .name(name)
                        .spawn(move || core.run_loop(weak, stop))
                        .map_err(Error::Io)?,
                );
            }
        }
        Ok(mgr)
    }

    /// Runs the main reactor on the calling thread until [`stop`] is called.
    ///
    /// [`stop`]: ReactorManager::stop
    pub fn run(self: &Arc<Self>) {
        let core = self.main_core.lock().unwrap().take();
        let Some(mut core) = core else {
            logmsg!("[ERROR] run called more than once");
            return;
        };
        logmsg!("main reactor running");
        while !self.stop.load(Ordering::Relaxed) {
            core.poll_once(self);
            std::thread::yield_now();
        }
        logmsg!("main reactor stopped");
    }

    /// Signals every reactor to exit its loop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Waits for the worker threads. Safe to call from a worker callback:
    /// the current thread is never joined on itself.
    pub fn join(&self) {
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if let Err(err) = handle.join() {
                logmsg!("[ERROR] reactor thread panicked: {:?}", err);
            }
        }
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Schedules a task on the given reactor's thread.
    pub(crate) fn post_to(&self, thread_id: ThreadId, task: Task) -> Result<(), Error> {
        self.senders[thread_id]
            .send(task)
            .map_err(|_| Error::ReactorStopped)
    }

    /// Per-reactor live-session counters, for assertions on lifecycle
    /// bookkeeping.
    #[cfg(test)]
    pub(crate) fn load_snapshot(&self) -> Vec<usize> {
        self.state.lock().unwrap().loads.clone()
    }

    pub(crate) fn next_listener_key(&self) -> usize {
        LISTENER_KEY_BASE + self.next_listener_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a freshly connected stream: allocates a session ID, picks
    /// the least-loaded worker, hands the connection over to it, and fires
    /// `on_connected`. Main reactor thread only.
    pub(crate) fn session_connected(
        mgr: &Arc<Self>,
        core: &mut Reactor,
        stream: TcpStream,
        handler: Box<dyn SessionHandler>,
        framing: Box<dyn MessageFraming>,
        keep_alive: Duration,
    ) -> Result<SessionId, Error> {
        debug_assert_eq!(core.thread_id(), MAIN_THREAD_ID);
        let remote = stream.peer_addr()?;
        let (sid, tid) = {
            let mut state = mgr.state.lock().unwrap();
            let sid = state.ids.acquire()?;
            let tid = least_loaded(&state.loads);
            state.loads[tid] += 1;
            state.handlers.insert(
                sid,
                HandlerEntry {
                    handler: Some(handler),
                    thread_id: tid,
                    remote,
                },
            );
            (sid, tid)
        };
        logmsg!("session {} from {} assigned to reactor {}", sid, remote, tid);

        let conn = Connection::new(sid, tid, stream, framing, keep_alive);
        if tid == MAIN_THREAD_ID {
            if let Err(err) = core.activate_connection(conn) {
                mgr.discard_entry(sid);
                return Err(err);
            }
        } else {
            let result = mgr.post_to(
                tid,
                Box::new(move |reactor, mgr| {
                    if let Err(err) = reactor.activate_connection(conn) {
                        logmsg!("[ERROR] failed to activate session {}: {}", sid, err);
                        ReactorManager::notify_session_closed(mgr, reactor, sid);
                    }
                }),
            );
            if let Err(err) = result {
                mgr.discard_entry(sid);
                return Err(err);
            }
        }

        Self::with_handler(mgr, core, sid, |handler, ctx| handler.on_connected(ctx));
        Ok(sid)
    }

    /// Routes a decoded batch to the session's handler on the main thread.
    pub(crate) fn route_inbound(
        mgr: &Arc<Self>,
        reactor: &mut Reactor,
        sid: SessionId,
        batch: Vec<NetMessage>,
    ) {
        if reactor.thread_id() == MAIN_THREAD_ID {
            Self::deliver(mgr, reactor, sid, batch);
        } else {
            let posted = mgr.post_to(
                MAIN_THREAD_ID,
                Box::new(move |core, mgr| Self::deliver(mgr, core, sid, batch)),
            );
            if posted.is_err() {
                dbglog!("dropping inbound batch for session {}: manager stopped", sid);
            }
        }
    }

    fn deliver(mgr: &Arc<Self>, core: &mut Reactor, sid: SessionId, batch: Vec<NetMessage>) {
        Self::with_handler(mgr, core, sid, |handler, ctx| {
            for message in batch {
                handler.on_message(ctx, message);
            }
        });
    }

    /// Forwards the closed notification to the main thread, where the
    /// session's bookkeeping lives.
    pub(crate) fn notify_session_closed(mgr: &Arc<Self>, reactor: &mut Reactor, sid: SessionId) {
        if reactor.thread_id() == MAIN_THREAD_ID {
            Self::handle_session_closed(mgr, reactor, sid);
        } else {
            let _ = mgr.post_to(
                MAIN_THREAD_ID,
                Box::new(move |core, mgr| Self::handle_session_closed(mgr, core, sid)),
            );
        }
    }

    // Removes the bookkeeping entry, fires on_closed, and recycles the ID.
    // Idempotent: the entry leaves the map exactly once.
    fn handle_session_closed(mgr: &Arc<Self>, _core: &mut Reactor, sid: SessionId) {
        let entry = mgr.state.lock().unwrap().handlers.remove(&sid);
        let Some(mut entry) = entry else {
            return;
        };
        if let Some(mut handler) = entry.handler.take() {
            handler.on_closed(sid);
        }
        let mut state = mgr.state.lock().unwrap();
        state.loads[entry.thread_id] -= 1;
        state.ids.release(sid);
    }

    // Rolls back session_connected bookkeeping when activation never took.
    fn discard_entry(&self, sid: SessionId) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.handlers.remove(&sid) {
            state.loads[entry.thread_id] -= 1;
            state.ids.release(sid);
        }
    }

    // Runs one callback with the handler temporarily taken out of the map,
    // then applies the context's queued sends and close request.
    fn with_handler<F>(mgr: &Arc<Self>, core: &mut Reactor, sid: SessionId, f: F)
    where
        F: FnOnce(&mut dyn SessionHandler, &mut HandlerContext),
    {
        let taken = {
            let mut state = mgr.state.lock().unwrap();
            match state.handlers.get_mut(&sid) {
                Some(entry) => entry
                    .handler
                    .take()
                    .map(|handler| (handler, HandlerContext::new(sid, entry.thread_id, entry.remote))),
                None => None,
            }
        };
        let Some((mut handler, mut ctx)) = taken else {
            dbglog!("no handler available for session {}", sid);
            return;
        };
        f(handler.as_mut(), &mut ctx);
        {
            let mut state = mgr.state.lock().unwrap();
            if let Some(entry) = state.handlers.get_mut(&sid) {
                entry.handler = Some(handler);
            }
            // else: the session closed during the callback; handler drops.
        }
        Self::apply_actions(mgr, core, ctx);
    }

    fn apply_actions(mgr: &Arc<Self>, core: &mut Reactor, ctx: HandlerContext) {
        let HandlerContext {
            session_id,
            thread_id,
            queued,
            close_requested,
            ..
        } = ctx;
        if !queued.is_empty() {
            if thread_id == core.thread_id() {
                core.queue_outbound(session_id, queued, mgr);
            } else {
                let _ = mgr.post_to(
                    thread_id,
                    Box::new(move |reactor, mgr| reactor.queue_outbound(session_id, queued, mgr)),
                );
            }
        }
        if close_requested {
            if thread_id == core.thread_id() {
                core.begin_close(session_id, mgr);
            } else {
                let _ = mgr.post_to(
                    thread_id,
                    Box::new(move |reactor, mgr| reactor.begin_close(session_id, mgr)),
                );
            }
        }
    }
}

impl Drop for ReactorManager {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

// Session placement. Worker reactors start at index 1; the main reactor only
// hosts sessions when it is the sole reactor. Ties go to the lowest index.
fn least_loaded(loads: &[usize]) -> ThreadId {
    if loads.len() == 1 {
        return MAIN_THREAD_ID;
    }
    let mut best = 1;
    for tid in 2..loads.len() {
        if loads[tid] < loads[best] {
            best = tid;
        }
    }
    best
}
