//! The event loop that owns a poller and a set of connections. One `Reactor`
//! runs per service thread; reactor 0 is the main reactor, which additionally
//! owns every listener and runs all handler callbacks.
//!
//! Each loop iteration waits up to [`POLL_TICK`] for socket events, drains
//! the cross-thread task queue, and fires the periodic sweep that enforces
//! keep-alive and close-grace deadlines.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use polling::{Event, Events, PollMode, Poller};

use crate::connection::{Connection, ReadCycle, SessionState, WriteCycle};
use crate::error::Error;
use crate::framing::FramingFactory;
use crate::id_alloc::SessionId;
use crate::manager::{HandlerFactory, ReactorManager};
use crate::session_queue::SessionQueue;
use crate::{dbglog, logmsg};

/// Index of a reactor thread. The main reactor is always 0.
pub type ThreadId = usize;

pub const MAIN_THREAD_ID: ThreadId = 0;

/// Poll wait per loop iteration.
pub const POLL_TICK: Duration = Duration::from_millis(1);

/// Interval between keep-alive / close-grace sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Max tasks drained per loop iteration, so a flooded task queue cannot
/// starve socket events.
const MAX_TASKS_PER_TICK: usize = 128;

// Listener poll keys live above this base so they can never collide with
// session keys.
pub(crate) const LISTENER_KEY_BASE: usize = usize::MAX >> 1;

// Largest session ID the allocator may issue: its poll key must stay below
// the listener key space even when usize is 32 bits.
pub(crate) const MAX_SESSION_ID: SessionId = if LISTENER_KEY_BASE > SessionId::MAX as usize {
    SessionId::MAX
} else {
    (LISTENER_KEY_BASE - 1) as SessionId
};

/// A closure executed on a specific reactor's thread with full access to
/// that reactor. This is the only way state crosses threads.
pub(crate) type Task = Box<dyn FnOnce(&mut Reactor, &Arc<ReactorManager>) + Send>;

/// A listening socket registered on the main reactor. Each accepted stream
/// gets a fresh handler and framing from the factories.
pub(crate) struct Acceptor {
    pub key: usize,
    pub listener: TcpListener,
    pub handler_factory: HandlerFactory,
    pub framing_factory: FramingFactory,
    pub keep_alive: Duration,
}

pub(crate) struct Reactor {
    thread_id: ThreadId,
    poller: Poller,
    events: Events,
    tasks: Receiver<Task>,
    conns: SessionQueue,
    acceptors: HashMap<usize, Acceptor>,
    next_sweep: Instant,
    // scratch for event collection, reused across iterations.
    ready: Vec<(usize, bool, bool)>,
}

impl Reactor {
    pub fn new(thread_id: ThreadId, tasks: Receiver<Task>) -> std::io::Result<Self> {
        Ok(Self {
            thread_id,
            poller: Poller::new()?,
            events: Events::new(),
            tasks,
            conns: SessionQueue::new(),
            acceptors: HashMap::new(),
            next_sweep: Instant::now() + SWEEP_INTERVAL,
            ready: Vec::new(),
        })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Worker thread body. Holds only a weak handle to the manager so the
    /// manager's drop is never kept alive by its own workers; the loop exits
    /// when the manager is gone or stopped.
    pub fn run_loop(mut self, mgr: Weak<ReactorManager>, stop: Arc<AtomicBool>) {
        logmsg!("reactor {} started", self.thread_id);
        while !stop.load(Ordering::Relaxed) {
            let Some(mgr) = mgr.upgrade() else {
                break;
            };
            self.poll_once(&mgr);
            drop(mgr);
            std::thread::yield_now();
        }
        self.shutdown();
    }

    /// One loop iteration: socket events, queued tasks, timer sweep.
    pub fn poll_once(&mut self, mgr: &Arc<ReactorManager>) {
        self.events.clear();
        if let Err(err) = self.poller.wait(&mut self.events, Some(POLL_TICK)) {
            if err.kind() != std::io::ErrorKind::Interrupted {
                logmsg!("[ERROR] poller wait on reactor {}: {:?}", self.thread_id, err);
            }
            return;
        }

        self.ready.clear();
        for ev in self.events.iter() {
            self.ready.push((ev.key, ev.readable, ev.writable));
        }
        // events are detached from the poller borrow; now mutate freely.
        let ready = std::mem::take(&mut self.ready);
        for &(key, readable, writable) in &ready {
            if key >= LISTENER_KEY_BASE {
                self.handle_acceptable(key, mgr);
            } else {
                self.handle_connection_event(key as SessionId, readable, writable, mgr);
            }
        }
        self.ready = ready;

        for _ in 0..MAX_TASKS_PER_TICK {
            match self.tasks.try_recv() {
                Ok(task) => task(self, mgr),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let now = Instant::now();
        if now >= self.next_sweep {
            self.next_sweep = now + SWEEP_INTERVAL;
            self.sweep(now, mgr);
        }
    }

    fn handle_acceptable(&mut self, key: usize, mgr: &Arc<ReactorManager>) {
        loop {
            // the acceptor borrow must end before the manager gets &mut self.
            let (stream, addr, handler, framing, keep_alive) = {
                let Some(acceptor) = self.acceptors.get(&key) else {
                    dbglog!("[ERROR] event for removed listener key {}", key);
                    return;
                };
                match acceptor.listener.accept() {
                    Ok((stream, addr)) => (
                        stream,
                        addr,
                        (acceptor.handler_factory)(),
                        (acceptor.framing_factory)(),
                        acceptor.keep_alive,
                    ),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        logmsg!("[ERROR] accept on listener key {}: {:?}", key, err);
                        return;
                    }
                }
            };
            logmsg!("accepted connection from {}", addr);
            if let Err(err) =
                ReactorManager::session_connected(mgr, self, stream, handler, framing, keep_alive)
            {
                logmsg!("[ERROR] failed to set up accepted session: {}", err);
            }
        }
    }

    fn handle_connection_event(
        &mut self,
        sid: SessionId,
        readable: bool,
        writable: bool,
        mgr: &Arc<ReactorManager>,
    ) {
        let Some(conn) = self.conns.get_mut(sid) else {
            dbglog!("[ERROR] event for removed session {}", sid);
            return;
        };

        let mut fatal = false;
        let mut eof = false;

        if writable {
            if !conn.interested_writable {
                dbglog!("WARN: unsolicited writable sock: {:?}", conn.sock());
            }
            conn.interested_writable = true;
            if conn.handle_writable() == WriteCycle::Error {
                fatal = true;
            }
        }
        if readable && !fatal {
            match conn.handle_readable() {
                ReadCycle::Open => {}
                ReadCycle::Eof => eof = true,
                ReadCycle::Error => fatal = true,
            }
        }

        let batch = conn.take_received();
        let state = conn.state();

        if !batch.is_empty() {
            ReactorManager::route_inbound(mgr, self, sid, batch);
        }

        if fatal {
            self.finish_close(sid, mgr);
        } else if eof {
            match state {
                // EOF while draining completes the close.
                SessionState::Closing => self.finish_close(sid, mgr),
                _ => self.begin_close(sid, mgr),
            }
        } else {
            self.refresh_interest(sid);
        }
    }

    /// Registers a new connection with the poller and arms its first read.
    pub fn activate_connection(&mut self, mut conn: Connection) -> Result<(), Error> {
        debug_assert_eq!(conn.thread_id(), self.thread_id);
        conn.activate()?;
        let key = conn.poll_key();
        conn.interested_readable = conn.wants_readable();
        let interest = if conn.interested_readable {
            Event::readable(key)
        } else {
            Event::none(key)
        };
        unsafe {
            self.poller
                .add_with_mode(conn.sock(), interest, PollMode::Level)?;
        }
        logmsg!(
            "reactor {} added session {}, sock: {:?}",
            self.thread_id,
            conn.session_id(),
            conn.sock()
        );
        self.conns.add(conn);
        Ok(())
    }

    /// Queues a batch for sending, driving an immediate write attempt when
    /// the socket is idle.
    pub fn queue_outbound(
        &mut self,
        sid: SessionId,
        messages: Vec<crate::buffer::NetMessage>,
        mgr: &Arc<ReactorManager>,
    ) {
        let Some(conn) = self.conns.get_mut(sid) else {
            dbglog!("dropping {} message(s) for removed session {}", messages.len(), sid);
            return;
        };
        match conn.post_messages(&messages) {
            WriteCycle::Error => self.finish_close(sid, mgr),
            WriteCycle::Idle | WriteCycle::Pending => self.refresh_interest(sid),
        }
    }

    /// Starts the graceful close sequence for a session on this reactor.
    pub fn begin_close(&mut self, sid: SessionId, mgr: &Arc<ReactorManager>) {
        let closable = matches!(
            self.conns.get(sid).map(Connection::state),
            Some(SessionState::Created) | Some(SessionState::Active)
        );
        if !closable {
            return;
        }
        if let Some(conn) = self.conns.get_mut(sid) {
            conn.begin_closing();
        }
        self.refresh_interest(sid);
        ReactorManager::notify_session_closed(mgr, self, sid);
    }

    /// Tears a session down immediately: poller deregistration, queue
    /// removal, and the closed notification if it never went through
    /// `begin_close`.
    pub fn finish_close(&mut self, sid: SessionId, mgr: &Arc<ReactorManager>) {
        let Some(mut conn) = self.conns.remove(sid) else {
            return;
        };
        let announced = conn.state() == SessionState::Closing;
        conn.finish_closing();
        if let Err(err) = self.poller.delete(conn.sock()) {
            dbglog!("[ERROR] poller delete for session {}: {:?}", sid, err);
        }
        logmsg!(
            "reactor {} removed session {}, sock: {:?}",
            self.thread_id,
            sid,
            conn.sock()
        );
        if !announced {
            ReactorManager::notify_session_closed(mgr, self, sid);
        }
    }

    // re-register poller interest to mirror the connection's state. Write
    // interest follows the pending-send bytes; read interest drops once the
    // framing stops asking for bytes, so a level-triggered poller does not
    // re-fire forever on input the connection will never consume.
    fn refresh_interest(&mut self, sid: SessionId) {
        let Some(conn) = self.conns.get_mut(sid) else {
            return;
        };
        let wants_readable = conn.wants_readable();
        let wants_writable = conn.wants_writable();
        if wants_readable == conn.interested_readable
            && wants_writable == conn.interested_writable
        {
            return;
        }
        conn.interested_readable = wants_readable;
        conn.interested_writable = wants_writable;
        let key = conn.poll_key();
        let interest = match (wants_readable, wants_writable) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        };
        if let Err(err) = self
            .poller
            .modify_with_mode(conn.sock(), interest, PollMode::Level)
        {
            logmsg!("[ERROR] poller modify for session {}: {:?}", sid, err);
        }
    }

    /// Installs a listener on this reactor (main reactor only).
    pub fn add_acceptor(&mut self, acceptor: Acceptor) -> Result<(), Error> {
        debug_assert_eq!(self.thread_id, MAIN_THREAD_ID);
        acceptor.listener.set_nonblocking(true)?;
        unsafe {
            self.poller.add_with_mode(
                &acceptor.listener,
                Event::readable(acceptor.key),
                PollMode::Level,
            )?;
        }
        logmsg!(
            "added listener key {}, sock: {:?}",
            acceptor.key,
            acceptor.listener
        );
        self.acceptors.insert(acceptor.key, acceptor);
        Ok(())
    }

    pub fn remove_acceptor(&mut self, key: usize) {
        if let Some(acceptor) = self.acceptors.remove(&key) {
            if let Err(err) = self.poller.delete(&acceptor.listener) {
                dbglog!("[ERROR] poller delete for listener {}: {:?}", key, err);
            }
            logmsg!("removed listener key {}", key);
        }
    }

    // periodic deadline enforcement: keep-alive expiry starts a close,
    // close-grace expiry forces teardown.
    fn sweep(&mut self, now: Instant, mgr: &Arc<ReactorManager>) {
        let mut expired = Vec::new();
        let mut overdue = Vec::new();
        for conn in self.conns.iter() {
            if conn.keep_alive_expired(now) {
                expired.push(conn.session_id());
            } else if conn.grace_expired(now) {
                overdue.push(conn.session_id());
            }
        }
        for sid in expired {
            logmsg!("session {} keep-alive expired, closing", sid);
            self.begin_close(sid, mgr);
        }
        for sid in overdue {
            logmsg!("session {} close grace expired, dropping", sid);
            self.finish_close(sid, mgr);
        }
    }

    fn shutdown(&mut self) {
        logmsg!(
            "reactor {} stopping with {} connection(s)",
            self.thread_id,
            self.conns.len()
        );
        self.conns.clear();
        self.acceptors.clear();
    }
}
