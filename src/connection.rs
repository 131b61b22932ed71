//! The per-socket state machine: framed reads, single-in-flight buffered
//! writes, keep-alive bookkeeping, and the graceful drain-then-close
//! shutdown sequence.
//!
//! A `Connection` lives in exactly one reactor's `SessionQueue` and is only
//! ever touched on that reactor's thread. Cross-thread interaction goes
//! through the reactor's task queue, never through this type directly.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use crate::buffer::{NetMessage, INLINE_CAPACITY};
use crate::framing::{MessageFraming, ANY_BYTES};
use crate::id_alloc::SessionId;
use crate::logmsg;
use crate::reactor::ThreadId;

/// Grace period for draining peer input after the send side is half-closed.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// Socket exists, not yet registered with its reactor.
    Created,
    /// Registered, read loop armed.
    Active,
    /// Shutdown requested; draining input under the grace timer.
    Closing,
    /// Torn down; about to leave the queue.
    Closed,
}

/// Result of driving the read side until the socket would block.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadCycle {
    /// Socket still open, nothing more to read right now.
    Open,
    /// Peer closed its send side (or the drain finished).
    Eof,
    /// Transport or framing failure; fatal to the connection.
    Error,
}

// What to do after a failed read.
enum ReadErrorAction {
    WaitMore,
    Retry,
    Fatal,
}

/// Result of driving the write side.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriteCycle {
    /// Everything queued has reached the socket.
    Idle,
    /// Bytes remain in flight; writable interest is needed.
    Pending,
    /// Transport failure; fatal to the connection.
    Error,
}

pub(crate) struct Connection {
    session_id: SessionId,
    thread_id: ThreadId,
    sock: TcpStream,
    framing: Box<dyn MessageFraming>,
    state: SessionState,

    // read side
    read_target: usize,
    recv: Vec<u8>,
    filled: usize,
    received: Vec<NetMessage>,

    // write side: at most one buffer in flight; new bytes accumulate in
    // `pending` and are swapped in when the in-flight buffer drains.
    inflight: Vec<u8>,
    sent: usize,
    pending: Vec<u8>,

    // poller interest currently registered, owned by the reactor.
    pub(crate) interested_readable: bool,
    pub(crate) interested_writable: bool,

    keep_alive: Duration,
    last_activity: Instant,
    grace_deadline: Option<Instant>,
}

impl Connection {
    pub fn new(
        session_id: SessionId,
        thread_id: ThreadId,
        sock: TcpStream,
        framing: Box<dyn MessageFraming>,
        keep_alive: Duration,
    ) -> Self {
        Self {
            session_id,
            thread_id,
            sock,
            framing,
            state: SessionState::Created,
            read_target: 0,
            recv: Vec::new(),
            filled: 0,
            received: Vec::new(),
            inflight: Vec::new(),
            sent: 0,
            pending: Vec::new(),
            interested_readable: false,
            interested_writable: false,
            keep_alive,
            last_activity: Instant::now(),
            grace_deadline: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn sock(&self) -> &TcpStream {
        &self.sock
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Poller registration key. Session IDs are unique process-wide, so they
    /// double as event keys within the owning reactor's poller.
    pub fn poll_key(&self) -> usize {
        self.session_id as usize
    }

    /// Called on the owning reactor right after registration. Arms the first
    /// read according to the framing's request.
    pub fn activate(&mut self) -> std::io::Result<()> {
        debug_assert_eq!(self.state, SessionState::Created);
        self.sock.set_nonblocking(true)?;
        self.sock.set_nodelay(true)?;
        self.read_target = self.framing.bytes_wanna_read();
        self.last_activity = Instant::now();
        self.state = SessionState::Active;
        Ok(())
    }

    /// True while an in-flight write still has unsent bytes.
    pub fn wants_writable(&self) -> bool {
        self.sent < self.inflight.len()
    }

    /// False only when the framing returned 0 from `bytes_wanna_read`,
    /// meaning reads are over for this connection.
    pub fn wants_readable(&self) -> bool {
        self.read_target != 0 || self.state == SessionState::Closing
    }

    pub fn keep_alive_expired(&self, now: Instant) -> bool {
        self.state == SessionState::Active
            && !self.keep_alive.is_zero()
            && now.duration_since(self.last_activity) > self.keep_alive
    }

    pub fn grace_expired(&self, now: Instant) -> bool {
        matches!(self.grace_deadline, Some(deadline) if now >= deadline)
    }

    /// Takes the batch of messages decoded since the last call.
    pub fn take_received(&mut self) -> Vec<NetMessage> {
        std::mem::take(&mut self.received)
    }

    /// Drives the read side until the socket would block. In `Active` state
    /// this accumulates toward the framing's requested size and decodes; in
    /// `Closing` state it discards input, waiting for end-of-stream.
    pub fn handle_readable(&mut self) -> ReadCycle {
        match self.state {
            SessionState::Active => self.read_framed(),
            SessionState::Closing => self.read_drain(),
            _ => ReadCycle::Open,
        }
    }

    fn read_framed(&mut self) -> ReadCycle {
        let had_messages = self.received.len();
        let cycle = loop {
            match self.read_target {
                // framing asked to stop reading for good.
                0 => break ReadCycle::Open,
                ANY_BYTES => {
                    self.recv.resize(INLINE_CAPACITY, 0);
                    match self.sock.read(&mut self.recv[..]) {
                        Ok(0) => {
                            logmsg!("peer closed sock: {:?}", self.sock);
                            break ReadCycle::Eof;
                        }
                        Ok(n) => {
                            if !self.decode_exact(n) {
                                break ReadCycle::Error;
                            }
                            self.read_target = self.framing.bytes_wanna_read();
                        }
                        Err(err) => match Self::triage_read_error(&self.sock, err) {
                            ReadErrorAction::WaitMore => break ReadCycle::Open,
                            ReadErrorAction::Retry => continue,
                            ReadErrorAction::Fatal => break ReadCycle::Error,
                        },
                    }
                }
                target => {
                    if self.recv.len() < target {
                        self.recv.resize(target, 0);
                    }
                    debug_assert!(self.filled < target);
                    match self.sock.read(&mut self.recv[self.filled..target]) {
                        Ok(0) => {
                            logmsg!("peer closed sock: {:?}", self.sock);
                            break ReadCycle::Eof;
                        }
                        Ok(n) => {
                            self.filled += n;
                            if self.filled < target {
                                continue;
                            }
                            self.filled = 0;
                            if !self.decode_exact(target) {
                                break ReadCycle::Error;
                            }
                            self.read_target = self.framing.bytes_wanna_read();
                        }
                        Err(err) => match Self::triage_read_error(&self.sock, err) {
                            ReadErrorAction::WaitMore => break ReadCycle::Open,
                            ReadErrorAction::Retry => continue,
                            ReadErrorAction::Fatal => break ReadCycle::Error,
                        },
                    }
                }
            }
        };
        if self.received.len() > had_messages {
            self.last_activity = Instant::now();
        }
        cycle
    }

    // Feeds exactly `len` buffered bytes to the framing. Anything but full
    // consumption desynchronizes the stream cursor and is fatal.
    fn decode_exact(&mut self, len: usize) -> bool {
        match self.framing.decode(&self.recv[..len], &mut self.received) {
            Ok(consumed) if consumed == len => true,
            Ok(consumed) => {
                logmsg!(
                    "[ERROR] framing consumed {} of {} bytes on sock {:?}, closing",
                    consumed,
                    len,
                    self.sock
                );
                false
            }
            Err(err) => {
                logmsg!("[ERROR] decode failed on sock {:?}: {}", self.sock, err);
                false
            }
        }
    }

    fn read_drain(&mut self) -> ReadCycle {
        loop {
            self.recv.resize(INLINE_CAPACITY, 0);
            match self.sock.read(&mut self.recv[..]) {
                Ok(0) => return ReadCycle::Eof,
                Ok(_) => continue, // discard
                Err(err) => {
                    let kind = err.kind();
                    if kind == ErrorKind::WouldBlock {
                        return ReadCycle::Open;
                    } else if kind == ErrorKind::Interrupted {
                        continue;
                    }
                    // any failure while draining just finishes the close.
                    return ReadCycle::Eof;
                }
            }
        }
    }

    fn triage_read_error(sock: &TcpStream, err: std::io::Error) -> ReadErrorAction {
        let kind = err.kind();
        if kind == ErrorKind::WouldBlock {
            ReadErrorAction::WaitMore
        } else if kind == ErrorKind::Interrupted {
            logmsg!("[WARN] sock interrupted: {:?}. retry", sock);
            ReadErrorAction::Retry
        } else if kind == ErrorKind::ConnectionReset || kind == ErrorKind::ConnectionAborted {
            logmsg!("sock reset: {:?}. close socket", sock);
            ReadErrorAction::Fatal
        } else {
            logmsg!("[ERROR] read on sock {:?}, error: {:?}", sock, err);
            ReadErrorAction::Fatal
        }
    }

    /// Encodes a batch onto the pending buffer and starts a write if none is
    /// in flight. Messages posted to a closing connection are dropped.
    pub fn post_messages(&mut self, messages: &[NetMessage]) -> WriteCycle {
        if self.state != SessionState::Active || messages.is_empty() {
            return WriteCycle::Idle;
        }
        let bytes = self.framing.bytes_wanna_write(messages);
        if bytes == 0 {
            return WriteCycle::Idle;
        }
        self.pending.reserve(bytes);
        if let Err(err) = self.framing.encode(messages, &mut self.pending) {
            logmsg!("[ERROR] encode failed on sock {:?}: {}", self.sock, err);
            return WriteCycle::Error;
        }
        if self.inflight.is_empty() {
            self.handle_writable()
        } else {
            WriteCycle::Pending
        }
    }

    /// Drives the write side: pushes the in-flight buffer, swapping the
    /// pending buffer in whenever it drains, until done or WouldBlock.
    pub fn handle_writable(&mut self) -> WriteCycle {
        loop {
            if self.sent >= self.inflight.len() {
                self.inflight.clear();
                self.sent = 0;
                if self.state == SessionState::Closing {
                    // the deferred half-close: the in-flight write finished,
                    // anything still pending is abandoned.
                    self.pending.clear();
                    self.start_drain();
                    return WriteCycle::Idle;
                }
                if self.pending.is_empty() {
                    return WriteCycle::Idle;
                }
                std::mem::swap(&mut self.inflight, &mut self.pending);
            }
            match self.sock.write(&self.inflight[self.sent..]) {
                Ok(0) => {
                    logmsg!("[ERROR] sock wrote 0 bytes {:?}. close socket", self.sock);
                    return WriteCycle::Error;
                }
                Ok(n) => {
                    self.sent += n;
                }
                Err(err) => {
                    let kind = err.kind();
                    if kind == ErrorKind::WouldBlock {
                        return WriteCycle::Pending;
                    } else if kind == ErrorKind::Interrupted {
                        logmsg!("[WARN] sock interrupted: {:?}. retry", self.sock);
                        continue;
                    } else if kind == ErrorKind::ConnectionReset {
                        logmsg!("sock reset: {:?}. close socket", self.sock);
                        return WriteCycle::Error;
                    }
                    logmsg!("[ERROR] write on sock {:?}, error: {:?}", self.sock, err);
                    return WriteCycle::Error;
                }
            }
        }
    }

    /// Active -> Closing. The half-close of the send direction is deferred
    /// while a write is in flight; `handle_writable` picks it up on
    /// completion.
    pub fn begin_closing(&mut self) {
        if self.state != SessionState::Active && self.state != SessionState::Created {
            return;
        }
        self.state = SessionState::Closing;
        if !self.wants_writable() {
            self.pending.clear();
            self.start_drain();
        }
    }

    fn start_drain(&mut self) {
        debug_assert_eq!(self.state, SessionState::Closing);
        if self.grace_deadline.is_some() {
            return;
        }
        if let Err(err) = self.sock.shutdown(Shutdown::Write) {
            if err.kind() != ErrorKind::NotConnected {
                logmsg!("[WARN] shutdown on sock {:?}: {:?}", self.sock, err);
            }
        }
        self.grace_deadline = Some(Instant::now() + CLOSE_GRACE);
        self.filled = 0;
    }

    /// Closing -> Closed. The caller removes the connection from its queue
    /// right after; dropping the socket completes the teardown.
    pub fn finish_closing(&mut self) {
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::framing::LengthPrefixFraming;
    use std::net::TcpListener;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let local = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (remote, _) = listener.accept().unwrap();
        (local, remote)
    }

    fn test_connection(sock: TcpStream, keep_alive: Duration) -> Connection {
        let mut conn = Connection::new(
            1,
            1,
            sock,
            Box::new(LengthPrefixFraming::new()),
            keep_alive,
        );
        conn.activate().unwrap();
        conn
    }

    #[test]
    pub fn test_post_messages_frames_on_the_wire() {
        let (local, mut remote) = loopback_pair();
        let mut conn = test_connection(local, Duration::ZERO);

        let batch = vec![
            NetMessage::from_slice(b"ping"),
            NetMessage::from_slice(b"pong!"),
        ];
        assert_eq!(conn.post_messages(&batch), WriteCycle::Idle);

        let mut wire = [0u8; 13];
        remote.read_exact(&mut wire).unwrap();
        assert_eq!(&wire[..6], &[0x00, 0x04, b'p', b'i', b'n', b'g']);
        assert_eq!(&wire[6..8], &[0x00, 0x05]);
        assert_eq!(&wire[8..], b"pong!");
    }

    #[test]
    pub fn test_framed_read_assembles_messages() {
        let (local, mut remote) = loopback_pair();
        let mut conn = test_connection(local, Duration::ZERO);

        remote.write_all(&[0x00, 0x04, b'p', b'i', b'n', b'g']).unwrap();
        // split delivery: header of the second frame arrives separately.
        remote.write_all(&[0x00, 0x02]).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(conn.handle_readable(), ReadCycle::Open);
        let batch = conn.take_received();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].data(), b"ping");

        remote.write_all(b"ok").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(conn.handle_readable(), ReadCycle::Open);
        let batch = conn.take_received();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].data(), b"ok");
    }

    #[test]
    pub fn test_begin_closing_half_closes_send_side() {
        let (local, mut remote) = loopback_pair();
        let mut conn = test_connection(local, Duration::ZERO);
        conn.begin_closing();
        assert_eq!(conn.state(), SessionState::Closing);
        // peer observes EOF on its read side once the drain half-closes.
        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
        // messages posted after closing are dropped.
        assert_eq!(
            conn.post_messages(&[NetMessage::from_slice(b"late")]),
            WriteCycle::Idle
        );
        // peer closing its end finishes the drain.
        drop(remote);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(conn.handle_readable(), ReadCycle::Eof);
    }

    #[test]
    pub fn test_keep_alive_expiry() {
        let (local, _remote) = loopback_pair();
        let mut conn = test_connection(local, Duration::from_millis(10));
        let now = Instant::now();
        assert!(!conn.keep_alive_expired(now));
        assert!(conn.keep_alive_expired(now + Duration::from_millis(20)));
        // zero duration disables the check entirely.
        let (local2, _remote2) = loopback_pair();
        let conn2 = test_connection(local2, Duration::ZERO);
        assert!(!conn2.keep_alive_expired(now + Duration::from_secs(3600)));
        drop(conn);
    }

    #[test]
    pub fn test_peer_eof_reported() {
        let (local, remote) = loopback_pair();
        let mut conn = test_connection(local, Duration::ZERO);
        drop(remote);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(conn.handle_readable(), ReadCycle::Eof);
    }
}
