//! The per-reactor registry of live connections. Thread-confined: only the
//! owning reactor's thread ever touches it, so no locking is involved.

use std::collections::HashMap;

use crate::connection::Connection;
use crate::id_alloc::SessionId;

#[derive(Default)]
pub(crate) struct SessionQueue {
    sessions: HashMap<SessionId, Connection>,
}

impl SessionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn add(&mut self, conn: Connection) {
        let id = conn.session_id();
        debug_assert!(id > 0);
        self.sessions.insert(id, conn);
    }

    pub fn get(&self, id: SessionId) -> Option<&Connection> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Connection> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Connection> {
        self.sessions.remove(&id)
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.sessions.values()
    }
}
