//! Live-socket table: every routed connection currently open.

use std::collections::HashMap;

use parking_lot::Mutex;

use switchyard_core::{ConnectionId, ConnectionInfo};

#[derive(Default)]
pub struct ConnectionTable {
    inner: Mutex<HashMap<ConnectionId, ConnectionInfo>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: ConnectionInfo) {
        self.inner.lock().insert(info.id.clone(), info);
    }

    pub fn remove(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.inner.lock().remove(connection_id)
    }

    pub fn get(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.inner.lock().get(connection_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot, oldest first.
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self.inner.lock().values().cloned().collect();
        list.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then(a.id.cmp(&b.id)));
        list
    }
}
