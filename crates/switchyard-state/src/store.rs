//! StateStore — redb-backed session persistence for Switchyard.
//!
//! One table of JSON session records keyed by id. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use switchyard_core::Session;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or update a session.
    pub fn put_session(&self, session: &Session) -> StateResult<()> {
        let value = serde_json::to_vec(session).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            sessions
                .insert(session.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a session by id.
    pub fn get_session(&self, session_id: &str) -> StateResult<Option<Session>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        match table.get(session_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let session: Session =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// List every persisted session.
    pub fn list_sessions(&self) -> StateResult<Vec<Session>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let session: Session =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(session);
        }
        Ok(results)
    }

    /// Delete a session. Returns true if it existed.
    pub fn delete_session(&self, session_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            sessions.remove(session_id).map_err(map_err!(Write))?.is_some()
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            debug!(%session_id, "session deleted");
        }
        Ok(existed)
    }

    /// Delete every session that expired at or before `now_ms`.
    /// Returns the number removed.
    pub fn purge_expired(&self, now_ms: u64) -> StateResult<u32> {
        let expired: Vec<Session> = self
            .list_sessions()?
            .into_iter()
            .filter(|s| s.is_expired_at(now_ms))
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            for session in &expired {
                sessions
                    .remove(session.id.as_str())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(expired.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::SessionMetadata;

    fn test_session(id: &str, user: &str, expires_at: u64) -> Session {
        Session {
            id: id.to_string(),
            user_id: user.to_string(),
            organization_id: None,
            connections: vec![],
            metadata: SessionMetadata::default(),
            created_at: 1000,
            expires_at,
        }
    }

    #[test]
    fn session_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let session = test_session("s1", "user1", 5000);

        store.put_session(&session).unwrap();
        assert_eq!(store.get_session("s1").unwrap(), Some(session));
    }

    #[test]
    fn session_update_overwrites() {
        let store = StateStore::open_in_memory().unwrap();
        let mut session = test_session("s1", "user1", 5000);
        store.put_session(&session).unwrap();

        session.metadata.sticky_instance = Some("inst-a".to_string());
        store.put_session(&session).unwrap();

        let stored = store.get_session("s1").unwrap().unwrap();
        assert_eq!(stored.metadata.sticky_instance.as_deref(), Some("inst-a"));
        assert_eq!(store.list_sessions().unwrap().len(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_session(&test_session("s1", "user1", 5000)).unwrap();
        store.put_session(&test_session("s2", "user1", 5000)).unwrap();

        assert!(store.delete_session("s1").unwrap());
        assert!(!store.delete_session("s1").unwrap());
        assert!(store.get_session("s1").unwrap().is_none());
        assert_eq!(store.list_sessions().unwrap().len(), 1);
    }

    #[test]
    fn purge_expired_keeps_live_sessions() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_session(&test_session("old", "user1", 1500)).unwrap();
        store.put_session(&test_session("new", "user1", 9000)).unwrap();

        assert_eq!(store.purge_expired(2000).unwrap(), 1);
        let remaining = store.list_sessions().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "new");
        assert_eq!(store.purge_expired(2000).unwrap(), 0);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sessions.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_session(&test_session("s1", "user1", 5000)).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let session = store.get_session("s1").unwrap();
        assert_eq!(session.unwrap().user_id, "user1");
        assert_eq!(store.list_sessions().unwrap().len(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_sessions().unwrap().is_empty());
        assert!(store.get_session("nope").unwrap().is_none());
        assert!(!store.delete_session("nope").unwrap());
        assert_eq!(store.purge_expired(u64::MAX).unwrap(), 0);
    }
}
