//! Session store — TTL-bounded identity bindings with sticky affinity.
//!
//! Sessions are keyed by id and indexed by user id. An expired session
//! is never returned: reads drop it on sight and the sweeper removes the
//! rest. When a durable [`StateStore`] is attached, every change is
//! written through under the same lock, so the durable copy never goes
//! backwards relative to memory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchyard_core::config::SessionsConfig;
use switchyard_core::{epoch_millis, Session, SessionClaims, SessionMetadata};
use switchyard_state::StateStore;

/// Reports whether an instance id still refers to a live instance.
pub type LivenessCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    /// user id → session ids.
    by_user: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn insert(&mut self, session: Session) {
        self.by_user
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.id.clone());
        self.sessions.insert(session.id.clone(), session);
    }

    fn remove(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        if let Some(ids) = self.by_user.get_mut(&session.user_id) {
            ids.remove(session_id);
            if ids.is_empty() {
                self.by_user.remove(&session.user_id);
            }
        }
        Some(session)
    }
}

/// In-memory session table with optional write-through persistence.
pub struct SessionStore {
    inner: Mutex<Inner>,
    ttl: Duration,
    persistence: Option<StateStore>,
    liveness: Option<LivenessCheck>,
}

impl SessionStore {
    /// Purely in-memory store.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
            persistence: None,
            liveness: None,
        }
    }

    /// Build from the `[sessions]` config section, opening the durable
    /// store when `persist_sessions` is set.
    pub fn from_config(config: &SessionsConfig) -> anyhow::Result<Self> {
        let store = Self::new(config.ttl());
        if !config.persist_sessions {
            return Ok(store);
        }
        let state = StateStore::open(&config.path)?;
        info!(path = %config.path.display(), "session persistence enabled");
        Ok(store.with_persistence(state))
    }

    /// Attach a durable store and restore its unexpired sessions.
    pub fn with_persistence(mut self, state: StateStore) -> Self {
        let now = epoch_millis();
        match state.purge_expired(now) {
            Ok(0) => {}
            Ok(n) => debug!(purged = n, "expired persisted sessions purged"),
            Err(e) => warn!(error = %e, "failed to purge expired persisted sessions"),
        }
        match state.list_sessions() {
            Ok(sessions) => {
                let inner = self.inner.get_mut();
                let mut restored = 0usize;
                for session in sessions.into_iter().filter(|s| !s.is_expired_at(now)) {
                    inner.insert(session);
                    restored += 1;
                }
                info!(restored, "sessions restored from durable store");
            }
            Err(e) => warn!(error = %e, "failed to restore persisted sessions"),
        }
        self.persistence = Some(state);
        self
    }

    /// Clear sticky references to instances this check reports as gone.
    pub fn with_liveness(mut self, check: LivenessCheck) -> Self {
        self.liveness = Some(check);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn ttl_millis(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Return the live session for this identity, refreshing its expiry,
    /// or create a new one.
    pub fn get_or_create_session(&self, claims: &SessionClaims) -> Session {
        let now = epoch_millis();
        let mut inner = self.inner.lock();
        self.purge_user_expired(&mut inner, &claims.user_id, now);

        let existing = inner
            .by_user
            .get(&claims.user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.sessions.get(id))
            .filter(|s| s.matches(claims))
            .max_by_key(|s| s.expires_at)
            .map(|s| s.id.clone());

        if let Some(id) = existing
            && let Some(session) = inner.sessions.get_mut(&id)
        {
            session.expires_at = now + self.ttl_millis();
            let mut session = session.clone();
            if self.clear_dead_sticky(&mut session) {
                inner.insert(session.clone());
            }
            self.persist(&session);
            debug!(session_id = %session.id, user_id = %session.user_id, "session refreshed");
            return session;
        }

        let session = Session {
            id: format!("sess-{}", Uuid::new_v4()),
            user_id: claims.user_id.clone(),
            organization_id: claims.organization_id.clone(),
            connections: Vec::new(),
            metadata: SessionMetadata::default(),
            created_at: now,
            expires_at: now + self.ttl_millis(),
        };
        inner.insert(session.clone());
        self.persist(&session);
        info!(session_id = %session.id, user_id = %session.user_id, "session created");
        session
    }

    /// Fetch a session. Missing and expired sessions both yield `None`.
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        let now = epoch_millis();
        let mut inner = self.inner.lock();
        let mut session = inner.sessions.get(session_id)?.clone();

        if session.is_expired_at(now) {
            inner.remove(session_id);
            self.forget(session_id);
            debug!(%session_id, "expired session dropped on read");
            return None;
        }

        if self.clear_dead_sticky(&mut session) {
            inner.insert(session.clone());
            self.persist(&session);
        }
        Some(session)
    }

    /// Record the instance this session prefers. Returns false if the
    /// session does not exist or has expired.
    pub fn set_sticky_instance(&self, session_id: &str, instance_id: &str) -> bool {
        self.update(session_id, |session| {
            if session.metadata.sticky_instance.as_deref() == Some(instance_id) {
                return false;
            }
            session.metadata.sticky_instance = Some(instance_id.to_string());
            debug!(%session_id, %instance_id, "sticky instance set");
            true
        })
    }

    /// All live sessions for a user, oldest first.
    pub fn get_user_sessions(&self, user_id: &str) -> Vec<Session> {
        let now = epoch_millis();
        let mut inner = self.inner.lock();
        self.purge_user_expired(&mut inner, user_id, now);

        let mut sessions: Vec<Session> = inner
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect();
        for session in &mut sessions {
            if self.clear_dead_sticky(session) {
                inner.insert(session.clone());
                self.persist(session);
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Attach a connection id. Returns false if the session is gone.
    pub fn add_connection(&self, session_id: &str, connection_id: &str) -> bool {
        self.update(session_id, |session| {
            if session.connections.iter().any(|c| c == connection_id) {
                return false;
            }
            session.connections.push(connection_id.to_string());
            true
        })
    }

    /// Detach a connection id. Returns false if the session is gone.
    pub fn remove_connection(&self, session_id: &str, connection_id: &str) -> bool {
        self.update(session_id, |session| {
            let before = session.connections.len();
            session.connections.retain(|c| c != connection_id);
            session.connections.len() != before
        })
    }

    /// Drop a session regardless of its expiry.
    pub fn remove_session(&self, session_id: &str) -> Option<Session> {
        let removed = self.inner.lock().remove(session_id);
        if removed.is_some() {
            self.forget(session_id);
            info!(%session_id, "session removed");
        }
        removed
    }

    /// Snapshot of every unexpired session.
    pub fn sessions(&self) -> Vec<Session> {
        let now = epoch_millis();
        let inner = self.inner.lock();
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| !s.is_expired_at(now))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Number of sessions held, including ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Expiry ─────────────────────────────────────────────────────

    /// Remove every expired session. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = epoch_millis();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| s.is_expired_at(now))
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            inner.remove(id);
            self.forget(id);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "expired sessions swept");
        }
        expired.len()
    }

    /// Interval between sweeps: half the TTL.
    pub fn sweep_interval(&self) -> Duration {
        (self.ttl / 2).max(Duration::from_millis(10))
    }

    /// Sweep periodically until `shutdown` flips.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(interval = ?self.sweep_interval(), "session sweeper starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = shutdown.changed() => {
                    debug!("session sweeper shutting down");
                    break;
                }
            }
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Apply `f` to a live session, persisting if it reports a change.
    fn update(&self, session_id: &str, f: impl FnOnce(&mut Session) -> bool) -> bool {
        let now = epoch_millis();
        let mut inner = self.inner.lock();
        match inner.sessions.get(session_id) {
            None => return false,
            Some(session) if session.is_expired_at(now) => {
                inner.remove(session_id);
                self.forget(session_id);
                return false;
            }
            Some(_) => {}
        }
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return false;
        };
        if f(session) {
            let snapshot = session.clone();
            self.persist(&snapshot);
        }
        true
    }

    fn purge_user_expired(&self, inner: &mut Inner, user_id: &str, now: u64) {
        let expired: Vec<String> = inner
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter(|id| inner.sessions.get(*id).is_some_and(|s| s.is_expired_at(now)))
            .cloned()
            .collect();
        for id in expired {
            inner.remove(&id);
            self.forget(&id);
        }
    }

    /// Returns true if the sticky reference was cleared.
    fn clear_dead_sticky(&self, session: &mut Session) -> bool {
        let (Some(check), Some(instance_id)) =
            (&self.liveness, session.metadata.sticky_instance.as_deref())
        else {
            return false;
        };
        if check(instance_id) {
            return false;
        }
        debug!(session_id = %session.id, %instance_id, "sticky instance no longer live");
        session.metadata.sticky_instance = None;
        true
    }

    fn persist(&self, session: &Session) {
        if let Some(state) = &self.persistence
            && let Err(e) = state.put_session(session)
        {
            warn!(session_id = %session.id, error = %e, "failed to persist session");
        }
    }

    fn forget(&self, session_id: &str) {
        if let Some(state) = &self.persistence
            && let Err(e) = state.delete_session(session_id)
        {
            warn!(%session_id, error = %e, "failed to delete persisted session");
        }
    }
}
