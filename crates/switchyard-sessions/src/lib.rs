//! switchyard-sessions — session affinity for routed connections.
//!
//! A session binds an authenticated identity (user + optional
//! organization) to a TTL, the connections it currently holds, and an
//! optional sticky instance. The router resolves a session on every
//! connect and prefers the sticky instance while it stays live.
//!
//! # Architecture
//!
//! ```text
//! SessionStore
//!   ├── Mutex<Inner>
//!   │     ├── sessions : session_id → Session
//!   │     └── by_user  : user_id → {session_id}
//!   ├── LivenessCheck (sticky instance still live?)
//!   ├── StateStore (optional write-through, redb)
//!   └── sweeper task (every ttl / 2)
//! ```

pub mod store;

pub use store::{LivenessCheck, SessionStore};
