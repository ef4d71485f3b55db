//! switchyard-state — durable session records for Switchyard.
//!
//! Backed by [redb](https://docs.rs/redb). Used by the session store when
//! `sessions.persist_sessions = true`. Records are written as sessions
//! change and read back in bulk on startup, so there is no query layer.
//!
//! # Architecture
//!
//! ```text
//! sessions : {session_id} → Session (JSON)
//! ```
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
