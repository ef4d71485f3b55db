//! redb table definitions for the Switchyard session store.
//!
//! Keys are `&str`, values are JSON-serialized domain types.

use redb::TableDefinition;

/// Sessions keyed by `{session_id}`.
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
