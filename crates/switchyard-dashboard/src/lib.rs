//! switchyard-dashboard — live operator control plane over WebSocket.
//!
//! Operators connect to `/registry-dashboard` and receive the full
//! state once, then deltas as the pool changes:
//!
//! ```text
//! registry ──revision──┐
//! ticker ──────────────┼─► broadcaster ─► broadcast<String> ─► operator sockets
//! sessions ────────────┘   (changed sections only)
//!
//! operator ─► {type:"command"} ─► autoscaler / registry ─► command-result
//! ```
//!
//! | Command | Params |
//! |---|---|
//! | `scaleUp` | `count` (default 1) |
//! | `scaleDown` | `count` (default 1) |
//! | `setStrategy` | `type` |
//! | `removeInstance` | `id` |

pub mod commands;
pub mod dashboard;
pub mod state;

pub use commands::{Command, CommandError, parse_command};
pub use dashboard::{DASHBOARD_PATH, Dashboard};
pub use state::{DashboardState, RegistrySection, SessionsSection, SystemSection};
