pub mod auth;
pub mod config;
pub mod types;

pub use auth::{AuthError, BoxFuture, StaticTokenValidator, TokenValidator};
pub use config::{parse_duration, SwitchyardConfig};
pub use types::*;
