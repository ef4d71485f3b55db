//! switchyard-router — WebSocket front door for client connections.
//!
//! Clients connect to `/mcp-router` with a bearer token. The router
//! authenticates them, resolves their session, binds the connection to
//! an instance and proxies JSON frames both ways until either side
//! closes.
//!
//! # Components
//!
//! - **`router`**: axum handler and the per-connection flow
//! - **`frames`**: ack/error frame shapes and client frame classification
//! - **`upstream`**: [`InstanceConnector`] seam and the tungstenite-backed [`WsConnector`]
//! - **`connections`**: table of live routed connections

pub mod connections;
pub mod frames;
pub mod router;
pub mod upstream;

pub use connections::ConnectionTable;
pub use frames::{ClientFrame, ServerFrame};
pub use router::{ConnectionRouter, ROUTER_PATH};
pub use upstream::{InstanceConnector, UpstreamLink, WsConnector};
