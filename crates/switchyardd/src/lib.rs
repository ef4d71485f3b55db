//! switchyardd — the Switchyard daemon as a library, so integration
//! tests can boot a full control plane on ephemeral ports.

pub mod control_plane;

pub use control_plane::ControlPlane;
