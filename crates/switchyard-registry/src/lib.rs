//! switchyard-registry — instance pool ownership and load balancing.
//!
//! The registry is the only owner of [`Instance`](switchyard_core::Instance)
//! records. It:
//!
//! - Caps the pool at `max_instances`
//! - Tracks status transitions and the latest resource usage
//! - Binds connections to instances, one entry per connection id
//! - Selects instances for new connections through the [`LoadBalancer`]
//! - Publishes a revision counter on every mutation
//!
//! # Architecture
//!
//! ```text
//! InstanceRegistry
//!   ├── Mutex<Inner>
//!   │     ├── slots (creation order)
//!   │     │     └── Instance + bound connection ids
//!   │     └── LoadBalancingStrategy
//!   ├── LoadBalancer (atomic round-robin cursor)
//!   └── watch::Sender<u64> (revision feed)
//!
//! Provisioner (launch / terminate workers)
//!   ├── StaticProvisioner (fixed endpoint list)
//!   └── CommandProvisioner (one process per instance)
//! ```

pub mod error;
pub mod load_balancer;
pub mod provisioner;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use load_balancer::LoadBalancer;
pub use provisioner::{CommandProvisioner, Provisioner, StaticProvisioner};
pub use registry::InstanceRegistry;
