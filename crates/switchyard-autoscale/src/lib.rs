//! switchyard-autoscale — usage-driven instance scaling.
//!
//! Reads the registry snapshot on a fixed interval and performs at most
//! one scaling action per tick. Operators can also scale directly
//! through [`Autoscaler::scale_up`], [`Autoscaler::scale_down`] and
//! [`Autoscaler::remove_instance`].
//!
//! # Scaling Algorithm
//!
//! ```text
//! serving = active + provisioning instances
//!
//! if serving < min_instances and len < max_instances:
//!     ScaleUp(BelowMinimum)
//!
//! if any active instance has
//!        cpu    >= cpu_threshold
//!     or memory >= memory_threshold
//!     or connections >= connection_ratio * max_connections_per_instance
//!   and len < max_instances:
//!     ScaleUp
//!
//! if any instance is in error:
//!     ScaleDown(that instance)
//!
//! if serving > min_instances and an active instance has had
//!    0 connections and cpu < idle_cpu_threshold for idle_grace:
//!     ScaleDown(longest idle)
//! ```
//!
//! Scale-down marks the victim draining; it is removed once its
//! connections reach zero or `drain_timeout` elapses. Failed creations
//! retry with exponential backoff up to `max_create_retries`.

pub mod scaler;

pub use scaler::{Autoscaler, ScaleDecision, ScaleError, ScaleResult, ScaleUpReason, TickOutcome};
