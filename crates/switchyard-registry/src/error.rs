//! Registry error types.

use thiserror::Error;

use switchyard_core::InstanceStatus;

/// Errors that can occur during registry and routing operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("instance capacity exceeded (max {max})")]
    CapacityExceeded { max: usize },

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("no available instance")]
    NoAvailableInstance,

    #[error("instance {id} is {status:?} and cannot take connections")]
    NotRoutable { id: String, status: InstanceStatus },

    #[error("instance {0} is at its connection limit")]
    AtCapacity(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
