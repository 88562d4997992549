//! Controller-specific error types.

use thiserror::Error;

/// Errors that can occur in the dynamic-prefix controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Receiver construction failed for a DynamicPrefix
    #[error("receiver creation failed: {0}")]
    Factory(#[from] prefix::FactoryError),

    /// Receiver lifecycle error
    #[error("receiver error: {0}")]
    Receiver(#[from] prefix::ReceiverError),

    /// A resource is missing a required piece of metadata or configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A referenced projection (address range or subnet) does not exist
    #[error("projection not found: {0}")]
    ProjectionNotFound(String),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),
}
