//! Error types for store access, machine transport and controller passes

use keelson_common::{Namespace, ResourceKind};
use thiserror::Error;

/// Declarative store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Resource does not exist
    #[error("Resource not found: {kind} {namespace}/{id}")]
    NotFound {
        namespace: Namespace,
        kind: ResourceKind,
        id: String,
    },

    /// Stored resource could not be decoded or encoded
    #[error("Malformed resource: {0}")]
    Malformed(#[from] keelson_common::Error),

    /// Controller read a kind it did not declare as input
    #[error("Controller {controller} has no input of kind {kind}")]
    UndeclaredInput {
        controller: &'static str,
        kind: ResourceKind,
    },

    /// Controller wrote a kind it does not own
    #[error("Controller {controller} does not own output kind {kind}")]
    UndeclaredOutput {
        controller: &'static str,
        kind: ResourceKind,
    },

    /// Write blocked because a strong input has no resources
    #[error("Controller {controller} cannot write, strong input {kind} is missing")]
    StrongInputMissing {
        controller: &'static str,
        kind: ResourceKind,
    },

    /// Mutator refused the write
    #[error("Write rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Machine API transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// No credentials or no endpoint yet, retry later
    #[error("Client is not ready: {0}")]
    NotReady(String),

    /// Connecting to the machine failed
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Remote call failed
    #[error("Request failed: {0}")]
    Rpc(String),

    /// Call did not finish in time
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Reading transport credentials failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl TransportError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, TransportError::NotReady(_))
    }
}

/// Errors aborting a controller pass
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Controller error: {0}")]
    Internal(String),
}

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
