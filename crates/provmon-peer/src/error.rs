//! Error types for peer replication.

use provmon_state::{PeerId, StateError};
use thiserror::Error;

pub type PeerResult<T> = Result<T, PeerError>;

#[derive(Debug, Error)]
pub enum PeerError {
    /// The peer could not be reached at all.
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    /// The peer answered with an error.
    #[error("peer {peer} rejected call: {message}")]
    Rpc { peer: String, message: String },

    #[error("peer {peer} speaks unsupported protocol {version:?}")]
    IncompatibleVersion { peer: PeerId, version: String },

    #[error("deployment {0} not found")]
    UnknownDeployment(String),

    #[error("instance {instance} not found in deployment {deployment}")]
    UnknownInstance { deployment: String, instance: String },

    #[error("deployment {0} already exists")]
    AlreadyDeployed(String),

    /// Mutations are only accepted where the deployment is ACTIVE.
    #[error("deployment {0} is managed by another peer")]
    NotActive(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl PeerError {
    /// Whether this failure says something about the peer's liveness.
    pub fn is_communication(&self) -> bool {
        matches!(self, PeerError::Unreachable { .. } | PeerError::Rpc { .. })
    }
}
