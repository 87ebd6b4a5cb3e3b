//! The remote face of a peer.
//!
//! `PeerCoordinator` only ever talks to other monitors through these
//! traits. The daemon plugs in the HTTP client; tests wire coordinators
//! together in-process.

use std::sync::Arc;

use async_trait::async_trait;

use provmon_state::{DeploymentRecord, PeerInfo};

use crate::error::PeerResult;
use crate::event::DeploymentEvent;

#[async_trait]
pub trait PeerRpc: Send + Sync {
    async fn peer_info(&self) -> PeerResult<PeerInfo>;

    /// Ask the peer to back up every deployment `primary` manages.
    async fn assign_backup_for(&self, primary: PeerInfo) -> PeerResult<()>;

    async fn remove_backup_for(&self, primary: PeerInfo) -> PeerResult<()>;

    /// Deployments the peer currently holds, ACTIVE and BACKUP.
    async fn deployments(&self) -> PeerResult<Vec<DeploymentRecord>>;

    async fn deployment(&self, name: &str) -> PeerResult<Option<DeploymentRecord>>;

    /// The caller won a primacy conflict; the peer must become BACKUP.
    async fn demote(&self, name: &str, winner: PeerInfo) -> PeerResult<()>;

    async fn notify(&self, event: DeploymentEvent) -> PeerResult<()>;

    async fn update_peer_info(&self, info: PeerInfo) -> PeerResult<()>;

    async fn ping(&self) -> PeerResult<()>;
}

/// Opens an RPC stub for an endpoint.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> PeerResult<Arc<dyn PeerRpc>>;
}
