//! Typed deployment events exchanged between peers.

use serde::{Deserialize, Serialize};

use provmon_state::{DeploymentRecord, InstanceRecord, PeerId, PeerInfo, ServiceElement};

/// A state change of one deployment, emitted by the peer managing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub deployment: String,
    /// Peer that emitted the event.
    pub origin: PeerId,
    pub kind: EventKind,
    pub at: u64,
}

impl DeploymentEvent {
    pub fn new(deployment: &str, origin: &str, kind: EventKind) -> Self {
        Self {
            deployment: deployment.to_string(),
            origin: origin.to_string(),
            kind,
            at: epoch_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    ElementAdded(ServiceElement),
    ElementRemoved { name: String },
    ElementUpdated(ServiceElement),
    Deployed(DeploymentRecord),
    Undeployed,
    Updated(DeploymentRecord),
    /// `manager` now makes placement decisions for the deployment.
    ManagementChanged { manager: PeerInfo },
    InstanceUpdated(InstanceRecord),
    ServiceProvisioned(InstanceRecord),
    RedeployRequested { delay_ms: u64 },
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::ElementAdded(_) => "element_added",
            EventKind::ElementRemoved { .. } => "element_removed",
            EventKind::ElementUpdated(_) => "element_updated",
            EventKind::Deployed(_) => "deployed",
            EventKind::Undeployed => "undeployed",
            EventKind::Updated(_) => "updated",
            EventKind::ManagementChanged { .. } => "management_changed",
            EventKind::InstanceUpdated(_) => "instance_updated",
            EventKind::ServiceProvisioned(_) => "service_provisioned",
            EventKind::RedeployRequested { .. } => "redeploy_requested",
        }
    }
}

/// Local notifications for whoever drives provisioning in this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementNotice {
    /// This monitor became ACTIVE for the deployment.
    Promoted(String),
    Demoted(String),
    /// A scheduled redeploy ran; ACTIVE deployments need fresh placements.
    Redeployed(String),
}

pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
