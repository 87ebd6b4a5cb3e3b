//! provmon-peer: control-plane replication between monitors.
//!
//! Monitors discover each other, pick backups, mirror deployment state
//! through typed events and take over deployments whose primary the fault
//! probe reports unreachable.
//!
//! # Architecture
//!
//! ```text
//! PeerCoordinator
//!   ├── peers            discovered monitors + RPC stubs
//!   ├── backups          who backs up what we manage
//!   ├── backup_table     what we back up, by primary
//!   ├── DeploymentManager (one per deployment, ACTIVE or BACKUP)
//!   │     └── StateStore write-through
//!   ├── EventDispatcher  one bounded queue + task per peer
//!   └── FaultProbe       liveness of every known peer
//!
//! Transport
//!   ├── server::peer_routes   axum, under /api/v1/peer
//!   └── client::HttpPeerClient hyper http1
//! ```

pub mod client;
pub mod conflict;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod manager;
pub mod rpc;
pub mod server;

pub use client::{HttpConnector, HttpPeerClient};
pub use conflict::{Claim, Resolution, resolve};
pub use coordinator::{PeerCoordinator, PeerSettings};
pub use dispatch::{DeliveryFailure, EventDispatcher};
pub use error::{PeerError, PeerResult};
pub use event::{DeploymentEvent, EventKind, ManagementNotice};
pub use manager::DeploymentManager;
pub use rpc::{PeerConnector, PeerRpc};
pub use server::{ApiResponse, error_response, peer_error_response, peer_routes};
