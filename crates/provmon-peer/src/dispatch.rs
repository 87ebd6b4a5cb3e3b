//! Outbound event fan-out.
//!
//! Each peer gets its own bounded queue and delivery task so a slow peer
//! never holds up the others. Events that do not fit are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use provmon_state::PeerId;

use crate::error::PeerError;
use crate::event::DeploymentEvent;
use crate::rpc::PeerRpc;

/// A peer did not accept an event.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub peer: PeerId,
    pub error: PeerError,
}

struct Outbox {
    queue: mpsc::Sender<DeploymentEvent>,
    task: JoinHandle<()>,
}

pub struct EventDispatcher {
    depth: usize,
    outboxes: Mutex<HashMap<PeerId, Outbox>>,
    failures: mpsc::UnboundedSender<DeliveryFailure>,
}

impl EventDispatcher {
    /// `depth` is the per-peer queue bound.
    pub fn new(depth: usize) -> (Self, mpsc::UnboundedReceiver<DeliveryFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            depth: depth.max(1),
            outboxes: Mutex::new(HashMap::new()),
            failures,
        };
        (dispatcher, rx)
    }

    fn outboxes(&self) -> MutexGuard<'_, HashMap<PeerId, Outbox>> {
        self.outboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_peer(&self, peer: &str, rpc: Arc<dyn PeerRpc>) {
        let (queue, mut rx) = mpsc::channel::<DeploymentEvent>(self.depth);
        let failures = self.failures.clone();
        let id = peer.to_string();

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let label = event.kind.label();
                if let Err(error) = rpc.notify(event).await {
                    debug!(peer = %id, event = label, error = %error, "event delivery failed");
                    if failures.send(DeliveryFailure { peer: id.clone(), error }).is_err() {
                        return;
                    }
                }
            }
        });

        if let Some(old) = self.outboxes().insert(peer.to_string(), Outbox { queue, task }) {
            old.task.abort();
        }
    }

    pub fn remove_peer(&self, peer: &str) {
        if let Some(outbox) = self.outboxes().remove(peer) {
            outbox.task.abort();
        }
    }

    pub fn peer_count(&self) -> usize {
        self.outboxes().len()
    }

    /// Queue an event for one peer. Returns false if it was dropped.
    pub fn send_to(&self, peer: &str, event: DeploymentEvent) -> bool {
        let outboxes = self.outboxes();
        let Some(outbox) = outboxes.get(peer) else {
            return false;
        };
        enqueue(peer, &outbox.queue, event)
    }

    /// Queue an event for every known peer.
    pub fn broadcast(&self, event: &DeploymentEvent) {
        for (peer, outbox) in self.outboxes().iter() {
            enqueue(peer, &outbox.queue, event.clone());
        }
    }

    pub fn shutdown(&self) {
        for (_, outbox) in self.outboxes().drain() {
            outbox.task.abort();
        }
    }
}

fn enqueue(peer: &str, queue: &mpsc::Sender<DeploymentEvent>, event: DeploymentEvent) -> bool {
    match queue.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(
                peer = %peer,
                deployment = %event.deployment,
                event = event.kind.label(),
                "peer event queue full, dropping event"
            );
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
