//! Provisioner: turns desired state into placements.
//!
//! Only deployments this monitor manages are provisioned. Each placed
//! instance is recorded through the `PeerCoordinator`, which replicates it
//! to the backups. Work that finds no node is parked in the placement
//! coordinator and replayed when the fleet changes or the retry interval
//! elapses.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use provmon_peer::{ManagementNotice, PeerCoordinator, PeerError, PeerResult};
use provmon_placement::{PlacementCoordinator, ProvisionRequest, RegistryEvent, ResourceHandle};
use provmon_state::{InstanceRecord, InstanceStatus, ProvisionType, ServiceElement};

pub struct Provisioner {
    placement: Arc<PlacementCoordinator>,
    peers: Arc<PeerCoordinator>,
}

impl Provisioner {
    pub fn new(placement: Arc<PlacementCoordinator>, peers: Arc<PeerCoordinator>) -> Self {
        Self { placement, peers }
    }

    pub fn placement(&self) -> &Arc<PlacementCoordinator> {
        &self.placement
    }

    fn manages(&self, deployment: &str) -> bool {
        self.peers
            .manager(deployment)
            .is_some_and(|m| m.is_active() && m.is_managing())
    }

    /// Place whatever `deployment` is missing. Returns the number of
    /// instances placed.
    pub async fn provision(&self, deployment: &str) -> usize {
        if !self.manages(deployment) {
            debug!(%deployment, "not managed here, skipping provisioning");
            return 0;
        }
        let Some(record) = self.peers.deployment(deployment) else {
            return 0;
        };
        // Recomputed from scratch below.
        self.placement.discard_pending(deployment);

        let mut placed = 0;
        for element in &record.elements {
            match element.provision_type {
                ProvisionType::External => {}
                ProvisionType::Dynamic => {
                    let live = record.live_instances(&element.name) as u32;
                    let missing = element.planned.saturating_sub(live);
                    for _ in 0..missing {
                        let mut request = ProvisionRequest::new(element.clone());
                        match self.placement.acquire(&mut request).await {
                            Some(handle) => {
                                if self.record(&handle, element) {
                                    placed += 1;
                                }
                            }
                            None => {
                                debug!(element = %element.key(), reasons = ?request.reasons(), "parking placement");
                                self.placement.defer(request);
                                break;
                            }
                        }
                    }
                }
                ProvisionType::Fixed => {
                    let mut request = ProvisionRequest::new(element.clone());
                    for handle in self.placement.acquire_fixed(&mut request).await {
                        if self.record(&handle, element) {
                            placed += 1;
                        }
                    }
                    // Nodes that register later receive it on retry.
                    self.placement.defer(request);
                }
            }
        }
        if placed > 0 {
            info!(%deployment, placed, "instances placed");
        }
        placed
    }

    /// Replay parked requests.
    pub async fn retry(&self) -> usize {
        let mut placed = 0;
        for placement in self.placement.retry_pending().await {
            let element = &placement.request.element;
            if self.manages(&element.deployment) && self.record(&placement.handle, element) {
                placed += 1;
            } else {
                placement.handle.release(&element.key());
            }
        }
        placed
    }

    /// Record a fresh reservation. Undoes it if the deployment is no longer
    /// ours.
    fn record(&self, handle: &ResourceHandle, element: &ServiceElement) -> bool {
        let instance = InstanceRecord {
            id: format!("{}-{:08x}", element.name, rand::random::<u32>()),
            deployment: element.deployment.clone(),
            element: element.name.clone(),
            resource_id: handle.id().to_string(),
            host: handle.address().to_string(),
            status: InstanceStatus::Reserved,
            updated_at: 0,
        };
        match self.peers.record_instance(instance) {
            Ok(()) => true,
            Err(e) => {
                warn!(element = %element.key(), resource = %handle.id(), error = %e, "dropping reservation");
                handle.release(&element.key());
                false
            }
        }
    }

    /// Apply a status report for one instance and update node accounting.
    pub async fn instance_status(
        &self,
        deployment: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> PeerResult<InstanceRecord> {
        let record = self
            .peers
            .deployment(deployment)
            .ok_or_else(|| PeerError::UnknownDeployment(deployment.to_string()))?;
        let mut instance = record
            .instances
            .iter()
            .find(|i| i.id == instance_id)
            .cloned()
            .ok_or_else(|| PeerError::UnknownInstance {
                deployment: deployment.to_string(),
                instance: instance_id.to_string(),
            })?;

        let key = format!("{deployment}/{}", instance.element);
        let registry = self.placement.registry();
        match (instance.status, status) {
            (InstanceStatus::Reserved, InstanceStatus::Running) => {
                registry.confirm(&instance.resource_id, &key);
            }
            (InstanceStatus::Reserved, InstanceStatus::Stopped | InstanceStatus::Failed) => {
                registry.release(&instance.resource_id, &key);
            }
            (InstanceStatus::Running, InstanceStatus::Stopped | InstanceStatus::Failed) => {
                registry.stopped(&instance.resource_id, &key);
            }
            _ => {}
        }

        instance.status = status;
        instance.updated_at = provmon_peer::event::epoch_millis();
        self.peers.record_instance(instance.clone())?;

        if matches!(status, InstanceStatus::Stopped | InstanceStatus::Failed) {
            self.provision(deployment).await;
        }
        Ok(instance)
    }

    /// Instances on a node whose lease ended are gone.
    pub async fn resource_lost(&self, resource_id: &str) {
        for record in self.peers.deployments() {
            if !self.manages(&record.name) {
                continue;
            }
            let lost: Vec<InstanceRecord> = record
                .instances
                .iter()
                .filter(|i| {
                    i.resource_id == resource_id
                        && matches!(i.status, InstanceStatus::Reserved | InstanceStatus::Running)
                })
                .cloned()
                .collect();
            if lost.is_empty() {
                continue;
            }
            warn!(deployment = %record.name, resource = %resource_id, instances = lost.len(), "instances lost with node");
            for mut instance in lost {
                instance.status = InstanceStatus::Failed;
                instance.updated_at = provmon_peer::event::epoch_millis();
                if let Err(e) = self.peers.record_instance(instance) {
                    warn!(deployment = %record.name, error = %e, "failed to record lost instance");
                }
            }
            self.provision(&record.name).await;
        }
    }

    /// Stop provisioning `deployment` and give back its node accounting.
    pub fn withdraw(&self, deployment: &str) {
        if !self.manages(deployment) {
            return;
        }
        let dropped = self.placement.discard_pending(deployment);
        let Some(record) = self.peers.deployment(deployment) else {
            return;
        };
        let registry = self.placement.registry();
        for instance in &record.instances {
            let key = format!("{deployment}/{}", instance.element);
            match instance.status {
                InstanceStatus::Reserved => {
                    registry.release(&instance.resource_id, &key);
                }
                InstanceStatus::Running => {
                    registry.stopped(&instance.resource_id, &key);
                }
                _ => {}
            }
        }
        debug!(%deployment, dropped, "provisioning withdrawn");
    }

    /// Drive provisioning from management changes, fleet changes and a
    /// retry ticker until shutdown.
    pub fn run(self: Arc<Self>, retry_interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut notices = self.peers.subscribe();
        let mut fleet = self.placement.registry().subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retry_interval);
            ticker.tick().await;
            info!(?retry_interval, "provisioner running");

            loop {
                tokio::select! {
                    notice = notices.recv() => match notice {
                        Ok(ManagementNotice::Promoted(name) | ManagementNotice::Redeployed(name)) => {
                            self.provision(&name).await;
                        }
                        Ok(ManagementNotice::Demoted(name)) => {
                            let dropped = self.placement.discard_pending(&name);
                            debug!(deployment = %name, dropped, "demoted, pending work dropped");
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "management notices lagged, reprovisioning everything");
                            for record in self.peers.deployments() {
                                self.provision(&record.name).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    event = fleet.recv() => match event {
                        Ok(RegistryEvent::Registered(_) | RegistryEvent::Renewed(_)) => {
                            self.retry().await;
                        }
                        Ok(RegistryEvent::Removed(id)) => {
                            self.resource_lost(&id).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            self.retry().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = ticker.tick() => {
                        let placed = self.retry().await;
                        if placed > 0 {
                            info!(placed, "pending placements resolved");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("provisioner shutting down");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use provmon_core::StrategyKind;
    use provmon_health::FaultProbe;
    use provmon_peer::{PeerConnector, PeerRpc, PeerSettings};
    use provmon_placement::ResourceRegistry;
    use provmon_state::{DeploymentRecord, InstantiatorResource, PeerInfo};

    struct Alone;

    #[async_trait]
    impl PeerConnector for Alone {
        async fn connect(&self, endpoint: &str) -> PeerResult<Arc<dyn PeerRpc>> {
            Err(PeerError::Unreachable {
                peer: endpoint.to_string(),
                reason: "alone".into(),
            })
        }
    }

    struct Quiet;

    #[async_trait]
    impl FaultProbe for Quiet {
        async fn start_monitoring(&self, _id: &str, _endpoint: &str) {}
        async fn stop_monitoring(&self, _id: &str) {}
        async fn confirm_unreachable(&self, _id: &str) -> bool {
            false
        }
    }

    fn provisioner(nodes: &[&str]) -> Provisioner {
        let registry = Arc::new(ResourceRegistry::with_strategy(StrategyKind::LeastLoaded));
        for (i, id) in nodes.iter().enumerate() {
            registry.add(InstantiatorResource::new(id, &format!("10.1.0.{i}"), 4));
        }
        let peers = Arc::new(PeerCoordinator::new(
            PeerInfo::generate("mon", "10.0.0.1", "10.0.0.1:9010", "1.0"),
            PeerSettings::default(),
            Arc::new(Alone),
            Arc::new(Quiet),
            None,
        ));
        Provisioner::new(Arc::new(PlacementCoordinator::new(registry)), peers)
    }

    fn shop(planned: u32) -> DeploymentRecord {
        DeploymentRecord::new(
            "shop",
            vec![ServiceElement::new("shop", "web", ProvisionType::Dynamic, planned)],
        )
    }

    #[tokio::test]
    async fn provisions_missing_instances() {
        let prov = provisioner(&["n1", "n2"]);
        prov.peers.deploy(shop(3)).unwrap();

        assert_eq!(prov.provision("shop").await, 3);
        let record = prov.peers.deployment("shop").unwrap();
        assert_eq!(record.live_instances("web"), 3);
        assert!(record.instances.iter().all(|i| i.status == InstanceStatus::Reserved));

        // Nothing missing any more.
        assert_eq!(prov.provision("shop").await, 0);
    }

    #[tokio::test]
    async fn unplaced_work_waits_for_capacity() {
        let prov = provisioner(&[]);
        prov.peers.deploy(shop(1)).unwrap();
        assert_eq!(prov.provision("shop").await, 0);
        assert_eq!(prov.placement.pending_len(), 1);

        prov.placement.registry().add(InstantiatorResource::new("late", "10.1.0.9", 4));
        assert_eq!(prov.retry().await, 1);
        assert_eq!(prov.peers.deployment("shop").unwrap().live_instances("web"), 1);
    }

    #[tokio::test]
    async fn status_reports_update_accounting() {
        let prov = provisioner(&["n1"]);
        prov.peers.deploy(shop(1)).unwrap();
        prov.provision("shop").await;
        let instance = prov.peers.deployment("shop").unwrap().instances[0].clone();
        let node = prov.placement.registry().get("n1").unwrap();
        assert_eq!(node.in_process_count(), 1);

        prov.instance_status("shop", &instance.id, InstanceStatus::Running)
            .await
            .unwrap();
        assert_eq!(node.in_process_count(), 0);
        assert_eq!(node.running_count(), 1);

        // A failure is replaced straight away.
        prov.instance_status("shop", &instance.id, InstanceStatus::Failed)
            .await
            .unwrap();
        let record = prov.peers.deployment("shop").unwrap();
        assert_eq!(record.instances.len(), 2);
        assert_eq!(record.live_instances("web"), 1);
    }

    #[tokio::test]
    async fn lost_node_instances_are_replaced() {
        let prov = provisioner(&["n1", "n2"]);
        prov.peers.deploy(shop(1)).unwrap();
        prov.provision("shop").await;
        let first = prov.peers.deployment("shop").unwrap().instances[0].clone();

        prov.placement.registry().remove(&first.resource_id);
        prov.resource_lost(&first.resource_id).await;

        let record = prov.peers.deployment("shop").unwrap();
        let replacement = record.instances.iter().find(|i| i.id != first.id).unwrap();
        assert_ne!(replacement.resource_id, first.resource_id);
        assert_eq!(record.live_instances("web"), 1);
    }

    #[tokio::test]
    async fn fixed_elements_land_on_every_node() {
        let prov = provisioner(&["n1", "n2", "n3"]);
        let record = DeploymentRecord::new(
            "shop",
            vec![ServiceElement::new("shop", "agent", ProvisionType::Fixed, 1)],
        );
        prov.peers.deploy(record).unwrap();
        assert_eq!(prov.provision("shop").await, 3);
        assert_eq!(prov.placement.pending_len(), 1);
        // Already everywhere.
        assert_eq!(prov.retry().await, 0);
    }

    #[tokio::test]
    async fn backups_are_not_provisioned() {
        let prov = provisioner(&["n1"]);
        prov.peers.deploy(shop(1)).unwrap();
        let winner = PeerInfo::generate("other", "10.0.0.2", "10.0.0.2:9010", "1.0");
        PeerRpc::demote(prov.peers.as_ref(), "shop", winner).await.unwrap();
        assert_eq!(prov.provision("shop").await, 0);
    }
}
