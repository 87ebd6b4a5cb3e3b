//! Replication scenarios with in-process monitors.
//!
//! Coordinators are wired together through a shared `Network` map instead
//! of HTTP. Removing a monitor from the map makes every call to it fail,
//! and the scripted probe reports it unreachable when asked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use provmon_health::{FaultProbe, Unreachable};
use provmon_peer::{
    DeploymentEvent, PeerConnector, PeerCoordinator, PeerError, PeerResult, PeerRpc, PeerSettings,
};
use provmon_state::{
    DeploymentRecord, InstanceRecord, InstanceStatus, PeerInfo, ProvisionType, ServiceElement,
};

#[derive(Default)]
struct Network {
    nodes: Mutex<HashMap<String, Arc<PeerCoordinator>>>,
}

impl Network {
    fn lookup(&self, endpoint: &str) -> PeerResult<Arc<PeerCoordinator>> {
        self.nodes
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| PeerError::Unreachable {
                peer: endpoint.to_string(),
                reason: "not on the network".into(),
            })
    }

    fn is_up(&self, endpoint: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(endpoint)
    }

    fn unplug(&self, endpoint: &str) {
        self.nodes.lock().unwrap().remove(endpoint);
    }
}

/// Resolves the target on every call, so unplugged monitors stop answering.
struct LocalRpc {
    endpoint: String,
    net: Arc<Network>,
}

#[async_trait]
impl PeerRpc for LocalRpc {
    async fn peer_info(&self) -> PeerResult<PeerInfo> {
        self.net.lookup(&self.endpoint)?.peer_info().await
    }
    async fn assign_backup_for(&self, primary: PeerInfo) -> PeerResult<()> {
        self.net.lookup(&self.endpoint)?.assign_backup_for(primary).await
    }
    async fn remove_backup_for(&self, primary: PeerInfo) -> PeerResult<()> {
        self.net.lookup(&self.endpoint)?.remove_backup_for(primary).await
    }
    async fn deployments(&self) -> PeerResult<Vec<DeploymentRecord>> {
        PeerRpc::deployments(self.net.lookup(&self.endpoint)?.as_ref()).await
    }
    async fn deployment(&self, name: &str) -> PeerResult<Option<DeploymentRecord>> {
        PeerRpc::deployment(self.net.lookup(&self.endpoint)?.as_ref(), name).await
    }
    async fn demote(&self, name: &str, winner: PeerInfo) -> PeerResult<()> {
        self.net.lookup(&self.endpoint)?.demote(name, winner).await
    }
    async fn notify(&self, event: DeploymentEvent) -> PeerResult<()> {
        self.net.lookup(&self.endpoint)?.notify(event).await
    }
    async fn update_peer_info(&self, info: PeerInfo) -> PeerResult<()> {
        self.net.lookup(&self.endpoint)?.update_peer_info(info).await
    }
    async fn ping(&self) -> PeerResult<()> {
        self.net.lookup(&self.endpoint)?.ping().await
    }
}

struct LocalConnector(Arc<Network>);

#[async_trait]
impl PeerConnector for LocalConnector {
    async fn connect(&self, endpoint: &str) -> PeerResult<Arc<dyn PeerRpc>> {
        // Fail fast like a refused TCP connect.
        self.0.lookup(endpoint)?;
        Ok(Arc::new(LocalRpc {
            endpoint: endpoint.to_string(),
            net: self.0.clone(),
        }))
    }
}

/// Confirms unreachability by looking at the network map.
struct ScriptedProbe {
    net: Arc<Network>,
    watched: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl FaultProbe for ScriptedProbe {
    async fn start_monitoring(&self, id: &str, endpoint: &str) {
        self.watched.lock().unwrap().insert(id.to_string(), endpoint.to_string());
    }

    async fn stop_monitoring(&self, id: &str) {
        self.watched.lock().unwrap().remove(id);
    }

    async fn confirm_unreachable(&self, id: &str) -> bool {
        let endpoint = self.watched.lock().unwrap().get(id).cloned();
        endpoint.is_some_and(|e| !self.net.is_up(&e))
    }
}

struct Node {
    coord: Arc<PeerCoordinator>,
    probe: Arc<ScriptedProbe>,
    unreachable: mpsc::Sender<Unreachable>,
    endpoint: String,
}

impl Node {
    fn id(&self) -> String {
        self.coord.id()
    }

    fn watching(&self, id: &str) -> bool {
        self.probe.watched.lock().unwrap().contains_key(id)
    }

    /// What the fault detector would send once `other` stops answering.
    async fn report_unreachable(&self, other: &Node) {
        self.unreachable
            .send(Unreachable {
                id: other.id(),
                endpoint: other.endpoint.clone(),
            })
            .await
            .unwrap();
    }

    fn is_active(&self, name: &str) -> bool {
        self.coord.deployment(name).is_some_and(|r| r.active)
    }
}

fn spawn_node(net: &Arc<Network>, name: &str, host: &str, version: &str) -> Node {
    let endpoint = format!("{host}:9010");
    let probe = Arc::new(ScriptedProbe {
        net: net.clone(),
        watched: Mutex::new(HashMap::new()),
    });
    let coord = Arc::new(PeerCoordinator::new(
        PeerInfo::generate(name, host, &endpoint, version),
        PeerSettings::default(),
        Arc::new(LocalConnector(net.clone())),
        probe.clone(),
        None,
    ));
    let (tx, rx) = mpsc::channel(16);
    coord.start(rx);
    net.nodes.lock().unwrap().insert(endpoint.clone(), coord.clone());
    Node {
        coord,
        probe,
        unreachable: tx,
        endpoint,
    }
}

fn node(net: &Arc<Network>, name: &str, host: &str) -> Node {
    spawn_node(net, name, host, "1.0")
}

fn shop() -> DeploymentRecord {
    DeploymentRecord::new(
        "shop",
        vec![ServiceElement::new("shop", "web", ProvisionType::Dynamic, 2)],
    )
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ── Discovery ───────────────────────────────────────────────────

#[tokio::test]
async fn discovery_imports_active_deployments_as_backup() {
    let net = Arc::new(Network::default());
    let a = node(&net, "mon-a", "10.0.0.1");
    let b = node(&net, "mon-b", "10.0.0.2");

    a.coord.deploy(shop()).unwrap();
    let found = b.coord.discover(&a.endpoint).await.unwrap().unwrap();
    assert_eq!(found.id, a.id());

    let copy = b.coord.deployment("shop").unwrap();
    assert!(!copy.active);
    assert_eq!(copy.elements.len(), 1);
    assert_eq!(b.coord.manager("shop").unwrap().primary(), Some(a.id()));

    // Each asked the other to be its backup, and b now backs up a's deployment.
    assert_eq!(a.coord.backups(), vec![b.id()]);
    assert_eq!(b.coord.backups(), vec![a.id()]);
    assert_eq!(b.coord.backing_up(&a.id()), vec!["shop".to_string()]);
    assert_eq!(b.coord.backup_count(), 1);

    // Both ends probe each other.
    assert!(a.watching(&b.id()));
    assert!(b.watching(&a.id()));

    // The backup count reaches a through the info broadcast.
    eventually("b's backup count at a", || {
        a.coord
            .peers()
            .iter()
            .any(|p| p.id == b.id() && p.backup_count == 1)
    })
    .await;
}

#[tokio::test]
async fn discovering_ourselves_is_a_no_op() {
    let net = Arc::new(Network::default());
    let a = node(&net, "mon-a", "10.0.0.1");
    assert!(a.coord.discover(&a.endpoint).await.unwrap().is_none());
    assert!(a.coord.peers().is_empty());
}

#[tokio::test]
async fn incompatible_protocol_is_refused() {
    let net = Arc::new(Network::default());
    let a = node(&net, "mon-a", "10.0.0.1");
    let old = spawn_node(&net, "mon-old", "10.0.0.9", "0.9-SNAPSHOT");

    let err = a.coord.discover(&old.endpoint).await.unwrap_err();
    assert!(matches!(err, PeerError::IncompatibleVersion { .. }));
    assert!(a.coord.peers().is_empty());
}

#[tokio::test]
async fn off_host_peer_replaces_same_host_backup() {
    let net = Arc::new(Network::default());
    let a = node(&net, "mon-a", "10.0.0.1");
    // Same host, different port.
    let local = {
        let probe = Arc::new(ScriptedProbe {
            net: net.clone(),
            watched: Mutex::new(HashMap::new()),
        });
        let endpoint = "10.0.0.1:9011".to_string();
        let coord = Arc::new(PeerCoordinator::new(
            PeerInfo::generate("mon-local", "10.0.0.1", &endpoint, "1.0"),
            PeerSettings::default(),
            Arc::new(LocalConnector(net.clone())),
            probe.clone(),
            None,
        ));
        let (tx, rx) = mpsc::channel(16);
        coord.start(rx);
        net.nodes.lock().unwrap().insert(endpoint.clone(), coord.clone());
        Node {
            coord,
            probe,
            unreachable: tx,
            endpoint,
        }
    };
    let remote = node(&net, "mon-remote", "10.0.0.2");

    a.coord.deploy(shop()).unwrap();
    a.coord.discover(&local.endpoint).await.unwrap();
    assert_eq!(a.coord.backups(), vec![local.id()]);
    assert_eq!(local.coord.backing_up(&a.id()), vec!["shop".to_string()]);

    a.coord.discover(&remote.endpoint).await.unwrap();
    assert_eq!(a.coord.backups()[0], remote.id());
    assert_eq!(remote.coord.backing_up(&a.id()), vec!["shop".to_string()]);
    assert!(local.coord.backing_up(&a.id()).is_empty());
}

// ── Failover ────────────────────────────────────────────────────

#[tokio::test]
async fn backup_is_promoted_when_primary_fails() {
    let net = Arc::new(Network::default());
    let a = node(&net, "mon-a", "10.0.0.1");
    let b = node(&net, "mon-b", "10.0.0.2");
    let c = node(&net, "mon-c", "10.0.0.3");

    a.coord.deploy(shop()).unwrap();
    b.coord.discover(&a.endpoint).await.unwrap();
    c.coord.discover(&a.endpoint).await.unwrap();
    c.coord.discover(&b.endpoint).await.unwrap();

    assert_eq!(b.coord.backing_up(&a.id()), vec!["shop".to_string()]);
    assert!(c.coord.backing_up(&a.id()).is_empty());
    assert!(!c.is_active("shop"));

    let mut b_notices = b.coord.subscribe();
    net.unplug(&a.endpoint);
    b.report_unreachable(&a).await;
    c.report_unreachable(&a).await;

    eventually("b promoted", || b.is_active("shop")).await;
    assert_eq!(
        b_notices.recv().await.unwrap(),
        provmon_peer::ManagementNotice::Promoted("shop".into())
    );
    assert!(b.coord.manager("shop").unwrap().is_managing());
    assert!(b.coord.backing_up(&a.id()).is_empty());

    // c stays a backup and follows the new primary.
    eventually("c follows b", || {
        c.coord.manager("shop").and_then(|m| m.primary()) == Some(b.id())
    })
    .await;
    assert!(!c.is_active("shop"));

    // Events from the new primary reach c.
    let db = ServiceElement::new("shop", "db", ProvisionType::Fixed, 1);
    b.coord.add_element("shop", db).unwrap();
    eventually("element mirrored to c", || {
        c.coord
            .deployment("shop")
            .is_some_and(|r| r.element("db").is_some())
    })
    .await;

    // Nobody still tracks the dead monitor.
    assert!(b.coord.peers().iter().all(|p| p.id != a.id()));
    assert!(c.coord.peers().iter().all(|p| p.id != a.id()));
    assert!(!b.watching(&a.id()));
}

#[tokio::test]
async fn failed_call_needs_probe_confirmation() {
    let net = Arc::new(Network::default());
    let a = node(&net, "mon-a", "10.0.0.1");
    let b = node(&net, "mon-b", "10.0.0.2");
    a.coord.discover(&b.endpoint).await.unwrap();

    let err = PeerError::Unreachable {
        peer: b.id(),
        reason: "connection reset".into(),
    };
    a.coord.call_failed(&b.id(), err).await;
    assert_eq!(a.coord.peers().len(), 1, "probe still reaches b");

    net.unplug(&b.endpoint);
    let err = PeerError::Unreachable {
        peer: b.id(),
        reason: "connection reset".into(),
    };
    a.coord.call_failed(&b.id(), err).await;
    assert!(a.coord.peers().is_empty());
    assert!(a.coord.backups().is_empty());
}

// ── Conflicts ───────────────────────────────────────────────────

async fn competing_deployments(net: &Arc<Network>) -> (Node, Node) {
    let early = node(net, "mon-early", "10.0.0.1");
    let late = node(net, "mon-late", "10.0.0.2");
    early.coord.deploy(shop()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    late.coord.deploy(shop()).unwrap();
    assert!(early.is_active("shop") && late.is_active("shop"));
    (early, late)
}

#[tokio::test]
async fn earlier_deployment_wins_when_it_discovers() {
    let net = Arc::new(Network::default());
    let (early, late) = competing_deployments(&net).await;

    early.coord.discover(&late.endpoint).await.unwrap();

    assert!(early.is_active("shop"));
    assert!(!late.is_active("shop"));
    assert_eq!(late.coord.manager("shop").unwrap().primary(), Some(early.id()));
    assert_eq!(late.coord.backing_up(&early.id()), vec!["shop".to_string()]);
}

#[tokio::test]
async fn earlier_deployment_wins_when_it_is_discovered() {
    let net = Arc::new(Network::default());
    let (early, late) = competing_deployments(&net).await;
    let mut late_notices = late.coord.subscribe();

    late.coord.discover(&early.endpoint).await.unwrap();

    assert!(early.is_active("shop"));
    assert!(!late.is_active("shop"));
    assert!(!late.coord.manager("shop").unwrap().is_managing());
    assert_eq!(
        late_notices.recv().await.unwrap(),
        provmon_peer::ManagementNotice::Demoted("shop".into())
    );
}

// ── Event mirroring ─────────────────────────────────────────────

#[tokio::test]
async fn backups_mirror_every_change() {
    let net = Arc::new(Network::default());
    let a = node(&net, "mon-a", "10.0.0.1");
    let b = node(&net, "mon-b", "10.0.0.2");
    b.coord.discover(&a.endpoint).await.unwrap();

    // Deployed after discovery: arrives as an event.
    a.coord.deploy(shop()).unwrap();
    eventually("deployment mirrored", || b.coord.deployment("shop").is_some()).await;
    assert_eq!(b.coord.backing_up(&a.id()), vec!["shop".to_string()]);

    let mut web = ServiceElement::new("shop", "web", ProvisionType::Dynamic, 4);
    a.coord.update_element("shop", web.clone()).unwrap();
    a.coord
        .add_element("shop", ServiceElement::new("shop", "cache", ProvisionType::Dynamic, 1))
        .unwrap();
    a.coord.remove_element("shop", "cache").unwrap();
    a.coord
        .record_instance(InstanceRecord {
            id: "web-1".into(),
            deployment: "shop".into(),
            element: "web".into(),
            resource_id: "node-1".into(),
            host: "10.1.0.1".into(),
            status: InstanceStatus::Running,
            updated_at: 0,
        })
        .unwrap();

    eventually("instance mirrored", || {
        b.coord
            .deployment("shop")
            .is_some_and(|r| r.instances.len() == 1)
    })
    .await;
    let copy = b.coord.deployment("shop").unwrap();
    assert_eq!(copy.element("web").unwrap().planned, 4);
    assert!(copy.element("cache").is_none());
    assert!(!copy.active);

    // Backups never emit: a change forced onto b's copy goes nowhere.
    web.planned = 9;
    assert!(matches!(
        b.coord.update_element("shop", web),
        Err(PeerError::NotActive(_))
    ));

    a.coord
        .request_redeploy("shop", Some(Duration::from_millis(10)))
        .unwrap();
    eventually("redeploy mirrored", || {
        b.coord
            .deployment("shop")
            .is_some_and(|r| r.deployment_dates.len() == 2)
    })
    .await;

    a.coord.undeploy("shop").unwrap();
    eventually("undeploy mirrored", || b.coord.deployment("shop").is_none()).await;
    assert_eq!(b.coord.backup_count(), 0);
}
