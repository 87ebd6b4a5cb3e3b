//! PeerCoordinator: replication of managed deployments across monitors.
//!
//! Every deployment is ACTIVE on exactly one monitor and BACKUP on the
//! others that know about it. The ACTIVE side emits events; backups apply
//! them and take over when the fault probe reports their primary gone.
//!
//! Locks are plain mutexes, never held across an await, and when more than
//! one is needed they are taken in field order: `peers`, `backups`,
//! `backup_table`, `deployments`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use provmon_core::{MonitorConfig, ProtocolVersion};
use provmon_health::{FaultProbe, Unreachable};
use provmon_state::{DeploymentRecord, InstanceRecord, PeerId, PeerInfo, ServiceElement, StateStore};

use crate::conflict::{Claim, Resolution, resolve};
use crate::dispatch::{DeliveryFailure, EventDispatcher};
use crate::error::{PeerError, PeerResult};
use crate::event::{DeploymentEvent, EventKind, ManagementNotice, epoch_millis};
use crate::manager::DeploymentManager;
use crate::rpc::{PeerConnector, PeerRpc};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct PeerSettings {
    /// Peers with a lower protocol major are refused.
    pub min_protocol_major: u64,
    pub event_queue_depth: usize,
    /// Used when a redeploy is requested without a delay.
    pub redeploy_delay: Duration,
}

impl PeerSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            min_protocol_major: config.peers.min_protocol_major,
            event_queue_depth: config.peers.event_queue_depth,
            redeploy_delay: config.redeploy_delay(),
        }
    }
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            min_protocol_major: 1,
            event_queue_depth: 256,
            redeploy_delay: Duration::from_secs(30),
        }
    }
}

struct KnownPeer {
    info: PeerInfo,
    rpc: Arc<dyn PeerRpc>,
}

pub struct PeerCoordinator {
    me: Mutex<PeerInfo>,
    settings: PeerSettings,
    peers: Mutex<BTreeMap<PeerId, KnownPeer>>,
    /// Peers backing up deployments this monitor manages, preferred first.
    backups: Mutex<Vec<PeerId>>,
    /// Deployments this monitor backs up, keyed by their primary.
    backup_table: Mutex<HashMap<PeerId, BTreeSet<String>>>,
    deployments: Mutex<BTreeMap<String, Arc<DeploymentManager>>>,
    connector: Arc<dyn PeerConnector>,
    probe: Arc<dyn FaultProbe>,
    dispatcher: EventDispatcher,
    failures: Mutex<Option<mpsc::UnboundedReceiver<DeliveryFailure>>>,
    store: Option<StateStore>,
    notices: broadcast::Sender<ManagementNotice>,
}

/// Milliseconds for the wire, saturating at `u64::MAX`.
fn delay_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PeerCoordinator {
    pub fn new(
        me: PeerInfo,
        settings: PeerSettings,
        connector: Arc<dyn PeerConnector>,
        probe: Arc<dyn FaultProbe>,
        store: Option<StateStore>,
    ) -> Self {
        let (dispatcher, failures) = EventDispatcher::new(settings.event_queue_depth);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            me: Mutex::new(me),
            settings,
            peers: Mutex::new(BTreeMap::new()),
            backups: Mutex::new(Vec::new()),
            backup_table: Mutex::new(HashMap::new()),
            deployments: Mutex::new(BTreeMap::new()),
            connector,
            probe,
            dispatcher,
            failures: Mutex::new(Some(failures)),
            store,
            notices,
        }
    }

    /// Spawn the tasks that react to probe notices and failed deliveries.
    pub fn start(self: &Arc<Self>, mut unreachable: mpsc::Receiver<Unreachable>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(notice) = unreachable.recv().await {
                this.peer_unreachable(&notice.id).await;
            }
        }));

        if let Some(mut failures) = locked(&self.failures).take() {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(failure) = failures.recv().await {
                    this.call_failed(&failure.peer, failure.error).await;
                }
            }));
        }
        tasks
    }

    /// Periodically discover seeds that are not known peers yet.
    pub fn spawn_rediscovery(self: &Arc<Self>, seeds: Vec<String>, every: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let found = this.rediscover(&seeds).await;
                if found > 0 {
                    info!(found, "rediscovery found new peers");
                }
            }
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagementNotice> {
        self.notices.subscribe()
    }

    fn notify_local(&self, notice: ManagementNotice) {
        let _ = self.notices.send(notice);
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn info(&self) -> PeerInfo {
        locked(&self.me).clone()
    }

    pub fn id(&self) -> PeerId {
        locked(&self.me).id.clone()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        locked(&self.peers).values().map(|p| p.info.clone()).collect()
    }

    pub fn backups(&self) -> Vec<PeerId> {
        locked(&self.backups).clone()
    }

    /// Number of deployments this monitor backs up for others.
    pub fn backup_count(&self) -> u32 {
        locked(&self.backup_table).values().map(|s| s.len() as u32).sum()
    }

    /// Deployments backed up on behalf of `primary`.
    pub fn backing_up(&self, primary: &str) -> Vec<String> {
        locked(&self.backup_table)
            .get(primary)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn manager(&self, name: &str) -> Option<Arc<DeploymentManager>> {
        locked(&self.deployments).get(name).cloned()
    }

    pub fn deployments(&self) -> Vec<DeploymentRecord> {
        locked(&self.deployments).values().map(|m| m.record()).collect()
    }

    pub fn deployment(&self, name: &str) -> Option<DeploymentRecord> {
        self.manager(name).map(|m| m.record())
    }

    fn peer(&self, id: &str) -> Option<(PeerInfo, Arc<dyn PeerRpc>)> {
        locked(&self.peers)
            .get(id)
            .map(|p| (p.info.clone(), Arc::clone(&p.rpc)))
    }

    // ── Startup ───────────────────────────────────────────────────

    /// Load persisted records. Nothing is managed until
    /// [`resume_managing`](Self::resume_managing) runs.
    pub fn restore(&self) -> PeerResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let records = store.list_deployments()?;
        let count = records.len();
        let mut deployments = locked(&self.deployments);
        for record in records {
            debug!(deployment = %record.name, active = record.active, "restored deployment record");
            let name = record.name.clone();
            let manager = DeploymentManager::new(record, self.store.clone(), Some(self.notices.clone()));
            deployments.insert(name, Arc::new(manager));
        }
        info!(count, "deployment records restored");
        Ok(count)
    }

    /// Start managing every deployment still ACTIVE after the first round
    /// of discovery settled any conflicts.
    pub fn resume_managing(&self) -> usize {
        let resumed: Vec<Arc<DeploymentManager>> = locked(&self.deployments)
            .values()
            .filter(|m| m.is_active() && !m.is_managing())
            .cloned()
            .collect();
        for manager in &resumed {
            manager.set_managing(true);
            info!(deployment = %manager.name(), "resumed management");
            self.notify_local(ManagementNotice::Promoted(manager.name().to_string()));
        }
        resumed.len()
    }

    // ── Discovery ─────────────────────────────────────────────────

    /// Connect to `endpoint`, register the peer and import what it manages.
    ///
    /// Returns `None` if the endpoint turned out to be this monitor.
    pub async fn discover(&self, endpoint: &str) -> PeerResult<Option<PeerInfo>> {
        let rpc = self.connector.connect(endpoint).await?;
        let info = rpc.peer_info().await?;
        if info.id == self.id() {
            debug!(%endpoint, "discovered ourselves, skipping");
            return Ok(None);
        }

        let supported = ProtocolVersion::parse(&info.protocol_version)
            .map(|v| v.is_supported(self.settings.min_protocol_major))
            .unwrap_or(false);
        if !supported {
            warn!(peer = %info.id, version = %info.protocol_version, "refusing incompatible peer");
            return Err(PeerError::IncompatibleVersion {
                peer: info.id,
                version: info.protocol_version,
            });
        }

        let is_new = {
            let mut peers = locked(&self.peers);
            match peers.get_mut(&info.id) {
                Some(known) => {
                    known.info = info.clone();
                    false
                }
                None => {
                    peers.insert(
                        info.id.clone(),
                        KnownPeer {
                            info: info.clone(),
                            rpc: Arc::clone(&rpc),
                        },
                    );
                    true
                }
            }
        };

        if is_new {
            self.dispatcher.add_peer(&info.id, Arc::clone(&rpc));
            self.probe.start_monitoring(&info.id, &info.endpoint).await;
            info!(peer = %info.id, endpoint = %info.endpoint, version = %info.protocol_version, "peer discovered");
            // Introduce ourselves so the peer discovers us in turn.
            if let Err(e) = rpc.update_peer_info(self.info()).await {
                self.call_failed(&info.id, e).await;
            }
        }

        match rpc.deployments().await {
            Ok(records) => {
                for record in records.into_iter().filter(|r| r.active) {
                    self.import(&info, &rpc, record).await;
                }
            }
            Err(e) => self.call_failed(&info.id, e).await,
        }

        if is_new {
            self.consider_backup(&info, &rpc).await;
        }
        Ok(Some(info))
    }

    /// Discover every seed not already known. Returns how many peers were
    /// added.
    pub async fn rediscover(&self, seeds: &[String]) -> usize {
        let known: BTreeSet<String> = {
            let peers = locked(&self.peers);
            peers.values().map(|p| p.info.endpoint.clone()).collect()
        };
        let own = self.info().endpoint;

        let mut found = 0;
        for seed in seeds.iter().filter(|s| **s != own && !known.contains(*s)) {
            match self.discover(seed).await {
                Ok(Some(_)) => found += 1,
                Ok(None) => {}
                Err(e) => debug!(%seed, error = %e, "seed not reachable"),
            }
        }
        found
    }

    /// Make `candidate` our backup if we have none, or if ours shares our
    /// host and the candidate does not.
    async fn consider_backup(&self, candidate: &PeerInfo, rpc: &Arc<dyn PeerRpc>) {
        let current = {
            let peers = locked(&self.peers);
            let backups = locked(&self.backups);
            backups.first().and_then(|id| peers.get(id)).map(|p| p.info.clone())
        };
        let me = self.info();
        let replace = match &current {
            None => true,
            Some(cur) => cur.id != candidate.id && cur.same_host(&me) && !candidate.same_host(&me),
        };
        if !replace {
            return;
        }

        if let Err(e) = rpc.assign_backup_for(me.clone()).await {
            self.call_failed(&candidate.id, e).await;
            return;
        }
        {
            let mut backups = locked(&self.backups);
            backups.retain(|id| *id != candidate.id && current.as_ref().is_none_or(|c| *id != c.id));
            backups.insert(0, candidate.id.clone());
        }
        info!(backup = %candidate.id, host = %candidate.host, "backup assigned");

        if let Some(old) = current {
            if let Some((_, old_rpc)) = self.peer(&old.id) {
                debug!(peer = %old.id, "releasing previous backup");
                if let Err(e) = old_rpc.remove_backup_for(me).await {
                    self.call_failed(&old.id, e).await;
                }
            }
        }
    }

    /// Take in a record reported by `from`.
    async fn import(&self, from: &PeerInfo, rpc: &Arc<dyn PeerRpc>, record: DeploymentRecord) {
        let name = record.name.clone();
        let Some(local) = self.manager(&name) else {
            if !record.active {
                return;
            }
            let manager = Arc::new(DeploymentManager::new(
                DeploymentRecord {
                    active: false,
                    ..record
                },
                self.store.clone(),
                Some(self.notices.clone()),
            ));
            manager.set_primary(Some(from.id.clone()));
            manager.save();
            locked(&self.deployments).insert(name.clone(), manager);
            debug!(deployment = %name, primary = %from.id, "imported deployment as backup");
            self.track(&name, &from.id);
            return;
        };

        if !local.is_active() {
            if record.active {
                local.replace(record);
                local.set_primary(Some(from.id.clone()));
                self.track(&name, &from.id);
            }
            return;
        }

        let me = self.info();
        let local_dates = local.deployment_dates();
        let verdict = resolve(
            Claim {
                peer: &me,
                dates: &local_dates,
                active: true,
            },
            Claim {
                peer: from,
                dates: &record.deployment_dates,
                active: record.active,
            },
        );
        match verdict {
            Resolution::NoConflict => {}
            Resolution::LocalWins => {
                info!(deployment = %name, loser = %from.id, "primacy conflict won");
                match rpc.demote(&name, me).await {
                    Ok(()) => {
                        let mut backups = locked(&self.backups);
                        if !backups.contains(&from.id) {
                            backups.push(from.id.clone());
                        }
                    }
                    Err(e) => self.call_failed(&from.id, e).await,
                }
            }
            Resolution::RemoteWins => {
                info!(deployment = %name, winner = %from.id, "primacy conflict lost");
                self.demote_local(&name, from);
                local.replace(record);
            }
        }
    }

    /// Point a BACKUP deployment at its new primary. Recorded in the
    /// backup table only if we back that primary up.
    fn track(&self, name: &str, primary: &str) {
        let changed = {
            let mut table = locked(&self.backup_table);
            let mut changed = false;
            for (owner, set) in table.iter_mut() {
                if owner != primary {
                    changed |= set.remove(name);
                }
            }
            if let Some(set) = table.get_mut(primary) {
                changed |= set.insert(name.to_string());
            }
            changed
        };
        if changed {
            self.broadcast_backup_count();
        }
    }

    /// Give up primacy of `name` to `winner` and back it up for them.
    fn demote_local(&self, name: &str, winner: &PeerInfo) -> bool {
        let Some(manager) = self.manager(name) else {
            return false;
        };
        manager.set_managing(false);
        manager.set_active(false);
        manager.set_primary(Some(winner.id.clone()));
        {
            let mut table = locked(&self.backup_table);
            for set in table.values_mut() {
                set.remove(name);
            }
            table.entry(winner.id.clone()).or_default().insert(name.to_string());
        }
        info!(deployment = %name, primary = %winner.id, "demoted to backup");
        self.broadcast_backup_count();
        self.notify_local(ManagementNotice::Demoted(name.to_string()));
        true
    }

    // ── Failure handling ──────────────────────────────────────────

    /// A remote call failed. Fail over only if the probe agrees the peer
    /// is gone.
    pub async fn call_failed(&self, peer: &str, error: PeerError) {
        warn!(peer = %peer, error = %error, "peer call failed");
        if !error.is_communication() {
            return;
        }
        if self.probe.confirm_unreachable(peer).await {
            self.peer_unreachable(peer).await;
        } else {
            debug!(peer = %peer, "probe still reaches peer, no failover");
        }
    }

    /// Drop a dead peer, replace it as backup and take over what it
    /// managed for us.
    pub async fn peer_unreachable(&self, id: &str) {
        let Some(gone) = locked(&self.peers).remove(id) else {
            return;
        };
        self.dispatcher.remove_peer(id);
        self.probe.stop_monitoring(id).await;
        warn!(peer = %id, host = %gone.info.host, "peer unreachable, removed");

        let lost_backup = {
            let mut backups = locked(&self.backups);
            let before = backups.len();
            backups.retain(|b| b != id);
            before != backups.len() && backups.is_empty()
        };
        if lost_backup {
            self.replace_backup().await;
        }

        let orphaned = locked(&self.backup_table).remove(id).unwrap_or_default();
        let me = self.info();
        for name in &orphaned {
            let Some(manager) = self.manager(name) else {
                continue;
            };
            manager.set_primary(None);
            manager.set_active(true);
            manager.set_managing(true);
            info!(deployment = %name, failed = %id, "promoted to active");
            self.emit(&manager, EventKind::ManagementChanged { manager: me.clone() });
            self.notify_local(ManagementNotice::Promoted(name.clone()));
        }
        if !orphaned.is_empty() {
            self.broadcast_backup_count();
        }
    }

    /// Pick a new backup by peer order, preferring other hosts.
    async fn replace_backup(&self) {
        let me = self.info();
        let mut candidates: Vec<(PeerInfo, Arc<dyn PeerRpc>)> = locked(&self.peers)
            .values()
            .map(|p| (p.info.clone(), Arc::clone(&p.rpc)))
            .collect();
        // Other hosts first, then peer order within each group.
        candidates.sort_by(|(a, _), (b, _)| {
            a.same_host(&me).cmp(&b.same_host(&me)).then_with(|| a.cmp(b))
        });

        for (info, rpc) in candidates {
            match rpc.assign_backup_for(me.clone()).await {
                Ok(()) => {
                    locked(&self.backups).insert(0, info.id.clone());
                    info!(backup = %info.id, same_host = info.same_host(&me), "replacement backup assigned");
                    return;
                }
                Err(e) => warn!(peer = %info.id, error = %e, "replacement backup refused"),
            }
        }
        warn!("no peer available as backup");
    }

    /// Tell every peer our new backup count, if it changed.
    fn broadcast_backup_count(&self) {
        let count = self.backup_count();
        let info = {
            let mut me = locked(&self.me);
            if me.backup_count == count {
                return;
            }
            me.backup_count = count;
            me.clone()
        };
        debug!(backup_count = count, "backup count changed");
        let targets: Vec<(PeerId, Arc<dyn PeerRpc>)> = locked(&self.peers)
            .iter()
            .map(|(id, p)| (id.clone(), Arc::clone(&p.rpc)))
            .collect();
        for (peer, rpc) in targets {
            let info = info.clone();
            tokio::spawn(async move {
                if let Err(e) = rpc.update_peer_info(info).await {
                    debug!(peer = %peer, error = %e, "peer info update failed");
                }
            });
        }
    }

    // ── Inbound peer calls ────────────────────────────────────────

    async fn handle_assign_backup(&self, primary: PeerInfo) -> PeerResult<()> {
        if self.peer(&primary.id).is_none() {
            self.discover(&primary.endpoint).await?;
        }
        let names: BTreeSet<String> = locked(&self.deployments)
            .values()
            .filter(|m| !m.is_active() && m.primary().as_deref() == Some(primary.id.as_str()))
            .map(|m| m.name().to_string())
            .collect();
        info!(primary = %primary.id, deployments = names.len(), "now backing up peer");
        locked(&self.backup_table).insert(primary.id, names);
        self.broadcast_backup_count();
        Ok(())
    }

    fn handle_remove_backup(&self, primary: &PeerInfo) {
        if locked(&self.backup_table).remove(&primary.id).is_some() {
            info!(primary = %primary.id, "no longer backing up peer");
            self.broadcast_backup_count();
        }
    }

    /// Returns false if the peer is not known.
    fn update_peer(&self, info: PeerInfo) -> bool {
        match locked(&self.peers).get_mut(&info.id) {
            Some(known) => {
                known.info = info;
                true
            }
            None => false,
        }
    }

    /// Apply an event emitted by the primary of a deployment.
    pub async fn apply_event(&self, event: DeploymentEvent) {
        let DeploymentEvent {
            deployment,
            origin,
            kind,
            ..
        } = event;
        debug!(%deployment, %origin, event = kind.label(), "peer event");

        let Some(manager) = self.manager(&deployment) else {
            match kind {
                EventKind::Deployed(record) => {
                    if let Some((info, rpc)) = self.peer(&origin) {
                        self.import(&info, &rpc, DeploymentRecord { active: true, ..record })
                            .await;
                    }
                }
                EventKind::Undeployed => {}
                _ => self.fetch_from(&origin, &deployment).await,
            }
            return;
        };

        if manager.is_active() {
            if let EventKind::ManagementChanged { manager: claimant } = kind {
                self.fetch_from(&claimant.id, &deployment).await;
            } else {
                debug!(%deployment, %origin, "ignoring event for deployment we manage");
            }
            return;
        }

        match kind {
            EventKind::ElementAdded(element) => manager.add_element(element),
            EventKind::ElementRemoved { name } => {
                manager.remove_element(&name);
            }
            EventKind::ElementUpdated(element) => {
                if !manager.update_element(element.clone()) {
                    manager.add_element(element);
                }
            }
            EventKind::Deployed(record) | EventKind::Updated(record) => {
                manager.replace(record);
                manager.set_primary(Some(origin.clone()));
                self.track(&deployment, &origin);
            }
            EventKind::Undeployed => self.forget(&deployment),
            EventKind::ManagementChanged { manager: primary } => {
                manager.set_primary(Some(primary.id.clone()));
                self.track(&deployment, &primary.id);
            }
            EventKind::InstanceUpdated(instance) | EventKind::ServiceProvisioned(instance) => {
                manager.apply_instance(instance);
            }
            EventKind::RedeployRequested { delay_ms } => {
                manager.schedule_redeploy(Duration::from_millis(delay_ms));
            }
        }
    }

    async fn fetch_from(&self, peer: &str, name: &str) {
        let Some((info, rpc)) = self.peer(peer) else {
            debug!(%peer, deployment = %name, "event from unknown peer");
            return;
        };
        match rpc.deployment(name).await {
            Ok(Some(record)) => self.import(&info, &rpc, record).await,
            Ok(None) => {}
            Err(e) => self.call_failed(peer, e).await,
        }
    }

    /// Drop a deployment and its persisted record.
    fn forget(&self, name: &str) {
        let Some(manager) = locked(&self.deployments).remove(name) else {
            return;
        };
        manager.set_managing(false);
        manager.forget();
        let changed = {
            let mut table = locked(&self.backup_table);
            table.values_mut().fold(false, |acc, set| set.remove(name) | acc)
        };
        if changed {
            self.broadcast_backup_count();
        }
        info!(deployment = %name, "deployment forgotten");
    }

    // ── Local operations (ACTIVE only) ────────────────────────────

    fn ensure_active(&self, name: &str) -> PeerResult<Arc<DeploymentManager>> {
        let manager = self
            .manager(name)
            .ok_or_else(|| PeerError::UnknownDeployment(name.to_string()))?;
        if !manager.is_active() {
            return Err(PeerError::NotActive(name.to_string()));
        }
        Ok(manager)
    }

    /// Queue an event for every peer, provided this monitor manages the
    /// deployment.
    fn emit(&self, manager: &DeploymentManager, kind: EventKind) {
        if !(manager.is_active() && manager.is_managing()) {
            debug!(deployment = %manager.name(), event = kind.label(), "not managing, event suppressed");
            return;
        }
        self.publish(manager.name(), kind);
    }

    fn publish(&self, name: &str, kind: EventKind) {
        let event = DeploymentEvent::new(name, &self.id(), kind);
        self.dispatcher.broadcast(&event);
    }

    /// Start managing a new deployment here.
    pub fn deploy(&self, record: DeploymentRecord) -> PeerResult<Arc<DeploymentManager>> {
        record.validate()?;
        let name = record.name.clone();
        let manager = {
            let mut deployments = locked(&self.deployments);
            if deployments.contains_key(&name) {
                return Err(PeerError::AlreadyDeployed(name));
            }
            let manager = Arc::new(DeploymentManager::new(
                DeploymentRecord {
                    active: true,
                    ..record
                },
                self.store.clone(),
                Some(self.notices.clone()),
            ));
            deployments.insert(name.clone(), Arc::clone(&manager));
            manager
        };
        manager.set_managing(true);
        manager.record_deployment(epoch_millis());
        info!(deployment = %name, elements = manager.record().elements.len(), "deployed");
        self.emit(&manager, EventKind::Deployed(manager.record()));
        Ok(manager)
    }

    pub fn undeploy(&self, name: &str) -> PeerResult<DeploymentRecord> {
        let manager = self.ensure_active(name)?;
        let record = manager.record();
        manager.set_managing(false);
        self.publish(name, EventKind::Undeployed);
        self.forget(name);
        Ok(record)
    }

    pub fn add_element(&self, name: &str, element: ServiceElement) -> PeerResult<()> {
        let manager = self.ensure_active(name)?;
        element.validate()?;
        if element.deployment != name {
            return Err(PeerError::State(provmon_state::StateError::Invalid(format!(
                "element {} belongs to deployment {}",
                element.key(),
                element.deployment
            ))));
        }
        manager.add_element(element.clone());
        self.emit(&manager, EventKind::ElementAdded(element));
        Ok(())
    }

    /// Returns false if the element did not exist.
    pub fn remove_element(&self, name: &str, element: &str) -> PeerResult<bool> {
        let manager = self.ensure_active(name)?;
        if !manager.remove_element(element) {
            return Ok(false);
        }
        self.emit(
            &manager,
            EventKind::ElementRemoved {
                name: element.to_string(),
            },
        );
        Ok(true)
    }

    /// Returns false if the element did not exist.
    pub fn update_element(&self, name: &str, element: ServiceElement) -> PeerResult<bool> {
        let manager = self.ensure_active(name)?;
        element.validate()?;
        if !manager.update_element(element.clone()) {
            return Ok(false);
        }
        self.emit(&manager, EventKind::ElementUpdated(element));
        Ok(true)
    }

    /// Replace the whole desired-state tree.
    pub fn update_deployment(&self, record: DeploymentRecord) -> PeerResult<()> {
        let manager = self.ensure_active(&record.name)?;
        record.validate()?;
        manager.replace(record);
        self.emit(&manager, EventKind::Updated(manager.record()));
        Ok(())
    }

    /// Record a placed or changed instance.
    pub fn record_instance(&self, instance: InstanceRecord) -> PeerResult<()> {
        let manager = self.ensure_active(&instance.deployment)?;
        let kind = if manager.apply_instance(instance.clone()) {
            EventKind::ServiceProvisioned(instance)
        } else {
            EventKind::InstanceUpdated(instance)
        };
        self.emit(&manager, kind);
        Ok(())
    }

    pub fn request_redeploy(&self, name: &str, delay: Option<Duration>) -> PeerResult<()> {
        let manager = self.ensure_active(name)?;
        let delay = delay.unwrap_or(self.settings.redeploy_delay);
        manager.schedule_redeploy(delay);
        self.emit(
            &manager,
            EventKind::RedeployRequested {
                delay_ms: delay_millis(delay),
            },
        );
        Ok(())
    }

    /// Stop outbound delivery and every probe.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown();
        let ids: Vec<PeerId> = locked(&self.peers).keys().cloned().collect();
        for id in ids {
            self.probe.stop_monitoring(&id).await;
        }
        for manager in locked(&self.deployments).values() {
            manager.cancel_redeploy();
        }
    }
}

#[async_trait]
impl PeerRpc for PeerCoordinator {
    async fn peer_info(&self) -> PeerResult<PeerInfo> {
        Ok(self.info())
    }

    async fn assign_backup_for(&self, primary: PeerInfo) -> PeerResult<()> {
        self.handle_assign_backup(primary).await
    }

    async fn remove_backup_for(&self, primary: PeerInfo) -> PeerResult<()> {
        self.handle_remove_backup(&primary);
        Ok(())
    }

    async fn deployments(&self) -> PeerResult<Vec<DeploymentRecord>> {
        Ok(PeerCoordinator::deployments(self))
    }

    async fn deployment(&self, name: &str) -> PeerResult<Option<DeploymentRecord>> {
        Ok(PeerCoordinator::deployment(self, name))
    }

    async fn demote(&self, name: &str, winner: PeerInfo) -> PeerResult<()> {
        if self.demote_local(name, &winner) {
            Ok(())
        } else {
            Err(PeerError::UnknownDeployment(name.to_string()))
        }
    }

    async fn notify(&self, event: DeploymentEvent) -> PeerResult<()> {
        self.apply_event(event).await;
        Ok(())
    }

    async fn update_peer_info(&self, info: PeerInfo) -> PeerResult<()> {
        if self.update_peer(info.clone()) {
            return Ok(());
        }
        // An unknown monitor introducing itself.
        self.discover(&info.endpoint).await.map(|_| ())
    }

    async fn ping(&self) -> PeerResult<()> {
        Ok(())
    }
}
