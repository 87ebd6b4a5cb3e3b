//! DeploymentManager: this monitor's copy of one managed deployment.
//!
//! Holds the desired-state tree plus the ACTIVE/BACKUP flag and writes
//! every change through to the state store. The manager itself never talks
//! to peers; the coordinator decides what to emit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use provmon_state::{
    DeploymentRecord, InstanceRecord, InstanceStatus, PeerId, ServiceElement, StateStore,
};

use crate::event::{ManagementNotice, epoch_millis};

pub struct DeploymentManager {
    name: String,
    record: Mutex<DeploymentRecord>,
    /// Under lifecycle management here. Cleared before undeploy.
    managing: AtomicBool,
    /// Peer currently managing the deployment when this copy is a backup.
    primary: Mutex<Option<PeerId>>,
    redeploy: Mutex<Option<JoinHandle<()>>>,
    store: Option<StateStore>,
    notices: Option<broadcast::Sender<ManagementNotice>>,
}

impl DeploymentManager {
    pub fn new(
        record: DeploymentRecord,
        store: Option<StateStore>,
        notices: Option<broadcast::Sender<ManagementNotice>>,
    ) -> Self {
        Self {
            name: record.name.clone(),
            record: Mutex::new(record),
            managing: AtomicBool::new(false),
            primary: Mutex::new(None),
            redeploy: Mutex::new(None),
            store,
            notices,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeploymentRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy of the current record.
    pub fn record(&self) -> DeploymentRecord {
        self.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn set_active(&self, active: bool) {
        let mut record = self.lock();
        if record.active == active {
            return;
        }
        record.active = active;
        self.persist(&mut record);
        info!(deployment = %self.name, active, "primacy changed");
    }

    pub fn deployment_dates(&self) -> Vec<u64> {
        self.lock().deployment_dates.clone()
    }

    /// Stamp a (re)deployment.
    pub fn record_deployment(&self, at: u64) {
        let mut record = self.lock();
        record.deployment_dates.push(at);
        self.persist(&mut record);
    }

    pub fn is_managing(&self) -> bool {
        self.managing.load(Ordering::SeqCst)
    }

    /// Turning management off cancels any scheduled redeploy.
    pub fn set_managing(&self, managing: bool) {
        self.managing.store(managing, Ordering::SeqCst);
        if !managing {
            self.cancel_redeploy();
        }
    }

    pub fn primary(&self) -> Option<PeerId> {
        self.primary.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_primary(&self, peer: Option<PeerId>) {
        *self.primary.lock().unwrap_or_else(PoisonError::into_inner) = peer;
    }

    // ── Desired-state mutations ───────────────────────────────────

    /// Add an element, or replace it if one with the same name exists.
    pub fn add_element(&self, element: ServiceElement) {
        let mut record = self.lock();
        match record.elements.iter_mut().find(|e| e.name == element.name) {
            Some(existing) => *existing = element,
            None => record.elements.push(element),
        }
        self.persist(&mut record);
    }

    /// Returns false if no such element exists.
    pub fn remove_element(&self, name: &str) -> bool {
        let mut record = self.lock();
        let before = record.elements.len();
        record.elements.retain(|e| e.name != name);
        let removed = record.elements.len() != before;
        if removed {
            record.instances.retain(|i| i.element != name);
            self.persist(&mut record);
        }
        removed
    }

    /// Returns false if no such element exists.
    pub fn update_element(&self, element: ServiceElement) -> bool {
        let mut record = self.lock();
        let Some(existing) = record.elements.iter_mut().find(|e| e.name == element.name) else {
            return false;
        };
        *existing = element;
        self.persist(&mut record);
        true
    }

    /// Replace the desired-state tree, keeping the local primacy flag.
    pub fn replace(&self, incoming: DeploymentRecord) {
        let mut record = self.lock();
        let active = record.active;
        *record = DeploymentRecord { active, ..incoming };
        self.persist(&mut record);
    }

    /// Install or update one instance record. Returns true if it was new.
    pub fn apply_instance(&self, instance: InstanceRecord) -> bool {
        let mut record = self.lock();
        let new = match record.instances.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => {
                *existing = instance;
                false
            }
            None => {
                record.instances.push(instance);
                true
            }
        };
        self.persist(&mut record);
        new
    }

    // ── Redeploy ──────────────────────────────────────────────────

    /// Run a redeploy after `delay`, replacing any earlier schedule.
    pub fn schedule_redeploy(self: &Arc<Self>, delay: Duration) {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.redeploy_now();
        });
        let mut slot = self.redeploy.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
        debug!(deployment = %self.name, ?delay, "redeploy scheduled");
    }

    pub fn redeploy_pending(&self) -> bool {
        self.redeploy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn cancel_redeploy(&self) {
        if let Some(task) = self.redeploy.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
            debug!(deployment = %self.name, "scheduled redeploy cancelled");
        }
    }

    /// Stop every live instance and stamp a new deployment date.
    pub fn redeploy_now(&self) {
        let active = {
            let mut record = self.lock();
            let now = epoch_millis();
            for instance in &mut record.instances {
                if matches!(instance.status, InstanceStatus::Reserved | InstanceStatus::Running) {
                    instance.status = InstanceStatus::Stopped;
                    instance.updated_at = now;
                }
            }
            record.deployment_dates.push(now);
            self.persist(&mut record);
            record.active
        };
        info!(deployment = %self.name, active, "redeployed");
        if active {
            if let Some(notices) = &self.notices {
                let _ = notices.send(ManagementNotice::Redeployed(self.name.clone()));
            }
        }
    }

    /// Write the current record to the store.
    pub fn save(&self) {
        let mut record = self.lock();
        self.persist(&mut record);
    }

    fn persist(&self, record: &mut DeploymentRecord) {
        record.updated_at = epoch_millis();
        if let Some(store) = &self.store {
            if let Err(e) = store.put_deployment(record) {
                warn!(deployment = %self.name, error = %e, "failed to persist deployment record");
            }
        }
    }

    /// Remove the persisted record.
    pub fn forget(&self) {
        self.cancel_redeploy();
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_deployment(&self.name) {
                warn!(deployment = %self.name, error = %e, "failed to delete deployment record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provmon_state::ProvisionType;

    fn record() -> DeploymentRecord {
        DeploymentRecord::new(
            "shop",
            vec![ServiceElement::new("shop", "web", ProvisionType::Dynamic, 2)],
        )
    }

    fn instance(id: &str, status: InstanceStatus) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            deployment: "shop".to_string(),
            element: "web".to_string(),
            resource_id: "n1".to_string(),
            host: "10.0.0.1".to_string(),
            status,
            updated_at: 0,
        }
    }

    #[test]
    fn writes_through_to_store() {
        let store = StateStore::open_in_memory().unwrap();
        let manager = DeploymentManager::new(record(), Some(store.clone()), None);

        manager.set_active(true);
        manager.add_element(ServiceElement::new("shop", "db", ProvisionType::Fixed, 1));

        let stored = store.get_deployment("shop").unwrap().unwrap();
        assert!(stored.active);
        assert_eq!(stored.elements.len(), 2);

        manager.forget();
        assert!(store.get_deployment("shop").unwrap().is_none());
    }

    #[test]
    fn element_mutations() {
        let manager = DeploymentManager::new(record(), None, None);
        let mut web = ServiceElement::new("shop", "web", ProvisionType::Dynamic, 5);
        assert!(manager.update_element(web.clone()));
        assert_eq!(manager.record().elements[0].planned, 5);

        web.name = "missing".to_string();
        assert!(!manager.update_element(web));

        manager.apply_instance(instance("i1", InstanceStatus::Running));
        assert!(manager.remove_element("web"));
        assert!(!manager.remove_element("web"));
        assert!(manager.record().instances.is_empty());
    }

    #[test]
    fn replace_keeps_local_primacy() {
        let manager = DeploymentManager::new(record(), None, None);
        let mut incoming = record();
        incoming.active = true;
        incoming.elements.clear();
        manager.replace(incoming);
        assert!(!manager.is_active());
        assert!(manager.record().elements.is_empty());
    }

    #[test]
    fn apply_instance_installs_then_updates() {
        let manager = DeploymentManager::new(record(), None, None);
        assert!(manager.apply_instance(instance("i1", InstanceStatus::Reserved)));
        assert!(!manager.apply_instance(instance("i1", InstanceStatus::Running)));
        let rec = manager.record();
        assert_eq!(rec.instances.len(), 1);
        assert_eq!(rec.instances[0].status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn redeploy_runs_after_delay() {
        let (tx, mut rx) = broadcast::channel(4);
        let manager = Arc::new(DeploymentManager::new(record(), None, Some(tx)));
        manager.set_active(true);
        manager.apply_instance(instance("i1", InstanceStatus::Running));

        manager.schedule_redeploy(Duration::from_millis(10));
        assert!(manager.redeploy_pending());

        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice, ManagementNotice::Redeployed("shop".into()));
        let rec = manager.record();
        assert_eq!(rec.instances[0].status, InstanceStatus::Stopped);
        assert_eq!(rec.deployment_dates.len(), 1);
    }

    #[tokio::test]
    async fn unmanaging_cancels_redeploy() {
        let manager = Arc::new(DeploymentManager::new(record(), None, None));
        manager.schedule_redeploy(Duration::from_secs(60));
        assert!(manager.redeploy_pending());

        manager.set_managing(false);
        assert!(!manager.redeploy_pending());
        assert!(manager.deployment_dates().is_empty());
    }
}
