//! Domain types shared by the placement and replication layers.
//!
//! All types are serializable to/from JSON: they travel between peers
//! over the RPC surface and are persisted in redb tables.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Opaque identity token of a registered instantiator.
pub type ResourceId = String;

/// Identity token of an orchestrator peer.
pub type PeerId = String;

/// Sentinel for `max_per_machine` meaning "no per-machine cap".
pub const UNLIMITED: i32 = -1;

/// Names travel as URL path segments between monitors, so they are kept to
/// ASCII letters, digits, `-`, `_` and `.`, and may not be only dots.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.chars().all(|c| c == '.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// ── Service element ───────────────────────────────────────────────

/// How instances of an element come into being.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionType {
    /// Started outside the monitor; never placed.
    External,
    /// Placed anywhere in the fleet until `planned` instances exist.
    Dynamic,
    /// `planned` instances on every eligible instantiator.
    Fixed,
}

/// What counts as one "machine" for `max_per_machine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineBoundary {
    /// Each instantiator is its own machine.
    Virtual,
    /// One machine per operating-system instance, i.e. per instantiator.
    OsInstance,
    /// All instantiators sharing a host address are one machine.
    Physical,
}

/// Resources one instance needs from its instantiator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub memory_bytes: u64,
    pub cpu_weight: u32,
    /// Labels the instantiator must carry with exactly these values.
    pub labels: HashMap<String, String>,
}

/// Desired state of one deployable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceElement {
    pub name: String,
    /// Name of the owning deployment.
    pub deployment: String,
    pub provision_type: ProvisionType,
    pub planned: u32,
    pub actual: u32,
    /// Instances allowed per machine, or [`UNLIMITED`].
    pub max_per_machine: i32,
    pub machine_boundary: MachineBoundary,
    /// Fleet-wide cap on concurrent instances.
    pub max_instances: Option<u32>,
    /// Elements that must never share a host with this one. Entries are
    /// either bare element names (same deployment) or `deployment/name`.
    pub isolation: Vec<String>,
    pub requirements: ResourceRequirements,
}

impl ServiceElement {
    pub fn new(
        deployment: &str,
        name: &str,
        provision_type: ProvisionType,
        planned: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            deployment: deployment.to_string(),
            provision_type,
            planned,
            actual: 0,
            max_per_machine: UNLIMITED,
            machine_boundary: MachineBoundary::Virtual,
            max_instances: None,
            isolation: Vec::new(),
            requirements: ResourceRequirements::default(),
        }
    }

    pub fn with_max_per_machine(mut self, max: i32, boundary: MachineBoundary) -> Self {
        self.max_per_machine = max;
        self.machine_boundary = boundary;
        self
    }

    pub fn with_isolation(mut self, others: &[&str]) -> Self {
        self.isolation = others.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_requirements(mut self, requirements: ResourceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_max_instances(mut self, max: u32) -> Self {
        self.max_instances = Some(max);
        self
    }

    /// Fleet-unique key: `{deployment}/{name}`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.deployment, self.name)
    }

    /// The per-machine cap, or `None` when unlimited.
    pub fn machine_cap(&self) -> Option<u32> {
        u32::try_from(self.max_per_machine).ok()
    }

    /// Whether this element declares isolation from the element with `other_key`.
    pub fn isolates(&self, other_key: &str) -> bool {
        self.isolation.iter().any(|target| {
            if target.contains('/') {
                target == other_key
            } else {
                other_key
                    .split_once('/')
                    .is_some_and(|(dep, name)| dep == self.deployment && name == target)
            }
        })
    }

    pub fn validate(&self) -> StateResult<()> {
        if !is_valid_name(&self.name) {
            return Err(StateError::Invalid(format!(
                "element name {:?} may only use letters, digits, '-', '_' and '.'",
                self.name
            )));
        }
        if self.max_per_machine < UNLIMITED {
            return Err(StateError::Invalid(format!(
                "{}: max_per_machine must be >= -1, got {}",
                self.key(),
                self.max_per_machine
            )));
        }
        Ok(())
    }
}

// ── Instantiator ──────────────────────────────────────────────────

/// Capability snapshot reported by an instantiator.
///
/// The natural ordering is by [`Capability::cost`]: a lower cost means a
/// less utilized node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub capacity_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub capacity_cpu_weight: u32,
    pub used_cpu_weight: u32,
    pub labels: HashMap<String, String>,
}

impl Capability {
    pub fn free_memory(&self) -> u64 {
        self.capacity_memory_bytes.saturating_sub(self.used_memory_bytes)
    }

    pub fn free_cpu(&self) -> u32 {
        self.capacity_cpu_weight.saturating_sub(self.used_cpu_weight)
    }

    /// Utilization in `0.0..=1.0`: the higher of memory and CPU usage.
    pub fn cost(&self) -> f64 {
        let mem = ratio(self.used_memory_bytes as f64, self.capacity_memory_bytes as f64);
        let cpu = ratio(f64::from(self.used_cpu_weight), f64::from(self.capacity_cpu_weight));
        mem.max(cpu)
    }

    pub fn cmp_cost(&self, other: &Self) -> Ordering {
        self.cost().total_cmp(&other.cost())
    }
}

fn ratio(used: f64, capacity: f64) -> f64 {
    if capacity > 0.0 {
        (used / capacity).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// One registered compute node, as granted by the lease authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantiatorResource {
    pub id: ResourceId,
    pub name: String,
    /// Host address; instantiators with the same address share a machine.
    pub address: String,
    pub capability: Capability,
    /// Maximum concurrent instances across all elements.
    pub service_limit: u32,
    pub dynamic_enabled: bool,
    /// Element key → confirmed running instances.
    #[serde(default)]
    pub running: BTreeMap<String, u32>,
    /// Element key → reservations not yet confirmed.
    #[serde(default)]
    pub in_process: BTreeMap<String, u32>,
}

impl InstantiatorResource {
    pub fn new(id: &str, address: &str, service_limit: u32) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            address: address.to_string(),
            capability: Capability::default(),
            service_limit,
            dynamic_enabled: true,
            running: BTreeMap::new(),
            in_process: BTreeMap::new(),
        }
    }

    pub fn running_count(&self) -> u32 {
        self.running.values().sum()
    }

    pub fn in_process_count(&self) -> u32 {
        self.in_process.values().sum()
    }
}

// ── Peer ──────────────────────────────────────────────────────────

/// Identity and ordering of one orchestrator peer.
///
/// Peers order by `backup_count` ascending, then by `tiebreaker`, so the
/// least-burdened peer sorts first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
    pub host: String,
    /// `host:port` of the peer's RPC endpoint.
    pub endpoint: String,
    /// Random value drawn once per process lifetime.
    pub tiebreaker: u64,
    /// Deployments this peer currently backs up for others.
    pub backup_count: u32,
    pub protocol_version: String,
}

impl PeerInfo {
    /// Create an identity for this process with a fresh tiebreaker.
    pub fn generate(name: &str, host: &str, endpoint: &str, protocol_version: &str) -> Self {
        let tiebreaker: u64 = rand::random();
        Self {
            id: format!("{name}-{tiebreaker:016x}"),
            name: name.to_string(),
            host: host.to_string(),
            endpoint: endpoint.to_string(),
            tiebreaker,
            backup_count: 0,
            protocol_version: protocol_version.to_string(),
        }
    }

    pub fn same_host(&self, other: &PeerInfo) -> bool {
        self.host == other.host
    }
}

impl Ord for PeerInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.backup_count
            .cmp(&other.backup_count)
            .then(self.tiebreaker.cmp(&other.tiebreaker))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for PeerInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ── Managed deployment ────────────────────────────────────────────

/// Lifecycle status of a placed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Reserved,
    Running,
    Stopped,
    Failed,
}

/// One placed instance of a service element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub deployment: String,
    pub element: String,
    pub resource_id: ResourceId,
    pub host: String,
    pub status: InstanceStatus,
    pub updated_at: u64,
}

/// A managed deployment: the desired-state tree plus primacy flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub name: String,
    pub elements: Vec<ServiceElement>,
    /// `true` when this monitor is the primary for the deployment.
    pub active: bool,
    /// Epoch milliseconds of every (re)deployment, oldest first. Empty
    /// while the deployment is still pending.
    pub deployment_dates: Vec<u64>,
    pub instances: Vec<InstanceRecord>,
    pub updated_at: u64,
}

impl DeploymentRecord {
    pub fn new(name: &str, elements: Vec<ServiceElement>) -> Self {
        Self {
            name: name.to_string(),
            elements,
            active: false,
            deployment_dates: Vec::new(),
            instances: Vec::new(),
            updated_at: 0,
        }
    }

    /// Timestamp of the first deployment, if any.
    pub fn first_deployed(&self) -> Option<u64> {
        self.deployment_dates.iter().copied().min()
    }

    pub fn element(&self, name: &str) -> Option<&ServiceElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Instances of `element` that are reserved or running.
    pub fn live_instances(&self, element: &str) -> usize {
        self.instances
            .iter()
            .filter(|i| {
                i.element == element
                    && matches!(i.status, InstanceStatus::Reserved | InstanceStatus::Running)
            })
            .count()
    }

    pub fn validate(&self) -> StateResult<()> {
        if !is_valid_name(&self.name) {
            return Err(StateError::Invalid(format!(
                "deployment name {:?} may only use letters, digits, '-', '_' and '.'",
                self.name
            )));
        }
        for element in &self.elements {
            if element.deployment != self.name {
                return Err(StateError::Invalid(format!(
                    "element {} belongs to {}, not {}",
                    element.name, element.deployment, self.name
                )));
            }
            element.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, backup_count: u32, tiebreaker: u64) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            name: id.to_string(),
            host: "10.0.0.1".to_string(),
            endpoint: "10.0.0.1:9010".to_string(),
            tiebreaker,
            backup_count,
            protocol_version: "1.0".to_string(),
        }
    }

    #[test]
    fn peers_order_by_backup_count_first() {
        let busy = peer("a", 3, 1);
        let idle = peer("b", 0, 99);
        assert!(idle < busy);
    }

    #[test]
    fn peers_tiebreak_on_random_value() {
        let low = peer("a", 1, 5);
        let high = peer("b", 1, 7);
        let mut peers = vec![high.clone(), low.clone()];
        peers.sort();
        assert_eq!(peers[0].id, "a");
    }

    #[test]
    fn generated_peers_have_distinct_ids() {
        let a = PeerInfo::generate("mon", "h", "h:1", "1.0");
        let b = PeerInfo::generate("mon", "h", "h:1", "1.0");
        assert_ne!(a.id, b.id);
        assert!(a.same_host(&b));
    }

    #[test]
    fn machine_cap_unlimited() {
        let e = ServiceElement::new("app", "web", ProvisionType::Dynamic, 2);
        assert_eq!(e.machine_cap(), None);

        let e = e.with_max_per_machine(2, MachineBoundary::Physical);
        assert_eq!(e.machine_cap(), Some(2));
    }

    #[test]
    fn validate_rejects_bad_machine_cap() {
        let e = ServiceElement::new("app", "web", ProvisionType::Dynamic, 1)
            .with_max_per_machine(-2, MachineBoundary::Virtual);
        assert!(matches!(e.validate(), Err(StateError::Invalid(_))));
    }

    #[test]
    fn names_must_be_path_safe() {
        for good in ["shop", "shop-v2", "web_1", "api.internal"] {
            assert!(is_valid_name(good), "{good}");
        }
        for bad in ["", "my shop", "a?b", "a#b", "a/b", "..", "caf\u{e9}"] {
            assert!(!is_valid_name(bad), "{bad:?}");
            assert!(matches!(
                DeploymentRecord::new(bad, Vec::new()).validate(),
                Err(StateError::Invalid(_))
            ));
        }
        let e = ServiceElement::new("app", "web server", ProvisionType::Dynamic, 1);
        assert!(matches!(e.validate(), Err(StateError::Invalid(_))));
    }

    #[test]
    fn isolation_matches_bare_and_qualified_names() {
        let e = ServiceElement::new("app", "db", ProvisionType::Dynamic, 1)
            .with_isolation(&["cache", "other/db"]);
        assert!(e.isolates("app/cache"));
        assert!(e.isolates("other/db"));
        assert!(!e.isolates("other/cache"));
        assert!(!e.isolates("app/web"));
    }

    #[test]
    fn capability_cost_uses_worst_dimension() {
        let cap = Capability {
            capacity_memory_bytes: 1000,
            used_memory_bytes: 250,
            capacity_cpu_weight: 100,
            used_cpu_weight: 80,
            labels: HashMap::new(),
        };
        assert!((cap.cost() - 0.8).abs() < f64::EPSILON);
        assert_eq!(Capability::default().cost(), 0.0);
    }

    #[test]
    fn first_deployed_is_oldest_date() {
        let mut rec = DeploymentRecord::new("app", Vec::new());
        assert_eq!(rec.first_deployed(), None);
        rec.deployment_dates = vec![300, 100, 200];
        assert_eq!(rec.first_deployed(), Some(100));
    }

    #[test]
    fn record_validation_checks_element_ownership() {
        let rec = DeploymentRecord::new(
            "app",
            vec![ServiceElement::new("other", "web", ProvisionType::Dynamic, 1)],
        );
        assert!(rec.validate().is_err());
    }
}
