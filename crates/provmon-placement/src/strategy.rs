//! Candidate ordering strategies.
//!
//! Every strategy shares the registry's filtering and selection loop and
//! only decides the order candidates are tried in, plus how that order
//! reacts to registrations, renewals and selections. Strategies are called
//! with the registry lock held and must not block.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};

use provmon_core::StrategyKind;
use provmon_state::ResourceId;

use crate::handle::ResourceHandle;

pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_registered(&mut self, handle: &ResourceHandle);

    /// The handle's lease was renewed and its capability may have changed.
    fn on_renewed(&mut self, _handle: &ResourceHandle) {}

    fn on_removed(&mut self, handle: &ResourceHandle);

    /// Candidates in the order they should be tried.
    fn order(&self, handles: &HashMap<ResourceId, ResourceHandle>) -> Vec<ResourceHandle>;

    /// `handle` won a selection.
    fn on_selected(&mut self, _handle: &ResourceHandle) {}
}

/// Build the strategy named in the config file.
pub fn strategy_for(kind: StrategyKind) -> Box<dyn SelectionStrategy> {
    match kind {
        StrategyKind::RoundRobin => Box::new(RoundRobin::default()),
        StrategyKind::LeastLoaded => Box::new(LeastLoaded::default()),
        StrategyKind::CostOrdered => Box::new(CostOrdered::default()),
    }
}

fn resolve(ids: impl Iterator<Item = ResourceId>, handles: &HashMap<ResourceId, ResourceHandle>) -> Vec<ResourceHandle> {
    ids.filter_map(|id| handles.get(&id).cloned()).collect()
}

// ── Round robin ───────────────────────────────────────────────────

/// Selected handles move to the tail so every node takes a turn.
#[derive(Debug, Default)]
pub struct RoundRobin {
    order: VecDeque<ResourceId>,
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn on_registered(&mut self, handle: &ResourceHandle) {
        if !self.order.iter().any(|id| id == handle.id()) {
            self.order.push_back(handle.id().to_string());
        }
    }

    fn on_removed(&mut self, handle: &ResourceHandle) {
        self.order.retain(|id| id != handle.id());
    }

    fn order(&self, handles: &HashMap<ResourceId, ResourceHandle>) -> Vec<ResourceHandle> {
        resolve(self.order.iter().cloned(), handles)
    }

    fn on_selected(&mut self, handle: &ResourceHandle) {
        if let Some(pos) = self.order.iter().position(|id| id == handle.id()) {
            if let Some(id) = self.order.remove(pos) {
                self.order.push_back(id);
            }
        }
    }
}

// ── Least loaded ──────────────────────────────────────────────────

/// Handles grouped per host; hosts are sampled evenly, then the lightest
/// node wins.
#[derive(Debug, Default)]
pub struct LeastLoaded {
    /// (host, handle ids) in registration order.
    buckets: Vec<(String, Vec<ResourceId>)>,
}

impl LeastLoaded {
    fn interleaved(&self) -> Vec<ResourceId> {
        let depth = self.buckets.iter().map(|(_, ids)| ids.len()).max().unwrap_or(0);
        let mut out = Vec::new();
        for pass in 0..depth {
            for (_, ids) in &self.buckets {
                if let Some(id) = ids.get(pass) {
                    out.push(id.clone());
                }
            }
        }
        out
    }
}

impl SelectionStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn on_registered(&mut self, handle: &ResourceHandle) {
        let id = handle.id().to_string();
        match self.buckets.iter_mut().find(|(host, _)| host == handle.address()) {
            Some((_, ids)) => {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            None => self.buckets.push((handle.address().to_string(), vec![id])),
        }
    }

    fn on_removed(&mut self, handle: &ResourceHandle) {
        for (_, ids) in &mut self.buckets {
            ids.retain(|id| id != handle.id());
        }
        self.buckets.retain(|(_, ids)| !ids.is_empty());
    }

    fn order(&self, handles: &HashMap<ResourceId, ResourceHandle>) -> Vec<ResourceHandle> {
        let mut candidates = resolve(self.interleaved().into_iter(), handles);
        // Stable: equal loads keep the interleaved host order.
        candidates.sort_by_key(|h| h.load());
        candidates
    }
}

// ── Capability cost ───────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CostKey {
    cost: f64,
    load: u32,
    id: ResourceId,
}

impl CostKey {
    fn of(handle: &ResourceHandle) -> Self {
        Self {
            cost: handle.capability().cost(),
            load: handle.load(),
            id: handle.id().to_string(),
        }
    }
}

impl PartialEq for CostKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CostKey {}

impl Ord for CostKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then(self.load.cmp(&other.load))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for CostKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Cheapest capability first; equal cost prefers the less loaded node.
///
/// Keys are captured when a handle is inserted, so renewals re-insert
/// the handle to pick up new utilization figures.
#[derive(Debug, Default)]
pub struct CostOrdered {
    sorted: BTreeSet<CostKey>,
    keys: HashMap<ResourceId, CostKey>,
}

impl CostOrdered {
    fn insert(&mut self, handle: &ResourceHandle) {
        self.remove(handle.id());
        let key = CostKey::of(handle);
        self.sorted.insert(key.clone());
        self.keys.insert(key.id.clone(), key);
    }

    fn remove(&mut self, id: &str) {
        if let Some(old) = self.keys.remove(id) {
            self.sorted.remove(&old);
        }
    }
}

impl SelectionStrategy for CostOrdered {
    fn name(&self) -> &'static str {
        "cost-ordered"
    }

    fn on_registered(&mut self, handle: &ResourceHandle) {
        self.insert(handle);
    }

    fn on_renewed(&mut self, handle: &ResourceHandle) {
        self.insert(handle);
    }

    fn on_removed(&mut self, handle: &ResourceHandle) {
        self.remove(handle.id());
    }

    fn order(&self, handles: &HashMap<ResourceId, ResourceHandle>) -> Vec<ResourceHandle> {
        resolve(self.sorted.iter().map(|k| k.id.clone()), handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provmon_state::{Capability, InstantiatorResource, ProvisionType, ServiceElement};

    fn handle(id: &str, host: &str) -> ResourceHandle {
        ResourceHandle::new(InstantiatorResource::new(id, host, 10))
    }

    fn loaded(id: &str, host: &str, running: u32) -> ResourceHandle {
        let mut res = InstantiatorResource::new(id, host, 10);
        if running > 0 {
            res.running.insert("app/other".to_string(), running);
        }
        ResourceHandle::new(res)
    }

    fn with_cost(id: &str, used_memory: u64) -> ResourceHandle {
        let mut res = InstantiatorResource::new(id, "h", 10);
        res.capability = Capability {
            capacity_memory_bytes: 100,
            used_memory_bytes: used_memory,
            ..Capability::default()
        };
        ResourceHandle::new(res)
    }

    fn register_all(
        strategy: &mut dyn SelectionStrategy,
        handles: &[ResourceHandle],
    ) -> HashMap<ResourceId, ResourceHandle> {
        let mut map = HashMap::new();
        for h in handles {
            strategy.on_registered(h);
            map.insert(h.id().to_string(), h.clone());
        }
        map
    }

    fn ids(handles: &[ResourceHandle]) -> Vec<&str> {
        handles.iter().map(|h| h.id()).collect()
    }

    #[test]
    fn round_robin_moves_selected_to_tail() {
        let mut rr = RoundRobin::default();
        let map = register_all(&mut rr, &[handle("a", "h1"), handle("b", "h2"), handle("c", "h3")]);

        assert_eq!(ids(&rr.order(&map)), vec!["a", "b", "c"]);
        rr.on_selected(&map["a"]);
        assert_eq!(ids(&rr.order(&map)), vec!["b", "c", "a"]);
        rr.on_selected(&map["c"]);
        assert_eq!(ids(&rr.order(&map)), vec!["b", "a", "c"]);
    }

    #[test]
    fn round_robin_renewal_keeps_position() {
        let mut rr = RoundRobin::default();
        let map = register_all(&mut rr, &[handle("a", "h1"), handle("b", "h2")]);
        rr.on_renewed(&map["a"]);
        rr.on_registered(&map["a"]);
        assert_eq!(ids(&rr.order(&map)), vec!["a", "b"]);
    }

    #[test]
    fn least_loaded_interleaves_hosts() {
        let mut ll = LeastLoaded::default();
        let map = register_all(
            &mut ll,
            &[
                handle("a1", "host-a"),
                handle("a2", "host-a"),
                handle("a3", "host-a"),
                handle("b1", "host-b"),
            ],
        );
        // All idle: order is one pick per host per pass.
        assert_eq!(ids(&ll.order(&map)), vec!["a1", "b1", "a2", "a3"]);
    }

    #[test]
    fn least_loaded_sorts_by_running_count() {
        let mut ll = LeastLoaded::default();
        let map = register_all(
            &mut ll,
            &[loaded("n5", "h1", 5), loaded("n2", "h2", 2), loaded("n0", "h3", 0)],
        );
        assert_eq!(ids(&ll.order(&map)), vec!["n0", "n2", "n5"]);
    }

    #[test]
    fn least_loaded_counts_reservations() {
        let mut ll = LeastLoaded::default();
        let map = register_all(&mut ll, &[handle("a", "h1"), handle("b", "h2")]);
        map["a"].reserve(&ServiceElement::new("app", "web", ProvisionType::Dynamic, 3));
        assert_eq!(ids(&ll.order(&map)), vec!["b", "a"]);
    }

    #[test]
    fn least_loaded_drops_empty_buckets() {
        let mut ll = LeastLoaded::default();
        let map = register_all(&mut ll, &[handle("a", "h1"), handle("b", "h2")]);
        ll.on_removed(&map["a"]);
        assert_eq!(ll.buckets.len(), 1);
        assert_eq!(ids(&ll.order(&map)), vec!["b"]);
    }

    #[test]
    fn cost_ordered_prefers_cheapest() {
        let mut co = CostOrdered::default();
        let map = register_all(
            &mut co,
            &[with_cost("busy", 90), with_cost("idle", 10), with_cost("mid", 50)],
        );
        assert_eq!(ids(&co.order(&map)), vec!["idle", "mid", "busy"]);
    }

    #[test]
    fn cost_ordered_renewal_reinserts() {
        let mut co = CostOrdered::default();
        let map = register_all(&mut co, &[with_cost("a", 10), with_cost("b", 50)]);

        let mut update = InstantiatorResource::new("a", "h", 10);
        update.capability = Capability {
            capacity_memory_bytes: 100,
            used_memory_bytes: 95,
            ..Capability::default()
        };
        map["a"].refresh(update);

        // Without a renewal notice the stale key still wins.
        assert_eq!(ids(&co.order(&map)), vec!["a", "b"]);
        co.on_renewed(&map["a"]);
        assert_eq!(ids(&co.order(&map)), vec!["b", "a"]);
        assert_eq!(co.sorted.len(), 2);
    }

    #[test]
    fn cost_ties_break_toward_less_loaded() {
        let mut co = CostOrdered::default();
        let map = register_all(&mut co, &[loaded("z-busy", "h1", 3), loaded("a-idle", "h2", 0)]);
        assert_eq!(ids(&co.order(&map)), vec!["a-idle", "z-busy"]);

        let mut co = CostOrdered::default();
        let map = register_all(&mut co, &[loaded("a-busy", "h1", 3), loaded("z-idle", "h2", 0)]);
        assert_eq!(ids(&co.order(&map)), vec!["z-idle", "a-busy"]);
    }

    #[test]
    fn strategy_for_maps_config() {
        assert_eq!(strategy_for(StrategyKind::RoundRobin).name(), "round-robin");
        assert_eq!(strategy_for(StrategyKind::LeastLoaded).name(), "least-loaded");
        assert_eq!(strategy_for(StrategyKind::CostOrdered).name(), "cost-ordered");
    }
}
