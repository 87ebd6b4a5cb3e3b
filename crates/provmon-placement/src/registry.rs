//! ResourceRegistry: the set of leased instantiators and the selection loop.
//!
//! Lease callbacks and strategy re-ordering mutate the registry under one
//! mutex. Selection copies a snapshot under that lock and releases it
//! before filtering or probing, so a slow capability probe never blocks
//! a registration.
//!
//! Concurrent selections are not serialized against each other: two
//! attempts may pick the same node before either reserves it. The next
//! attempt re-validates against the service limit and planned count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use provmon_core::StrategyKind;
use provmon_state::{InstantiatorResource, ProvisionType, ResourceId, ServiceElement};

use crate::error::{PlacementError, PlacementResult};
use crate::filter;
use crate::handle::ResourceHandle;
use crate::lease::LeaseListener;
use crate::matcher::{CapabilityMatcher, MatchError, RequirementsMatcher};
use crate::request::{CandidateFilter, ProvisionRequest};
use crate::strategy::{SelectionStrategy, strategy_for};

const EVENT_CAPACITY: usize = 64;

/// Change in the registered fleet, for anyone holding deferred work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(ResourceId),
    Renewed(ResourceId),
    Removed(ResourceId),
}

struct Inner {
    handles: HashMap<ResourceId, ResourceHandle>,
    strategy: Box<dyn SelectionStrategy>,
}

pub struct ResourceRegistry {
    inner: Mutex<Inner>,
    matcher: Arc<dyn CapabilityMatcher>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ResourceRegistry {
    pub fn new(strategy: Box<dyn SelectionStrategy>, matcher: Arc<dyn CapabilityMatcher>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                handles: HashMap::new(),
                strategy,
            }),
            matcher,
            events,
        }
    }

    /// Registry with the configured strategy and the requirements matcher.
    pub fn with_strategy(kind: StrategyKind) -> Self {
        Self::new(strategy_for(kind), Arc::new(RequirementsMatcher))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.lock().strategy.name()
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().handles.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<ResourceHandle> {
        self.lock().handles.get(id).cloned()
    }

    /// Strategy-ordered copy of every registered handle.
    pub fn snapshot(&self) -> Vec<ResourceHandle> {
        let inner = self.lock();
        inner.strategy.order(&inner.handles)
    }

    /// Add a newly leased instantiator. A repeated registration is a renewal.
    pub fn add(&self, resource: InstantiatorResource) -> ResourceHandle {
        let id = resource.id.clone();
        let handle = {
            let mut inner = self.lock();
            if inner.handles.contains_key(&id) {
                drop(inner);
                debug!(resource = %id, "already registered, treating as renewal");
                return self.renew(resource);
            }
            let handle = ResourceHandle::new(resource);
            inner.handles.insert(id.clone(), handle.clone());
            inner.strategy.on_registered(&handle);
            handle
        };
        info!(resource = %id, address = %handle.address(), "instantiator registered");
        self.publish(RegistryEvent::Registered(id));
        handle
    }

    /// Apply a renewal. Unknown ids are registered.
    pub fn renew(&self, resource: InstantiatorResource) -> ResourceHandle {
        let id = resource.id.clone();
        let handle = {
            let mut inner = self.lock();
            let Some(handle) = inner.handles.get(&id).cloned() else {
                drop(inner);
                warn!(resource = %id, "renewal for unknown instantiator, registering");
                return self.add(resource);
            };
            handle.refresh(resource);
            inner.strategy.on_renewed(&handle);
            handle
        };
        debug!(resource = %id, load = handle.load(), "lease renewed");
        self.publish(RegistryEvent::Renewed(id));
        handle
    }

    /// Drop an instantiator whose lease ended. Unknown ids are logged and
    /// otherwise ignored.
    pub fn remove(&self, id: &str) -> Option<ResourceHandle> {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.handles.remove(id);
            if let Some(handle) = &removed {
                inner.strategy.on_removed(handle);
            }
            removed
        };
        match &removed {
            Some(_) => {
                info!(resource = %id, "instantiator removed");
                self.publish(RegistryEvent::Removed(id.to_string()));
            }
            None => warn!(resource = %id, "removal of unknown instantiator ignored"),
        }
        removed
    }

    // ── Instance accounting by id ─────────────────────────────────

    pub fn confirm(&self, id: &str, element_key: &str) -> bool {
        self.get(id).map(|h| h.confirm(element_key)).is_some()
    }

    pub fn release(&self, id: &str, element_key: &str) -> bool {
        self.get(id).is_some_and(|h| h.release(element_key))
    }

    pub fn stopped(&self, id: &str, element_key: &str) -> bool {
        self.get(id).is_some_and(|h| h.stopped(element_key))
    }

    // ── Selection ─────────────────────────────────────────────────

    /// Pick one node for `request`, or `None` with reasons recorded on it.
    pub async fn select_for(
        &self,
        request: &mut ProvisionRequest,
        restriction: &CandidateFilter,
    ) -> PlacementResult<Option<ResourceHandle>> {
        let element = request.element.clone();
        let Some(candidates) = self.candidates(request, &element, restriction)? else {
            return Ok(None);
        };

        let selected = select_candidate(
            candidates,
            &element,
            self.matcher.as_ref(),
            request.reasons_mut(),
            |handle| self.commit(handle),
        )
        .await?;

        if let Some(handle) = &selected {
            debug!(element = %element.key(), resource = %handle.id(), "candidate selected");
        }
        Ok(selected)
    }

    /// Every node that should receive a FIXED element this round.
    pub async fn eligible_for(
        &self,
        request: &mut ProvisionRequest,
        restriction: &CandidateFilter,
    ) -> PlacementResult<Vec<ResourceHandle>> {
        let element = request.element.clone();
        let Some(candidates) = self.candidates(request, &element, restriction)? else {
            return Ok(Vec::new());
        };

        let mut eligible = Vec::new();
        for handle in candidates {
            if check_candidate(&handle, &element, self.matcher.as_ref(), request.reasons_mut())
                .await?
            {
                eligible.push(handle);
            }
        }
        Ok(eligible)
    }

    /// Fleet-wide checks followed by the constraint filters.
    fn candidates(
        &self,
        request: &mut ProvisionRequest,
        element: &ServiceElement,
        restriction: &CandidateFilter,
    ) -> PlacementResult<Option<Vec<ResourceHandle>>> {
        element.validate()?;
        let snapshot = self.snapshot();
        let key = element.key();

        if element.provision_type == ProvisionType::External {
            request.add_reason("external elements are not provisioned");
            return Ok(None);
        }

        let fleet: u32 = snapshot.iter().map(|h| h.element_count(&key)).sum();
        if element.provision_type == ProvisionType::Dynamic && fleet >= element.planned {
            request.add_reason(format!("{key}: planned count reached"));
            return Ok(None);
        }
        if let Some(max) = element.max_instances {
            if fleet >= max {
                request.add_reason(format!("{key}: maximum of {max} instances reached"));
                return Ok(None);
            }
        }

        let reasons = request.reasons_mut();
        let candidates = filter::machine_boundary(&snapshot, element, reasons);
        let candidates = filter::isolation(&snapshot, candidates, element, reasons);
        let candidates = filter::restrict(candidates, restriction);
        if candidates.is_empty() {
            reasons.push(format!("{key}: no candidate instantiators"));
            return Ok(None);
        }
        Ok(Some(candidates))
    }

    /// Tell the strategy about a selection, if the handle is still leased.
    fn commit(&self, handle: &ResourceHandle) -> bool {
        let mut inner = self.lock();
        if !inner.handles.contains_key(handle.id()) {
            return false;
        }
        inner.strategy.on_selected(handle);
        true
    }
}

impl LeaseListener for ResourceRegistry {
    fn register(&self, resource: InstantiatorResource) {
        self.add(resource);
    }

    fn renewed(&self, resource: InstantiatorResource) {
        self.renew(resource);
    }

    fn expired(&self, id: &str) {
        debug!(resource = %id, "lease expired");
        self.remove(id);
    }

    fn removed(&self, id: &str) {
        self.remove(id);
    }
}

/// Walk `candidates` in order and return the first that passes every
/// per-node check and that `commit` accepts.
pub async fn select_candidate(
    candidates: Vec<ResourceHandle>,
    element: &ServiceElement,
    matcher: &dyn CapabilityMatcher,
    reasons: &mut Vec<String>,
    commit: impl Fn(&ResourceHandle) -> bool,
) -> PlacementResult<Option<ResourceHandle>> {
    for handle in candidates {
        if !check_candidate(&handle, element, matcher, reasons).await? {
            continue;
        }
        if commit(&handle) {
            return Ok(Some(handle));
        }
        reasons.push(format!("{}: lease ended during selection", handle.id()));
    }
    Ok(None)
}

/// Per-node checks in order: service limit, planned count, dynamic
/// provisioning flag, capability match.
async fn check_candidate(
    handle: &ResourceHandle,
    element: &ServiceElement,
    matcher: &dyn CapabilityMatcher,
    reasons: &mut Vec<String>,
) -> PlacementResult<bool> {
    let id = handle.id();
    if handle.load() >= handle.service_limit() {
        reasons.push(format!("{id}: service limit reached"));
        return Ok(false);
    }
    if handle.element_count(&element.key()) >= element.planned {
        reasons.push(format!("{id}: already at planned count"));
        return Ok(false);
    }
    if !handle.dynamic_enabled() {
        reasons.push(format!("{id}: dynamic provisioning disabled"));
        return Ok(false);
    }
    match matcher.can_provision(handle, element).await {
        Ok(true) => Ok(true),
        Ok(false) => {
            reasons.push(format!("{id}: capabilities do not match"));
            Ok(false)
        }
        Err(MatchError::Transient(e)) => {
            warn!(resource = %id, element = %element.key(), error = %e, "capability probe failed");
            reasons.push(format!("{id}: capability probe failed"));
            Ok(false)
        }
        Err(MatchError::Unrecoverable(reason)) => Err(PlacementError::Uninstantiable {
            element: element.key(),
            reason,
        }),
    }
}
