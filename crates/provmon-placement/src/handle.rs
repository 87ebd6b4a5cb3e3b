//! Lease-backed instantiator handles.
//!
//! A `ResourceHandle` is the registry's non-owning view of an instantiator
//! granted by the lease authority. Clones share the same live counters, so
//! a reservation made through a snapshot copy is visible to every later
//! snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use provmon_state::{Capability, InstantiatorResource, ResourceId, ServiceElement};

#[derive(Clone)]
pub struct ResourceHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: ResourceId,
    address: String,
    state: Mutex<HandleState>,
}

struct HandleState {
    resource: InstantiatorResource,
    /// Element key → descriptor of every element placed here, kept for
    /// isolation checks in both directions.
    hosted: HashMap<String, ServiceElement>,
}

impl ResourceHandle {
    pub fn new(resource: InstantiatorResource) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: resource.id.clone(),
                address: resource.address.clone(),
                state: Mutex::new(HandleState {
                    resource,
                    hosted: HashMap::new(),
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Host address; handles with equal addresses share a physical machine.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Point-in-time copy of the instantiator record, counters included.
    pub fn snapshot(&self) -> InstantiatorResource {
        self.state().resource.clone()
    }

    pub fn capability(&self) -> Capability {
        self.state().resource.capability.clone()
    }

    pub fn service_limit(&self) -> u32 {
        self.state().resource.service_limit
    }

    pub fn dynamic_enabled(&self) -> bool {
        self.state().resource.dynamic_enabled
    }

    pub fn running_count(&self) -> u32 {
        self.state().resource.running_count()
    }

    pub fn in_process_count(&self) -> u32 {
        self.state().resource.in_process_count()
    }

    /// Running plus reserved instances across all elements.
    pub fn load(&self) -> u32 {
        let state = self.state();
        state.resource.running_count() + state.resource.in_process_count()
    }

    /// Running plus reserved instances of one element.
    pub fn element_count(&self, element_key: &str) -> u32 {
        let state = self.state();
        state.resource.running.get(element_key).copied().unwrap_or(0)
            + state.resource.in_process.get(element_key).copied().unwrap_or(0)
    }

    /// Whether `element` may not share a machine with anything placed here.
    pub fn conflicts_with(&self, element: &ServiceElement) -> bool {
        let key = element.key();
        let state = self.state();
        let live = |k: &str| {
            state.resource.running.get(k).copied().unwrap_or(0)
                + state.resource.in_process.get(k).copied().unwrap_or(0)
                > 0
        };

        let declared_here = state
            .resource
            .running
            .keys()
            .chain(state.resource.in_process.keys())
            .any(|k| element.isolates(k.as_str()) && live(k.as_str()));
        let declared_there = state
            .hosted
            .iter()
            .any(|(k, hosted)| hosted.isolates(&key) && live(k.as_str()));

        declared_here || declared_there
    }

    /// Record a reservation for `element` (in-process counter +1).
    pub fn reserve(&self, element: &ServiceElement) {
        let key = element.key();
        let mut state = self.state();
        *state.resource.in_process.entry(key.clone()).or_insert(0) += 1;
        state.hosted.insert(key.clone(), element.clone());
        debug!(resource = %self.id(), element = %key, "reservation recorded");
    }

    /// The node confirmed an instance: move one reservation to running.
    pub fn confirm(&self, element_key: &str) {
        let mut state = self.state();
        decrement(&mut state.resource.in_process, element_key);
        *state
            .resource
            .running
            .entry(element_key.to_string())
            .or_insert(0) += 1;
    }

    /// Drop one reservation without starting an instance.
    pub fn release(&self, element_key: &str) -> bool {
        decrement(&mut self.state().resource.in_process, element_key)
    }

    /// One running instance stopped.
    pub fn stopped(&self, element_key: &str) -> bool {
        decrement(&mut self.state().resource.running, element_key)
    }

    /// Apply a capability refresh from the lease authority.
    ///
    /// The node's own report of running instances replaces ours;
    /// reservations are kept because the node has not seen them yet.
    pub fn refresh(&self, update: InstantiatorResource) {
        let mut state = self.state();
        let in_process = std::mem::take(&mut state.resource.in_process);
        state.resource = InstantiatorResource {
            in_process,
            id: state.resource.id.clone(),
            address: state.resource.address.clone(),
            ..update
        };
    }
}

fn decrement(counts: &mut BTreeMap<String, u32>, key: &str) -> bool {
    match counts.get_mut(key) {
        Some(n) if *n > 1 => {
            *n -= 1;
            true
        }
        Some(_) => {
            counts.remove(key);
            true
        }
        None => false,
    }
}

impl PartialEq for ResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ResourceHandle {}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("load", &self.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provmon_state::ProvisionType;

    fn element(name: &str) -> ServiceElement {
        ServiceElement::new("app", name, ProvisionType::Dynamic, 4)
    }

    #[test]
    fn reserve_confirm_release_cycle() {
        let handle = ResourceHandle::new(InstantiatorResource::new("n1", "10.0.0.1", 4));
        let web = element("web");

        handle.reserve(&web);
        handle.reserve(&web);
        assert_eq!(handle.in_process_count(), 2);
        assert_eq!(handle.element_count("app/web"), 2);

        handle.confirm("app/web");
        assert_eq!(handle.running_count(), 1);
        assert_eq!(handle.in_process_count(), 1);

        assert!(handle.release("app/web"));
        assert!(!handle.release("app/web"));
        assert_eq!(handle.load(), 1);

        assert!(handle.stopped("app/web"));
        assert_eq!(handle.load(), 0);
    }

    #[test]
    fn clones_share_counters() {
        let handle = ResourceHandle::new(InstantiatorResource::new("n1", "10.0.0.1", 4));
        let copy = handle.clone();
        copy.reserve(&element("web"));
        assert_eq!(handle.in_process_count(), 1);
        assert_eq!(handle, copy);
    }

    #[test]
    fn refresh_keeps_reservations() {
        let handle = ResourceHandle::new(InstantiatorResource::new("n1", "10.0.0.1", 4));
        handle.reserve(&element("web"));

        let mut update = InstantiatorResource::new("n1", "10.0.0.1", 8);
        update.running.insert("app/db".to_string(), 2);
        handle.refresh(update);

        assert_eq!(handle.service_limit(), 8);
        assert_eq!(handle.running_count(), 2);
        assert_eq!(handle.in_process_count(), 1);
    }

    #[test]
    fn isolation_is_checked_in_both_directions() {
        let handle = ResourceHandle::new(InstantiatorResource::new("n1", "10.0.0.1", 4));
        let db = element("db").with_isolation(&["cache"]);
        handle.reserve(&db);

        // cache declares nothing, but db (already here) isolates from it.
        assert!(handle.conflicts_with(&element("cache")));
        assert!(!handle.conflicts_with(&element("web")));

        let other = ResourceHandle::new(InstantiatorResource::new("n2", "10.0.0.2", 4));
        other.reserve(&element("cache"));
        assert!(other.conflicts_with(&db));
    }

    #[test]
    fn released_elements_no_longer_conflict() {
        let handle = ResourceHandle::new(InstantiatorResource::new("n1", "10.0.0.1", 4));
        let db = element("db").with_isolation(&["cache"]);
        handle.reserve(&db);
        handle.release("app/db");
        assert!(!handle.conflicts_with(&element("cache")));
    }
}
