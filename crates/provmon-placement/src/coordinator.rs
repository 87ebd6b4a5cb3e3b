//! PlacementCoordinator: one placement attempt at a time.
//!
//! Resolves the request's affinity hints, asks the registry for a
//! candidate and reserves it. Requests that found nothing can be parked
//! and replayed when the fleet changes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use provmon_state::ProvisionType;

use crate::error::PlacementError;
use crate::handle::ResourceHandle;
use crate::registry::ResourceRegistry;
use crate::request::{CandidateFilter, ProvisionRequest};

pub struct PlacementCoordinator {
    registry: Arc<ResourceRegistry>,
    pending: Mutex<VecDeque<ProvisionRequest>>,
}

/// A request and the node it was placed on.
#[derive(Debug, Clone)]
pub struct Placement {
    pub request: ProvisionRequest,
    pub handle: ResourceHandle,
}

impl PlacementCoordinator {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<ProvisionRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place one instance of `request.element`.
    ///
    /// A preferred node is tried alone first, then the whole fleet. On
    /// success the node's in-process counter is incremented before
    /// returning. `None` means no candidate this round, or that the
    /// request was marked uninstantiable.
    pub async fn acquire(&self, request: &mut ProvisionRequest) -> Option<ResourceHandle> {
        let key = request.element.key();
        let result = match (request.preferred.clone(), request.excluded.clone()) {
            (Some(preferred), _) => {
                match self
                    .registry
                    .select_for(request, &CandidateFilter::Only(preferred.clone()))
                    .await
                {
                    Ok(None) => {
                        debug!(element = %key, resource = %preferred, "preferred node unavailable, trying the fleet");
                        self.registry.select_for(request, &CandidateFilter::Any).await
                    }
                    other => other,
                }
            }
            (None, Some(excluded)) => {
                self.registry
                    .select_for(request, &CandidateFilter::Exclude(excluded))
                    .await
            }
            (None, None) => self.registry.select_for(request, &CandidateFilter::Any).await,
        };

        match result {
            Ok(Some(handle)) => {
                handle.reserve(&request.element);
                info!(element = %key, resource = %handle.id(), "instance placed");
                request.notify_placed(&handle);
                Some(handle)
            }
            Ok(None) => {
                debug!(element = %key, reasons = ?request.reasons(), "no candidate this round");
                request.notify_unplaced();
                None
            }
            Err(e) => {
                self.fail(request, e);
                None
            }
        }
    }

    /// Place a FIXED element on every eligible node, reserving each.
    pub async fn acquire_fixed(&self, request: &mut ProvisionRequest) -> Vec<ResourceHandle> {
        let restriction = request
            .excluded
            .clone()
            .map(CandidateFilter::Exclude)
            .unwrap_or_default();

        match self.registry.eligible_for(request, &restriction).await {
            Ok(eligible) => {
                for handle in &eligible {
                    handle.reserve(&request.element);
                    request.notify_placed(handle);
                }
                if eligible.is_empty() {
                    request.notify_unplaced();
                } else {
                    info!(element = %request.element.key(), nodes = eligible.len(), "fixed instances placed");
                }
                eligible
            }
            Err(e) => {
                self.fail(request, e);
                Vec::new()
            }
        }
    }

    fn fail(&self, request: &mut ProvisionRequest, err: PlacementError) {
        match err {
            PlacementError::Uninstantiable { element, reason } => {
                error!(element = %element, %reason, "element marked uninstantiable");
                request.mark_uninstantiable(reason);
                request.notify_uninstantiable();
            }
            other => {
                warn!(element = %request.element.key(), error = %other, "placement attempt failed");
                request.add_reason(other.to_string());
                request.notify_unplaced();
            }
        }
    }

    /// Park a request that found no candidate. Uninstantiable requests are
    /// dropped.
    pub fn defer(&self, request: ProvisionRequest) {
        if request.is_uninstantiable() {
            debug!(element = %request.element.key(), "not deferring uninstantiable request");
            return;
        }
        self.pending().push_back(request);
    }

    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    /// Forget parked requests for a deployment, e.g. after undeploy.
    pub fn discard_pending(&self, deployment: &str) -> usize {
        let mut pending = self.pending();
        let before = pending.len();
        pending.retain(|r| r.element.deployment != deployment);
        before - pending.len()
    }

    /// Replay every parked request once. Requests that still find nothing
    /// are parked again.
    pub async fn retry_pending(&self) -> Vec<Placement> {
        let queued: Vec<ProvisionRequest> = self.pending().drain(..).collect();
        if queued.is_empty() {
            return Vec::new();
        }
        debug!(count = queued.len(), "retrying pending placements");

        let mut placed = Vec::new();
        for mut request in queued {
            request.clear_reasons();
            match request.element.provision_type {
                ProvisionType::Fixed => {
                    let handles = self.acquire_fixed(&mut request).await;
                    for handle in handles {
                        placed.push(Placement {
                            request: request.clone(),
                            handle,
                        });
                    }
                    // FIXED work stays parked so later nodes receive it too.
                    self.defer(request);
                }
                _ => match self.acquire(&mut request).await {
                    Some(handle) => placed.push(Placement { request, handle }),
                    None => self.defer(request),
                },
            }
        }
        placed
    }
}
