//! Per-attempt placement requests.

use std::fmt;
use std::sync::Arc;

use provmon_state::{ResourceId, ServiceElement};

use crate::handle::ResourceHandle;

/// Completion callbacks for a placement attempt.
///
/// Called on the placing task; implementations should hand off any slow
/// work.
pub trait ProvisionListener: Send + Sync {
    fn placed(&self, _request: &ProvisionRequest, _handle: &ResourceHandle) {}

    /// No candidate this round; `request.reasons()` says why.
    fn unplaced(&self, _request: &ProvisionRequest) {}

    fn uninstantiable(&self, _request: &ProvisionRequest) {}
}

/// Restriction applied to the candidate list after constraint filtering.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CandidateFilter {
    #[default]
    Any,
    Only(ResourceId),
    Exclude(ResourceId),
}

impl CandidateFilter {
    pub fn admits(&self, id: &str) -> bool {
        match self {
            CandidateFilter::Any => true,
            CandidateFilter::Only(only) => only == id,
            CandidateFilter::Exclude(excluded) => excluded != id,
        }
    }
}

/// One attempt to place an instance of `element`.
#[derive(Clone)]
pub struct ProvisionRequest {
    pub element: ServiceElement,
    /// Try this node first, then anywhere.
    pub preferred: Option<ResourceId>,
    /// Never use this node.
    pub excluded: Option<ResourceId>,
    reasons: Vec<String>,
    uninstantiable: bool,
    listener: Option<Arc<dyn ProvisionListener>>,
}

impl ProvisionRequest {
    pub fn new(element: ServiceElement) -> Self {
        Self {
            element,
            preferred: None,
            excluded: None,
            reasons: Vec::new(),
            uninstantiable: false,
            listener: None,
        }
    }

    pub fn prefer(mut self, id: impl Into<ResourceId>) -> Self {
        self.preferred = Some(id.into());
        self
    }

    pub fn exclude(mut self, id: impl Into<ResourceId>) -> Self {
        self.excluded = Some(id.into());
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ProvisionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn add_reason(&mut self, reason: impl Into<String>) {
        self.reasons.push(reason.into());
    }

    pub(crate) fn reasons_mut(&mut self) -> &mut Vec<String> {
        &mut self.reasons
    }

    pub fn clear_reasons(&mut self) {
        self.reasons.clear();
    }

    pub fn is_uninstantiable(&self) -> bool {
        self.uninstantiable
    }

    pub(crate) fn mark_uninstantiable(&mut self, reason: String) {
        self.uninstantiable = true;
        self.reasons.push(reason);
    }

    pub(crate) fn notify_placed(&self, handle: &ResourceHandle) {
        if let Some(listener) = &self.listener {
            listener.placed(self, handle);
        }
    }

    pub(crate) fn notify_unplaced(&self) {
        if let Some(listener) = &self.listener {
            listener.unplaced(self);
        }
    }

    pub(crate) fn notify_uninstantiable(&self) {
        if let Some(listener) = &self.listener {
            listener.uninstantiable(self);
        }
    }
}

impl fmt::Debug for ProvisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionRequest")
            .field("element", &self.element.key())
            .field("preferred", &self.preferred)
            .field("excluded", &self.excluded)
            .field("reasons", &self.reasons)
            .field("uninstantiable", &self.uninstantiable)
            .finish()
    }
}
