//! Capability-match probe.
//!
//! The last per-candidate check in the selection loop asks whether the
//! node can actually host the element. The probe may be remote, so it is
//! async and always runs without the registry lock held.

use async_trait::async_trait;
use thiserror::Error;

use provmon_state::ServiceElement;

use crate::handle::ResourceHandle;

#[derive(Debug, Error)]
pub enum MatchError {
    /// This node could not be checked; try another one.
    #[error("capability probe failed: {0}")]
    Transient(String),

    /// No node will ever be able to host the element.
    #[error("{0}")]
    Unrecoverable(String),
}

#[async_trait]
pub trait CapabilityMatcher: Send + Sync {
    async fn can_provision(
        &self,
        handle: &ResourceHandle,
        element: &ServiceElement,
    ) -> Result<bool, MatchError>;
}

/// Compares the element's resource requirements with the node's free
/// capacity and labels.
///
/// Nodes that report no capacity for a dimension are not checked on it.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequirementsMatcher;

#[async_trait]
impl CapabilityMatcher for RequirementsMatcher {
    async fn can_provision(
        &self,
        handle: &ResourceHandle,
        element: &ServiceElement,
    ) -> Result<bool, MatchError> {
        let req = &element.requirements;
        if req.labels.keys().any(|k| k.trim().is_empty()) {
            return Err(MatchError::Unrecoverable(
                "required label with empty key".to_string(),
            ));
        }

        let cap = handle.capability();

        // Check hard label constraints.
        for (key, value) in &req.labels {
            match cap.labels.get(key) {
                Some(v) if v == value => {}
                _ => return Ok(false),
            }
        }

        if req.memory_bytes > 0 && cap.capacity_memory_bytes > 0 && cap.free_memory() < req.memory_bytes {
            return Ok(false);
        }
        if req.cpu_weight > 0 && cap.capacity_cpu_weight > 0 && cap.free_cpu() < req.cpu_weight {
            return Ok(false);
        }
        Ok(true)
    }
}
