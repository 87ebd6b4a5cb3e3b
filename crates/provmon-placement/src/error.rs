//! Error types for placement selection.

use provmon_state::StateError;
use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

/// Placement failures that are not simply "no candidate this round".
///
/// Finding no eligible node is reported as `Ok(None)` with the reasons
/// recorded on the request; it is never an error.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// The element itself can never be instantiated on any node.
    #[error("{element} cannot be instantiated: {reason}")]
    Uninstantiable { element: String, reason: String },

    #[error("invalid service element: {0}")]
    InvalidElement(#[from] StateError),
}
