//! provmon-placement: choosing an instantiator for each new instance.
//!
//! The registry holds lease-backed handles for every registered
//! instantiator and orders them with a pluggable strategy. A placement
//! attempt filters a snapshot through the hard constraints, walks the
//! ordered candidates, and reserves the first node that passes.
//!
//! # Components
//!
//! - **`registry`**: leased handles, lease callbacks, selection loop
//! - **`strategy`**: round-robin, least-loaded and cost-ordered ordering
//! - **`filter`**: per-machine limits, isolation, candidate restriction
//! - **`matcher`**: capability-match probe
//! - **`coordinator`**: affinity hints, reservation, pending retries

pub mod coordinator;
pub mod error;
pub mod filter;
pub mod handle;
pub mod lease;
pub mod matcher;
pub mod registry;
pub mod request;
pub mod strategy;

pub use coordinator::{Placement, PlacementCoordinator};
pub use error::{PlacementError, PlacementResult};
pub use handle::ResourceHandle;
pub use lease::LeaseListener;
pub use matcher::{CapabilityMatcher, MatchError, RequirementsMatcher};
pub use registry::{RegistryEvent, ResourceRegistry, select_candidate};
pub use request::{CandidateFilter, ProvisionListener, ProvisionRequest};
pub use strategy::{CostOrdered, LeastLoaded, RoundRobin, SelectionStrategy, strategy_for};
