//! provmond: assembles the resource registry, placement, peer replication
//! and the REST API into one daemon.

pub mod api;
pub mod daemon;
pub mod provisioner;

pub use api::{ApiState, build_router};
pub use daemon::run;
pub use provisioner::Provisioner;
