//! provmon-health: fault probes for sibling monitors and other targets.
//!
//! A probe watches a remote endpoint and reports when it stops answering.
//! The `FaultDetector` runs one background task per target; each task
//! probes on an interval, counts consecutive failures, and emits a single
//! `Unreachable` notice once the threshold is crossed.
//!
//! # Architecture
//!
//! ```text
//! FaultDetector
//!   ├── Per-target background task
//!   │   ├── LivenessTracker (consecutive failures, backoff)
//!   │   └── LivenessCheck::probe() → ProbeResult
//!   └── mpsc::Receiver<Unreachable> for the owner
//! ```
//!
//! Failed probes back off exponentially (capped at 60s), so a dead target
//! is not hammered while the threshold fills up.

pub mod checker;
pub mod monitor;

pub use checker::{HttpCheck, Liveness, LivenessCheck, LivenessTracker, ProbeResult, TcpHeartbeat, check_for};
pub use monitor::{FaultDetector, FaultProbe, ProbeSettings, Unreachable};
