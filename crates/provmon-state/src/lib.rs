//! provmon-state: data model and deployment record store.
//!
//! Holds the leaf data types shared by every other crate
//! (`ServiceElement`, `InstantiatorResource`, `PeerInfo`,
//! `DeploymentRecord`) and a [redb](https://docs.rs/redb) backed
//! `StateStore` that persists managed-deployment records.
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns and keyed
//! by deployment name. The `StateStore` is `Clone` + `Send` + `Sync`
//! (backed by `Arc<Database>`).

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
