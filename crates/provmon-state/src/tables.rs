//! redb table definitions for the deployment record store.

use redb::TableDefinition;

/// Managed-deployment records keyed by deployment name.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");
