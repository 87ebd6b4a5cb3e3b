//! StateStore: redb-backed persistence for managed-deployment records.
//!
//! Every deployment manager writes its record through to this store so a
//! restarted monitor can reload what it was managing or backing up. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::DEPLOYMENTS;
use crate::types::DeploymentRecord;

/// Deployment records keyed by name. Cheap to clone.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path)
            .map_err(redb::Error::from)
            .map_err(StateError::store("open"))?;
        debug!(?path, "record store opened");
        Self::with_database(db)
    }

    /// Ephemeral store for tests and throwaway monitors.
    pub fn open_in_memory() -> StateResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(redb::Error::from)
            .map_err(StateError::store("open"))?;
        Self::with_database(db)
    }

    fn with_database(db: Database) -> StateResult<Self> {
        let store = Self { db: Arc::new(db) };
        store.create_table().map_err(StateError::store("create table"))?;
        Ok(store)
    }

    fn create_table(&self) -> Result<(), redb::Error> {
        let txn = self.db.begin_write()?;
        txn.open_table(DEPLOYMENTS)?;
        txn.commit()?;
        Ok(())
    }

    // ── Raw access ────────────────────────────────────────────────

    fn write_raw(&self, name: &str, bytes: &[u8]) -> Result<(), redb::Error> {
        let txn = self.db.begin_write()?;
        txn.open_table(DEPLOYMENTS)?.insert(name, bytes)?;
        txn.commit()?;
        Ok(())
    }

    fn read_raw(&self, name: &str) -> Result<Option<Vec<u8>>, redb::Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DEPLOYMENTS)?;
        let bytes = table.get(name)?.map(|guard| guard.value().to_vec());
        Ok(bytes)
    }

    fn read_all_raw(&self) -> Result<Vec<(String, Vec<u8>)>, redb::Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DEPLOYMENTS)?;
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (name, bytes) = entry?;
            rows.push((name.value().to_string(), bytes.value().to_vec()));
        }
        Ok(rows)
    }

    fn remove_raw(&self, name: &str) -> Result<bool, redb::Error> {
        let txn = self.db.begin_write()?;
        let existed = txn.open_table(DEPLOYMENTS)?.remove(name)?.is_some();
        txn.commit()?;
        Ok(existed)
    }

    // ── Records ───────────────────────────────────────────────────

    /// Insert or replace the record under its name.
    pub fn put_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        let bytes = serde_json::to_vec(record).map_err(StateError::codec(&record.name))?;
        self.write_raw(&record.name, &bytes)
            .map_err(StateError::store("write"))?;
        debug!(deployment = %record.name, active = record.active, "deployment record stored");
        Ok(())
    }

    pub fn get_deployment(&self, name: &str) -> StateResult<Option<DeploymentRecord>> {
        match self.read_raw(name).map_err(StateError::store("read"))? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(StateError::codec(name)),
            None => Ok(None),
        }
    }

    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        self.read_all_raw()
            .map_err(StateError::store("scan"))?
            .into_iter()
            .map(|(name, bytes)| serde_json::from_slice(&bytes).map_err(StateError::codec(&name)))
            .collect()
    }

    /// Returns true if a record was removed.
    pub fn delete_deployment(&self, name: &str) -> StateResult<bool> {
        let existed = self.remove_raw(name).map_err(StateError::store("delete"))?;
        debug!(deployment = %name, existed, "deployment record deleted");
        Ok(existed)
    }
}
