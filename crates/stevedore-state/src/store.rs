//! StateStore — redb-backed persistence for the scheduling core.
//!
//! Implements [`DeploymentRepository`] (in-flight plans, recovered on
//! leadership acquisition) and [`GroupRepository`] (the declarative
//! group tree). Supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use stevedore_core::plan::DeploymentPlan;
use stevedore_core::{DeploymentRepository, Group, GroupRepository, RunSpecId};

use crate::error::{StateError, StateResult};
use crate::tables::{GROUPS, PLANS};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PLANS).map_err(map_err!(Table))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Plans ──────────────────────────────────────────────────────

    pub fn put_plan(&self, plan: &DeploymentPlan) -> StateResult<()> {
        let value = serde_json::to_vec(plan).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PLANS).map_err(map_err!(Table))?;
            table
                .insert(plan.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(plan_id = %plan.id, "plan stored");
        Ok(())
    }

    pub fn list_plans(&self) -> StateResult<Vec<DeploymentPlan>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PLANS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let plan: DeploymentPlan =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(plan);
        }
        Ok(results)
    }

    /// Delete a plan by id. Returns true if it existed.
    pub fn delete_plan(&self, plan_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(PLANS).map_err(map_err!(Table))?;
            existed = table.remove(plan_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%plan_id, existed, "plan deleted");
        Ok(existed)
    }

    // ── Groups ─────────────────────────────────────────────────────

    pub fn put_root(&self, root: &Group) -> StateResult<()> {
        let value = serde_json::to_vec(root).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            table
                .insert(RunSpecId::root().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The root group; empty when never written.
    pub fn get_root(&self) -> StateResult<Group> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        match table
            .get(RunSpecId::root().as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Ok(Group::default()),
        }
    }
}

#[async_trait]
impl DeploymentRepository for StateStore {
    async fn all(&self) -> anyhow::Result<Vec<DeploymentPlan>> {
        Ok(self.list_plans()?)
    }

    async fn store(&self, plan: &DeploymentPlan) -> anyhow::Result<()> {
        Ok(self.put_plan(plan)?)
    }

    async fn delete(&self, plan_id: &str) -> anyhow::Result<()> {
        self.delete_plan(plan_id)?;
        Ok(())
    }
}

#[async_trait]
impl GroupRepository for StateStore {
    async fn root(&self) -> anyhow::Result<Group> {
        Ok(self.get_root()?)
    }

    async fn store_root(&self, root: &Group) -> anyhow::Result<()> {
        Ok(self.put_root(root)?)
    }
}
