//! InstanceStore — redb-backed persistence for preview instances.
//!
//! Provides the status-filterable instance table and the per-instance
//! build-log table. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing). No cross-call transactions are assumed by
//! callers; each operation commits on its own.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use orchard_core::{CommonStatus, Instance, OutputChunk};

use crate::error::{StateError, StateResult};
use crate::tables::{BUILD_LOGS, INSTANCES};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// One persisted build-log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildLogRow {
    #[serde(flatten)]
    pub chunk: OutputChunk,
    /// Unix timestamp in milliseconds at append time.
    pub created_at: i64,
}

/// Thread-safe instance store backed by redb.
#[derive(Clone)]
pub struct InstanceStore {
    db: Arc<Database>,
}

impl InstanceStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "instance store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Storage))?;
        txn.open_table(BUILD_LOGS).map_err(map_err!(Storage))?;
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or replace an instance row.
    pub fn insert_instance(&self, instance: &Instance) -> StateResult<()> {
        let value = serde_json::to_vec(instance).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Storage))?;
            table
                .insert(instance.hash.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(hash = %instance.hash, status = %instance.status, "instance stored");
        Ok(())
    }

    /// Get an instance by hash.
    pub fn get_instance(&self, hash: &str) -> StateResult<Option<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Storage))?;
        match table.get(hash).map_err(map_err!(Storage))? {
            Some(guard) => {
                let instance: Instance =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    /// List all instances, oldest first.
    pub fn list_instances(&self) -> StateResult<Vec<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Storage))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (_, value) = entry.map_err(map_err!(Storage))?;
            let instance: Instance =
                serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
            results.push(instance);
        }
        results.sort_by_key(|instance| instance.created_at);
        Ok(results)
    }

    /// Instances in the given status, oldest first, optionally capped.
    pub fn get_instances_by_status(
        &self,
        status: CommonStatus,
        limit: Option<usize>,
    ) -> StateResult<Vec<Instance>> {
        let mut results: Vec<Instance> = self
            .list_instances()?
            .into_iter()
            .filter(|instance| instance.status == status)
            .collect();
        if let Some(limit) = limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// Number of instances currently marked `generating`.
    pub fn count_generating(&self) -> StateResult<usize> {
        Ok(self
            .get_instances_by_status(CommonStatus::Generating, None)?
            .len())
    }

    /// Update the persisted status of an instance. No-op when absent.
    pub fn update_instance_status(&self, hash: &str, status: CommonStatus) -> StateResult<()> {
        let Some(mut instance) = self.get_instance(hash)? else {
            return Ok(());
        };
        instance.status = status;
        self.insert_instance(&instance)
    }

    /// `generated` instances created more than `ttl_ms` ago.
    pub fn get_instances_by_ttl(&self, ttl_ms: u64, now_ms: i64) -> StateResult<Vec<Instance>> {
        Ok(self
            .get_instances_by_status(CommonStatus::Generated, None)?
            .into_iter()
            .filter(|instance| now_ms.saturating_sub(instance.created_at) > ttl_ms as i64)
            .collect())
    }

    /// Remove the instance row and its build logs.
    pub fn clear_instance_data(&self, hash: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Storage))?;
            instances.remove(hash).map_err(map_err!(Storage))?;
            let mut logs = txn.open_table(BUILD_LOGS).map_err(map_err!(Storage))?;
            logs.remove(hash).map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(%hash, "instance data cleared");
        Ok(())
    }

    // ── Build logs ─────────────────────────────────────────────────

    /// Append output chunks to an instance's build log, preserving order.
    pub fn insert_instance_logs(&self, hash: &str, chunks: &[OutputChunk]) -> StateResult<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp_millis();
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut table = txn.open_table(BUILD_LOGS).map_err(map_err!(Storage))?;
            let mut rows: Vec<BuildLogRow> = match table.get(hash).map_err(map_err!(Storage))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?
                }
                None => Vec::new(),
            };
            rows.extend(chunks.iter().map(|chunk| BuildLogRow {
                chunk: chunk.clone(),
                created_at: now,
            }));
            let value = serde_json::to_vec(&rows).map_err(map_err!(Codec))?;
            table
                .insert(hash, value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    /// All build-log rows for an instance, in append order.
    pub fn list_instance_logs(&self, hash: &str) -> StateResult<Vec<BuildLogRow>> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(BUILD_LOGS).map_err(map_err!(Storage))?;
        match table.get(hash).map_err(map_err!(Storage))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Codec))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Drop all build logs for an instance.
    pub fn clear_instance_logs(&self, hash: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut table = txn.open_table(BUILD_LOGS).map_err(map_err!(Storage))?;
            table.remove(hash).map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_instance(hash: &str, created_at: i64, status: CommonStatus) -> Instance {
        Instance {
            hash: hash.to_string(),
            project: "web".to_string(),
            branch: "main".to_string(),
            vcs: "git".to_string(),
            instance_config_name: "default".to_string(),
            url_template: None,
            env_variables: HashMap::new(),
            run_env_variables: HashMap::new(),
            labels: HashMap::new(),
            description: None,
            created_at,
            status,
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let store = InstanceStore::open_in_memory().unwrap();
        let instance = test_instance("aaa", 1000, CommonStatus::Queued);
        store.insert_instance(&instance).unwrap();
        assert_eq!(store.get_instance("aaa").unwrap(), Some(instance));
        assert_eq!(store.get_instance("bbb").unwrap(), None);
    }

    #[test]
    fn by_status_is_oldest_first_and_capped() {
        let store = InstanceStore::open_in_memory().unwrap();
        store
            .insert_instance(&test_instance("c", 3000, CommonStatus::Queued))
            .unwrap();
        store
            .insert_instance(&test_instance("a", 1000, CommonStatus::Queued))
            .unwrap();
        store
            .insert_instance(&test_instance("b", 2000, CommonStatus::Generating))
            .unwrap();

        let queued = store
            .get_instances_by_status(CommonStatus::Queued, Some(1))
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].hash, "a");
    }

    #[test]
    fn count_generating_counts_only_generating() {
        let store = InstanceStore::open_in_memory().unwrap();
        store
            .insert_instance(&test_instance("a", 1000, CommonStatus::Generating))
            .unwrap();
        store
            .insert_instance(&test_instance("b", 2000, CommonStatus::Queued))
            .unwrap();
        assert_eq!(store.count_generating().unwrap(), 1);
    }

    #[test]
    fn update_status_on_missing_instance_is_noop() {
        let store = InstanceStore::open_in_memory().unwrap();
        store
            .update_instance_status("ghost", CommonStatus::Errored)
            .unwrap();
        assert_eq!(store.get_instance("ghost").unwrap(), None);
    }

    #[test]
    fn clear_removes_row_and_logs() {
        let store = InstanceStore::open_in_memory().unwrap();
        store
            .insert_instance(&test_instance("a", 1000, CommonStatus::Generated))
            .unwrap();
        store
            .insert_instance_logs("a", &[OutputChunk::message("hello")])
            .unwrap();

        store.clear_instance_data("a").unwrap();
        assert_eq!(store.get_instance("a").unwrap(), None);
        assert!(store.list_instance_logs("a").unwrap().is_empty());

        // Clearing again does not fail.
        store.clear_instance_data("a").unwrap();
    }

    #[test]
    fn logs_preserve_append_order() {
        let store = InstanceStore::open_in_memory().unwrap();
        let first = vec![
            OutputChunk::message("one"),
            OutputChunk::message("two"),
        ];
        let second = vec![OutputChunk::message("three")];
        store.insert_instance_logs("a", &first).unwrap();
        store.insert_instance_logs("a", &second).unwrap();

        let rows = store.list_instance_logs("a").unwrap();
        let stdout: Vec<_> = rows
            .iter()
            .map(|row| row.chunk.stdout.as_deref().unwrap())
            .collect();
        assert_eq!(stdout, ["one", "two", "three"]);
    }

    #[test]
    fn ttl_query_only_returns_old_generated() {
        let store = InstanceStore::open_in_memory().unwrap();
        store
            .insert_instance(&test_instance("old", 1000, CommonStatus::Generated))
            .unwrap();
        store
            .insert_instance(&test_instance("new", 9000, CommonStatus::Generated))
            .unwrap();
        store
            .insert_instance(&test_instance("old-queued", 1000, CommonStatus::Queued))
            .unwrap();

        let expired = store.get_instances_by_ttl(5000, 10_000).unwrap();
        let hashes: Vec<_> = expired.iter().map(|i| i.hash.as_str()).collect();
        assert_eq!(hashes, ["old"]);
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchard.redb");
        {
            let store = InstanceStore::open(&path).unwrap();
            store
                .insert_instance(&test_instance("a", 1000, CommonStatus::Generated))
                .unwrap();
        }
        let store = InstanceStore::open(&path).unwrap();
        assert!(store.get_instance("a").unwrap().is_some());
    }
}
