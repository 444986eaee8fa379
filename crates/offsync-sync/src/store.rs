//! Local entity store: the device's own copy of every entity.
//!
//! The coordinator writes here before enqueueing a mutation and applies
//! incoming or resolved versions here.
//!
//! Two implementations:
//!   - [`MemoryStore`]: in-process map, used by tests and embedders that keep
//!     their own database.
//!   - [`JsonFileStore`]: in-memory map mirrored write-through to
//!     `entities.json` in the tenant state directory.

use async_trait::async_trait;
use offsync_core::{EntityVersion, OfsResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::state::{read_json, write_json, TenantState, ENTITIES_FILE};

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, entity_type: &str, entity_id: &str) -> OfsResult<Option<EntityVersion>>;
    async fn put(&self, entity_type: &str, version: EntityVersion) -> OfsResult<()>;
    async fn delete(&self, entity_type: &str, entity_id: &str) -> OfsResult<()>;
}

fn key(entity_type: &str, entity_id: &str) -> String {
    format!("{entity_type}/{entity_id}")
}

// ── MemoryStore ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, EntityVersion>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, entity_type: &str, entity_id: &str) -> OfsResult<Option<EntityVersion>> {
        Ok(self.entries.read().await.get(&key(entity_type, entity_id)).cloned())
    }

    async fn put(&self, entity_type: &str, version: EntityVersion) -> OfsResult<()> {
        self.entries
            .write()
            .await
            .insert(key(entity_type, &version.entity_id), version);
        Ok(())
    }

    async fn delete(&self, entity_type: &str, entity_id: &str) -> OfsResult<()> {
        self.entries.write().await.remove(&key(entity_type, entity_id));
        Ok(())
    }
}

// ── JsonFileStore ─────────────────────────────────────────────────────────────

pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, EntityVersion>>,
}

impl JsonFileStore {
    /// Load or create the store at the given path.
    pub fn open(path: &Path) -> OfsResult<Self> {
        let entries = read_json(path)?.unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    pub fn for_tenant(state: &TenantState) -> OfsResult<Self> {
        Self::open(&state.dir().join(ENTITIES_FILE))
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl LocalStore for JsonFileStore {
    async fn get(&self, entity_type: &str, entity_id: &str) -> OfsResult<Option<EntityVersion>> {
        Ok(self.entries.read().await.get(&key(entity_type, entity_id)).cloned())
    }

    async fn put(&self, entity_type: &str, version: EntityVersion) -> OfsResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key(entity_type, &version.entity_id), version);
        write_json(&self.path, &*entries)
    }

    async fn delete(&self, entity_type: &str, entity_id: &str) -> OfsResult<()> {
        let mut entries = self.entries.write().await;
        if entries.remove(&key(entity_type, entity_id)).is_some() {
            write_json(&self.path, &*entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn version(id: &str, amount: u64) -> EntityVersion {
        EntityVersion {
            entity_id: id.into(),
            value: json!({ "amount": amount }),
            timestamp: amount,
            checksum: format!("sum-{amount}"),
            deleted: false,
            device_id: Some("dev-a".into()),
        }
    }

    #[tokio::test]
    async fn memory_store_put_get_delete() {
        let store = MemoryStore::new();
        store.put("transaction", version("42", 50)).await.unwrap();
        assert_eq!(
            store.get("transaction", "42").await.unwrap().unwrap().value["amount"],
            50
        );
        assert!(store.get("goal", "42").await.unwrap().is_none());

        store.delete("transaction", "42").await.unwrap();
        assert!(store.is_empty().await);
        store.delete("transaction", "42").await.unwrap();
    }

    #[tokio::test]
    async fn json_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.json");
        {
            let store = JsonFileStore::open(&path).unwrap();
            store.put("transaction", version("1", 10)).await.unwrap();
            store.put("transaction", version("2", 20)).await.unwrap();
            store.delete("transaction", "1").await.unwrap();
        }
        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.len().await, 1);
        let kept = reopened.get("transaction", "2").await.unwrap().unwrap();
        assert_eq!(kept, version("2", 20));
    }
}
