//! Per-tenant sync state on disk.
//!
//! Layout under the configured state directory:
//! ```text
//! {state_dir}/{tenant}/queue.json      pending SyncItems (QueueSnapshot)
//! {state_dir}/{tenant}/sync_meta.json  last sync time + this device's ClientInfo
//! {state_dir}/{tenant}/entities.json   JsonFileStore contents
//! ```
//! Every file is replaced atomically (write temp, then rename), so a crash
//! mid-write leaves the previous version intact.

use offsync_core::{ClientInfo, OfsResult, SyncError, TenantId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::queue::QueueSnapshot;

const QUEUE_FILE: &str = "queue.json";
const META_FILE: &str = "sync_meta.json";
pub(crate) const ENTITIES_FILE: &str = "entities.json";

/// Sync bookkeeping that must survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// Server time of the last successful pull; 0 before the first sync
    #[serde(default)]
    pub last_sync_time: u64,
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

/// Handle on one tenant's state directory.
#[derive(Debug, Clone)]
pub struct TenantState {
    dir: PathBuf,
}

impl TenantState {
    /// Open (creating if needed) `{root}/{tenant}`.
    pub fn open(root: &Path, tenant: &TenantId) -> OfsResult<Self> {
        let dir = root.join(tenant.as_str());
        std::fs::create_dir_all(&dir)
            .map_err(|e| SyncError::Store(format!("creating state dir {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_queue(&self) -> OfsResult<QueueSnapshot> {
        let path = self.dir.join(QUEUE_FILE);
        if !path.exists() {
            return Ok(QueueSnapshot::default());
        }
        let data = std::fs::read(&path)
            .map_err(|e| SyncError::Store(format!("reading {}: {e}", path.display())))?;
        let snapshot = QueueSnapshot::from_bytes(&data)?;
        info!(path = %path.display(), items = snapshot.items.len(), "loaded sync queue");
        Ok(snapshot)
    }

    pub fn save_queue(&self, snapshot: &QueueSnapshot) -> OfsResult<()> {
        write_atomic(&self.dir.join(QUEUE_FILE), &snapshot.to_bytes()?)
    }

    pub fn load_meta(&self) -> OfsResult<SyncMeta> {
        Ok(read_json(&self.dir.join(META_FILE))?.unwrap_or_default())
    }

    pub fn save_meta(&self, meta: &SyncMeta) -> OfsResult<()> {
        write_json(&self.dir.join(META_FILE), meta)
    }

    /// The device identity persisted for this tenant, generated on first use.
    pub fn load_or_create_client_info(&self, device_name: Option<String>) -> OfsResult<ClientInfo> {
        let mut meta = self.load_meta()?;
        if let Some(info) = &meta.client_info {
            return Ok(info.clone());
        }
        let info = ClientInfo::generate(device_name);
        info!(device_id = %info.device_id, "generated device identity");
        meta.client_info = Some(info.clone());
        self.save_meta(&meta)?;
        Ok(info)
    }
}

// ── Atomic file helpers ───────────────────────────────────────────────────────

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> OfsResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| SyncError::Store(format!("creating {}: {e}", parent.display())))?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, data)
        .map_err(|e| SyncError::Store(format!("writing {}: {e}", tmp_path.display())))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        SyncError::Store(format!(
            "renaming {} -> {}: {e}",
            tmp_path.display(),
            path.display()
        ))
    })?;
    debug!(path = %path.display(), bytes = data.len(), "state file written");
    Ok(())
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> OfsResult<()> {
    write_atomic(path, &serde_json::to_vec_pretty(value)?)
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> OfsResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)
        .map_err(|e| SyncError::Store(format!("reading {}: {e}", path.display())))?;
    let value = serde_json::from_slice(&data)
        .map_err(|e| SyncError::Store(format!("parsing {}: {e}", path.display())))?;
    Ok(Some(value))
}
