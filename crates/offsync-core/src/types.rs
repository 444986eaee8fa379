use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{OfsResult, SyncError};

/// Wire protocol version attached to every batch and realtime handshake.
pub const PROTOCOL_VERSION: u32 = 2;

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Kind of local mutation carried by a queued item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of the signed-in account. All persisted state is scoped by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Tenant ids become directory names, so separators and dot-segments are rejected.
    pub fn new(id: impl Into<String>) -> OfsResult<Self> {
        let id = id.into();
        if id.is_empty()
            || id == "."
            || id == ".."
            || id.contains(['/', '\\', '\0'])
        {
            return Err(SyncError::Config(format!("invalid tenant id: {id:?}")));
        }
        Ok(TenantId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static-per-install identity attached to outbound batches and the realtime
/// handshake, so echoes of this device's own writes can be recognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub device_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
    pub protocol_version: u32,
}

impl ClientInfo {
    /// Fresh identity with a random UUID v4 device id.
    pub fn generate(device_name: Option<String>) -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn is_self(&self, origin_device: Option<&str>) -> bool {
        origin_device == Some(self.device_id.as_str())
    }
}

/// One pending local mutation awaiting transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItem {
    /// Assigned at enqueue time, stable across retries and coalescing
    pub id: String,
    pub operation: Operation,
    /// Logical collection name ("account", "transaction", "goal", ...)
    pub entity_type: String,
    pub entity_id: String,
    /// Encrypted payload; the engine never interprets it
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    /// BLAKE3 hex of the plaintext before encryption
    pub checksum: String,
    /// Unix ms, set once
    pub enqueued_at: u64,
    /// Unix ms of the latest mutation coalesced into this item
    pub modified_at: u64,
    pub attempt: u32,
    /// Unix ms before which the item must not be sent
    pub next_eligible_at: u64,
}

/// Decrypted representation of one version of an entity, used for comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVersion {
    pub entity_id: String,
    /// `Null` for tombstones
    pub value: serde_json::Value,
    /// Unix ms of the write that produced this version
    pub timestamp: u64,
    pub checksum: String,
    #[serde(default)]
    pub deleted: bool,
    /// Device that produced this version, if known
    #[serde(default)]
    pub device_id: Option<String>,
}

impl EntityVersion {
    pub fn tombstone(entity_id: impl Into<String>, timestamp: u64, checksum: String) -> Self {
        Self {
            entity_id: entity_id.into(),
            value: serde_json::Value::Null,
            timestamp,
            checksum,
            deleted: true,
            device_id: None,
        }
    }
}

/// Serde adapter storing binary payloads as standard base64 strings.
pub mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
