//! Wire messages exchanged with the remote sync API and the realtime channel.
//!
//! Payloads are always the encrypted bytes produced on the originating device
//! and travel base64-encoded inside JSON.

use offsync_core::types::b64;
use offsync_core::{ClientInfo, OfsResult, Operation, SyncError, SyncItem};
use serde::{Deserialize, Serialize};

// ── Batch push ────────────────────────────────────────────────────────────

/// One queued item as sent to the batch endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub entity_id: String,
    pub operation: Operation,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    /// Unix ms of the latest local mutation carried by this item
    pub timestamp: u64,
    pub checksum: String,
}

impl From<&SyncItem> for BatchItem {
    fn from(item: &SyncItem) -> Self {
        Self {
            id: item.id.clone(),
            entity_id: item.entity_id.clone(),
            operation: item.operation,
            payload: item.payload.clone(),
            timestamp: item.modified_at,
            checksum: item.checksum.clone(),
        }
    }
}

/// All items of one entity type from a single dequeued batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub entity_type: String,
    pub items: Vec<BatchItem>,
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    /// Malformed item; retried up to the attempt limit
    Validation,
    /// Checksum mismatch on the server side; dropped
    Integrity,
    /// Credentials no longer accepted for this item
    Auth,
    /// Transient server-side failure; retried without counting an attempt
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ItemErrorKind,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub item_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<ItemError>,
}

impl ItemResult {
    pub fn ok(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(item_id: impl Into<String>, kind: ItemErrorKind, message: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            success: false,
            error: Some(ItemError {
                kind,
                message: message.into(),
            }),
        }
    }
}

/// The server refused an item because it holds a diverging version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConflict {
    pub item_id: String,
    pub remote: RemoteMutation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub results: Vec<ItemResult>,
    #[serde(default)]
    pub conflicts: Vec<ServerConflict>,
    /// Newer versions the server wants this device to apply
    #[serde(default)]
    pub server_updates: Vec<RemoteMutation>,
}

// ── Pull ──────────────────────────────────────────────────────────────────

/// A mutation produced by some device, as relayed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMutation {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    pub checksum: String,
    pub timestamp: u64,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub changes: Vec<RemoteMutation>,
    /// Server clock at the time of the query; becomes the next `since`
    pub server_time: u64,
}

// ── Realtime channel ──────────────────────────────────────────────────────

/// Messages carried over the realtime channel in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// First message after connecting; identifies device and tenant
    Hello {
        client_info: ClientInfo,
        tenant_id: String,
    },
    RemoteMutation {
        mutation: RemoteMutation,
    },
    /// The server detected divergence and forwards its current version
    ConflictNotice {
        mutation: RemoteMutation,
        #[serde(default)]
        reason: Option<String>,
    },
    SyncComplete {
        #[serde(default)]
        device_id: Option<String>,
        server_time: u64,
    },
    KeepAlive {
        #[serde(default)]
        device_id: Option<String>,
    },
    KeepAliveAck {
        device_id: String,
    },
}

impl ChannelMessage {
    /// Device that produced the message, when the message carries one.
    pub fn origin_device(&self) -> Option<&str> {
        match self {
            ChannelMessage::Hello { client_info, .. } => Some(client_info.device_id.as_str()),
            ChannelMessage::RemoteMutation { mutation }
            | ChannelMessage::ConflictNotice { mutation, .. } => mutation.device_id.as_deref(),
            ChannelMessage::SyncComplete { device_id, .. }
            | ChannelMessage::KeepAlive { device_id } => device_id.as_deref(),
            ChannelMessage::KeepAliveAck { device_id } => Some(device_id.as_str()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelMessage::Hello { .. } => "hello",
            ChannelMessage::RemoteMutation { .. } => "remote_mutation",
            ChannelMessage::ConflictNotice { .. } => "conflict_notice",
            ChannelMessage::SyncComplete { .. } => "sync_complete",
            ChannelMessage::KeepAlive { .. } => "keep_alive",
            ChannelMessage::KeepAliveAck { .. } => "keep_alive_ack",
        }
    }

    pub fn to_bytes(&self) -> OfsResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| SyncError::Validation(format!("serializing {}: {e}", self.type_name())))
    }

    pub fn from_bytes(data: &[u8]) -> OfsResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| SyncError::Validation(format!("deserializing channel message: {e}")))
    }
}
