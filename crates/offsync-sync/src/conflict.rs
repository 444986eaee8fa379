//! Timestamp-window conflict detection.
//!
//! Wall clocks across devices are only loosely synchronized, so two writes
//! whose timestamps fall within the detection window are treated as
//! concurrent rather than ordered. An incoming version older than the local
//! one by more than the window would silently roll the entity back and is
//! flagged as a stale overwrite instead.

use offsync_core::{now_millis, EntityVersion};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both writes happened within the detection window
    ConcurrentModification,
    /// The incoming version is older than local by more than the window
    StaleOverwrite,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::ConcurrentModification => "concurrent_modification",
            ConflictKind::StaleOverwrite => "stale_overwrite",
        }
    }
}

/// A detected divergence. Not `Clone`: a record is handed to the resolver
/// once and consumed there.
#[derive(Debug)]
pub struct ConflictRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub local: EntityVersion,
    pub remote: EntityVersion,
    pub kind: ConflictKind,
    pub detected_at: u64,
}

/// What to do with an incoming version.
#[derive(Debug)]
pub enum Detection {
    /// Same content already held locally
    UpToDate,
    /// No local version, or the incoming one is clearly newer
    ApplyIncoming,
    Conflict(ConflictRecord),
}

// ── Detector ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    window_ms: u64,
}

impl ConflictDetector {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Conflict check per the timestamp window. Identical checksums never
    /// conflict, whatever their timestamps.
    pub fn detect(
        &self,
        entity_type: &str,
        incoming: &EntityVersion,
        local: Option<&EntityVersion>,
    ) -> Option<ConflictRecord> {
        match self.classify(entity_type, incoming, local) {
            Detection::Conflict(record) => Some(record),
            Detection::UpToDate | Detection::ApplyIncoming => None,
        }
    }

    pub fn classify(
        &self,
        entity_type: &str,
        incoming: &EntityVersion,
        local: Option<&EntityVersion>,
    ) -> Detection {
        let Some(local) = local else {
            return Detection::ApplyIncoming;
        };
        if local.checksum == incoming.checksum {
            return Detection::UpToDate;
        }

        let kind = if local.timestamp.abs_diff(incoming.timestamp) < self.window_ms {
            ConflictKind::ConcurrentModification
        } else if local.timestamp > incoming.timestamp {
            ConflictKind::StaleOverwrite
        } else {
            return Detection::ApplyIncoming;
        };

        Detection::Conflict(ConflictRecord {
            entity_type: entity_type.to_string(),
            entity_id: incoming.entity_id.clone(),
            local: local.clone(),
            remote: incoming.clone(),
            kind,
            detected_at: now_millis(),
        })
    }
}
