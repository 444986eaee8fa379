//! Sync round statistics and the event stream observers subscribe to.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::conflict::ConflictKind;
use crate::network::NetworkEvent;
use crate::realtime::ChannelState;
use crate::resolve::Winner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

/// Outcome of one sync round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    /// Another round was running, or the device was offline or awaiting re-auth
    pub skipped: bool,
    /// Stopped early because the network went away between batches
    pub interrupted: bool,
    pub pushed: usize,
    pub acknowledged: usize,
    pub retried: usize,
    pub dropped: usize,
    pub conflicts: usize,
    pub applied: usize,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            skipped: false,
            interrupted: false,
            pushed: 0,
            acknowledged: 0,
            retried: 0,
            dropped: 0,
            conflicts: 0,
            applied: 0,
            duration_ms: 0,
        }
    }

    pub fn skipped(mode: SyncMode) -> Self {
        Self {
            skipped: true,
            ..Self::new(mode)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    MaxAttempts,
    Integrity,
    Encryption,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::MaxAttempts => "max_attempts",
            DropReason::Integrity => "integrity",
            DropReason::Encryption => "encryption",
        }
    }
}

/// Observable engine events. Errors never escape `queue_mutation`; they
/// surface here instead.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    SyncStarted {
        mode: SyncMode,
    },
    SyncCompleted {
        report: SyncReport,
    },
    SyncFailed {
        mode: SyncMode,
        error: String,
    },
    ItemAcknowledged {
        item_id: String,
        entity_type: String,
    },
    ItemRetryScheduled {
        item_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    ItemDropped {
        item_id: String,
        entity_type: String,
        entity_id: String,
        reason: DropReason,
        message: String,
    },
    ConflictResolved {
        entity_type: String,
        entity_id: String,
        kind: ConflictKind,
        strategy: &'static str,
        winner: Winner,
        requeued: bool,
    },
    RemoteApplied {
        entity_type: String,
        entity_id: String,
    },
    /// An incoming mutation failed decryption or checksum verification
    RemoteRejected {
        entity_type: String,
        entity_id: String,
        reason: String,
    },
    LocalStoreFailed {
        entity_type: String,
        entity_id: String,
        message: String,
    },
    /// Sync is paused until `resume_after_reauth`
    AuthRequired {
        reason: String,
    },
    ServerSyncComplete {
        server_time: u64,
    },
    Network(NetworkEvent),
    Realtime(ChannelState),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub conflicts_resolved: u64,
    pub items_pushed: u64,
    pub items_dropped: u64,
    pub last_sync_duration_ms: u64,
    /// Running mean over every recorded round
    pub average_sync_duration_ms: f64,
    #[serde(default)]
    pub last_successful_sync_at: Option<u64>,
}

impl SyncStats {
    pub fn record_round(&mut self, duration: Duration, success: bool, finished_at: u64) {
        let ms = duration.as_millis() as u64;
        self.total_syncs += 1;
        if success {
            self.successful_syncs += 1;
            self.last_successful_sync_at = Some(finished_at);
        } else {
            self.failed_syncs += 1;
        }
        self.last_sync_duration_ms = ms;
        let n = self.total_syncs as f64;
        self.average_sync_duration_ms += (ms as f64 - self.average_sync_duration_ms) / n;
    }

    pub fn reset(&mut self) {
        *self = SyncStats::default();
    }
}
