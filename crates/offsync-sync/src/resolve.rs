//! Conflict resolution strategies.
//!
//! `LastWriteWins` and `DomainPriority` only look at the two versions, never at
//! which side is local, so two devices resolving the same pair pick the same
//! winner. Exact ties go to the lexicographically greater checksum.

use std::collections::HashMap;
use std::sync::Arc;

use offsync_core::config::{ConflictConfig, StrategyKind};
use offsync_core::{now_millis, EntityVersion};
use serde_json::{Map, Value};

use crate::checksum::checksum_value;
use crate::conflict::{ConflictKind, ConflictRecord};

// ── Outcome types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Pick {
    Local,
    Remote,
    Merged(EntityVersion),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

impl Winner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Winner::Local => "local",
            Winner::Remote => "remote",
            Winner::Merged => "merged",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub entity_type: String,
    pub entity_id: String,
    pub kind: ConflictKind,
    /// The version both sides should converge to
    pub value: EntityVersion,
    pub winner: Winner,
    pub strategy: &'static str,
    /// Checksum of the remote version the conflict was detected against
    pub remote_checksum: String,
}

impl Resolution {
    /// The resolved value differs from what the remote holds and must be pushed.
    pub fn needs_push(&self) -> bool {
        self.value.checksum != self.remote_checksum
    }
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn pick(&self, record: &ConflictRecord) -> Pick;
}

fn checksum_tiebreak(local: &EntityVersion, remote: &EntityVersion) -> Pick {
    if local.checksum > remote.checksum {
        Pick::Local
    } else {
        Pick::Remote
    }
}

fn newer(local: &EntityVersion, remote: &EntityVersion) -> Pick {
    match local.timestamp.cmp(&remote.timestamp) {
        std::cmp::Ordering::Greater => Pick::Local,
        std::cmp::Ordering::Less => Pick::Remote,
        std::cmp::Ordering::Equal => checksum_tiebreak(local, remote),
    }
}

// ── Strategies ────────────────────────────────────────────────────────────────

pub struct LastWriteWins;

impl Strategy for LastWriteWins {
    fn name(&self) -> &'static str {
        "last_write_wins"
    }

    fn pick(&self, record: &ConflictRecord) -> Pick {
        newer(&record.local, &record.remote)
    }
}

pub struct ServerWins;

impl Strategy for ServerWins {
    fn name(&self) -> &'static str {
        "server_wins"
    }

    fn pick(&self, _record: &ConflictRecord) -> Pick {
        Pick::Remote
    }
}

pub struct ClientWins;

impl Strategy for ClientWins {
    fn name(&self) -> &'static str {
        "client_wins"
    }

    fn pick(&self, _record: &ConflictRecord) -> Pick {
        Pick::Local
    }
}

/// Field-level union of two object values. Local fields win unless empty;
/// array fields are unioned. Tombstones fall back to last-write-wins.
pub struct FieldMerge;

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn merge_objects(local: &Map<String, Value>, remote: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = local.clone();
    for (key, remote_value) in remote {
        match merged.get_mut(key) {
            None => {
                merged.insert(key.clone(), remote_value.clone());
            }
            Some(local_value) if is_empty(local_value) => *local_value = remote_value.clone(),
            Some(Value::Array(items)) => {
                if let Value::Array(remote_items) = remote_value {
                    for item in remote_items {
                        if !items.contains(item) {
                            items.push(item.clone());
                        }
                    }
                }
            }
            Some(_) => {}
        }
    }
    merged
}

impl Strategy for FieldMerge {
    fn name(&self) -> &'static str {
        "field_merge"
    }

    fn pick(&self, record: &ConflictRecord) -> Pick {
        let (local, remote) = (&record.local, &record.remote);
        if local.deleted || remote.deleted {
            return newer(local, remote);
        }
        let value = match (&local.value, &remote.value) {
            (Value::Object(l), Value::Object(r)) => Value::Object(merge_objects(l, r)),
            (l, r) if is_empty(l) => r.clone(),
            (l, _) => l.clone(),
        };
        // A merge that took nothing from one side is that side unchanged: it
        // keeps its own timestamp and is not flagged merged
        let checksum = checksum_value(&value);
        if checksum == local.checksum {
            return Pick::Local;
        }
        if checksum == remote.checksum {
            return Pick::Remote;
        }
        Pick::Merged(EntityVersion {
            entity_id: local.entity_id.clone(),
            value,
            timestamp: now_millis().max(local.timestamp).max(remote.timestamp),
            checksum,
            deleted: false,
            device_id: local.device_id.clone(),
        })
    }
}

/// For entities where a partially-filled record is worse than a stale one:
/// the version with more populated expected fields wins, then the newer one.
pub struct DomainPriority {
    expected_fields: Vec<String>,
}

impl DomainPriority {
    pub fn new(expected_fields: Vec<String>) -> Self {
        Self { expected_fields }
    }

    fn completeness(&self, version: &EntityVersion, other: &EntityVersion) -> usize {
        if version.deleted {
            return 0;
        }
        let Value::Object(fields) = &version.value else {
            return usize::from(!is_empty(&version.value));
        };
        let populated = |name: &String| fields.get(name).is_some_and(|v| !is_empty(v));
        if self.expected_fields.is_empty() {
            let mut names: Vec<&String> = fields.keys().collect();
            if let Value::Object(other_fields) = &other.value {
                names.extend(other_fields.keys());
            }
            names.sort();
            names.dedup();
            names.into_iter().filter(|n| populated(n)).count()
        } else {
            self.expected_fields.iter().filter(|n| populated(n)).count()
        }
    }
}

impl Strategy for DomainPriority {
    fn name(&self) -> &'static str {
        "domain_priority"
    }

    fn pick(&self, record: &ConflictRecord) -> Pick {
        let (local, remote) = (&record.local, &record.remote);
        if local.deleted || remote.deleted {
            return newer(local, remote);
        }
        let local_score = self.completeness(local, remote);
        let remote_score = self.completeness(remote, local);
        match local_score.cmp(&remote_score) {
            std::cmp::Ordering::Greater => Pick::Local,
            std::cmp::Ordering::Less => Pick::Remote,
            std::cmp::Ordering::Equal => newer(local, remote),
        }
    }
}

pub fn build_strategy(kind: StrategyKind, expected_fields: Vec<String>) -> Arc<dyn Strategy> {
    match kind {
        StrategyKind::LastWriteWins => Arc::new(LastWriteWins),
        StrategyKind::ServerWins => Arc::new(ServerWins),
        StrategyKind::ClientWins => Arc::new(ClientWins),
        StrategyKind::FieldMerge => Arc::new(FieldMerge),
        StrategyKind::DomainPriority => Arc::new(DomainPriority::new(expected_fields)),
    }
}

// ── Resolver ──────────────────────────────────────────────────────────────────

pub struct ConflictResolver {
    strategies: HashMap<String, Arc<dyn Strategy>>,
    default: Arc<dyn Strategy>,
}

impl ConflictResolver {
    pub fn new(default: Arc<dyn Strategy>) -> Self {
        Self {
            strategies: HashMap::new(),
            default,
        }
    }

    pub fn from_config(config: &ConflictConfig) -> Self {
        let fields_for = |entity_type: &str| {
            config
                .expected_fields
                .get(entity_type)
                .cloned()
                .unwrap_or_default()
        };
        let mut resolver = Self::new(build_strategy(config.default_strategy, Vec::new()));
        for (entity_type, kind) in &config.strategies {
            resolver.register(entity_type, build_strategy(*kind, fields_for(entity_type)));
        }
        resolver
    }

    pub fn register(&mut self, entity_type: &str, strategy: Arc<dyn Strategy>) {
        self.strategies.insert(entity_type.to_string(), strategy);
    }

    pub fn strategy_for(&self, entity_type: &str) -> &dyn Strategy {
        self.strategies
            .get(entity_type)
            .unwrap_or(&self.default)
            .as_ref()
    }

    /// Resolve with the strategy configured for the record's entity type.
    pub fn resolve_for(&self, record: ConflictRecord) -> Resolution {
        let strategy = self.strategy_for(&record.entity_type);
        self.resolve(record, strategy)
    }

    pub fn resolve(&self, record: ConflictRecord, strategy: &dyn Strategy) -> Resolution {
        let pick = strategy.pick(&record);
        let ConflictRecord {
            entity_type,
            entity_id,
            local,
            remote,
            kind,
            ..
        } = record;
        let remote_checksum = remote.checksum.clone();
        let (value, winner) = match pick {
            Pick::Local => (local, Winner::Local),
            Pick::Remote => (remote, Winner::Remote),
            Pick::Merged(merged) => (merged, Winner::Merged),
        };
        Resolution {
            entity_type,
            entity_id,
            kind,
            value,
            winner,
            strategy: strategy.name(),
            remote_checksum,
        }
    }
}
