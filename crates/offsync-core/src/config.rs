use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration (loaded from offsync.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OfsConfig {
    pub daemon: DaemonConfig,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub network: NetworkConfig,
    pub realtime: RealtimeConfig,
    pub conflict: ConflictConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root directory for per-tenant persisted state
    pub state_dir: PathBuf,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9310)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// Device name reported in ClientInfo (defaults to hostname)
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the batch and changes endpoints
    pub base_url: String,
    /// Realtime endpoint (NATS URL)
    pub realtime_url: String,
    /// Tenant (account) identifier all requests are scoped to
    pub tenant_id: String,
    /// Bounded timeout for every outbound request (default: 30)
    pub request_timeout_secs: u64,
    /// Interval between reachability probes (default: 10)
    pub probe_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum items dequeued per drain round
    pub batch_size: usize,
    /// Attempts after which a rejected item is dropped and reported
    pub max_attempts: u32,
    /// Window in which repeated edits of the same entity coalesce (ms)
    pub coalesce_window_ms: u64,
    /// Period of the incremental sync timer (default: 30)
    pub incremental_interval_secs: u64,
    /// First retry delay for a failed item (ms)
    pub retry_base_delay_ms: u64,
    /// Upper bound on retry delay (ms)
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Raw connectivity changes must hold this long before an event fires (ms)
    pub min_transition_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Upper bound on a single reconnect delay (default: 30)
    pub reconnect_cap_secs: u64,
    /// Reconnect attempts before giving up until the next online transition
    pub max_reconnect_attempts: u32,
}

/// Conflict resolution strategy, selected per entity type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    LastWriteWins,
    ServerWins,
    ClientWins,
    FieldMerge,
    DomainPriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Writes closer than this are concurrent (ms, default: 5000)
    pub window_ms: u64,
    /// Strategy for entity types without an explicit entry
    pub default_strategy: StrategyKind,
    /// entity type → strategy
    pub strategies: BTreeMap<String, StrategyKind>,
    /// entity type → fields counted by the domain-priority completeness score
    pub expected_fields: BTreeMap<String, Vec<String>>,
}

/// Payload encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub enabled: bool,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// File holding the 16-byte KDF salt (created on first run)
    pub salt_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("~/.local/share/offsync"),
            metrics_addr: Some("127.0.0.1:9310".into()),
            log_level: "info".into(),
            log_format: "text".into(),
            device_name: None,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".into(),
            realtime_url: "nats://localhost:4222".into(),
            tenant_id: "default".into(),
            request_timeout_secs: 30,
            probe_interval_secs: 10,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 5,
            coalesce_window_ms: 2_000,
            incremental_interval_secs: 30,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            min_transition_interval_ms: 2_000,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            reconnect_cap_secs: 30,
            max_reconnect_attempts: 5,
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        let mut strategies = BTreeMap::new();
        for financial in ["account", "transaction", "goal", "balance"] {
            strategies.insert(financial.to_string(), StrategyKind::DomainPriority);
        }
        strategies.insert("settings".to_string(), StrategyKind::FieldMerge);

        let mut expected_fields = BTreeMap::new();
        expected_fields.insert(
            "transaction".to_string(),
            ["amount", "date", "description", "category", "merchant", "account_id"]
                .map(String::from)
                .to_vec(),
        );
        expected_fields.insert(
            "goal".to_string(),
            ["name", "target_amount", "current_amount", "deadline", "category"]
                .map(String::from)
                .to_vec(),
        );
        expected_fields.insert(
            "account".to_string(),
            ["name", "kind", "balance", "currency", "institution"]
                .map(String::from)
                .to_vec(),
        );

        Self {
            window_ms: 5_000,
            default_strategy: StrategyKind::LastWriteWins,
            strategies,
            expected_fields,
        }
    }
}

impl ConflictConfig {
    pub fn strategy_for(&self, entity_type: &str) -> StrategyKind {
        self.strategies
            .get(entity_type)
            .copied()
            .unwrap_or(self.default_strategy)
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            salt_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
state_dir = "/var/lib/offsync"
log_level = "debug"
log_format = "json"

[remote]
base_url = "https://sync.example.com/api"
realtime_url = "tls://nats.example.com:4222"
tenant_id = "acme"
request_timeout_secs = 10

[sync]
batch_size = 20
max_attempts = 3
coalesce_window_ms = 500

[network]
min_transition_interval_ms = 1000

[realtime]
reconnect_cap_secs = 16
max_reconnect_attempts = 7

[conflict]
window_ms = 3000
default_strategy = "server_wins"

[conflict.strategies]
note = "field_merge"

[conflict.expected_fields]
note = ["title", "body"]

[crypto]
enabled = false
argon2_mem_cost_kib = 131072
"#;
        let config: OfsConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.daemon.state_dir, PathBuf::from("/var/lib/offsync"));
        assert_eq!(config.daemon.log_format, "json");
        assert_eq!(config.remote.tenant_id, "acme");
        assert_eq!(config.remote.request_timeout_secs, 10);
        assert_eq!(config.sync.batch_size, 20);
        assert_eq!(config.sync.coalesce_window_ms, 500);
        assert_eq!(config.network.min_transition_interval_ms, 1000);
        assert_eq!(config.realtime.max_reconnect_attempts, 7);
        assert_eq!(config.conflict.window_ms, 3000);
        assert_eq!(config.conflict.strategy_for("note"), StrategyKind::FieldMerge);
        assert_eq!(
            config.conflict.strategy_for("unknown"),
            StrategyKind::ServerWins
        );
        assert_eq!(config.conflict.expected_fields["note"], vec!["title", "body"]);
        assert!(!config.crypto.enabled);
        assert_eq!(config.crypto.argon2_mem_cost_kib, 131072);
    }

    #[test]
    fn test_parse_defaults() {
        let config: OfsConfig = toml::from_str("").unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.remote.request_timeout_secs, 30);
        assert_eq!(config.sync.incremental_interval_secs, 30);
        assert_eq!(config.sync.coalesce_window_ms, 2_000);
        assert_eq!(config.network.min_transition_interval_ms, 2_000);
        assert_eq!(config.realtime.reconnect_cap_secs, 30);
        assert_eq!(config.realtime.max_reconnect_attempts, 5);
        assert_eq!(config.conflict.window_ms, 5_000);
        assert_eq!(
            config.conflict.strategy_for("goal"),
            StrategyKind::DomainPriority
        );
        assert_eq!(
            config.conflict.strategy_for("tag"),
            StrategyKind::LastWriteWins
        );
        assert!(config.crypto.enabled);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[remote]
tenant_id = "household-17"
"#;
        let config: OfsConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.remote.tenant_id, "household-17");
        assert_eq!(config.remote.base_url, "http://localhost:8080/api");
        assert_eq!(config.sync.batch_size, 50);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = OfsConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: OfsConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.daemon.state_dir, parsed.daemon.state_dir);
        assert_eq!(config.remote.base_url, parsed.remote.base_url);
        assert_eq!(config.conflict.strategies, parsed.conflict.strategies);
    }
}
