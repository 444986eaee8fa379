//! Daemon lifecycle: wiring, reachability probe, metrics, systemd notify, shutdown

use anyhow::{Context, Result};
use offsync_core::config::OfsConfig;
use offsync_core::{SyncError, TenantId};
use offsync_crypto::{derive_master_key, load_or_create_salt, KdfParams, PayloadCipher};
use offsync_sync::{
    Collaborators, CoordinatorSettings, Credentials, Encryptor, HttpRemote, JsonFileStore,
    NatsTransport, NetworkMonitor, PlaintextEncryptor, RemoteApi, SyncCoordinator, TenantState,
};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::{HealthState, SyncMetrics};

/// Secrets supplied on the command line or through the environment.
pub struct Secrets {
    pub session_token: SecretString,
    pub passphrase: Option<SecretString>,
}

/// Expand `~` in path to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

pub fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-device".into())
}

/// Open the persisted state directory for the configured tenant.
pub fn open_state(config: &OfsConfig) -> Result<(TenantId, TenantState)> {
    let tenant = TenantId::new(&config.remote.tenant_id).context("remote.tenant_id")?;
    let root = expand_tilde(&config.daemon.state_dir);
    let state = TenantState::open(&root, &tenant)
        .with_context(|| format!("opening state dir {}", root.display()))?;
    Ok((tenant, state))
}

pub async fn run(config: OfsConfig, secrets: Secrets) -> Result<()> {
    info!("daemon starting");

    let (tenant, state) = open_state(&config)?;
    let device_name = config
        .daemon
        .device_name
        .clone()
        .unwrap_or_else(default_device_name);
    let client_info = state
        .load_or_create_client_info(Some(device_name))
        .context("loading device identity")?;
    info!(
        device_id = %client_info.device_id,
        device_name = client_info.device_name.as_deref().unwrap_or(""),
        tenant = %tenant,
        state_dir = %state.dir().display(),
        "device identity ready"
    );

    let credentials = Credentials {
        tenant_id: tenant.clone(),
        token: secrets.session_token,
    };
    let encryptor = build_encryptor(&config, &state, &tenant, secrets.passphrase).await?;
    let remote: Arc<dyn RemoteApi> = Arc::new(
        HttpRemote::new(
            &config.remote.base_url,
            &credentials,
            Duration::from_secs(config.remote.request_timeout_secs.max(1)),
        )
        .context("building remote client")?,
    );
    let transport = Arc::new(NatsTransport::new(client_info.clone()));
    let network = NetworkMonitor::new(
        false,
        Duration::from_millis(config.network.min_transition_interval_ms),
    );
    let store = Arc::new(JsonFileStore::for_tenant(&state).context("opening entity store")?);

    let settings = CoordinatorSettings::from_config(&config, client_info, credentials);
    let coordinator = SyncCoordinator::new(
        settings,
        Collaborators {
            store,
            encryptor,
            remote: Arc::clone(&remote),
            transport,
            network: Arc::clone(&network),
            state: Some(state),
        },
    )
    .context("starting sync coordinator")?;

    let cancel = CancellationToken::new();
    let monitor = network.spawn(cancel.clone());
    let probe = spawn_probe(
        remote,
        Arc::clone(&network),
        Duration::from_secs(config.remote.probe_interval_secs.max(1)),
        cancel.clone(),
    );

    // Start Prometheus metrics endpoint
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = SyncMetrics::new(&mut registry);
        crate::metrics::spawn_recorder(metrics, Arc::clone(&coordinator), cancel.clone());
        let health = HealthState {
            registry: Arc::new(registry),
            coordinator: Arc::clone(&coordinator),
            network: Arc::clone(&network),
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, health).await {
                error!("metrics server failed: {e:#}");
            }
        });
    }

    let run_loop = coordinator.start(cancel.clone());
    notify_ready();

    wait_for_shutdown().await?;
    info!(pending = coordinator.queue().size(), "shutting down");
    cancel.cancel();

    // The run loop flushes queue and metadata on its way out
    if let Err(e) = run_loop.await {
        warn!("sync run loop ended abnormally: {e}");
        coordinator.shutdown().await;
    }
    let _ = tokio::join!(monitor, probe);
    info!("daemon stopped");
    Ok(())
}

async fn build_encryptor(
    config: &OfsConfig,
    state: &TenantState,
    tenant: &TenantId,
    passphrase: Option<SecretString>,
) -> Result<Arc<dyn Encryptor>> {
    if !config.crypto.enabled {
        warn!("payload encryption disabled: payloads leave this device in plaintext");
        return Ok(Arc::new(PlaintextEncryptor));
    }
    let passphrase =
        passphrase.context("crypto.enabled is true but no passphrase was given (OFFSYNC_PASSPHRASE)")?;

    let salt_path = config
        .crypto
        .salt_file
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(|| state.dir().join("kdf.salt"));
    let params = KdfParams {
        mem_cost_kib: config.crypto.argon2_mem_cost_kib,
        time_cost: config.crypto.argon2_time_cost,
        parallelism: config.crypto.argon2_parallelism,
    };
    let tenant = tenant.as_str().to_string();

    // Argon2id blocks for a noticeable time; run it off the async workers
    let cipher = tokio::task::spawn_blocking(move || -> Result<PayloadCipher> {
        let salt = load_or_create_salt(&salt_path)?;
        let master = derive_master_key(&passphrase, &salt, &params)?;
        PayloadCipher::new(&master, &tenant)
    })
    .await
    .context("key derivation task")??;

    info!("payload encryption enabled");
    Ok(Arc::new(cipher))
}

/// Periodically ping the remote and feed the result to the network monitor.
fn spawn_probe(
    remote: Arc<dyn RemoteApi>,
    network: Arc<NetworkMonitor>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reachable = match tokio::time::timeout(every, remote.ping()).await {
                        Ok(Ok(())) => true,
                        // The server answered; credentials are the coordinator's concern
                        Ok(Err(SyncError::Auth(_))) => true,
                        Ok(Err(e)) => {
                            debug!(kind = e.kind(), "reachability probe failed: {e}");
                            false
                        }
                        Err(_) => {
                            debug!("reachability probe timed out");
                            false
                        }
                    };
                    network.report(reachable);
                }
            }
        }
    })
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

fn notify_ready() {
    // sd_notify(READY=1) when running under systemd; no-op without $NOTIFY_SOCKET
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_expands_to_home() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(
            expand_tilde(Path::new("~/.local/share/offsync")),
            PathBuf::from(home).join(".local/share/offsync")
        );
        assert_eq!(
            expand_tilde(Path::new("/var/lib/offsync")),
            PathBuf::from("/var/lib/offsync")
        );
    }

    #[test]
    fn state_dir_is_scoped_by_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OfsConfig::default();
        config.daemon.state_dir = dir.path().to_path_buf();
        config.remote.tenant_id = "acme".into();

        let (tenant, state) = open_state(&config).unwrap();
        assert_eq!(tenant.as_str(), "acme");
        assert_eq!(state.dir(), dir.path().join("acme"));
    }

    #[tokio::test]
    async fn plaintext_when_crypto_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OfsConfig::default();
        config.daemon.state_dir = dir.path().to_path_buf();
        config.crypto.enabled = false;
        let (tenant, state) = open_state(&config).unwrap();

        let encryptor = build_encryptor(&config, &state, &tenant, None).await.unwrap();
        assert_eq!(encryptor.encrypt(b"{}").unwrap(), b"{}");
    }

    #[tokio::test]
    async fn crypto_requires_a_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OfsConfig::default();
        config.daemon.state_dir = dir.path().to_path_buf();
        let (tenant, state) = open_state(&config).unwrap();

        let err = build_encryptor(&config, &state, &tenant, None)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("OFFSYNC_PASSPHRASE"));
    }

    #[tokio::test]
    async fn cipher_is_stable_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OfsConfig::default();
        config.daemon.state_dir = dir.path().to_path_buf();
        config.crypto.argon2_mem_cost_kib = 1024;
        config.crypto.argon2_time_cost = 1;
        config.crypto.argon2_parallelism = 1;
        let (tenant, state) = open_state(&config).unwrap();
        let passphrase = || Some(SecretString::from("correct horse battery staple"));

        let first = build_encryptor(&config, &state, &tenant, passphrase()).await.unwrap();
        let sealed = first.encrypt(br#"{"amount":50}"#).unwrap();
        let second = build_encryptor(&config, &state, &tenant, passphrase()).await.unwrap();
        assert_eq!(second.decrypt(&sealed).unwrap(), br#"{"amount":50}"#);
        assert!(state.dir().join("kdf.salt").exists());
    }
}
