//! Shared fakes for the sync integration tests: an in-memory sync server, a
//! scripted realtime transport and an obfuscating encryptor.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use offsync_core::config::OfsConfig;
use offsync_core::{now_millis, ClientInfo, OfsResult, Operation, SyncError, TenantId};
use offsync_sync::checksum::{checksum_bytes, encode_value};
use offsync_sync::protocol::{
    BatchRequest, BatchResponse, ChangesResponse, ChannelMessage, ItemErrorKind, ItemResult,
    RemoteMutation,
};
use offsync_sync::{
    Collaborators, Connection, CoordinatorSettings, Credentials, Encryptor, MemoryStore,
    MessageSink, NetworkMonitor, RealtimeTransport, RemoteApi, SyncCoordinator, SyncEvent,
    TenantState,
};
use secrecy::SecretString;

// ── Encryptor ────────────────────────────────────────────────────────────────

/// XOR with a fixed byte: payloads on the wire differ from plaintext, which is
/// all the tests need to tell encrypted from raw.
pub struct XorEncryptor(pub u8);

impl Encryptor for XorEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> OfsResult<Vec<u8>> {
        Ok(plaintext.iter().map(|b| b ^ self.0).collect())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> OfsResult<Vec<u8>> {
        Ok(ciphertext.iter().map(|b| b ^ self.0).collect())
    }
}

pub const KEY: u8 = 0x5a;

/// A mutation as another device would produce it.
pub fn foreign_mutation(
    device: &str,
    entity_type: &str,
    entity_id: &str,
    value: serde_json::Value,
    timestamp: u64,
) -> RemoteMutation {
    let plaintext = encode_value(&value);
    RemoteMutation {
        entity_type: entity_type.into(),
        entity_id: entity_id.into(),
        operation: Operation::Update,
        checksum: checksum_bytes(&plaintext),
        payload: XorEncryptor(KEY).encrypt(&plaintext).unwrap(),
        timestamp,
        device_id: Some(device.into()),
    }
}

// ── Fake sync server ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Accept,
    /// Every item fails with this kind
    Reject(ItemErrorKind),
    /// The whole request fails with a network error
    NetworkDown,
    /// The whole request fails with 401
    Unauthorized,
    /// Accept, but list every result twice
    DuplicateAcks,
}

#[derive(Default)]
struct ServerState {
    entities: BTreeMap<(String, String), RemoteMutation>,
    log: Vec<(u64, RemoteMutation)>,
    clock: u64,
    batches: Vec<BatchRequest>,
    scripted: VecDeque<BatchResponse>,
}

impl ServerState {
    fn tick(&mut self) -> u64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }

    fn record(&mut self, mutation: RemoteMutation) {
        let at = self.tick();
        self.entities.insert(
            (mutation.entity_type.clone(), mutation.entity_id.clone()),
            mutation.clone(),
        );
        self.log.push((at, mutation));
    }
}

pub struct FakeServer {
    state: Mutex<ServerState>,
    mode: Mutex<Mode>,
    delay: Mutex<Option<Duration>>,
    go_offline: Mutex<Option<Arc<NetworkMonitor>>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            mode: Mutex::new(Mode::Accept),
            delay: Mutex::new(None),
            go_offline: Mutex::new(None),
        })
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Return this response verbatim for the next batch.
    pub fn script(&self, response: BatchResponse) {
        self.state.lock().unwrap().scripted.push_back(response);
    }

    /// After the next batch is answered, report the network down and wait
    /// long enough for the monitor to commit the transition.
    pub fn drop_network_after_next_batch(&self, monitor: Arc<NetworkMonitor>) {
        *self.go_offline.lock().unwrap() = Some(monitor);
    }

    /// Inject a change as if another device had pushed it.
    pub fn inject(&self, mutation: RemoteMutation) {
        self.state.lock().unwrap().record(mutation);
    }

    pub fn batches(&self) -> Vec<BatchRequest> {
        self.state.lock().unwrap().batches.clone()
    }

    pub fn entity(&self, entity_type: &str, entity_id: &str) -> Option<RemoteMutation> {
        self.state
            .lock()
            .unwrap()
            .entities
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned()
    }

    /// Decrypted JSON value the server currently holds for an entity.
    pub fn value(&self, entity_type: &str, entity_id: &str) -> Option<serde_json::Value> {
        let mutation = self.entity(entity_type, entity_id)?;
        let plaintext = XorEncryptor(KEY).decrypt(&mutation.payload).unwrap();
        assert_eq!(checksum_bytes(&plaintext), mutation.checksum);
        Some(serde_json::from_slice(&plaintext).unwrap())
    }
}

#[async_trait]
impl RemoteApi for FakeServer {
    async fn send_batch(&self, request: &BatchRequest) -> OfsResult<BatchResponse> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mode = *self.mode.lock().unwrap();
        let response = {
            let mut state = self.state.lock().unwrap();
            state.batches.push(request.clone());
            match mode {
                Mode::NetworkDown => return Err(SyncError::Network("connection refused".into())),
                Mode::Unauthorized => return Err(SyncError::Auth("401 Unauthorized".into())),
                _ => {}
            }
            if let Some(scripted) = state.scripted.pop_front() {
                scripted
            } else if let Mode::Reject(kind) = mode {
                BatchResponse {
                    results: request
                        .items
                        .iter()
                        .map(|item| ItemResult::failed(&item.id, kind, "rejected by test server"))
                        .collect(),
                    ..BatchResponse::default()
                }
            } else {
                let mut results = Vec::new();
                for item in &request.items {
                    state.record(RemoteMutation {
                        entity_type: request.entity_type.clone(),
                        entity_id: item.entity_id.clone(),
                        operation: item.operation,
                        payload: item.payload.clone(),
                        checksum: item.checksum.clone(),
                        timestamp: item.timestamp,
                        device_id: Some(request.client_info.device_id.clone()),
                    });
                    results.push(ItemResult::ok(&item.id));
                    if mode == Mode::DuplicateAcks {
                        results.push(ItemResult::ok(&item.id));
                    }
                }
                BatchResponse {
                    results,
                    ..BatchResponse::default()
                }
            }
        };

        let monitor = self.go_offline.lock().unwrap().take();
        if let Some(monitor) = monitor {
            monitor.report(false);
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(response)
    }

    async fn fetch_changes(&self, since: u64, _client_info: &ClientInfo) -> OfsResult<ChangesResponse> {
        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::NetworkDown => return Err(SyncError::Network("connection refused".into())),
            Mode::Unauthorized => return Err(SyncError::Auth("401 Unauthorized".into())),
            _ => {}
        }
        let mut state = self.state.lock().unwrap();
        let server_time = state.tick();
        let changes = state
            .log
            .iter()
            .filter(|(at, _)| *at > since)
            .map(|(_, mutation)| mutation.clone())
            .collect();
        Ok(ChangesResponse {
            changes,
            server_time,
        })
    }

    async fn ping(&self) -> OfsResult<()> {
        Ok(())
    }
}

// ── Realtime transports ──────────────────────────────────────────────────────

pub type Inbound = mpsc::UnboundedSender<OfsResult<ChannelMessage>>;

pub enum Dial {
    /// Connect; the returned sender feeds the inbound stream and dropping it
    /// simulates a dropped connection.
    Accept(mpsc::UnboundedReceiver<OfsResult<ChannelMessage>>),
    Fail(SyncError),
}

pub struct RecordingSink {
    sent: Arc<Mutex<Vec<ChannelMessage>>>,
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send(&self, message: &ChannelMessage) -> OfsResult<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn close(&self) {}
}

/// Plays back a queue of dial outcomes; once exhausted every dial is refused.
pub struct ScriptedTransport {
    outcomes: Mutex<VecDeque<Dial>>,
    pub dials: Mutex<Vec<tokio::time::Instant>>,
    pub sent: Arc<Mutex<Vec<ChannelMessage>>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
            dials: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Queue a successful dial and return the handle that feeds it.
    pub fn accept_next(&self) -> Inbound {
        let (tx, rx) = mpsc::unbounded();
        self.outcomes.lock().unwrap().push_back(Dial::Accept(rx));
        tx
    }

    pub fn fail_next(&self, error: SyncError) {
        self.outcomes.lock().unwrap().push_back(Dial::Fail(error));
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }

    /// Seconds between consecutive dials.
    pub fn dial_gaps(&self) -> Vec<u64> {
        let dials = self.dials.lock().unwrap();
        dials
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect()
    }

    pub fn sent(&self) -> Vec<ChannelMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl RealtimeTransport for ScriptedTransport {
    async fn connect(
        &self,
        _endpoint: &str,
        _credentials: &Credentials,
        hello: &ChannelMessage,
    ) -> OfsResult<Connection> {
        self.dials.lock().unwrap().push(tokio::time::Instant::now());
        let outcome = self.outcomes.lock().unwrap().pop_front();
        match outcome {
            Some(Dial::Accept(rx)) => {
                let sink = Arc::new(RecordingSink {
                    sent: Arc::clone(&self.sent),
                });
                sink.send(hello).await?;
                Ok(Connection {
                    sink,
                    inbound: rx.boxed(),
                })
            }
            Some(Dial::Fail(e)) => Err(e),
            None => Err(SyncError::Network("connection refused".into())),
        }
    }
}

/// Always connects; the inbound stream never yields.
pub struct IdleTransport;

#[async_trait]
impl RealtimeTransport for IdleTransport {
    async fn connect(
        &self,
        _endpoint: &str,
        _credentials: &Credentials,
        _hello: &ChannelMessage,
    ) -> OfsResult<Connection> {
        Ok(Connection {
            sink: Arc::new(RecordingSink {
                sent: Arc::new(Mutex::new(Vec::new())),
            }),
            inbound: futures::stream::pending().boxed(),
        })
    }
}

// ── Devices ──────────────────────────────────────────────────────────────────

pub fn credentials() -> Credentials {
    Credentials {
        tenant_id: TenantId::new("acme").unwrap(),
        token: SecretString::from("session-token"),
    }
}

pub struct Device {
    pub coordinator: Arc<SyncCoordinator>,
    pub store: Arc<MemoryStore>,
    pub network: Arc<NetworkMonitor>,
}

pub struct DeviceBuilder {
    name: String,
    online: bool,
    settings: Box<dyn FnOnce(&mut CoordinatorSettings)>,
    state: Option<TenantState>,
    transport: Arc<dyn RealtimeTransport>,
}

impl DeviceBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            online: true,
            settings: Box::new(|_| {}),
            state: None,
            transport: Arc::new(IdleTransport),
        }
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    pub fn settings(mut self, tweak: impl FnOnce(&mut CoordinatorSettings) + 'static) -> Self {
        self.settings = Box::new(tweak);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn RealtimeTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn state(mut self, state: TenantState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn build(self, server: &Arc<FakeServer>) -> Device {
        let client_info = match &self.state {
            Some(state) => state
                .load_or_create_client_info(Some(self.name.clone()))
                .unwrap(),
            None => ClientInfo::generate(Some(self.name.clone())),
        };
        let mut settings =
            CoordinatorSettings::from_config(&OfsConfig::default(), client_info, credentials());
        (self.settings)(&mut settings);

        let store = Arc::new(MemoryStore::new());
        let network = NetworkMonitor::new(self.online, Duration::from_millis(2000));
        let coordinator = SyncCoordinator::new(
            settings,
            Collaborators {
                store: store.clone(),
                encryptor: Arc::new(XorEncryptor(KEY)),
                remote: server.clone(),
                transport: self.transport,
                network: Arc::clone(&network),
                state: self.state,
            },
        )
        .unwrap();
        Device {
            coordinator,
            store,
            network,
        }
    }
}

/// Wait (in virtual time when paused) for the first event matching `pred`.
pub async fn wait_for(
    events: &mut tokio::sync::broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}
