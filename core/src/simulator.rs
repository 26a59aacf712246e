//! Software device and radio
//!
//! [`SimulatedDevice`] is a device-side protocol engine behind the
//! [`Transport`] trait: it answers the version, handshake, scan and config
//! endpoints and echoes anything else. [`SimulatedRadio`] advertises a set of
//! such devices through [`DiscoveryBackend`] and hands them out through
//! [`TransportProvider`]. Used for dry runs and tests, no radio required.

use crate::protocol::{
    self, ConfigRequest, ConfigResponse, DeviceFailureReason, ScanEntry, ScanRequest,
    ScanResponse, SessionMessage, StationState, Status, VersionInfo, CAP_WIFI_SCAN, EP_CONFIG,
    EP_SCAN, EP_SESSION, EP_VERSION, SCAN_RESULT_PAGE,
};
use crate::security::{
    EcdhResponder, PlaintextCipher, ProofOfPossession, SecuritySession, SecurityType,
};
use crate::transport::{
    Advertisement, ConnectivityEvent, DeviceDescriptor, DiscoveryBackend, DiscoveryEvent,
    Transport, TransportError, TransportKind, TransportProvider, META_SOFTAP_PASSWORD,
};
use crate::wifi::{WifiAuthMode, WifiCredentials, WifiNetwork};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Address handed out by a successful simulated join
const SIMULATED_IP: [u8; 4] = [192, 168, 1, 42];

// ============================================================================
// DEVICE PROFILE
// ============================================================================

/// Scripted device-side failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedFailure {
    /// Refuse to start a Wi-Fi scan
    RejectScan,
    /// Refuse the Wi-Fi configuration
    RejectConfig,
    /// Refuse to apply a stored configuration
    RejectApply,
    /// Report this reason after the join attempt
    JoinFails(DeviceFailureReason),
    /// Claim this many scan results regardless of the visible networks
    ReportScanCount(u32),
}

#[derive(Debug, Clone)]
struct SimulatedNetwork {
    network: WifiNetwork,
    passphrase: String,
}

/// Everything a simulated device knows about itself
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub address: String,
    pub name: String,
    pub kind: TransportKind,
    pub security: SecurityType,
    pub pop: ProofOfPossession,
    pub capabilities: Vec<String>,
    pub failure: Option<SimulatedFailure>,
    /// Status polls answered with `Connecting` before the join settles
    pub join_delay: u32,
    /// Added before every response
    pub response_delay: Duration,
    pub rssi: i16,
    pub softap_password: Option<String>,
    networks: Vec<SimulatedNetwork>,
}

impl DeviceProfile {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            kind: TransportKind::Ble,
            security: SecurityType::SecureV2,
            pop: ProofOfPossession::empty(),
            capabilities: vec![CAP_WIFI_SCAN.to_string()],
            failure: None,
            join_delay: 1,
            response_delay: Duration::ZERO,
            rssi: -50,
            softap_password: None,
            networks: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_security(mut self, security: SecurityType) -> Self {
        self.security = security;
        self
    }

    pub fn with_pop(mut self, pop: &str) -> Self {
        self.pop = ProofOfPossession::from(pop);
        self
    }

    pub fn with_capability(mut self, capability: &str) -> Self {
        self.capabilities.push(capability.to_string());
        self
    }

    /// A visible network. The device joins it only with `passphrase`.
    pub fn with_network(mut self, ssid: &str, rssi: i32, auth: WifiAuthMode, passphrase: &str) -> Self {
        let mut network = WifiNetwork::new(ssid, rssi, auth);
        network.channel = 1 + (self.networks.len() % 11) as u8;
        network.bssid = [0x24, 0x0a, 0xc4, 0x00, 0x00, self.networks.len() as u8];
        self.networks.push(SimulatedNetwork {
            network,
            passphrase: passphrase.to_string(),
        });
        self
    }

    pub fn with_failure(mut self, failure: SimulatedFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_join_delay(mut self, polls: u32) -> Self {
        self.join_delay = polls;
        self
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_softap_password(mut self, password: &str) -> Self {
        self.softap_password = Some(password.to_string());
        self
    }

    fn fails_with(&self, failure: SimulatedFailure) -> bool {
        self.failure == Some(failure)
    }
}

// ============================================================================
// DEVICE
// ============================================================================

struct DeviceState {
    linked: bool,
    responder: Option<EcdhResponder>,
    security: Option<SecuritySession>,
    outbox: HashMap<String, Vec<u8>>,
    scan_finished: bool,
    staged: Option<WifiCredentials>,
    station: StationState,
    outcome: Option<StationState>,
    polls: u32,
    replay_next: bool,
    last_secure_reply: Option<Vec<u8>>,
    joined: Option<String>,
}

impl DeviceState {
    fn fresh(profile: &DeviceProfile) -> Self {
        let (responder, security) = match profile.security {
            SecurityType::None => (
                None,
                Some(SecuritySession::established(
                    SecurityType::None,
                    Box::new(PlaintextCipher),
                )),
            ),
            scheme => (Some(EcdhResponder::new(scheme, profile.pop.clone())), None),
        };
        Self {
            linked: false,
            responder,
            security,
            outbox: HashMap::new(),
            scan_finished: false,
            staged: None,
            station: StationState::Disconnected,
            outcome: None,
            polls: 0,
            replay_next: false,
            last_secure_reply: None,
            joined: None,
        }
    }
}

fn io(detail: impl std::fmt::Display) -> TransportError {
    TransportError::Io(detail.to_string())
}

/// In-process device speaking the provisioning protocol
pub struct SimulatedDevice {
    profile: DeviceProfile,
    state: Mutex<DeviceState>,
    out_of_range: AtomicBool,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl SimulatedDevice {
    pub fn new(profile: DeviceProfile) -> Self {
        let (events, _) = broadcast::channel(16);
        let state = DeviceState::fresh(&profile);
        Self {
            profile,
            state: Mutex::new(state),
            out_of_range: AtomicBool::new(false),
            events,
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// What discovery reports for this device
    pub fn descriptor(&self) -> DeviceDescriptor {
        let mut descriptor =
            DeviceDescriptor::new(&self.profile.address, &self.profile.name, self.profile.kind)
                .with_rssi(self.profile.rssi);
        if let Some(password) = &self.profile.softap_password {
            descriptor = descriptor.with_metadata(META_SOFTAP_PASSWORD, password);
        }
        descriptor
    }

    fn advertisement(&self) -> Advertisement {
        let mut advert = Advertisement::new(&self.profile.address, Some(self.profile.name.as_str()))
            .with_rssi(self.profile.rssi);
        if let Some(password) = &self.profile.softap_password {
            advert
                .metadata
                .insert(META_SOFTAP_PASSWORD.to_string(), password.clone());
        }
        advert
    }

    /// Out-of-range devices stop advertising and refuse links
    pub fn set_out_of_range(&self, out_of_range: bool) {
        self.out_of_range.store(out_of_range, Ordering::SeqCst);
    }

    pub fn is_out_of_range(&self) -> bool {
        self.out_of_range.load(Ordering::SeqCst)
    }

    pub fn is_linked(&self) -> bool {
        self.state.lock().linked
    }

    /// Ssid of the network the device joined, if any
    pub fn joined_network(&self) -> Option<String> {
        self.state.lock().joined.clone()
    }

    /// Answer the next secured request with the previous secured reply, verbatim
    pub fn replay_next_response(&self) {
        self.state.lock().replay_next = true;
    }

    /// Drop the link from the device side
    pub fn drop_link(&self) {
        if self.unlink() {
            info!("simulated device {} dropped the link", self.profile.address);
        }
    }

    fn unlink(&self) -> bool {
        let was_linked = {
            let mut state = self.state.lock();
            let was_linked = state.linked;
            state.linked = false;
            state.security = None;
            state.outbox.clear();
            was_linked
        };
        if was_linked {
            let _ = self.events.send(ConnectivityEvent::Disconnected {
                device_id: self.profile.address.clone(),
            });
        }
        was_linked
    }

    fn version_reply(&self) -> Result<Vec<u8>, TransportError> {
        let capabilities: Vec<&str> = self.profile.capabilities.iter().map(String::as_str).collect();
        VersionInfo::new(self.profile.security.version(), &capabilities)
            .to_json()
            .map_err(io)
    }

    fn session_reply(state: &mut DeviceState, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        let command: SessionMessage = protocol::decode(data).map_err(io)?;
        let response = match state.responder.as_mut() {
            Some(responder) => {
                let (response, session) = responder.respond(command);
                if session.is_some() {
                    state.security = session;
                }
                response
            }
            None => SessionMessage::Response0 {
                status: Status::InvalidSecScheme,
                device_pubkey: [0u8; 32],
                device_random: [0u8; 16],
            },
        };
        protocol::encode(&response).map_err(io)
    }

    fn secure_reply(&self, state: &mut DeviceState, endpoint: &str, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let request = match state.security.as_mut() {
            Some(session) if session.is_established() => session
                .decrypt(frame)
                .map_err(|e| io(format!("device rejected frame: {}", e)))?,
            _ => return Err(io("device has no secure session")),
        };

        let reply = match endpoint {
            EP_SCAN => self.handle_scan(state, &request)?,
            EP_CONFIG => self.handle_config(state, &request)?,
            _ => request,
        };

        if state.replay_next {
            state.replay_next = false;
            if let Some(stale) = state.last_secure_reply.clone() {
                debug!("replaying stale frame on {}", endpoint);
                return Ok(stale);
            }
        }

        let sealed = match state.security.as_mut() {
            Some(session) => session.encrypt(&reply).map_err(io)?,
            None => return Err(io("device has no secure session")),
        };
        state.last_secure_reply = Some(sealed.clone());
        Ok(sealed)
    }

    fn handle_scan(&self, state: &mut DeviceState, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let networks = &self.profile.networks;
        let response = match protocol::decode::<ScanRequest>(request).map_err(io)? {
            ScanRequest::Start { .. } if self.profile.fails_with(SimulatedFailure::RejectScan) => {
                ScanResponse::Started {
                    status: Status::InternalError,
                }
            }
            ScanRequest::Start { .. } => {
                state.scan_finished = true;
                ScanResponse::Started {
                    status: Status::Success,
                }
            }
            ScanRequest::Status => ScanResponse::Status {
                status: Status::Success,
                finished: state.scan_finished,
                result_count: match self.profile.failure {
                    Some(SimulatedFailure::ReportScanCount(count)) => count,
                    _ => networks.len() as u32,
                },
            },
            ScanRequest::Results { start_index, count } => {
                let start = (start_index as usize).min(networks.len());
                let end = (start + count.min(SCAN_RESULT_PAGE) as usize).min(networks.len());
                let entries = networks[start..end]
                    .iter()
                    .map(|n| ScanEntry {
                        ssid: n.network.ssid.clone(),
                        channel: n.network.channel,
                        rssi: n.network.rssi,
                        bssid: n.network.bssid,
                        auth: n.network.auth,
                    })
                    .collect();
                ScanResponse::Results {
                    status: Status::Success,
                    entries,
                }
            }
        };
        protocol::encode(&response).map_err(io)
    }

    fn join_outcome(&self, credentials: &WifiCredentials) -> StationState {
        if let Some(SimulatedFailure::JoinFails(reason)) = self.profile.failure {
            return StationState::ConnectionFailed { reason };
        }
        match self
            .profile
            .networks
            .iter()
            .find(|n| n.network.ssid == credentials.ssid)
        {
            None => StationState::ConnectionFailed {
                reason: DeviceFailureReason::NetworkNotFound,
            },
            Some(n) if n.network.auth.requires_passphrase() && n.passphrase != credentials.passphrase => {
                StationState::ConnectionFailed {
                    reason: DeviceFailureReason::AuthError,
                }
            }
            Some(n) => StationState::Connected {
                ssid: n.network.ssid.clone(),
                ip4: SIMULATED_IP,
                channel: n.network.channel,
            },
        }
    }

    fn handle_config(&self, state: &mut DeviceState, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let response = match protocol::decode::<ConfigRequest>(request).map_err(io)? {
            ConfigRequest::SetConfig { .. } if self.profile.fails_with(SimulatedFailure::RejectConfig) => {
                ConfigResponse::SetConfig {
                    status: Status::InvalidArgument,
                }
            }
            ConfigRequest::SetConfig {
                ssid,
                passphrase,
                bssid,
                channel,
            } => {
                let mut credentials = WifiCredentials::new(ssid, passphrase).with_channel(channel);
                credentials.bssid = bssid;
                state.staged = Some(credentials);
                ConfigResponse::SetConfig {
                    status: Status::Success,
                }
            }
            ConfigRequest::ApplyConfig if self.profile.fails_with(SimulatedFailure::RejectApply) => {
                ConfigResponse::ApplyConfig {
                    status: Status::InternalError,
                }
            }
            ConfigRequest::ApplyConfig => match state.staged.as_ref() {
                Some(credentials) => {
                    state.outcome = Some(self.join_outcome(credentials));
                    state.station = StationState::Connecting;
                    state.polls = 0;
                    ConfigResponse::ApplyConfig {
                        status: Status::Success,
                    }
                }
                None => ConfigResponse::ApplyConfig {
                    status: Status::InvalidProto,
                },
            },
            ConfigRequest::GetStatus => {
                if state.station == StationState::Connecting {
                    state.polls = state.polls.saturating_add(1);
                    if state.polls > self.profile.join_delay {
                        if let Some(outcome) = state.outcome.take() {
                            if let StationState::Connected { ssid, .. } = &outcome {
                                state.joined = Some(ssid.clone());
                            }
                            state.station = outcome;
                        }
                    }
                }
                ConfigResponse::Status {
                    status: Status::Success,
                    station: state.station.clone(),
                }
            }
        };
        protocol::encode(&response).map_err(io)
    }
}

#[async_trait]
impl Transport for SimulatedDevice {
    fn kind(&self) -> TransportKind {
        self.profile.kind
    }

    async fn open(&self, descriptor: &DeviceDescriptor) -> Result<(), TransportError> {
        if self.is_out_of_range() || descriptor.id != self.profile.address {
            return Err(TransportError::NotFound(descriptor.id.clone()));
        }
        {
            let mut state = self.state.lock();
            *state = DeviceState::fresh(&self.profile);
            state.linked = true;
        }
        let _ = self.events.send(ConnectivityEvent::Connected {
            device_id: self.profile.address.clone(),
        });
        Ok(())
    }

    async fn send(&self, endpoint: &str, data: &[u8]) -> Result<(), TransportError> {
        if !self.profile.response_delay.is_zero() {
            tokio::time::sleep(self.profile.response_delay).await;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.linked {
            return Err(TransportError::NotConnected);
        }
        let reply = match endpoint {
            EP_VERSION => self.version_reply()?,
            EP_SESSION => Self::session_reply(state, data)?,
            _ => self.secure_reply(state, endpoint, data)?,
        };
        state.outbox.insert(endpoint.to_string(), reply);
        Ok(())
    }

    async fn receive(&self, endpoint: &str) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        if !state.linked {
            return Err(TransportError::Disconnected);
        }
        state
            .outbox
            .remove(endpoint)
            .ok_or_else(|| io(format!("no reply pending on {}", endpoint)))
    }

    async fn close(&self) {
        self.unlink();
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// RADIO
// ============================================================================

/// Advertises simulated devices and opens links to them
pub struct SimulatedRadio {
    devices: RwLock<Vec<Arc<SimulatedDevice>>>,
    repeat_adverts: u32,
    advert_interval: Duration,
    start_failure: Option<String>,
    abort_reason: Option<String>,
    tasks: Mutex<Vec<(TransportKind, JoinHandle<()>)>>,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            repeat_adverts: 1,
            advert_interval: Duration::ZERO,
            start_failure: None,
            abort_reason: None,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Two bench devices: a BLE module and a SoftAP module, both with pop `abcd1234`
    pub fn demo() -> Self {
        let radio = Self::new().with_advert_interval(Duration::from_millis(100));
        radio.add_device(
            DeviceProfile::new("AA:BB", "PROV_123")
                .with_security(SecurityType::SecureV2)
                .with_pop("abcd1234")
                .with_rssi(-48)
                .with_network("Home", -40, WifiAuthMode::Wpa2Psk, "secret123")
                .with_network("Garage", -71, WifiAuthMode::WpaWpa2Psk, "garage-door")
                .with_network("Guest", -71, WifiAuthMode::Open, ""),
        );
        radio.add_device(
            DeviceProfile::new("PROV_AP42", "PROV_AP42")
                .with_kind(TransportKind::SoftAp)
                .with_softap_password("prov-ap-pass")
                .with_security(SecurityType::SecureV1)
                .with_pop("abcd1234")
                .with_rssi(-60)
                .with_network("Home", -55, WifiAuthMode::Wpa2Psk, "secret123"),
        );
        radio
    }

    /// Advertise every device this many times per scan
    pub fn with_repeated_adverts(mut self, rounds: u32) -> Self {
        self.repeat_adverts = rounds.max(1);
        self
    }

    pub fn with_advert_interval(mut self, interval: Duration) -> Self {
        self.advert_interval = interval;
        self
    }

    /// Refuse to start discovery
    pub fn with_start_failure(mut self, reason: &str) -> Self {
        self.start_failure = Some(reason.to_string());
        self
    }

    /// Abort every scan after the adverts
    pub fn with_abort(mut self, reason: &str) -> Self {
        self.abort_reason = Some(reason.to_string());
        self
    }

    pub fn add_device(&self, profile: DeviceProfile) -> Arc<SimulatedDevice> {
        let device = Arc::new(SimulatedDevice::new(profile));
        self.devices.write().push(device.clone());
        device
    }

    pub fn device(&self, address: &str) -> Option<Arc<SimulatedDevice>> {
        self.devices
            .read()
            .iter()
            .find(|d| d.profile.address == address)
            .cloned()
    }

    pub fn devices(&self) -> Vec<Arc<SimulatedDevice>> {
        self.devices.read().clone()
    }
}

#[async_trait]
impl DiscoveryBackend for SimulatedRadio {
    async fn start_discovery(
        &self,
        kind: TransportKind,
        sink: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<(), TransportError> {
        if let Some(reason) = &self.start_failure {
            return Err(TransportError::Unsupported(reason.clone()));
        }

        let adverts: Vec<Advertisement> = self
            .devices
            .read()
            .iter()
            .filter(|d| d.profile.kind == kind && !d.is_out_of_range())
            .map(|d| d.advertisement())
            .collect();
        let rounds = self.repeat_adverts;
        let interval = self.advert_interval;
        let abort = self.abort_reason.clone();

        let task = tokio::spawn(async move {
            for round in 0..rounds {
                for advert in &adverts {
                    if sink.send(DiscoveryEvent::Found(advert.clone())).await.is_err() {
                        return;
                    }
                }
                if round + 1 < rounds && !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
            }
            if let Some(reason) = abort {
                let _ = sink.send(DiscoveryEvent::Aborted(reason)).await;
            }
        });
        self.tasks.lock().push((kind, task));
        Ok(())
    }

    async fn stop_discovery(&self, kind: TransportKind) {
        self.tasks.lock().retain(|(task_kind, task)| {
            if *task_kind == kind {
                task.abort();
                false
            } else {
                true
            }
        });
    }
}

impl TransportProvider for SimulatedRadio {
    fn create(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Transport>, TransportError> {
        match self.device(&descriptor.id) {
            Some(device) if device.profile.kind == descriptor.transport_kind => {
                Ok(device as Arc<dyn Transport>)
            }
            _ => Err(TransportError::NotFound(descriptor.id.clone())),
        }
    }
}
