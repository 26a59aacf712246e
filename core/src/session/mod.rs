// Provisioning session — one device, one transport, one security session
//
// Operations are serialized by a non-blocking guard: a second call while one
// is in flight fails with SessionBusy instead of queueing, so frame counters
// never interleave. Disconnect bypasses the guard and aborts whatever is
// pending.

pub mod events;
pub mod state;

pub use events::{ProvisionPhase, SessionEvent};
pub use state::LifecycleState;

use crate::protocol::{
    self, ConfigRequest, ConfigResponse, ProtocolError, ScanRequest, ScanResponse, StationState,
    VersionInfo, EP_CONFIG, EP_SCAN, EP_VERSION, MAX_SCAN_RESULTS, SCAN_RESULT_PAGE,
};
use crate::security::{
    HandshakeFailure, ProofOfPossession, SecurityError, SecuritySession, SecurityState,
    SecurityType,
};
use crate::transport::{exchange, ConnectivityEvent, DeviceDescriptor, Transport, TransportError};
use crate::wifi::{sort_networks, WifiCredentials, WifiNetwork};
use crate::{ConnectFailure, ProvisionError};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use state::Lifecycle;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Session timing and device scan parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on opening the link
    pub connect_timeout: Duration,
    /// Bound on each handshake round trip
    pub handshake_timeout: Duration,
    /// Bound on each application round trip
    pub request_timeout: Duration,
    /// Pause between device status polls
    pub status_poll_interval: Duration,
    /// Status polls before giving up on a scan or join
    pub status_poll_attempts: u32,
    pub scan_passive: bool,
    /// Channels scanned per dwell group (0 scans all at once)
    pub scan_group_channels: u8,
    /// Dwell time per channel
    pub scan_period_ms: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            status_poll_interval: Duration::from_secs(1),
            status_poll_attempts: 30,
            scan_passive: false,
            scan_group_channels: 5,
            scan_period_ms: 120,
        }
    }
}

impl SessionConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_status_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.status_poll_interval = interval;
        self.status_poll_attempts = attempts;
        self
    }

    pub fn with_passive_scan(mut self, passive: bool) -> Self {
        self.scan_passive = passive;
        self
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        let timeouts = [
            ("connect_timeout", self.connect_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("request_timeout", self.request_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ProvisionError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.status_poll_attempts == 0 {
            return Err(ProvisionError::InvalidConfig(
                "status_poll_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// INTERNAL FAILURE PLUMBING
// ============================================================================

/// Why one secured round trip did not produce a reply
#[derive(Debug, Error)]
enum ExchangeFailure {
    #[error("aborted by disconnect")]
    Aborted,
    #[error("{0}")]
    Transport(TransportError),
    #[error("{0}")]
    Security(SecurityError),
    #[error("{0}")]
    Protocol(ProtocolError),
}

impl ExchangeFailure {
    /// Map to the caller taxonomy. Counter breaches and a dead security
    /// session keep their own variants; everything else is the operation's.
    fn into_error(self, wrap: impl FnOnce(String) -> ProvisionError) -> ProvisionError {
        match self {
            ExchangeFailure::Aborted => ProvisionError::OperationAbortedByDisconnect,
            ExchangeFailure::Security(SecurityError::SequenceViolation { expected, received }) => {
                ProvisionError::SequenceViolation { expected, received }
            }
            ExchangeFailure::Security(SecurityError::SessionNotSecured) => {
                ProvisionError::SessionNotSecured
            }
            other => wrap(other.to_string()),
        }
    }
}

fn handshake_error(e: SecurityError) -> ProvisionError {
    match e {
        SecurityError::HandshakeFailed(failure) => ProvisionError::HandshakeFailed(failure),
        other => ProvisionError::HandshakeFailed(HandshakeFailure::Protocol(other.to_string())),
    }
}

fn unexpected(what: &str, got: impl std::fmt::Debug) -> String {
    format!("expected {} response, got {:?}", what, got)
}

async fn wait_for_abort(mut abort: watch::Receiver<bool>) {
    loop {
        let down = *abort.borrow_and_update();
        if down {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// SESSION
// ============================================================================

struct SessionInner {
    descriptor: DeviceDescriptor,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    lifecycle: Lifecycle,
    security: Mutex<Option<SecuritySession>>,
    version: RwLock<Option<VersionInfo>>,
    op_guard: tokio::sync::Mutex<()>,
    abort: watch::Sender<bool>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn device_id(&self) -> String {
        self.descriptor.id.clone()
    }

    /// Tear down local state. True if this call moved the session to Disconnected.
    fn shut_down(&self) -> bool {
        self.abort.send_replace(true);
        if let Some(security) = self.security.lock().as_mut() {
            security.close();
        }
        self.lifecycle.disconnect()
    }

    fn link_lost(&self, reason: &str) {
        if self.shut_down() {
            warn!("link to {} lost: {}", self.descriptor.id, reason);
            self.emit(SessionEvent::Disconnected {
                device_id: self.device_id(),
            });
        }
    }
}

/// Orchestrates connect → secure → scan / provision / custom data for one device.
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct ProvisioningSession {
    inner: Arc<SessionInner>,
}

impl ProvisioningSession {
    pub fn new(
        descriptor: DeviceDescriptor,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Self {
        let (abort, _) = watch::channel(false);
        let (events, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(SessionInner {
                descriptor,
                transport,
                config,
                lifecycle: Lifecycle::new(),
                security: Mutex::new(None),
                version: RwLock::new(None),
                op_guard: tokio::sync::Mutex::new(()),
                abort,
                events,
            }),
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    pub fn device_id(&self) -> &str {
        &self.inner.descriptor.id
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.get()
    }

    /// `None` until a handshake has been attempted
    pub fn security_state(&self) -> Option<SecurityState> {
        self.inner.security.lock().as_ref().map(SecuritySession::state)
    }

    pub fn version_info(&self) -> Option<VersionInfo> {
        self.inner.version.read().clone()
    }

    /// Lifecycle and progress notifications, independent of any in-flight call
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    // ------------------------------------------------------------------------
    // Guards
    // ------------------------------------------------------------------------

    fn begin(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, ProvisionError> {
        self.inner
            .op_guard
            .try_lock()
            .map_err(|_| ProvisionError::SessionBusy)
    }

    fn advance(&self, operation: &'static str, next: LifecycleState) -> Result<(), ProvisionError> {
        self.inner
            .lifecycle
            .advance(next)
            .map_err(|state| match state {
                LifecycleState::Disconnected => ProvisionError::OperationAbortedByDisconnect,
                state => ProvisionError::InvalidState { operation, state },
            })
    }

    fn require_secured(&self) -> Result<(), ProvisionError> {
        if !self.state().is_secured() {
            return Err(ProvisionError::NoActiveDevice);
        }
        match self.security_state() {
            Some(SecurityState::Established) => Ok(()),
            _ => Err(ProvisionError::SessionNotSecured),
        }
    }

    /// Run `fut` unless the session is torn down first
    async fn unless_disconnected<F: Future>(&self, fut: F) -> Option<F::Output> {
        let abort = self.inner.abort.subscribe();
        tokio::select! {
            biased;
            _ = wait_for_abort(abort) => None,
            output = fut => Some(output),
        }
    }

    async fn pause(&self, interval: Duration) -> Result<(), ProvisionError> {
        self.unless_disconnected(tokio::time::sleep(interval))
            .await
            .ok_or(ProvisionError::OperationAbortedByDisconnect)
    }

    fn with_security<T>(
        &self,
        f: impl FnOnce(&mut SecuritySession) -> Result<T, SecurityError>,
    ) -> Result<T, SecurityError> {
        let mut guard = self.inner.security.lock();
        match guard.as_mut() {
            Some(security) => f(security),
            None => Err(SecurityError::SessionNotSecured),
        }
    }

    async fn secure_exchange(&self, endpoint: &str, request: &[u8]) -> Result<Vec<u8>, ExchangeFailure> {
        let frame = self
            .with_security(|s| s.encrypt(request))
            .map_err(ExchangeFailure::Security)?;
        let reply = self
            .unless_disconnected(exchange(
                &*self.inner.transport,
                endpoint,
                &frame,
                self.inner.config.request_timeout,
            ))
            .await
            .ok_or(ExchangeFailure::Aborted)?
            .map_err(ExchangeFailure::Transport)?;
        self.with_security(|s| s.decrypt(&reply))
            .map_err(ExchangeFailure::Security)
    }

    async fn request<Req, Resp>(&self, endpoint: &str, request: &Req) -> Result<Resp, ExchangeFailure>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let plaintext = protocol::encode(request).map_err(ExchangeFailure::Protocol)?;
        let reply = self.secure_exchange(endpoint, &plaintext).await?;
        protocol::decode(&reply).map_err(ExchangeFailure::Protocol)
    }

    fn progress(&self, phase: ProvisionPhase) {
        debug!("{}: {}", self.device_id(), phase);
        self.inner.emit(SessionEvent::Progress {
            device_id: self.inner.device_id(),
            phase,
        });
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    /// Created → Connecting → Connected. Never retried.
    pub async fn connect(&self) -> Result<(), ProvisionError> {
        let _op = self.begin()?;
        self.advance("connect", LifecycleState::Connecting)?;

        let transport = self.inner.transport.clone();
        let link_events = transport.subscribe();
        let descriptor = &self.inner.descriptor;
        let timeout = self.inner.config.connect_timeout;

        let opened = self
            .unless_disconnected(tokio::time::timeout(timeout, transport.open(descriptor)))
            .await
            .ok_or(ProvisionError::OperationAbortedByDisconnect)?;
        let failure = match opened {
            Ok(Ok(())) => None,
            Ok(Err(TransportError::NotFound(_))) => Some(ConnectFailure::NotFound),
            Ok(Err(e)) => Some(ConnectFailure::TransportError(e.to_string())),
            Err(_) => Some(ConnectFailure::TransportError(
                TransportError::Timeout(timeout.as_millis() as u64).to_string(),
            )),
        };

        if let Some(reason) = failure {
            warn!("connect to {} failed: {}, releasing the link", descriptor.id, reason);
            transport.close().await;
            let _ = self.inner.lifecycle.advance(LifecycleState::ConnectionFailed);
            self.inner.emit(SessionEvent::ConnectionFailed {
                device_id: self.inner.device_id(),
                reason: reason.to_string(),
            });
            return Err(ProvisionError::ConnectionFailed { reason });
        }

        self.advance("connect", LifecycleState::Connected)?;
        self.watch_link(link_events);
        info!("connected to {} over {}", descriptor.id, transport.kind());
        self.inner.emit(SessionEvent::Connected {
            device_id: self.inner.device_id(),
        });
        Ok(())
    }

    /// Fold transport connectivity changes into the lifecycle
    fn watch_link(&self, mut link_events: broadcast::Receiver<ConnectivityEvent>) {
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let abort = self.inner.abort.subscribe();

        tokio::spawn(async move {
            let aborted = wait_for_abort(abort);
            tokio::pin!(aborted);
            loop {
                let event = tokio::select! {
                    _ = &mut aborted => break,
                    event = link_events.recv() => event,
                };
                let reason = match event {
                    Ok(ConnectivityEvent::Connected { .. }) => continue,
                    Ok(ConnectivityEvent::Disconnected { .. }) => "device disconnected".to_string(),
                    Ok(ConnectivityEvent::Failed { reason, .. }) => reason,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("dropped {} connectivity event(s)", missed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Some(inner) = weak.upgrade() {
                    inner.link_lost(&reason);
                }
                break;
            }
        });
    }

    /// Read the plaintext version endpoint. Valid once connected.
    pub async fn read_version_info(&self) -> Result<VersionInfo, ProvisionError> {
        let _op = self.begin()?;
        if !self.state().is_linked() {
            return Err(ProvisionError::NoActiveDevice);
        }

        let reply = self
            .unless_disconnected(exchange(
                &*self.inner.transport,
                EP_VERSION,
                &[],
                self.inner.config.request_timeout,
            ))
            .await
            .ok_or(ProvisionError::OperationAbortedByDisconnect)?
            .map_err(|e| ProvisionError::VersionQueryFailed(e.to_string()))?;
        let info = VersionInfo::from_json(&reply)
            .map_err(|e| ProvisionError::VersionQueryFailed(e.to_string()))?;

        debug!("{} speaks {} (sec_ver {:?})", self.device_id(), info.prov.ver, info.prov.sec_ver);
        *self.inner.version.write() = Some(info.clone());
        Ok(info)
    }

    // ------------------------------------------------------------------------
    // Security
    // ------------------------------------------------------------------------

    /// Connected → Securing → Secured. A rejected secret ends the session in
    /// ConnectionFailed; it is never retried here.
    pub async fn establish_security(
        &self,
        security_type: SecurityType,
        pop: ProofOfPossession,
    ) -> Result<(), ProvisionError> {
        let _op = self.begin()?;
        let state = self.state();
        if state != LifecycleState::Connected {
            return Err(match state {
                LifecycleState::Created | LifecycleState::Connecting => ProvisionError::NoActiveDevice,
                LifecycleState::Disconnected => ProvisionError::NoActiveDevice,
                state => ProvisionError::InvalidState {
                    operation: "establish_security",
                    state,
                },
            });
        }

        let advertised = self.inner.version.read().as_ref().and_then(|v| v.prov.sec_ver);
        if let Some(device_version) = advertised {
            if device_version != security_type.version() {
                return Err(ProvisionError::HandshakeFailed(HandshakeFailure::Protocol(format!(
                    "device supports security version {}, not {}",
                    device_version, security_type
                ))));
            }
        }

        self.advance("establish_security", LifecycleState::Securing)?;

        let scheme = security_type.scheme();
        let mut security = SecuritySession::new(security_type);
        let outcome = self
            .unless_disconnected(security.handshake(
                &*scheme,
                pop,
                &*self.inner.transport,
                self.inner.config.handshake_timeout,
            ))
            .await;

        let result = match outcome {
            None => Err(ProvisionError::OperationAbortedByDisconnect),
            Some(result) => result.map_err(handshake_error),
        };
        {
            // Checked under the slot lock: a teardown either sees this
            // session stored or has already raised the abort flag.
            let mut slot = self.inner.security.lock();
            if *self.inner.abort.borrow() {
                security.close();
            }
            *slot = Some(security);
        }

        match result {
            Ok(()) => {
                self.advance("establish_security", LifecycleState::Secured)?;
                info!("{} secured with {}", self.device_id(), security_type);
                Ok(())
            }
            Err(ProvisionError::OperationAbortedByDisconnect) => {
                Err(ProvisionError::OperationAbortedByDisconnect)
            }
            Err(e) => {
                warn!("securing {} failed: {}", self.device_id(), e);
                if self.inner.lifecycle.advance(LifecycleState::ConnectionFailed).is_ok() {
                    self.inner.emit(SessionEvent::ConnectionFailed {
                        device_id: self.inner.device_id(),
                        reason: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Wi-Fi scan
    // ------------------------------------------------------------------------

    /// Networks visible to the device, strongest first
    pub async fn scan_wifi_networks(&self) -> Result<Vec<WifiNetwork>, ProvisionError> {
        let _op = self.begin()?;
        let state = self.state();
        if state == LifecycleState::Provisioned {
            return Err(ProvisionError::InvalidState {
                operation: "scan_wifi_networks",
                state,
            });
        }
        self.require_secured()?;

        let config = &self.inner.config;
        let fail = ProvisionError::ScanFailed;

        let start = ScanRequest::Start {
            blocking: true,
            passive: config.scan_passive,
            group_channels: config.scan_group_channels,
            period_ms: config.scan_period_ms,
        };
        match self.request(EP_SCAN, &start).await.map_err(|e| e.into_error(fail))? {
            ScanResponse::Started { status } if status.is_success() => {}
            ScanResponse::Started { status } => {
                return Err(fail(format!("device refused scan: {}", status)))
            }
            other => return Err(fail(unexpected("scan start", other))),
        }

        let mut total = None;
        for _ in 0..config.status_poll_attempts {
            match self
                .request(EP_SCAN, &ScanRequest::Status)
                .await
                .map_err(|e| e.into_error(fail))?
            {
                ScanResponse::Status {
                    status,
                    finished,
                    result_count,
                } if status.is_success() => {
                    if finished {
                        total = Some(result_count);
                        break;
                    }
                }
                ScanResponse::Status { status, .. } => {
                    return Err(fail(format!("scan status failed: {}", status)))
                }
                other => return Err(fail(unexpected("scan status", other))),
            }
            self.pause(config.status_poll_interval).await?;
        }
        let total = total.ok_or_else(|| fail("device scan did not finish".into()))?;
        if total > MAX_SCAN_RESULTS {
            return Err(fail(format!(
                "device reported {} results, limit is {}",
                total, MAX_SCAN_RESULTS
            )));
        }

        let mut networks = Vec::new();
        let mut start_index = 0;
        while start_index < total {
            let count = (total - start_index).min(SCAN_RESULT_PAGE);
            let page = ScanRequest::Results { start_index, count };
            let received = match self.request(EP_SCAN, &page).await.map_err(|e| e.into_error(fail))? {
                ScanResponse::Results { status, entries } if status.is_success() => {
                    let received = entries.len();
                    networks.extend(entries.into_iter().take(count as usize).map(WifiNetwork::from));
                    received
                }
                ScanResponse::Results { status, .. } => {
                    return Err(fail(format!("scan results failed: {}", status)))
                }
                other => return Err(fail(unexpected("scan results", other))),
            };
            // A short page means the device has nothing more to give.
            if received < count as usize {
                warn!(
                    "{} reported {} results but returned {}",
                    self.device_id(),
                    total,
                    networks.len()
                );
                break;
            }
            start_index += count;
        }

        sort_networks(&mut networks);
        debug!("{} reports {} network(s)", self.device_id(), networks.len());
        Ok(networks)
    }

    // ------------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------------

    /// Secured → Provisioning → Provisioned. Resolves with the joined ssid.
    pub async fn send_credentials(&self, ssid: &str, passphrase: &str) -> Result<String, ProvisionError> {
        self.send_credentials_with(WifiCredentials::new(ssid, passphrase))
            .await
    }

    /// Like [`send_credentials`](Self::send_credentials) with BSSID / channel hints.
    ///
    /// Each phase is reported on the event stream as it completes. On failure
    /// the session returns to Secured so the caller can decide whether to retry.
    pub async fn send_credentials_with(&self, credentials: WifiCredentials) -> Result<String, ProvisionError> {
        let _op = self.begin()?;
        self.require_secured()?;
        self.advance("send_credentials", LifecycleState::Provisioning)?;

        let result = self.deliver_credentials(&credentials).await;
        match &result {
            Ok(ssid) => {
                self.advance("send_credentials", LifecycleState::Provisioned)?;
                info!("{} joined {}", self.device_id(), ssid);
            }
            Err(ProvisionError::OperationAbortedByDisconnect) => {}
            Err(e) => {
                warn!("provisioning {} failed: {}", self.device_id(), e);
                let _ = self.inner.lifecycle.advance(LifecycleState::Secured);
            }
        }
        result
    }

    async fn deliver_credentials(&self, credentials: &WifiCredentials) -> Result<String, ProvisionError> {
        let config = &self.inner.config;

        let set = ConfigRequest::SetConfig {
            ssid: credentials.ssid.clone(),
            passphrase: credentials.passphrase.clone(),
            bssid: credentials.bssid,
            channel: credentials.channel,
        };
        let applied = ProvisionError::ConfigApplyFailed;
        match self.request(EP_CONFIG, &set).await.map_err(|e| e.into_error(applied))? {
            ConfigResponse::SetConfig { status } if status.is_success() => {}
            ConfigResponse::SetConfig { status } => {
                return Err(applied(format!("device rejected configuration: {}", status)))
            }
            other => return Err(applied(unexpected("set config", other))),
        }
        self.progress(ProvisionPhase::ConfigApplied);

        let context = ProvisionError::SessionCreationFailed;
        let reply = self
            .request(EP_CONFIG, &ConfigRequest::ApplyConfig)
            .await
            .map_err(|e| e.into_error(context))?;
        self.progress(ProvisionPhase::ConfigSent);
        match reply {
            ConfigResponse::ApplyConfig { status } if status.is_success() => {}
            ConfigResponse::ApplyConfig { status } => {
                return Err(context(format!("device refused to apply: {}", status)))
            }
            other => return Err(context(unexpected("apply config", other))),
        }
        self.progress(ProvisionPhase::SessionContextReady);

        let join = ProvisionError::WifiConfigFailed;
        let mut joining_reported = false;
        for _ in 0..config.status_poll_attempts {
            match self
                .request(EP_CONFIG, &ConfigRequest::GetStatus)
                .await
                .map_err(|e| e.into_error(join))?
            {
                ConfigResponse::Status { status, station } if status.is_success() => match station {
                    StationState::Connected { ssid, .. } => {
                        self.progress(ProvisionPhase::Joined { ssid: ssid.clone() });
                        return Ok(ssid);
                    }
                    StationState::ConnectionFailed { reason } => {
                        return Err(ProvisionError::ProvisioningFailedFromDevice { reason })
                    }
                    StationState::Connecting | StationState::Disconnected => {
                        if !joining_reported {
                            joining_reported = true;
                            self.progress(ProvisionPhase::Joining);
                        }
                    }
                },
                ConfigResponse::Status { status, .. } => {
                    return Err(join(format!("status query failed: {}", status)))
                }
                other => return Err(join(unexpected("status", other))),
            }
            self.pause(config.status_poll_interval).await?;
        }

        Err(join(format!(
            "no join result after {} status checks",
            config.status_poll_attempts
        )))
    }

    // ------------------------------------------------------------------------
    // Custom data
    // ------------------------------------------------------------------------

    /// Encrypted request/response on an application endpoint.
    ///
    /// Safe to repeat at the transport level. Whether the device-side effect
    /// is idempotent is up to the endpoint.
    pub async fn send_custom_data(&self, endpoint: &str, payload: &[u8]) -> Result<Vec<u8>, ProvisionError> {
        let _op = self.begin()?;
        self.require_secured()?;
        if endpoint.is_empty() {
            return Err(ProvisionError::CustomExchangeFailed {
                cause: "empty endpoint name".into(),
            });
        }

        self.secure_exchange(endpoint, payload)
            .await
            .map_err(|e| e.into_error(|cause| ProvisionError::CustomExchangeFailed { cause }))
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Always succeeds locally. Pending operations end with
    /// `OperationAbortedByDisconnect`.
    pub async fn disconnect(&self) {
        let changed = self.inner.shut_down();
        self.inner.transport.close().await;
        if changed {
            info!("disconnected from {}", self.device_id());
            self.inner.emit(SessionEvent::Disconnected {
                device_id: self.inner.device_id(),
            });
        }
    }
}

impl std::fmt::Debug for ProvisioningSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningSession")
            .field("device", &self.inner.descriptor.id)
            .field("state", &self.state())
            .field("security", &self.security_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{DeviceProfile, SimulatedDevice};
    use crate::transport::TransportKind;
    use crate::wifi::WifiAuthMode;

    fn profile() -> DeviceProfile {
        DeviceProfile::new("AA:BB", "PROV_123")
            .with_security(SecurityType::SecureV2)
            .with_pop("abcd1234")
            .with_network("Home", -40, WifiAuthMode::Wpa2Psk, "secret123")
            .with_network("Cafe", -70, WifiAuthMode::Open, "")
    }

    fn fast_config() -> SessionConfig {
        SessionConfig::default()
            .with_request_timeout(Duration::from_secs(2))
            .with_status_polling(Duration::from_millis(5), 20)
    }

    fn session_for(device: &Arc<SimulatedDevice>) -> ProvisioningSession {
        let descriptor = DeviceDescriptor::new("AA:BB", "PROV_123", TransportKind::Ble);
        ProvisioningSession::new(descriptor, device.clone(), fast_config())
    }

    async fn secured(device: &Arc<SimulatedDevice>) -> ProvisioningSession {
        let session = session_for(device);
        session.connect().await.unwrap();
        session
            .establish_security(SecurityType::SecureV2, "abcd1234".into())
            .await
            .unwrap();
        session
    }

    #[test]
    fn test_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());
        let zero = SessionConfig::default().with_request_timeout(Duration::ZERO);
        assert!(matches!(zero.validate(), Err(ProvisionError::InvalidConfig(_))));
        let no_polls = SessionConfig::default().with_status_polling(Duration::from_millis(1), 0);
        assert!(no_polls.validate().is_err());
    }

    #[tokio::test]
    async fn test_full_flow_reaches_provisioned() {
        let device = Arc::new(SimulatedDevice::new(profile()));
        let session = secured(&device).await;
        assert_eq!(session.state(), LifecycleState::Secured);
        assert_eq!(session.security_state(), Some(SecurityState::Established));

        let networks = session.scan_wifi_networks().await.unwrap();
        assert_eq!(networks[0].ssid, "Home");
        assert_eq!(networks[1].ssid, "Cafe");

        let ssid = session.send_credentials("Home", "secret123").await.unwrap();
        assert_eq!(ssid, "Home");
        assert_eq!(session.state(), LifecycleState::Provisioned);
    }

    #[tokio::test]
    async fn test_progress_events_in_order() {
        let device = Arc::new(SimulatedDevice::new(profile().with_join_delay(2)));
        let session = secured(&device).await;
        let mut events = session.subscribe();

        session.send_credentials("Home", "secret123").await.unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Progress { phase, .. } = event {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                ProvisionPhase::ConfigApplied,
                ProvisionPhase::ConfigSent,
                ProvisionPhase::SessionContextReady,
                ProvisionPhase::Joining,
                ProvisionPhase::Joined { ssid: "Home".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_wrong_passphrase_is_device_failure_and_retryable() {
        let device = Arc::new(SimulatedDevice::new(profile()));
        let session = secured(&device).await;

        match session.send_credentials("Home", "nope").await {
            Err(ProvisionError::ProvisioningFailedFromDevice { reason }) => {
                assert_eq!(reason, crate::protocol::DeviceFailureReason::AuthError)
            }
            other => panic!("Wrong error type: {:?}", other),
        }
        assert_eq!(session.state(), LifecycleState::Secured);

        assert_eq!(session.send_credentials("Home", "secret123").await.unwrap(), "Home");
    }

    #[tokio::test]
    async fn test_unknown_network_reported_by_device() {
        let device = Arc::new(SimulatedDevice::new(profile()));
        let session = secured(&device).await;

        match session.send_credentials("Elsewhere", "pw").await {
            Err(ProvisionError::ProvisioningFailedFromDevice { reason }) => {
                assert_eq!(reason, crate::protocol::DeviceFailureReason::NetworkNotFound)
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[tokio::test]
    async fn test_config_rejection_is_local_failure() {
        let device = Arc::new(SimulatedDevice::new(
            profile().with_failure(crate::simulator::SimulatedFailure::RejectConfig),
        ));
        let session = secured(&device).await;

        match session.send_credentials("Home", "secret123").await {
            Err(ProvisionError::ConfigApplyFailed(_)) => (),
            _ => panic!("Wrong error type"),
        }
    }

    #[tokio::test]
    async fn test_apply_rejection_is_session_creation_failure() {
        let device = Arc::new(SimulatedDevice::new(
            profile().with_failure(crate::simulator::SimulatedFailure::RejectApply),
        ));
        let session = secured(&device).await;

        match session.send_credentials("Home", "secret123").await {
            Err(ProvisionError::SessionCreationFailed(_)) => (),
            _ => panic!("Wrong error type"),
        }
    }

    #[tokio::test]
    async fn test_join_never_settles() {
        let device = Arc::new(SimulatedDevice::new(profile().with_join_delay(u32::MAX)));
        let session = secured(&device).await;

        match session.send_credentials("Home", "secret123").await {
            Err(ProvisionError::WifiConfigFailed(_)) => (),
            _ => panic!("Wrong error type"),
        }
    }

    #[tokio::test]
    async fn test_scan_refused_after_provisioned() {
        let device = Arc::new(SimulatedDevice::new(profile()));
        let session = secured(&device).await;
        session.send_credentials("Home", "secret123").await.unwrap();

        match session.scan_wifi_networks().await {
            Err(ProvisionError::InvalidState { state, .. }) => {
                assert_eq!(state, LifecycleState::Provisioned)
            }
            _ => panic!("Wrong error type"),
        }
        // Custom data stays available.
        assert_eq!(session.send_custom_data("echo", b"hi").await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_version_info_gates_scheme() {
        let device = Arc::new(SimulatedDevice::new(profile()));
        let session = session_for(&device);
        session.connect().await.unwrap();

        let info = session.read_version_info().await.unwrap();
        assert_eq!(info.prov.sec_ver, Some(2));

        match session
            .establish_security(SecurityType::SecureV1, "abcd1234".into())
            .await
        {
            Err(ProvisionError::HandshakeFailed(HandshakeFailure::Protocol(_))) => (),
            _ => panic!("Wrong error type"),
        }
        assert_eq!(session.state(), LifecycleState::Connected);
        assert!(session
            .establish_security(SecurityType::SecureV2, "abcd1234".into())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_version_needs_link() {
        let device = Arc::new(SimulatedDevice::new(profile()));
        let session = session_for(&device);
        match session.read_version_info().await {
            Err(ProvisionError::NoActiveDevice) => (),
            _ => panic!("Wrong error type"),
        }
    }

    /// Link whose open never succeeds; counts teardowns
    struct RefusingLink {
        hang: bool,
        closes: std::sync::atomic::AtomicUsize,
        events: broadcast::Sender<ConnectivityEvent>,
    }

    impl RefusingLink {
        fn new(hang: bool) -> Arc<Self> {
            let (events, _) = broadcast::channel(4);
            Arc::new(Self {
                hang,
                closes: std::sync::atomic::AtomicUsize::new(0),
                events,
            })
        }

        fn closes(&self) -> usize {
            self.closes.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Transport for RefusingLink {
        fn kind(&self) -> TransportKind {
            TransportKind::Ble
        }

        async fn open(&self, _descriptor: &DeviceDescriptor) -> Result<(), TransportError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(TransportError::Io("gatt error 133".to_string()))
        }

        async fn send(&self, _endpoint: &str, _data: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::NotConnected)
        }

        async fn receive(&self, _endpoint: &str) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::NotConnected)
        }

        async fn close(&self) {
            self.closes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
            self.events.subscribe()
        }
    }

    #[tokio::test]
    async fn test_failed_open_releases_link() {
        let link = RefusingLink::new(false);
        let descriptor = DeviceDescriptor::new("AA:BB", "PROV_123", TransportKind::Ble);
        let session = ProvisioningSession::new(descriptor, link.clone(), fast_config());

        match session.connect().await {
            Err(ProvisionError::ConnectionFailed {
                reason: ConnectFailure::TransportError(_),
            }) => (),
            _ => panic!("Wrong error type"),
        }
        assert_eq!(session.state(), LifecycleState::ConnectionFailed);
        assert_eq!(link.closes(), 1);
    }

    #[tokio::test]
    async fn test_open_timeout_releases_link() {
        let link = RefusingLink::new(true);
        let descriptor = DeviceDescriptor::new("AA:BB", "PROV_123", TransportKind::Ble);
        let config = fast_config().with_connect_timeout(Duration::from_millis(20));
        let session = ProvisioningSession::new(descriptor, link.clone(), config);

        match session.connect().await {
            Err(ProvisionError::ConnectionFailed {
                reason: ConnectFailure::TransportError(detail),
            }) => assert!(detail.contains("20")),
            _ => panic!("Wrong error type"),
        }
        assert_eq!(link.closes(), 1);
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid() {
        let device = Arc::new(SimulatedDevice::new(profile()));
        let session = session_for(&device);
        session.connect().await.unwrap();
        match session.connect().await {
            Err(ProvisionError::InvalidState { state, .. }) => {
                assert_eq!(state, LifecycleState::Connected)
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_emits_once() {
        let device = Arc::new(SimulatedDevice::new(profile()));
        let session = secured(&device).await;
        let mut events = session.subscribe();

        session.disconnect().await;
        session.disconnect().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Disconnected { .. }) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
        assert_eq!(session.state(), LifecycleState::Disconnected);
        assert_eq!(session.security_state(), Some(SecurityState::Closed));
    }

    #[tokio::test]
    async fn test_plaintext_scheme_session() {
        let device = Arc::new(SimulatedDevice::new(
            profile().with_security(SecurityType::None),
        ));
        let session = session_for(&device);
        session.connect().await.unwrap();
        session
            .establish_security(SecurityType::None, ProofOfPossession::empty())
            .await
            .unwrap();

        assert_eq!(session.send_custom_data("echo", b"plain").await.unwrap(), b"plain");
    }
}
