//! Caller-facing provisioning API
//!
//! [`ProvisioningClient`] owns discovery and hands out a [`SessionHandle`] per
//! connected device. There is no global "current device": every operation
//! names the session it acts on.

use crate::security::{ProofOfPossession, SecurityType};
use crate::session::{ProvisioningSession, SessionConfig, SessionEvent};
use crate::transport::{
    DeviceDescriptor, DeviceScan, DiscoveryBackend, DiscoveryConfig, DiscoveryScanner,
    FoundDevices, PermissionGate, TransportError, TransportKind, TransportProvider,
};
use crate::wifi::{WifiCredentials, WifiNetwork};
use crate::{ConnectFailure, LifecycleState, ProvisionError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Names one connected session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    session: ProvisioningSession,
}

impl SessionHandle {
    fn new(session: ProvisioningSession) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device(&self) -> &DeviceDescriptor {
        self.session.descriptor()
    }

    pub fn state(&self) -> LifecycleState {
        self.session.state()
    }

    /// Direct access for callers that drive the steps themselves
    pub fn session(&self) -> &ProvisioningSession {
        &self.session
    }
}

pub struct ProvisioningClient {
    scanner: DiscoveryScanner,
    transports: Arc<dyn TransportProvider>,
    gate: Arc<dyn PermissionGate>,
    session_config: SessionConfig,
}

impl ProvisioningClient {
    pub fn new(
        discovery: Arc<dyn DiscoveryBackend>,
        transports: Arc<dyn TransportProvider>,
        gate: Arc<dyn PermissionGate>,
    ) -> Self {
        Self {
            scanner: DiscoveryScanner::new(discovery, gate.clone()),
            transports,
            gate,
            session_config: SessionConfig::default(),
        }
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Result<Self, ProvisionError> {
        config.validate()?;
        self.session_config = config;
        Ok(self)
    }

    pub fn with_discovery_config(mut self, config: DiscoveryConfig) -> Self {
        self.scanner = self.scanner.with_config(config);
        self
    }

    /// Devices reported by the most recent scan
    pub fn found_devices(&self) -> FoundDevices {
        self.scanner.found_devices()
    }

    // ========================================================================
    // DISCOVERY
    // ========================================================================

    /// Scan to completion and return every matching device once
    pub async fn scan(
        &self,
        prefix: &str,
        kind: TransportKind,
        timeout: Duration,
    ) -> Result<Vec<DeviceDescriptor>, ProvisionError> {
        let scan = self.scanner.scan(prefix, kind, timeout).await?;
        Ok(scan.collect_all().await?)
    }

    /// Lazy variant of [`scan`](Self::scan). Drop or `stop()` it to cancel.
    pub async fn scan_stream(
        &self,
        prefix: &str,
        kind: TransportKind,
        timeout: Duration,
    ) -> Result<DeviceScan, ProvisionError> {
        Ok(self.scanner.scan(prefix, kind, timeout).await?)
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    /// Bind a fresh, unconnected session to `descriptor`
    pub fn open_session(&self, descriptor: &DeviceDescriptor) -> Result<SessionHandle, ProvisionError> {
        let kind = descriptor.transport_kind;
        if !self.gate.is_granted(kind) {
            return Err(ProvisionError::PermissionDenied(kind));
        }

        let transport = self.transports.create(descriptor).map_err(|e| {
            let reason = match e {
                TransportError::NotFound(_) => ConnectFailure::NotFound,
                other => ConnectFailure::TransportError(other.to_string()),
            };
            ProvisionError::ConnectionFailed { reason }
        })?;

        let session =
            ProvisioningSession::new(descriptor.clone(), transport, self.session_config.clone());
        Ok(SessionHandle::new(session))
    }

    /// Connect and secure in one call.
    ///
    /// The device's version endpoint is consulted first when it answers, so a
    /// scheme the device does not run is refused before any key exchange. On
    /// failure the link is closed and no handle is returned.
    pub async fn connect(
        &self,
        descriptor: &DeviceDescriptor,
        pop: ProofOfPossession,
        security: SecurityType,
    ) -> Result<SessionHandle, ProvisionError> {
        let handle = self.open_session(descriptor)?;
        let session = handle.session();

        session.connect().await?;
        if let Err(e) = session.read_version_info().await {
            warn!("{} did not report its version: {}", descriptor.id, e);
        }
        if let Err(e) = session.establish_security(security, pop).await {
            session.disconnect().await;
            return Err(e);
        }

        info!("session {} bound to {}", handle.id(), descriptor.id);
        Ok(handle)
    }

    /// Connect to an address reported by an earlier scan
    pub async fn connect_address(
        &self,
        id: &str,
        pop: ProofOfPossession,
        security: SecurityType,
    ) -> Result<SessionHandle, ProvisionError> {
        let descriptor = self.found_devices().get(id).ok_or_else(|| {
            warn!("{} was never discovered", id);
            ProvisionError::ConnectionFailed {
                reason: ConnectFailure::NotFound,
            }
        })?;
        self.connect(&descriptor, pop, security).await
    }

    pub async fn scan_wifi_networks(&self, handle: &SessionHandle) -> Result<Vec<WifiNetwork>, ProvisionError> {
        handle.session.scan_wifi_networks().await
    }

    /// Deliver credentials; resolves with the ssid the device joined
    pub async fn provision(
        &self,
        handle: &SessionHandle,
        ssid: &str,
        passphrase: &str,
    ) -> Result<String, ProvisionError> {
        handle.session.send_credentials(ssid, passphrase).await
    }

    pub async fn provision_with(
        &self,
        handle: &SessionHandle,
        credentials: WifiCredentials,
    ) -> Result<String, ProvisionError> {
        handle.session.send_credentials_with(credentials).await
    }

    pub async fn send_custom_data(
        &self,
        handle: &SessionHandle,
        endpoint: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProvisionError> {
        handle.session.send_custom_data(endpoint, payload).await
    }

    pub async fn disconnect(&self, handle: &SessionHandle) {
        handle.session.disconnect().await;
    }

    pub fn subscribe(&self, handle: &SessionHandle) -> broadcast::Receiver<SessionEvent> {
        handle.session.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{DeviceProfile, SimulatedRadio};
    use crate::transport::abstraction::MockPermissionGate;
    use crate::wifi::WifiAuthMode;

    fn radio() -> Arc<SimulatedRadio> {
        let radio = SimulatedRadio::new();
        radio.add_device(
            DeviceProfile::new("AA:BB", "PROV_123")
                .with_security(SecurityType::SecureV1)
                .with_pop("abcd1234")
                .with_network("Home", -40, WifiAuthMode::Wpa2Psk, "secret123"),
        );
        Arc::new(radio)
    }

    fn client_with_gate(gate: Arc<dyn PermissionGate>) -> ProvisioningClient {
        let radio = radio();
        ProvisioningClient::new(radio.clone(), radio, gate)
    }

    #[tokio::test]
    async fn test_connect_address_requires_discovery() {
        let client = client_with_gate(Arc::new(crate::transport::AllowAll));
        match client
            .connect_address("AA:BB", "abcd1234".into(), SecurityType::SecureV1)
            .await
        {
            Err(ProvisionError::ConnectionFailed {
                reason: ConnectFailure::NotFound,
            }) => (),
            _ => panic!("Wrong error type"),
        }

        let found = client
            .scan("PROV_", TransportKind::Ble, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let handle = client
            .connect_address("AA:BB", "abcd1234".into(), SecurityType::SecureV1)
            .await
            .unwrap();
        assert_eq!(handle.state(), LifecycleState::Secured);
        assert_eq!(handle.device().display_name, "PROV_123");
    }

    #[tokio::test]
    async fn test_permission_gate_blocks_connect() {
        let mut gate = MockPermissionGate::new();
        gate.expect_is_granted().returning(|_| false);
        let client = client_with_gate(Arc::new(gate));

        let descriptor = DeviceDescriptor::new("AA:BB", "PROV_123", TransportKind::Ble);
        match client
            .connect(&descriptor, "abcd1234".into(), SecurityType::SecureV1)
            .await
        {
            Err(ProvisionError::PermissionDenied(TransportKind::Ble)) => (),
            _ => panic!("Wrong error type"),
        }
    }

    #[tokio::test]
    async fn test_failed_connect_closes_link() {
        let client = client_with_gate(Arc::new(crate::transport::AllowAll));
        let descriptor = DeviceDescriptor::new("AA:BB", "PROV_123", TransportKind::Ble);

        match client
            .connect(&descriptor, "wrong".into(), SecurityType::SecureV1)
            .await
        {
            Err(ProvisionError::HandshakeFailed(crate::HandshakeFailure::WrongSecret)) => (),
            other => panic!("Wrong error type: {:?}", other),
        }

        // The device is free again for a correct attempt.
        let handle = client
            .connect(&descriptor, "abcd1234".into(), SecurityType::SecureV1)
            .await
            .unwrap();
        assert_ne!(handle.id(), Uuid::nil());
    }

    #[test]
    fn test_invalid_session_config_rejected() {
        let client = client_with_gate(Arc::new(crate::transport::AllowAll));
        let config = SessionConfig::default().with_connect_timeout(Duration::ZERO);
        assert!(matches!(
            client.with_session_config(config),
            Err(ProvisionError::InvalidConfig(_))
        ));
    }
}
