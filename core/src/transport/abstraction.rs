//! Transport abstraction layer for wifiprov
//!
//! Defines the byte-pipe boundary the provisioning core talks through, plus the
//! platform seams it needs for discovery and permission checks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

#[cfg(test)]
use mockall::automock;

/// Metadata key carrying the device access-point password for SoftAP descriptors
pub const META_SOFTAP_PASSWORD: &str = "softap_password";

/// Metadata key carrying a BLE service UUID advertised by the device
pub const META_SERVICE_UUID: &str = "service_uuid";

/// Transport families a device can be reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Bluetooth Low Energy GATT
    Ble,
    /// Device-hosted access point, HTTP endpoints
    SoftAp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ble => write!(f, "ble"),
            TransportKind::SoftAp => write!(f, "softap"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ble" | "bluetooth" => Ok(TransportKind::Ble),
            "softap" | "soft-ap" | "wifi" => Ok(TransportKind::SoftAp),
            other => Err(TransportError::Unsupported(format!(
                "unknown transport kind: {}",
                other
            ))),
        }
    }
}

/// A candidate device produced by discovery.
///
/// Identifies a device, not a connection. `id` is transport scoped: a BLE
/// address on [`TransportKind::Ble`], the access-point SSID on
/// [`TransportKind::SoftAp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub display_name: String,
    pub transport_kind: TransportKind,
    /// Last observed signal strength, if the radio reported one
    pub rssi: Option<i16>,
    /// Transport specific extras (SoftAP password, service UUID)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            transport_kind: kind,
            rssi: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Connectivity changes reported asynchronously by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Connected { device_id: String },
    Disconnected { device_id: String },
    Failed { device_id: String, reason: String },
}

/// Errors for transport operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    NotFound(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Link lost")]
    Disconnected,
    #[error("Timed out after {0} ms")]
    Timeout(u64),
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Point-to-point byte channel to one device.
///
/// Every exchange is addressed to a named endpoint. A `send` is always
/// followed by a `receive` on the same endpoint; the session layer never
/// pipelines requests.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Open the link to the addressed device
    async fn open(&self, descriptor: &DeviceDescriptor) -> Result<(), TransportError>;

    async fn send(&self, endpoint: &str, data: &[u8]) -> Result<(), TransportError>;

    async fn receive(&self, endpoint: &str) -> Result<Vec<u8>, TransportError>;

    /// Best-effort teardown. Never fails.
    async fn close(&self);

    /// Subscribe to connectivity changes for the current link
    fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent>;
}

/// One request/response exchange on `endpoint`, bounded by `timeout`.
///
/// Expiry is reported as [`TransportError::Timeout`], the same branch as any
/// other link failure.
pub async fn exchange(
    transport: &dyn Transport,
    endpoint: &str,
    payload: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let round_trip = async {
        transport.send(endpoint, payload).await?;
        transport.receive(endpoint).await
    };
    match tokio::time::timeout(timeout, round_trip).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Builds a fresh transport for a device of the given kind
pub trait TransportProvider: Send + Sync {
    fn create(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Transport>, TransportError>;
}

/// A single raw advertisement seen by the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub metadata: BTreeMap<String, String>,
}

impl Advertisement {
    pub fn new(address: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_string),
            rssi: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }
}

/// Events a discovery backend pushes while a scan is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found(Advertisement),
    /// The radio stopped early; no further events follow
    Aborted(String),
}

/// Platform radio used for discovery
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Begin discovery, pushing events into `sink` until stopped
    async fn start_discovery(
        &self,
        kind: TransportKind,
        sink: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<(), TransportError>;

    async fn stop_discovery(&self, kind: TransportKind);
}

/// Platform permission precondition (location / Bluetooth)
#[cfg_attr(test, automock)]
pub trait PermissionGate: Send + Sync {
    fn is_granted(&self, kind: TransportKind) -> bool;
}

/// Gate for hosts without a runtime permission model
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionGate for AllowAll {
    fn is_granted(&self, _kind: TransportKind) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("BLE".parse::<TransportKind>().unwrap(), TransportKind::Ble);
        assert_eq!("softap".parse::<TransportKind>().unwrap(), TransportKind::SoftAp);
        assert!("zigbee".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_transport_kind_display_roundtrips() {
        for kind in [TransportKind::Ble, TransportKind::SoftAp] {
            assert_eq!(kind.to_string().parse::<TransportKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_descriptor_metadata() {
        let descriptor = DeviceDescriptor::new("PROV_AP", "PROV_AP", TransportKind::SoftAp)
            .with_metadata(META_SOFTAP_PASSWORD, "abcd1234")
            .with_rssi(-52);

        assert_eq!(descriptor.metadata(META_SOFTAP_PASSWORD), Some("abcd1234"));
        assert_eq!(descriptor.metadata(META_SERVICE_UUID), None);
        assert_eq!(descriptor.rssi, Some(-52));
    }

    #[test]
    fn test_allow_all_gate() {
        assert!(AllowAll.is_granted(TransportKind::Ble));
        assert!(AllowAll.is_granted(TransportKind::SoftAp));
    }
}
