/// BLE (Bluetooth Low Energy) provisioning transport
///
/// The platform owns the radio and exposes a GATT client through
/// [`BleGattBridge`]. [`BleTransport`] layers endpoint routing and chunk
/// framing on top of it:
///
/// - **gatt**: endpoint → characteristic mapping, MTU fragmentation and reassembly
///
/// The framing logic is testable without Bluetooth hardware.

pub mod gatt;

pub use gatt::{
    characteristic_uuid, ChunkHeader, EndpointMap, GattError, GattFragmenter, GattReassembler,
    DEFAULT_ATT_PAYLOAD, MAX_ATT_PAYLOAD, PROV_SERVICE_UUID,
};

use crate::transport::abstraction::{
    ConnectivityEvent, DeviceDescriptor, Transport, TransportError, TransportKind,
    META_SERVICE_UUID,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Callback invoked by the platform when the link drops
pub type LinkLostCallback = Box<dyn Fn(String) + Send + Sync>;

// ============================================================================
// PLATFORM BRIDGE TRAIT
// ============================================================================

/// GATT client operations provided by the host platform
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BleGattBridge: Send + Sync {
    /// Connect and discover the given primary service
    async fn connect(&self, address: &str, service: Uuid) -> Result<(), TransportError>;

    async fn write(&self, characteristic: Uuid, data: Vec<u8>) -> Result<(), TransportError>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;

    async fn disconnect(&self);

    /// Usable ATT payload for writes on the current link
    fn att_payload(&self) -> usize;

    /// Register the link-loss callback
    fn on_link_lost(&self, callback: LinkLostCallback);
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct BleTransportConfig {
    /// Service UUID used when the descriptor does not carry one
    pub service_uuid: Uuid,
    /// Custom endpoint names, allocated after the standard endpoints in order
    pub custom_endpoints: Vec<String>,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            service_uuid: PROV_SERVICE_UUID,
            custom_endpoints: Vec::new(),
        }
    }
}

impl BleTransportConfig {
    pub fn with_custom_endpoint(mut self, name: impl Into<String>) -> Self {
        self.custom_endpoints.push(name.into());
        self
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

struct LinkState {
    device_id: Option<String>,
    endpoints: Option<EndpointMap>,
}

pub struct BleTransport {
    bridge: Arc<dyn BleGattBridge>,
    config: BleTransportConfig,
    link: Mutex<LinkState>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl BleTransport {
    pub fn new(bridge: Arc<dyn BleGattBridge>, config: BleTransportConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            bridge,
            config,
            link: Mutex::new(LinkState {
                device_id: None,
                endpoints: None,
            }),
            events,
        }
    }

    fn endpoint_map_for(&self, descriptor: &DeviceDescriptor) -> Result<EndpointMap, TransportError> {
        let service = match descriptor.metadata(META_SERVICE_UUID) {
            Some(raw) => Uuid::parse_str(raw).map_err(|e| {
                TransportError::ConnectionFailed(format!("bad service uuid {}: {}", raw, e))
            })?,
            None => self.config.service_uuid,
        };
        let mut map = EndpointMap::standard(service);
        for name in &self.config.custom_endpoints {
            map.register_custom(name)
                .map_err(|e| TransportError::Unsupported(e.to_string()))?;
        }
        Ok(map)
    }

    fn characteristic(&self, endpoint: &str) -> Result<Uuid, TransportError> {
        let link = self.link.lock();
        let map = link.endpoints.as_ref().ok_or(TransportError::NotConnected)?;
        map.resolve(endpoint)
            .map_err(|_| TransportError::UnknownEndpoint(endpoint.to_string()))
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn open(&self, descriptor: &DeviceDescriptor) -> Result<(), TransportError> {
        let map = self.endpoint_map_for(descriptor)?;
        self.bridge.connect(&descriptor.id, map.service()).await?;

        let events = self.events.clone();
        self.bridge.on_link_lost(Box::new(move |device_id| {
            warn!("BLE link to {} lost", device_id);
            let _ = events.send(ConnectivityEvent::Disconnected { device_id });
        }));

        {
            let mut link = self.link.lock();
            link.device_id = Some(descriptor.id.clone());
            link.endpoints = Some(map);
        }
        info!("BLE link open to {}", descriptor.id);
        let _ = self.events.send(ConnectivityEvent::Connected {
            device_id: descriptor.id.clone(),
        });
        Ok(())
    }

    async fn send(&self, endpoint: &str, data: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(endpoint)?;
        let fragmenter = GattFragmenter::new(self.bridge.att_payload().min(MAX_ATT_PAYLOAD))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let chunks = fragmenter
            .fragment(data)
            .map_err(|e| TransportError::Io(e.to_string()))?;

        debug!("{} ← {} bytes in {} chunk(s)", endpoint, data.len(), chunks.len());
        for chunk in chunks {
            self.bridge.write(characteristic, chunk).await?;
        }
        Ok(())
    }

    async fn receive(&self, endpoint: &str) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(endpoint)?;
        let mut reassembler = GattReassembler::new();
        loop {
            let chunk = self.bridge.read(characteristic).await?;
            match reassembler.push(&chunk) {
                Ok(Some(payload)) => {
                    debug!("{} → {} bytes", endpoint, payload.len());
                    return Ok(payload);
                }
                Ok(None) => continue,
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }

    async fn close(&self) {
        let device_id = {
            let mut link = self.link.lock();
            link.endpoints = None;
            link.device_id.take()
        };
        if let Some(device_id) = device_id {
            self.bridge.disconnect().await;
            debug!("BLE link to {} closed", device_id);
            let _ = self.events.send(ConnectivityEvent::Disconnected { device_id });
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EP_SESSION;
    use parking_lot::Mutex as PlMutex;
    use std::collections::VecDeque;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor::new("AA:BB", "PROV_123", TransportKind::Ble)
    }

    fn connected_bridge() -> MockBleGattBridge {
        let mut bridge = MockBleGattBridge::new();
        bridge.expect_connect().returning(|_, service| {
            assert_eq!(service, PROV_SERVICE_UUID);
            Ok(())
        });
        bridge.expect_on_link_lost().returning(|_| ());
        bridge.expect_att_payload().return_const(DEFAULT_ATT_PAYLOAD);
        bridge
    }

    #[tokio::test]
    async fn test_send_before_open_is_rejected() {
        let transport = BleTransport::new(Arc::new(MockBleGattBridge::new()), Default::default());
        match transport.send(EP_SESSION, b"hello").await {
            Err(TransportError::NotConnected) => (),
            _ => panic!("Wrong error type"),
        }
    }

    #[tokio::test]
    async fn test_send_splits_into_att_sized_writes() {
        let mut bridge = connected_bridge();
        let session_char = characteristic_uuid(PROV_SERVICE_UUID, 0xFF51);
        bridge
            .expect_write()
            .withf(move |uuid, data| *uuid == session_char && data.len() <= DEFAULT_ATT_PAYLOAD)
            .times(3)
            .returning(|_, _| Ok(()));

        let transport = BleTransport::new(Arc::new(bridge), Default::default());
        transport.open(&descriptor()).await.expect("open");
        // 40 bytes at 16 bytes per chunk is three writes.
        transport.send(EP_SESSION, &[7u8; 40]).await.expect("send");
    }

    #[tokio::test]
    async fn test_receive_reads_until_complete() {
        let fragmenter = GattFragmenter::new(DEFAULT_ATT_PAYLOAD).unwrap();
        let chunks: VecDeque<Vec<u8>> = fragmenter.fragment(&[9u8; 50]).unwrap().into();
        let chunks = Arc::new(PlMutex::new(chunks));

        let mut bridge = connected_bridge();
        let reads = chunks.clone();
        bridge
            .expect_read()
            .returning(move |_| Ok(reads.lock().pop_front().unwrap_or_default()));

        let transport = BleTransport::new(Arc::new(bridge), Default::default());
        transport.open(&descriptor()).await.unwrap();
        let payload = transport.receive(EP_SESSION).await.expect("payload");

        assert_eq!(payload, vec![9u8; 50]);
        assert!(chunks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let transport = BleTransport::new(Arc::new(connected_bridge()), Default::default());
        transport.open(&descriptor()).await.unwrap();

        match transport.send("not-registered", b"x").await {
            Err(TransportError::UnknownEndpoint(name)) => assert_eq!(name, "not-registered"),
            _ => panic!("Wrong error type"),
        }
    }

    #[tokio::test]
    async fn test_custom_endpoint_and_service_from_descriptor() {
        let service = Uuid::from_u128(0x1234_5678_0000_1000_8000_00805f9b34fb);
        let mut bridge = MockBleGattBridge::new();
        bridge.expect_connect().returning(move |_, requested| {
            assert_eq!(requested, service);
            Ok(())
        });
        bridge.expect_on_link_lost().returning(|_| ());
        bridge.expect_att_payload().return_const(128usize);
        let custom_char = characteristic_uuid(service, 0xFF54);
        bridge
            .expect_write()
            .withf(move |uuid, _| *uuid == custom_char)
            .times(1)
            .returning(|_, _| Ok(()));

        let config = BleTransportConfig::default().with_custom_endpoint("custom-data");
        let transport = BleTransport::new(Arc::new(bridge), config);
        let descriptor = descriptor().with_metadata(META_SERVICE_UUID, service.to_string());
        transport.open(&descriptor).await.unwrap();
        transport.send("custom-data", b"ping").await.expect("send");
    }

    #[tokio::test]
    async fn test_close_emits_disconnected() {
        let mut bridge = connected_bridge();
        bridge.expect_disconnect().times(1).returning(|| ());

        let transport = BleTransport::new(Arc::new(bridge), Default::default());
        let mut events = transport.subscribe();
        transport.open(&descriptor()).await.unwrap();
        transport.close().await;
        // Second close is a no-op.
        transport.close().await;

        assert_eq!(
            events.recv().await.unwrap(),
            ConnectivityEvent::Connected { device_id: "AA:BB".into() }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectivityEvent::Disconnected { device_id: "AA:BB".into() }
        );
    }
}
