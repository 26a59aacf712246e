// Transport module — device byte pipes, discovery and platform seams

pub mod abstraction;
pub mod ble;
pub mod discovery;
pub mod softap;

pub use abstraction::{
    exchange, Advertisement, AllowAll, ConnectivityEvent, DeviceDescriptor, DiscoveryBackend,
    DiscoveryEvent, PermissionGate, Transport, TransportError, TransportKind, TransportProvider,
    META_SERVICE_UUID, META_SOFTAP_PASSWORD,
};
pub use ble::{BleGattBridge, BleTransport, BleTransportConfig, EndpointMap, PROV_SERVICE_UUID};
pub use discovery::{DeviceScan, DiscoveryConfig, DiscoveryScanner, FoundDevices, ScanError};
pub use softap::{SoftApHttpBridge, SoftApTransport};
