// BLE bridge — btleplug central driving the provisioning GATT service
//
// One adapter, one peripheral at a time. Discovery turns central events into
// advertisements; the GATT side resolves characteristics after service
// discovery and reports link loss through the registered callback.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wifiprov_core::transport::ble::{LinkLostCallback, DEFAULT_ATT_PAYLOAD};
use wifiprov_core::transport::{Advertisement, BleGattBridge, DiscoveryEvent, TransportError};

fn ble_error(e: btleplug::Error) -> TransportError {
    match e {
        btleplug::Error::DeviceNotFound => TransportError::NotFound("peripheral".to_string()),
        btleplug::Error::NotConnected => TransportError::NotConnected,
        btleplug::Error::TimedOut(d) => TransportError::Timeout(d.as_millis() as u64),
        btleplug::Error::PermissionDenied => {
            TransportError::Unsupported("Bluetooth permission denied".to_string())
        }
        other => TransportError::Io(other.to_string()),
    }
}

/// Connected peripheral and its resolved characteristics
struct Link {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
}

pub struct BtleplugBridge {
    adapter: Adapter,
    link: Mutex<Option<Link>>,
    on_lost: Arc<Mutex<Option<LinkLostCallback>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugBridge {
    /// Bind to the first Bluetooth adapter
    pub async fn first_adapter() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(ble_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ble_error)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Unsupported("no Bluetooth adapter".to_string()))?;
        if let Ok(info) = adapter.adapter_info().await {
            debug!("using Bluetooth adapter {}", info);
        }
        Ok(Self {
            adapter,
            link: Mutex::new(None),
            on_lost: Arc::new(Mutex::new(None)),
            scan_task: Mutex::new(None),
            watch_task: Mutex::new(None),
        })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, TransportError> {
        for peripheral in self.adapter.peripherals().await.map_err(ble_error)? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                return Ok(peripheral);
            }
        }
        Err(TransportError::NotFound(address.to_string()))
    }

    fn characteristic(&self, uuid: Uuid) -> Result<(Peripheral, Characteristic), TransportError> {
        let link = self.link.lock();
        let link = link.as_ref().ok_or(TransportError::NotConnected)?;
        let characteristic = link
            .characteristics
            .get(&uuid)
            .cloned()
            .ok_or_else(|| TransportError::UnknownEndpoint(uuid.to_string()))?;
        Ok((link.peripheral.clone(), characteristic))
    }

    /// Watch adapter events for the disconnect of `id`
    async fn watch_disconnect(&self, id: PeripheralId, address: String) -> Result<(), TransportError> {
        let mut events = self.adapter.events().await.map_err(ble_error)?;
        let on_lost = self.on_lost.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        if let Some(callback) = on_lost.lock().as_ref() {
                            callback(address.clone());
                        }
                        break;
                    }
                }
            }
        });
        if let Some(previous) = self.watch_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn advertisement(&self, id: &PeripheralId) -> Option<Advertisement> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let props = peripheral.properties().await.ok()??;
        let mut advert = Advertisement::new(props.address.to_string(), props.local_name.as_deref());
        if let Some(rssi) = props.rssi {
            advert = advert.with_rssi(rssi);
        }
        Some(advert)
    }

    /// Push advertisements into `sink` until stopped
    pub async fn start_scan(self: &Arc<Self>, sink: mpsc::Sender<DiscoveryEvent>) -> Result<(), TransportError> {
        let mut events = self.adapter.events().await.map_err(ble_error)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ble_error)?;

        let bridge = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                if let Some(advert) = bridge.advertisement(&id).await {
                    if sink.send(DiscoveryEvent::Found(advert)).await.is_err() {
                        break;
                    }
                }
            }
            let _ = sink.send(DiscoveryEvent::Aborted("adapter event stream ended".into())).await;
        });
        if let Some(previous) = self.scan_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn stop_scan(&self) {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("stopping BLE scan: {}", e);
        }
    }
}

#[async_trait]
impl BleGattBridge for BtleplugBridge {
    async fn connect(&self, address: &str, service: Uuid) -> Result<(), TransportError> {
        let peripheral = self.find_peripheral(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        peripheral.discover_services().await.map_err(ble_error)?;

        let characteristics: HashMap<Uuid, Characteristic> = peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.into_iter())
            .map(|c| (c.uuid, c))
            .collect();
        if characteristics.is_empty() {
            let _ = peripheral.disconnect().await;
            return Err(TransportError::ConnectionFailed(format!(
                "{} does not expose service {}",
                address, service
            )));
        }

        info!("{} exposes {} provisioning characteristics", address, characteristics.len());
        let id = peripheral.id();
        *self.link.lock() = Some(Link {
            peripheral,
            characteristics,
        });
        self.watch_disconnect(id, address.to_string()).await
    }

    async fn write(&self, characteristic: Uuid, data: Vec<u8>) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.characteristic(characteristic)?;
        peripheral
            .write(&characteristic, &data, WriteType::WithResponse)
            .await
            .map_err(ble_error)
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let (peripheral, characteristic) = self.characteristic(characteristic)?;
        peripheral.read(&characteristic).await.map_err(ble_error)
    }

    async fn disconnect(&self) {
        let link = self.link.lock().take();
        if let Some(task) = self.watch_task.lock().take() {
            task.abort();
        }
        if let Some(link) = link {
            if let Err(e) = link.peripheral.disconnect().await {
                warn!("BLE disconnect: {}", e);
            }
        }
    }

    fn att_payload(&self) -> usize {
        // btleplug does not expose the negotiated MTU.
        DEFAULT_ATT_PAYLOAD
    }

    fn on_link_lost(&self, callback: LinkLostCallback) {
        *self.on_lost.lock() = Some(callback);
    }
}
