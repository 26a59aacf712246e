// Host radios — BLE (btleplug) and SoftAP (hyper) behind the core seams

use crate::ble::BtleplugBridge;
use crate::config::Config;
use crate::softap::HttpBridge;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use wifiprov_core::transport::{
    BleTransport, BleTransportConfig, DiscoveryEvent, SoftApTransport, TransportError,
};
use wifiprov_core::{DeviceDescriptor, DiscoveryBackend, Transport, TransportKind, TransportProvider};

pub struct HostRadio {
    ble: Option<Arc<BtleplugBridge>>,
    ble_config: BleTransportConfig,
    softap: Arc<HttpBridge>,
    softap_name: String,
}

impl HostRadio {
    /// Bluetooth is optional: without an adapter only SoftAP works
    pub async fn from_config(config: &Config) -> Result<Self> {
        let ble = match BtleplugBridge::first_adapter().await {
            Ok(bridge) => Some(Arc::new(bridge)),
            Err(e) => {
                warn!("BLE unavailable: {}", e);
                None
            }
        };

        let mut ble_config = BleTransportConfig::default();
        if let Some(raw) = &config.ble.service_uuid {
            ble_config.service_uuid =
                uuid::Uuid::parse_str(raw).context("Invalid ble_service_uuid in config")?;
        }
        for name in &config.ble.custom_endpoints {
            ble_config = ble_config.with_custom_endpoint(name.clone());
        }

        Ok(Self {
            ble,
            ble_config,
            softap: Arc::new(HttpBridge::new(&config.softap.host, config.request_duration())),
            softap_name: config.softap.device_name.clone(),
        })
    }

    fn ble(&self) -> Result<&Arc<BtleplugBridge>, TransportError> {
        self.ble
            .as_ref()
            .ok_or_else(|| TransportError::Unsupported("no Bluetooth adapter".to_string()))
    }
}

#[async_trait]
impl DiscoveryBackend for HostRadio {
    async fn start_discovery(
        &self,
        kind: TransportKind,
        sink: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<(), TransportError> {
        match kind {
            TransportKind::Ble => self.ble()?.start_scan(sink).await,
            TransportKind::SoftAp => {
                let softap = self.softap.clone();
                let name = self.softap_name.clone();
                tokio::spawn(async move { softap.probe(&name, sink).await });
                Ok(())
            }
        }
    }

    async fn stop_discovery(&self, kind: TransportKind) {
        if let (TransportKind::Ble, Some(ble)) = (kind, &self.ble) {
            ble.stop_scan().await;
        }
    }
}

impl TransportProvider for HostRadio {
    fn create(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Transport>, TransportError> {
        match descriptor.transport_kind {
            TransportKind::Ble => {
                let bridge = self.ble()?.clone();
                Ok(Arc::new(BleTransport::new(bridge, self.ble_config.clone())))
            }
            TransportKind::SoftAp => Ok(Arc::new(SoftApTransport::new(self.softap.clone()))),
        }
    }
}
