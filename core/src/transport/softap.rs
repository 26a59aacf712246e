// SoftAP transport — provisioning endpoints over the device's own access point
//
// The host joins the device AP, then every endpoint is an HTTP POST to
// `/<endpoint>`. HTTP is already request/response, so `send` performs the POST
// and parks the body until the matching `receive`.

use crate::transport::abstraction::{
    ConnectivityEvent, DeviceDescriptor, Transport, TransportError, TransportKind,
    META_SOFTAP_PASSWORD,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// HTTP + Wi-Fi operations provided by the host platform
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SoftApHttpBridge: Send + Sync {
    /// Join the device access point. Hosts that are already associated may no-op.
    async fn join(&self, ssid: &str, password: Option<String>) -> Result<(), TransportError>;

    /// POST `body` to `path` on the device and return the response body
    async fn post(&self, path: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError>;

    async fn leave(&self);
}

#[derive(Default)]
struct Exchange {
    device_id: Option<String>,
    responses: HashMap<String, Vec<u8>>,
}

pub struct SoftApTransport {
    bridge: Arc<dyn SoftApHttpBridge>,
    exchange: Mutex<Exchange>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl SoftApTransport {
    pub fn new(bridge: Arc<dyn SoftApHttpBridge>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            bridge,
            exchange: Mutex::new(Exchange::default()),
            events,
        }
    }

    fn path_for(endpoint: &str) -> String {
        format!("/{}", endpoint.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for SoftApTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SoftAp
    }

    async fn open(&self, descriptor: &DeviceDescriptor) -> Result<(), TransportError> {
        let password = descriptor.metadata(META_SOFTAP_PASSWORD).map(str::to_string);
        self.bridge.join(&descriptor.id, password).await?;
        {
            let mut exchange = self.exchange.lock();
            exchange.device_id = Some(descriptor.id.clone());
            exchange.responses.clear();
        }
        info!("joined device access point {}", descriptor.id);
        let _ = self.events.send(ConnectivityEvent::Connected {
            device_id: descriptor.id.clone(),
        });
        Ok(())
    }

    async fn send(&self, endpoint: &str, data: &[u8]) -> Result<(), TransportError> {
        if self.exchange.lock().device_id.is_none() {
            return Err(TransportError::NotConnected);
        }
        let response = self.bridge.post(&Self::path_for(endpoint), data.to_vec()).await?;
        debug!("POST /{}: {} bytes out, {} bytes back", endpoint, data.len(), response.len());
        self.exchange
            .lock()
            .responses
            .insert(endpoint.to_string(), response);
        Ok(())
    }

    async fn receive(&self, endpoint: &str) -> Result<Vec<u8>, TransportError> {
        let mut exchange = self.exchange.lock();
        if exchange.device_id.is_none() {
            return Err(TransportError::NotConnected);
        }
        exchange
            .responses
            .remove(endpoint)
            .ok_or_else(|| TransportError::Io(format!("no response pending on {}", endpoint)))
    }

    async fn close(&self) {
        let device_id = {
            let mut exchange = self.exchange.lock();
            exchange.responses.clear();
            exchange.device_id.take()
        };
        if let Some(device_id) = device_id {
            self.bridge.leave().await;
            let _ = self.events.send(ConnectivityEvent::Disconnected { device_id });
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }
}
