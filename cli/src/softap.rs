// SoftAP bridge — HTTP POSTs to the device's provisioning server
//
// The operating system owns Wi-Fi association: the host must already be
// joined to the device access point. Each endpoint is `POST http://<host>/<endpoint>`.

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use wifiprov_core::protocol::EP_VERSION;
use wifiprov_core::transport::{
    Advertisement, DiscoveryEvent, SoftApHttpBridge, TransportError,
};

pub struct HttpBridge {
    client: Client<HttpConnector>,
    host: String,
    timeout: Duration,
}

impl HttpBridge {
    pub fn new(host: &str, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            host: host.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn url_for(&self, path: &str) -> String {
        let host = self
            .host
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        format!("http://{}/{}", host, path.trim_start_matches('/'))
    }

    async fn request(&self, path: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let url = self.url_for(path);
        let req = Request::builder()
            .method(Method::POST)
            .uri(&url)
            .header("Content-type", "application/x-www-form-urlencoded")
            .header("Accept", "text/plain")
            .body(Body::from(body))
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let resp = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", url, e)))?;

        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        match status {
            StatusCode::OK => Ok(bytes.to_vec()),
            StatusCode::NOT_FOUND => Err(TransportError::UnknownEndpoint(path.to_string())),
            other => Err(TransportError::Io(format!("{} answered {}", url, other))),
        }
    }

    /// Report the device when its version endpoint answers
    pub async fn probe(&self, device_name: &str, sink: mpsc::Sender<DiscoveryEvent>) {
        match self.request(EP_VERSION, Vec::new()).await {
            Ok(_) => {
                let advert = Advertisement::new(self.host.clone(), Some(device_name));
                let _ = sink.send(DiscoveryEvent::Found(advert)).await;
            }
            Err(e) => debug!("no provisioning server at {}: {}", self.host, e),
        }
    }
}

#[async_trait]
impl SoftApHttpBridge for HttpBridge {
    async fn join(&self, ssid: &str, password: Option<String>) -> Result<(), TransportError> {
        // Association is left to the OS; make sure the server is reachable instead.
        if password.is_some() {
            info!("access point {} is password protected, join it from the OS", ssid);
        }
        self.request(EP_VERSION, Vec::new()).await.map_err(|e| match e {
            TransportError::ConnectionFailed(_) | TransportError::Timeout(_) => {
                TransportError::NotFound(self.host.clone())
            }
            other => other,
        })?;
        Ok(())
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        self.request(path, body).await
    }

    async fn leave(&self) {
        debug!("leaving {}", self.host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_endpoint() {
        let bridge = HttpBridge::new("192.168.4.1:80", Duration::from_secs(1));
        assert_eq!(bridge.url_for("/prov-config"), "http://192.168.4.1:80/prov-config");
        assert_eq!(bridge.url_for("proto-ver"), "http://192.168.4.1:80/proto-ver");
    }

    #[test]
    fn test_url_for_strips_scheme() {
        let bridge = HttpBridge::new("http://10.0.0.1/", Duration::from_secs(1));
        assert_eq!(bridge.url_for("prov-scan"), "http://10.0.0.1/prov-scan");
    }

    #[tokio::test]
    async fn test_unreachable_device_reports_nothing() {
        // Port 9 on localhost has no provisioning server.
        let bridge = HttpBridge::new("127.0.0.1:9", Duration::from_millis(500));
        let (tx, mut rx) = mpsc::channel(4);
        bridge.probe("PROV_SOFTAP", tx).await;
        assert!(rx.recv().await.is_none());
    }
}
