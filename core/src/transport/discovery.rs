// Device discovery — prefix-filtered, deduplicated scans over a platform radio
//
// A scan is a lazy, finite stream of descriptors. It ends on timeout, on an
// explicit stop, or when the radio aborts. Every sighting is recorded in the
// shared found-devices table so a later connect can resolve an address.

use super::abstraction::{
    DeviceDescriptor, DiscoveryBackend, DiscoveryEvent, PermissionGate, TransportKind,
};
use futures::Stream;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Scan length used when the caller passes a zero timeout
    pub default_timeout: Duration,
    /// Buffer between the radio and the scan task
    pub channel_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            channel_capacity: 64,
        }
    }
}

/// Scan failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("Permission denied for {0} discovery")]
    PermissionDenied(TransportKind),
    #[error("Scan could not start: {0}")]
    ScanStartFailed(String),
    #[error("Scan aborted: {0}")]
    ScanAborted(String),
}

/// Concurrency-safe address → descriptor table.
///
/// Written by the scan task, read by connect. Re-inserting an address
/// overwrites the previous entry.
#[derive(Debug, Clone, Default)]
pub struct FoundDevices {
    inner: Arc<RwLock<HashMap<String, DeviceDescriptor>>>,
}

impl FoundDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, descriptor: DeviceDescriptor) {
        self.inner.write().insert(descriptor.id.clone(), descriptor);
    }

    pub fn get(&self, id: &str) -> Option<DeviceDescriptor> {
        self.inner.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Copy of all entries, ordered by id
    pub fn snapshot(&self) -> Vec<DeviceDescriptor> {
        let mut devices: Vec<_> = self.inner.read().values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }
}

/// Enumerates candidate devices reachable over a transport kind
pub struct DiscoveryScanner {
    backend: Arc<dyn DiscoveryBackend>,
    gate: Arc<dyn PermissionGate>,
    found: FoundDevices,
    config: DiscoveryConfig,
}

impl DiscoveryScanner {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, gate: Arc<dyn PermissionGate>) -> Self {
        Self {
            backend,
            gate,
            found: FoundDevices::new(),
            config: DiscoveryConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing table instead of the scanner's own
    pub fn with_found_devices(mut self, found: FoundDevices) -> Self {
        self.found = found;
        self
    }

    pub fn found_devices(&self) -> FoundDevices {
        self.found.clone()
    }

    /// Start a scan. Devices whose advertised name does not start with
    /// `prefix` are ignored; an empty prefix accepts everything.
    pub async fn scan(
        &self,
        prefix: &str,
        kind: TransportKind,
        timeout: Duration,
    ) -> Result<DeviceScan, ScanError> {
        if !self.gate.is_granted(kind) {
            warn!("{} discovery refused: permission not granted", kind);
            return Err(ScanError::PermissionDenied(kind));
        }

        let timeout = if timeout.is_zero() {
            self.config.default_timeout
        } else {
            timeout
        };

        let capacity = self.config.channel_capacity.max(1);
        let (raw_tx, raw_rx) = mpsc::channel(capacity);
        self.backend
            .start_discovery(kind, raw_tx)
            .await
            .map_err(|e| ScanError::ScanStartFailed(e.to_string()))?;

        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = oneshot::channel();

        info!("{} scan started (prefix {:?}, {:?})", kind, prefix, timeout);
        tokio::spawn(run_scan(ScanTask {
            backend: self.backend.clone(),
            kind,
            prefix: prefix.to_string(),
            timeout,
            raw_rx,
            out_tx,
            stop_rx,
            found: self.found.clone(),
        }));

        Ok(DeviceScan {
            rx: out_rx,
            stop: Some(stop_tx),
        })
    }
}

struct ScanTask {
    backend: Arc<dyn DiscoveryBackend>,
    kind: TransportKind,
    prefix: String,
    timeout: Duration,
    raw_rx: mpsc::Receiver<DiscoveryEvent>,
    out_tx: mpsc::Sender<Result<DeviceDescriptor, ScanError>>,
    stop_rx: oneshot::Receiver<()>,
    found: FoundDevices,
}

async fn run_scan(task: ScanTask) {
    let ScanTask {
        backend,
        kind,
        prefix,
        timeout,
        mut raw_rx,
        out_tx,
        mut stop_rx,
        found,
    } = task;

    let mut reported: HashSet<String> = HashSet::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                debug!("{} scan finished after {:?}", kind, timeout);
                break;
            }
            _ = &mut stop_rx => {
                debug!("{} scan stopped by caller", kind);
                break;
            }
            event = raw_rx.recv() => match event {
                Some(DiscoveryEvent::Found(advert)) => {
                    let name = match advert.name.as_deref() {
                        Some(name) if name.starts_with(&prefix) => name.to_string(),
                        None if prefix.is_empty() => advert.address.clone(),
                        _ => continue,
                    };

                    let mut descriptor = DeviceDescriptor::new(advert.address.clone(), name, kind);
                    descriptor.rssi = advert.rssi;
                    descriptor.metadata = advert.metadata;
                    found.record(descriptor.clone());

                    if !reported.insert(advert.address) {
                        debug!("duplicate advertisement from {}", descriptor.id);
                        continue;
                    }
                    if out_tx.send(Ok(descriptor)).await.is_err() {
                        break;
                    }
                }
                Some(DiscoveryEvent::Aborted(reason)) => {
                    warn!("{} scan aborted: {}", kind, reason);
                    let _ = out_tx.send(Err(ScanError::ScanAborted(reason))).await;
                    break;
                }
                None => break,
            }
        }
    }

    backend.stop_discovery(kind).await;
    info!("{} scan complete, {} device(s)", kind, reported.len());
}

/// A running scan. Yields each matching device once.
///
/// Dropping the scan stops it. Devices already yielded stay valid.
pub struct DeviceScan {
    rx: mpsc::Receiver<Result<DeviceDescriptor, ScanError>>,
    stop: Option<oneshot::Sender<()>>,
}

impl DeviceScan {
    /// Stop discovering. Buffered results can still be drained.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    pub async fn next_device(&mut self) -> Option<Result<DeviceDescriptor, ScanError>> {
        self.rx.recv().await
    }

    /// Drain the scan to completion
    pub async fn collect_all(mut self) -> Result<Vec<DeviceDescriptor>, ScanError> {
        let mut devices = Vec::new();
        while let Some(item) = self.rx.recv().await {
            devices.push(item?);
        }
        Ok(devices)
    }
}

impl Stream for DeviceScan {
    type Item = Result<DeviceDescriptor, ScanError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for DeviceScan {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::abstraction::{
        Advertisement, AllowAll, MockPermissionGate, TransportError,
    };
    use async_trait::async_trait;
    use futures::StreamExt;
    use parking_lot::Mutex;

    /// Radio that replays a fixed set of events, optionally refusing to start
    struct ScriptedRadio {
        events: Vec<DiscoveryEvent>,
        refuse: bool,
        stopped: Mutex<u32>,
        hold_open: Mutex<Option<mpsc::Sender<DiscoveryEvent>>>,
    }

    impl ScriptedRadio {
        fn new(events: Vec<DiscoveryEvent>) -> Self {
            Self {
                events,
                refuse: false,
                stopped: Mutex::new(0),
                hold_open: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl DiscoveryBackend for ScriptedRadio {
        async fn start_discovery(
            &self,
            _kind: TransportKind,
            sink: mpsc::Sender<DiscoveryEvent>,
        ) -> Result<(), TransportError> {
            if self.refuse {
                return Err(TransportError::Unsupported("adapter powered off".into()));
            }
            for event in &self.events {
                sink.send(event.clone())
                    .await
                    .map_err(|e| TransportError::Io(e.to_string()))?;
            }
            // Keep the channel open so the scan runs until its deadline.
            *self.hold_open.lock() = Some(sink);
            Ok(())
        }

        async fn stop_discovery(&self, _kind: TransportKind) {
            *self.stopped.lock() += 1;
            self.hold_open.lock().take();
        }
    }

    fn found(address: &str, name: &str) -> DiscoveryEvent {
        DiscoveryEvent::Found(Advertisement::new(address, Some(name)))
    }

    fn scanner(radio: Arc<ScriptedRadio>) -> DiscoveryScanner {
        DiscoveryScanner::new(radio, Arc::new(AllowAll))
    }

    #[tokio::test]
    async fn test_scan_filters_by_prefix() {
        let radio = Arc::new(ScriptedRadio::new(vec![
            found("AA:BB", "PROV_123"),
            found("CC:DD", "Headphones"),
            found("EE:FF", "PROV_456"),
        ]));

        let devices = scanner(radio)
            .scan("PROV_", TransportKind::Ble, Duration::from_millis(100))
            .await
            .expect("scan starts")
            .collect_all()
            .await
            .expect("scan completes");

        let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["AA:BB", "EE:FF"]);
    }

    #[tokio::test]
    async fn test_scan_deduplicates_by_address() {
        let radio = Arc::new(ScriptedRadio::new(vec![
            found("AA:BB", "PROV_123"),
            DiscoveryEvent::Found(Advertisement::new("AA:BB", Some("PROV_123")).with_rssi(-40)),
        ]));
        let scanner = scanner(radio);

        let devices = scanner
            .scan("PROV_", TransportKind::Ble, Duration::from_millis(100))
            .await
            .unwrap()
            .collect_all()
            .await
            .unwrap();

        assert_eq!(devices.len(), 1);
        // The table keeps the latest sighting.
        let table = scanner.found_devices();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("AA:BB").unwrap().rssi, Some(-40));
    }

    #[tokio::test]
    async fn test_scan_permission_denied() {
        let mut gate = MockPermissionGate::new();
        gate.expect_is_granted().returning(|_| false);
        let radio = Arc::new(ScriptedRadio::new(vec![]));
        let scanner = DiscoveryScanner::new(radio, Arc::new(gate));

        match scanner.scan("PROV_", TransportKind::Ble, Duration::from_millis(50)).await {
            Err(ScanError::PermissionDenied(TransportKind::Ble)) => (),
            _ => panic!("Wrong error type"),
        }
    }

    #[tokio::test]
    async fn test_scan_start_failed() {
        let mut radio = ScriptedRadio::new(vec![]);
        radio.refuse = true;

        match scanner(Arc::new(radio))
            .scan("", TransportKind::Ble, Duration::from_millis(50))
            .await
        {
            Err(ScanError::ScanStartFailed(reason)) => assert!(reason.contains("powered off")),
            _ => panic!("Wrong error type"),
        }
    }

    #[tokio::test]
    async fn test_scan_aborted_keeps_earlier_results() {
        let radio = Arc::new(ScriptedRadio::new(vec![
            found("AA:BB", "PROV_1"),
            DiscoveryEvent::Aborted("adapter reset".into()),
        ]));

        let mut scan = scanner(radio)
            .scan("PROV_", TransportKind::Ble, Duration::from_secs(5))
            .await
            .unwrap();

        let first = scan.next().await.expect("one item").expect("device");
        assert_eq!(first.display_name, "PROV_1");
        match scan.next().await {
            Some(Err(ScanError::ScanAborted(reason))) => assert_eq!(reason, "adapter reset"),
            _ => panic!("Wrong error type"),
        }
        assert!(scan.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_ends_scan_and_releases_radio() {
        let radio = Arc::new(ScriptedRadio::new(vec![found("AA:BB", "PROV_1")]));
        let mut scan = scanner(radio.clone())
            .scan("PROV_", TransportKind::Ble, Duration::from_secs(30))
            .await
            .unwrap();

        assert!(scan.next_device().await.is_some());
        scan.stop();
        assert!(scan.next_device().await.is_none());
        assert_eq!(*radio.stopped.lock(), 1);
    }

    #[tokio::test]
    async fn test_scan_is_restartable() {
        let radio = Arc::new(ScriptedRadio::new(vec![found("AA:BB", "PROV_1")]));
        let scanner = scanner(radio);

        for _ in 0..2 {
            let devices = scanner
                .scan("PROV_", TransportKind::Ble, Duration::from_millis(50))
                .await
                .unwrap()
                .collect_all()
                .await
                .unwrap();
            assert_eq!(devices.len(), 1);
        }
    }
}
