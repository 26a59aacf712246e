// Wi-Fi network snapshots reported by the device scanner

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::protocol::ScanEntry;

/// Authentication mode advertised by an access point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WifiAuthMode {
    Open,
    Wep,
    WpaPsk,
    Wpa2Psk,
    WpaWpa2Psk,
    Wpa2Enterprise,
    Wpa3Psk,
    Wpa2Wpa3Psk,
}

impl WifiAuthMode {
    /// Whether joining needs a passphrase
    pub fn requires_passphrase(self) -> bool {
        !matches!(self, WifiAuthMode::Open)
    }
}

impl fmt::Display for WifiAuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WifiAuthMode::Open => "Open",
            WifiAuthMode::Wep => "WEP",
            WifiAuthMode::WpaPsk => "WPA",
            WifiAuthMode::Wpa2Psk => "WPA2",
            WifiAuthMode::WpaWpa2Psk => "WPA/WPA2",
            WifiAuthMode::Wpa2Enterprise => "WPA2-Enterprise",
            WifiAuthMode::Wpa3Psk => "WPA3",
            WifiAuthMode::Wpa2Wpa3Psk => "WPA2/WPA3",
        };
        f.write_str(label)
    }
}

/// One visible network. A copy owned by the caller; later scans never touch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    /// Signal strength in dBm
    pub rssi: i32,
    pub auth: WifiAuthMode,
    pub channel: u8,
    pub bssid: [u8; 6],
}

impl WifiNetwork {
    pub fn new(ssid: impl Into<String>, rssi: i32, auth: WifiAuthMode) -> Self {
        Self {
            ssid: ssid.into(),
            rssi,
            auth,
            channel: 0,
            bssid: [0; 6],
        }
    }

    pub fn bssid_hex(&self) -> String {
        self.bssid
            .iter()
            .map(|b| hex::encode([*b]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl From<ScanEntry> for WifiNetwork {
    fn from(entry: ScanEntry) -> Self {
        Self {
            ssid: entry.ssid,
            rssi: entry.rssi,
            auth: entry.auth,
            channel: entry.channel,
            bssid: entry.bssid,
        }
    }
}

/// Strongest signal first; equal signals ordered by ssid, then bssid
pub fn sort_networks(networks: &mut [WifiNetwork]) {
    networks.sort_by(|a, b| {
        b.rssi
            .cmp(&a.rssi)
            .then_with(|| a.ssid.cmp(&b.ssid))
            .then_with(|| a.bssid.cmp(&b.bssid))
    });
}

/// Target network credentials, with optional BSSID / channel hints.
///
/// The passphrase is wiped on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WifiCredentials {
    pub ssid: String,
    pub passphrase: String,
    pub bssid: Option<[u8; 6]>,
    /// 0 lets the device pick
    pub channel: u8,
}

impl WifiCredentials {
    pub fn new(ssid: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            passphrase: passphrase.into(),
            bssid: None,
            channel: 0,
        }
    }

    pub fn with_bssid(mut self, bssid: [u8; 6]) -> Self {
        self.bssid = Some(bssid);
        self
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }
}

impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("passphrase", &"<redacted>")
            .field("bssid", &self.bssid)
            .field("channel", &self.channel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sort_by_signal_then_ssid() {
        let mut networks = vec![
            WifiNetwork::new("B", -80, WifiAuthMode::Wpa2Psk),
            WifiNetwork::new("A", -80, WifiAuthMode::Wpa2Psk),
            WifiNetwork::new("C", -40, WifiAuthMode::Wpa2Psk),
        ];
        sort_networks(&mut networks);

        let order: Vec<_> = networks.iter().map(|n| (n.ssid.as_str(), n.rssi)).collect();
        assert_eq!(order, vec![("C", -40), ("A", -80), ("B", -80)]);
    }

    #[test]
    fn test_same_ssid_and_signal_ordered_by_bssid() {
        let mut high = WifiNetwork::new("Mesh", -60, WifiAuthMode::Wpa2Psk);
        high.bssid = [0x24, 0x0a, 0xc4, 0x00, 0x00, 0x09];
        let mut low = WifiNetwork::new("Mesh", -60, WifiAuthMode::Wpa2Psk);
        low.bssid = [0x24, 0x0a, 0xc4, 0x00, 0x00, 0x01];

        let mut networks = vec![high.clone(), low.clone()];
        sort_networks(&mut networks);
        assert_eq!(networks, vec![low, high]);
    }

    #[test]
    fn test_bssid_hex() {
        let mut network = WifiNetwork::new("Home", -40, WifiAuthMode::Wpa2Psk);
        network.bssid = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];
        assert_eq!(network.bssid_hex(), "de:ad:be:ef:00:01");
    }

    #[test]
    fn test_open_network_needs_no_passphrase() {
        assert!(!WifiAuthMode::Open.requires_passphrase());
        assert!(WifiAuthMode::Wpa3Psk.requires_passphrase());
    }

    #[test]
    fn test_credentials_debug_redacts_passphrase() {
        let credentials = WifiCredentials::new("Home", "secret123").with_channel(6);
        let rendered = format!("{:?}", credentials);
        assert!(rendered.contains("Home"));
        assert!(!rendered.contains("secret123"));
    }

    proptest! {
        #[test]
        fn prop_sorted_output_is_ordered(
            input in proptest::collection::vec(("[A-Z]{1,4}", -100i32..0), 0..40)
        ) {
            let mut networks: Vec<_> = input
                .iter()
                .map(|(ssid, rssi)| WifiNetwork::new(ssid.clone(), *rssi, WifiAuthMode::Open))
                .collect();
            sort_networks(&mut networks);

            prop_assert_eq!(networks.len(), input.len());
            for pair in networks.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a.rssi > b.rssi || (a.rssi == b.rssi && a.ssid <= b.ssid));
            }
        }
    }
}
