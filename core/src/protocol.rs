//! Provisioning wire protocol — endpoint names, messages and codec
//!
//! Structured messages are serde enums encoded with bincode and bounded in
//! size. The version endpoint is the exception: it speaks plaintext JSON so a
//! client can learn what the device supports before any key exchange.

use crate::wifi::WifiAuthMode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Handshake endpoint
pub const EP_SESSION: &str = "prov-session";
/// Wi-Fi scan endpoint
pub const EP_SCAN: &str = "prov-scan";
/// Credential endpoint
pub const EP_CONFIG: &str = "prov-config";
/// Version / capability endpoint (plaintext JSON)
pub const EP_VERSION: &str = "proto-ver";
/// Device control endpoint (reserved)
pub const EP_CONTROL: &str = "prov-ctrl";

/// Protocol version this crate speaks
pub const PROTOCOL_VERSION: &str = "v1.1";

/// Capability tag: device can scan for Wi-Fi networks
pub const CAP_WIFI_SCAN: &str = "wifi_scan";
/// Capability tag: device accepts sessions without proof of possession
pub const CAP_NO_POP: &str = "no_pop";

/// Maximum encoded message size: 64 KB
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Entries fetched per scan result request
pub const SCAN_RESULT_PAGE: u32 = 4;

/// Most scan results a device may report. An encoded entry stays under
/// 64 bytes, so this many fill one maximum-size message.
pub const MAX_SCAN_RESULTS: u32 = (MAX_MESSAGE_SIZE / 64) as u32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
    #[error("Encode failed: {0}")]
    Encode(String),
    #[error("Decode failed: {0}")]
    Decode(String),
}

/// Device status attached to every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    InvalidSecScheme,
    InvalidProto,
    InvalidProof,
    InvalidArgument,
    InternalError,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Success => "success",
            Status::InvalidSecScheme => "invalid security scheme",
            Status::InvalidProto => "invalid protocol",
            Status::InvalidProof => "invalid proof of possession",
            Status::InvalidArgument => "invalid argument",
            Status::InternalError => "internal device error",
        };
        f.write_str(text)
    }
}

// ============================================================================
// SESSION (HANDSHAKE)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    Command0 {
        sec_ver: u8,
        client_pubkey: [u8; 32],
    },
    Response0 {
        status: Status,
        device_pubkey: [u8; 32],
        device_random: [u8; 16],
    },
    Command1 {
        client_verify: Vec<u8>,
    },
    Response1 {
        status: Status,
        device_verify: Vec<u8>,
    },
}

// ============================================================================
// WI-FI SCAN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanRequest {
    Start {
        blocking: bool,
        passive: bool,
        group_channels: u8,
        period_ms: u32,
    },
    Status,
    Results {
        start_index: u32,
        count: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEntry {
    pub ssid: String,
    pub channel: u8,
    pub rssi: i32,
    pub bssid: [u8; 6],
    pub auth: WifiAuthMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanResponse {
    Started {
        status: Status,
    },
    Status {
        status: Status,
        finished: bool,
        result_count: u32,
    },
    Results {
        status: Status,
        entries: Vec<ScanEntry>,
    },
}

// ============================================================================
// CREDENTIALS
// ============================================================================

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigRequest {
    SetConfig {
        ssid: String,
        passphrase: String,
        bssid: Option<[u8; 6]>,
        channel: u8,
    },
    ApplyConfig,
    GetStatus,
}

impl fmt::Debug for ConfigRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigRequest::SetConfig { ssid, bssid, channel, .. } => f
                .debug_struct("SetConfig")
                .field("ssid", ssid)
                .field("passphrase", &"<redacted>")
                .field("bssid", bssid)
                .field("channel", channel)
                .finish(),
            ConfigRequest::ApplyConfig => f.write_str("ApplyConfig"),
            ConfigRequest::GetStatus => f.write_str("GetStatus"),
        }
    }
}

/// Why the device could not join the target network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceFailureReason {
    AuthError,
    NetworkNotFound,
    IpAssignTimeout,
    Unknown,
}

impl fmt::Display for DeviceFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFailureReason::AuthError => write!(f, "authentication rejected"),
            DeviceFailureReason::NetworkNotFound => write!(f, "network not found"),
            DeviceFailureReason::IpAssignTimeout => write!(f, "no IP address assigned"),
            DeviceFailureReason::Unknown => write!(f, "unknown"),
        }
    }
}

/// Station state reported by the device while joining
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StationState {
    Connected { ssid: String, ip4: [u8; 4], channel: u8 },
    Connecting,
    Disconnected,
    ConnectionFailed { reason: DeviceFailureReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigResponse {
    SetConfig { status: Status },
    ApplyConfig { status: Status },
    Status { status: Status, station: StationState },
}

// ============================================================================
// VERSION INFO (JSON)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub prov: ProvVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvVersion {
    pub ver: String,
    #[serde(default)]
    pub sec_ver: Option<u8>,
    #[serde(default)]
    pub cap: Vec<String>,
}

impl VersionInfo {
    pub fn new(sec_ver: u8, capabilities: &[&str]) -> Self {
        Self {
            prov: ProvVersion {
                ver: PROTOCOL_VERSION.to_string(),
                sec_ver: Some(sec_ver),
                cap: capabilities.iter().map(|c| c.to_string()).collect(),
            },
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.prov.cap.iter().any(|c| c == capability)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(bytes.len()));
        }
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

// ============================================================================
// CODEC
// ============================================================================

/// Serialize a protocol message (bincode)
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let bytes = bincode::serialize(msg).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Deserialize a protocol message
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge(bytes.len()));
    }
    bincode::deserialize(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_oversized_decode() {
        let big = vec![0u8; MAX_MESSAGE_SIZE + 1];
        match decode::<ScanResponse>(&big) {
            Err(ProtocolError::TooLarge(n)) => assert_eq!(n, MAX_MESSAGE_SIZE + 1),
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_reject_oversized_encode() {
        let request = ConfigRequest::SetConfig {
            ssid: "x".repeat(MAX_MESSAGE_SIZE),
            passphrase: String::new(),
            bssid: None,
            channel: 0,
        };
        assert!(matches!(encode(&request), Err(ProtocolError::TooLarge(_))));
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(matches!(
            decode::<SessionMessage>(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_config_debug_redacts_passphrase() {
        let request = ConfigRequest::SetConfig {
            ssid: "Home".into(),
            passphrase: "secret123".into(),
            bssid: None,
            channel: 6,
        };
        let rendered = format!("{:?}", request);
        assert!(rendered.contains("Home"));
        assert!(!rendered.contains("secret123"));
    }

    #[test]
    fn test_version_info_json_shape() {
        let info = VersionInfo::new(2, &[CAP_WIFI_SCAN]);
        let json: serde_json::Value = serde_json::from_slice(&info.to_json().unwrap()).unwrap();

        assert_eq!(json["prov"]["ver"], "v1.1");
        assert_eq!(json["prov"]["sec_ver"], 2);
        assert_eq!(json["prov"]["cap"][0], "wifi_scan");
    }

    #[test]
    fn test_version_info_tolerates_missing_fields() {
        let info = VersionInfo::from_json(br#"{"prov":{"ver":"v1.0"}}"#).unwrap();
        assert_eq!(info.prov.sec_ver, None);
        assert!(!info.has_capability(CAP_WIFI_SCAN));
    }
}
