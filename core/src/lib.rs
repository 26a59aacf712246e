// wifiprov core — device onboarding over BLE or SoftAP
//
// discover → connect → secure → scan / provision / custom data → disconnect
//
// Every step after connect runs over a proof-of-possession-gated secure
// channel. Nothing here retries on the caller's behalf.

#![allow(clippy::empty_line_after_doc_comments)]

pub mod client;
pub mod protocol;
pub mod security;
pub mod session;
pub mod simulator;
pub mod transport;
pub mod wifi;

use std::fmt;
use thiserror::Error;

pub use client::{ProvisioningClient, SessionHandle};
pub use protocol::{DeviceFailureReason, VersionInfo};
pub use security::{HandshakeFailure, ProofOfPossession, SecurityState, SecurityType};
pub use session::{
    LifecycleState, ProvisionPhase, ProvisioningSession, SessionConfig, SessionEvent,
};
pub use transport::{
    AllowAll, DeviceDescriptor, DiscoveryBackend, PermissionGate, ScanError, Transport,
    TransportKind, TransportProvider,
};
pub use wifi::{WifiAuthMode, WifiCredentials, WifiNetwork};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Why a connect attempt did not open a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Device is gone or the address was never discovered
    NotFound,
    TransportError(String),
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailure::NotFound => write!(f, "device not found"),
            ConnectFailure::TransportError(detail) => write!(f, "transport error: {}", detail),
        }
    }
}

/// Caller-facing failure taxonomy. Each variant calls for a different
/// reaction, so none of them are folded together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("Permission required for {0} access")]
    PermissionDenied(TransportKind),
    #[error("Discovery could not start: {0}")]
    ScanStartFailed(String),
    #[error("Discovery aborted: {0}")]
    ScanAborted(String),
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: ConnectFailure },
    #[error("Handshake failed: {0}")]
    HandshakeFailed(HandshakeFailure),
    #[error("Sequence violation: expected frame {expected}, received {received}")]
    SequenceViolation { expected: u64, received: u64 },
    #[error("Session busy")]
    SessionBusy,
    #[error("No secured device session")]
    NoActiveDevice,
    #[error("Session not secured")]
    SessionNotSecured,
    #[error("{operation} not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },
    #[error("Version query failed: {0}")]
    VersionQueryFailed(String),
    #[error("Wi-Fi scan failed: {0}")]
    ScanFailed(String),
    #[error("Applying Wi-Fi configuration failed: {0}")]
    ConfigApplyFailed(String),
    #[error("Device session setup failed: {0}")]
    SessionCreationFailed(String),
    #[error("Wi-Fi configuration failed: {0}")]
    WifiConfigFailed(String),
    #[error("Device could not join network: {reason}")]
    ProvisioningFailedFromDevice { reason: DeviceFailureReason },
    #[error("Custom data exchange failed: {cause}")]
    CustomExchangeFailed { cause: String },
    #[error("Operation aborted by disconnect")]
    OperationAbortedByDisconnect,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<ScanError> for ProvisionError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::PermissionDenied(kind) => ProvisionError::PermissionDenied(kind),
            ScanError::ScanStartFailed(detail) => ProvisionError::ScanStartFailed(detail),
            ScanError::ScanAborted(detail) => ProvisionError::ScanAborted(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_errors_keep_their_kind() {
        assert_eq!(
            ProvisionError::from(ScanError::PermissionDenied(TransportKind::Ble)),
            ProvisionError::PermissionDenied(TransportKind::Ble)
        );
        assert!(matches!(
            ProvisionError::from(ScanError::ScanAborted("radio off".into())),
            ProvisionError::ScanAborted(_)
        ));
    }

    #[test]
    fn test_error_messages_are_distinct() {
        let wrong_secret = ProvisionError::HandshakeFailed(HandshakeFailure::WrongSecret);
        let not_found = ProvisionError::ConnectionFailed {
            reason: ConnectFailure::NotFound,
        };
        assert_eq!(wrong_secret.to_string(), "Handshake failed: wrong proof of possession");
        assert_eq!(not_found.to_string(), "Connection failed: device not found");
        assert_ne!(
            ProvisionError::NoActiveDevice.to_string(),
            ProvisionError::SessionNotSecured.to_string()
        );
    }
}
