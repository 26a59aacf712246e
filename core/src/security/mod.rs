// Security module — pluggable schemes for the provisioning channel
//
// A scheme runs its key agreement over the raw transport and hands back a
// FrameCipher. SecuritySession wraps that cipher with the per-direction
// counters and the Idle → Handshaking → Established → Closed/Failed machine.

pub mod ecdh;
pub mod plaintext;
pub mod session;

pub use ecdh::{EcdhResponder, EcdhScheme};
pub use plaintext::{PlaintextCipher, PlaintextScheme};
pub use session::{SecuritySession, SecurityState};

use crate::transport::Transport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ============================================================================
// SECURITY TYPE TAG
// ============================================================================

/// Security scheme selector, chosen when security is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityType {
    /// Plaintext frames, no key agreement
    None,
    /// X25519 + proof-of-possession-masked key, ChaCha20-Poly1305
    SecureV1,
    /// X25519 + BLAKE3 transcript-bound directional keys, ChaCha20-Poly1305
    SecureV2,
}

impl SecurityType {
    /// Numeric version advertised on the version endpoint
    pub fn version(self) -> u8 {
        match self {
            SecurityType::None => 0,
            SecurityType::SecureV1 => 1,
            SecurityType::SecureV2 => 2,
        }
    }

    pub fn from_version(version: u8) -> Option<Self> {
        match version {
            0 => Some(SecurityType::None),
            1 => Some(SecurityType::SecureV1),
            2 => Some(SecurityType::SecureV2),
            _ => None,
        }
    }

    /// Client-side scheme implementation for this tag
    pub fn scheme(self) -> Box<dyn SecurityScheme> {
        match self {
            SecurityType::None => Box::new(PlaintextScheme),
            SecurityType::SecureV1 => Box::new(EcdhScheme::secure_v1()),
            SecurityType::SecureV2 => Box::new(EcdhScheme::secure_v2()),
        }
    }
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityType::None => write!(f, "none"),
            SecurityType::SecureV1 => write!(f, "secure-v1"),
            SecurityType::SecureV2 => write!(f, "secure-v2"),
        }
    }
}

impl FromStr for SecurityType {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "sec0" | "0" => Ok(SecurityType::None),
            "secure-v1" | "sec1" | "1" => Ok(SecurityType::SecureV1),
            "secure-v2" | "sec2" | "2" => Ok(SecurityType::SecureV2),
            other => Err(SecurityError::UnknownScheme(other.to_string())),
        }
    }
}

// ============================================================================
// PROOF OF POSSESSION
// ============================================================================

/// Secret proving the caller may configure the device.
///
/// Wiped on drop and redacted in `Debug`. Consumed by a single handshake.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ProofOfPossession(Vec<u8>);

impl ProofOfPossession {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(secret.into())
    }

    /// Devices advertising `no_pop` accept an empty secret
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ProofOfPossession {
    fn from(secret: &str) -> Self {
        Self::new(secret.as_bytes().to_vec())
    }
}

impl fmt::Debug for ProofOfPossession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProofOfPossession(<redacted>)")
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Why a handshake did not reach Established
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeFailure {
    #[error("wrong proof of possession")]
    WrongSecret,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(HandshakeFailure),
    #[error("Session not secured")]
    SessionNotSecured,
    #[error("Sequence violation: expected frame {expected}, received {received}")]
    SequenceViolation { expected: u64, received: u64 },
    #[error("Frame failed authentication")]
    AuthenticationFailed,
    #[error("Malformed frame")]
    MalformedFrame,
    #[error("Counter exhausted")]
    CounterExhausted,
    #[error("Cryptography error: {0}")]
    Crypto(String),
    #[error("Handshake not allowed in state {0:?}")]
    InvalidState(SecurityState),
    #[error("Unknown security scheme: {0}")]
    UnknownScheme(String),
}

// ============================================================================
// SCHEME TRAITS
// ============================================================================

/// Authenticated encryption keyed by a handshake. Counters are chosen by the
/// caller; a cipher never reuses state between calls.
pub trait FrameCipher: Send + Sync {
    fn seal(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError>;

    fn open(&self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, SecurityError>;
}

/// Client half of a security scheme
#[async_trait]
pub trait SecurityScheme: Send + Sync {
    fn security_type(&self) -> SecurityType;

    /// Run key agreement over the raw transport. Every round trip is bounded
    /// by `timeout`.
    async fn handshake(
        &self,
        pop: &ProofOfPossession,
        transport: &dyn Transport,
        timeout: Duration,
    ) -> Result<Box<dyn FrameCipher>, SecurityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_type_parse() {
        assert_eq!("secure-v1".parse::<SecurityType>().unwrap(), SecurityType::SecureV1);
        assert_eq!("SEC2".parse::<SecurityType>().unwrap(), SecurityType::SecureV2);
        assert_eq!("0".parse::<SecurityType>().unwrap(), SecurityType::None);
        match "sec9".parse::<SecurityType>() {
            Err(SecurityError::UnknownScheme(name)) => assert_eq!(name, "sec9"),
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_security_type_versions() {
        for tag in [SecurityType::None, SecurityType::SecureV1, SecurityType::SecureV2] {
            assert_eq!(SecurityType::from_version(tag.version()), Some(tag));
            assert_eq!(tag.scheme().security_type(), tag);
        }
        assert_eq!(SecurityType::from_version(7), None);
    }

    #[test]
    fn test_pop_debug_is_redacted() {
        let pop = ProofOfPossession::from("abcd1234");
        assert!(!format!("{:?}", pop).contains("abcd1234"));
        assert_eq!(pop.as_bytes(), b"abcd1234");
    }
}
