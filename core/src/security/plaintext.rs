// "none" scheme — no key agreement, frames travel in the clear

use super::{FrameCipher, ProofOfPossession, SecurityError, SecurityScheme, SecurityType};
use crate::transport::Transport;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Passes payloads through unchanged. Counter framing still applies.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextCipher;

impl FrameCipher for PlaintextCipher {
    fn seal(&self, _counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, _counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        Ok(ciphertext.to_vec())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextScheme;

#[async_trait]
impl SecurityScheme for PlaintextScheme {
    fn security_type(&self) -> SecurityType {
        SecurityType::None
    }

    async fn handshake(
        &self,
        _pop: &ProofOfPossession,
        _transport: &dyn Transport,
        _timeout: Duration,
    ) -> Result<Box<dyn FrameCipher>, SecurityError> {
        debug!("plaintext scheme: no key exchange");
        Ok(Box::new(PlaintextCipher))
    }
}
