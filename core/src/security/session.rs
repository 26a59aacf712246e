// Security session — handshake state machine and sequence enforcement
//
// Frame layout: [counter: u64 BE | sealed payload]. Each direction counts
// independently from FIRST_APPLICATION_COUNTER; counter 0 is reserved for the
// handshake verification tokens. A receiver accepts only the exact next
// counter. Anything else fails the session closed.

use super::{
    FrameCipher, ProofOfPossession, SecurityError, SecurityScheme, SecurityType,
};
use crate::transport::Transport;
use std::time::Duration;
use tracing::{debug, info, warn};

/// First counter used by application frames in each direction
pub const FIRST_APPLICATION_COUNTER: u64 = 1;

const COUNTER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityState {
    Idle,
    Handshaking,
    Established,
    Closed,
    Failed,
}

pub struct SecuritySession {
    security_type: SecurityType,
    state: SecurityState,
    cipher: Option<Box<dyn FrameCipher>>,
    tx_counter: u64,
    rx_counter: u64,
}

impl SecuritySession {
    pub fn new(security_type: SecurityType) -> Self {
        Self {
            security_type,
            state: SecurityState::Idle,
            cipher: None,
            tx_counter: FIRST_APPLICATION_COUNTER,
            rx_counter: FIRST_APPLICATION_COUNTER,
        }
    }

    /// Session whose keys were agreed elsewhere (device side of a handshake)
    pub fn established(security_type: SecurityType, cipher: Box<dyn FrameCipher>) -> Self {
        let mut session = Self::new(security_type);
        session.cipher = Some(cipher);
        session.state = SecurityState::Established;
        session
    }

    pub fn state(&self) -> SecurityState {
        self.state
    }

    pub fn security_type(&self) -> SecurityType {
        self.security_type
    }

    pub fn is_established(&self) -> bool {
        self.state == SecurityState::Established
    }

    /// Idle → Handshaking → Established | Failed.
    ///
    /// Takes the proof of possession by value: it is bound to this session and
    /// wiped when the handshake returns.
    pub async fn handshake(
        &mut self,
        scheme: &dyn SecurityScheme,
        pop: ProofOfPossession,
        transport: &dyn Transport,
        timeout: Duration,
    ) -> Result<(), SecurityError> {
        if self.state != SecurityState::Idle {
            return Err(SecurityError::InvalidState(self.state));
        }
        if scheme.security_type() != self.security_type {
            return Err(SecurityError::UnknownScheme(scheme.security_type().to_string()));
        }

        self.state = SecurityState::Handshaking;
        debug!("{} handshake started", self.security_type);

        match scheme.handshake(&pop, transport, timeout).await {
            Ok(cipher) => {
                self.cipher = Some(cipher);
                self.state = SecurityState::Established;
                info!("{} session established", self.security_type);
                Ok(())
            }
            Err(e) => {
                warn!("{} handshake failed: {}", self.security_type, e);
                self.fail();
                Err(e)
            }
        }
    }

    /// Seal one outbound application frame
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if self.state != SecurityState::Established {
            return Err(SecurityError::SessionNotSecured);
        }
        let cipher = self.cipher.as_ref().ok_or(SecurityError::SessionNotSecured)?;

        let counter = self.tx_counter;
        let next = counter.checked_add(1).ok_or(SecurityError::CounterExhausted)?;
        let sealed = cipher.seal(counter, plaintext)?;
        self.tx_counter = next;

        let mut frame = Vec::with_capacity(COUNTER_LEN + sealed.len());
        frame.extend_from_slice(&counter.to_be_bytes());
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Open one inbound application frame. Out-of-sequence or forged frames
    /// move the session to Failed.
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if self.state != SecurityState::Established {
            return Err(SecurityError::SessionNotSecured);
        }
        if frame.len() < COUNTER_LEN {
            self.fail();
            return Err(SecurityError::MalformedFrame);
        }

        let mut counter_bytes = [0u8; COUNTER_LEN];
        counter_bytes.copy_from_slice(&frame[..COUNTER_LEN]);
        let received = u64::from_be_bytes(counter_bytes);
        if received != self.rx_counter {
            let expected = self.rx_counter;
            warn!(
                "sequence violation: expected frame {}, received {}",
                expected, received
            );
            self.fail();
            return Err(SecurityError::SequenceViolation { expected, received });
        }

        let opened = match self.cipher.as_ref() {
            Some(cipher) => cipher.open(received, &frame[COUNTER_LEN..]),
            None => Err(SecurityError::SessionNotSecured),
        };
        match opened {
            Ok(plaintext) => {
                self.rx_counter += 1;
                Ok(plaintext)
            }
            Err(e) => {
                warn!("rejecting frame {}: {}", received, e);
                self.fail();
                Err(e)
            }
        }
    }

    /// Established → Closed. Key material is dropped; a failed session stays failed.
    pub fn close(&mut self) {
        self.cipher = None;
        if self.state != SecurityState::Failed {
            self.state = SecurityState::Closed;
        }
    }

    fn fail(&mut self) {
        self.cipher = None;
        self.state = SecurityState::Failed;
    }
}

impl std::fmt::Debug for SecuritySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuritySession")
            .field("security_type", &self.security_type)
            .field("state", &self.state)
            .field("tx_counter", &self.tx_counter)
            .field("rx_counter", &self.rx_counter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::ecdh::tests::established_pair;
    use crate::security::PlaintextCipher;

    fn plaintext_pair() -> (SecuritySession, SecuritySession) {
        (
            SecuritySession::established(SecurityType::None, Box::new(PlaintextCipher)),
            SecuritySession::established(SecurityType::None, Box::new(PlaintextCipher)),
        )
    }

    #[test]
    fn test_new_session_rejects_frames() {
        let mut session = SecuritySession::new(SecurityType::SecureV1);
        assert_eq!(session.state(), SecurityState::Idle);
        match session.encrypt(b"hello") {
            Err(SecurityError::SessionNotSecured) => (),
            _ => panic!("Wrong error type"),
        }
        match session.decrypt(&[0u8; 16]) {
            Err(SecurityError::SessionNotSecured) => (),
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_frames_flow_in_order() {
        let (mut client, mut device) = established_pair(SecurityType::SecureV2);

        for i in 0..3u8 {
            let frame = client.encrypt(&[i; 10]).unwrap();
            assert_eq!(device.decrypt(&frame).unwrap(), vec![i; 10]);
            let reply = device.encrypt(&[i + 100]).unwrap();
            assert_eq!(client.decrypt(&reply).unwrap(), vec![i + 100]);
        }
    }

    #[test]
    fn test_replayed_frame_forces_failed() {
        let (mut client, mut device) = established_pair(SecurityType::SecureV1);

        let frame = device.encrypt(b"networks").unwrap();
        assert_eq!(client.decrypt(&frame).unwrap(), b"networks");

        match client.decrypt(&frame) {
            Err(SecurityError::SequenceViolation { expected: 2, received: 1 }) => (),
            other => panic!("Wrong error type: {:?}", other),
        }
        assert_eq!(client.state(), SecurityState::Failed);

        // Nothing is accepted afterwards, not even the legitimate next frame.
        let next = device.encrypt(b"more").unwrap();
        match client.decrypt(&next) {
            Err(SecurityError::SessionNotSecured) => (),
            _ => panic!("Wrong error type"),
        }
        assert!(client.encrypt(b"x").is_err());
    }

    #[test]
    fn test_reordered_frames_rejected() {
        let (mut client, mut device) = plaintext_pair();
        let first = device.encrypt(b"one").unwrap();
        let second = device.encrypt(b"two").unwrap();

        match client.decrypt(&second) {
            Err(SecurityError::SequenceViolation { expected: 1, received: 2 }) => (),
            _ => panic!("Wrong error type"),
        }
        assert!(client.decrypt(&first).is_err());
    }

    #[test]
    fn test_tampered_frame_fails_closed() {
        let (mut client, mut device) = established_pair(SecurityType::SecureV2);
        let mut frame = client.encrypt(b"credentials").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        match device.decrypt(&frame) {
            Err(SecurityError::AuthenticationFailed) => (),
            _ => panic!("Wrong error type"),
        }
        assert_eq!(device.state(), SecurityState::Failed);
    }

    #[test]
    fn test_short_frame_is_malformed() {
        let (mut client, _) = plaintext_pair();
        match client.decrypt(&[0, 0, 1]) {
            Err(SecurityError::MalformedFrame) => (),
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_close_rejects_further_frames() {
        let (mut client, mut device) = plaintext_pair();
        let frame = device.encrypt(b"late").unwrap();
        client.close();

        assert_eq!(client.state(), SecurityState::Closed);
        match client.decrypt(&frame) {
            Err(SecurityError::SessionNotSecured) => (),
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_close_keeps_failed() {
        let (mut client, _) = plaintext_pair();
        let _ = client.decrypt(&[0u8; 4]);
        client.close();
        assert_eq!(client.state(), SecurityState::Failed);
    }
}
