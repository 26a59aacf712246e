// X25519 schemes: secure-v1 and secure-v2
//
// Flow (client):
// 1. Generate ephemeral X25519 keypair, send Command0 { client_pub }
// 2. Device answers Response0 { device_pub, device_random }
// 3. ECDH: client_secret × device_pub → shared
// 4. Keys:
//    secure-v1: key = shared XOR SHA-256(pop), same key both directions
//    secure-v2: BLAKE3 derive_key over shared ‖ SHA-256(pop) ‖ client_pub ‖
//               device_pub ‖ device_random, one key per direction
// 5. Command1 { seal(0, device_pub) } proves the client holds the pop
// 6. Response1 { seal(0, client_pub) } proves the device does
//
// ChaCha20-Poly1305 nonce: direction ‖ device_random[0..3] ‖ counter (BE),
// with the counter bound again as associated data.

use super::{
    FrameCipher, HandshakeFailure, ProofOfPossession, SecurityError, SecurityScheme,
    SecuritySession, SecurityType,
};
use crate::protocol::{self, SessionMessage, Status, EP_SESSION};
use crate::transport::{exchange, Transport};
use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// KDF contexts for secure-v2. Changing these breaks every deployed device.
const KDF_CLIENT_TO_DEVICE: &str = "wifiprov secure-v2 2024-05-01 client-to-device";
const KDF_DEVICE_TO_CLIENT: &str = "wifiprov secure-v2 2024-05-01 device-to-client";

const DIR_CLIENT_TO_DEVICE: u8 = 0x01;
const DIR_DEVICE_TO_CLIENT: u8 = 0x02;

/// Counter reserved for the handshake verification tokens
const VERIFY_COUNTER: u64 = 0;

/// Which end of the link a cipher serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Device,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKeys {
    client_to_device: [u8; 32],
    device_to_client: [u8; 32],
}

impl SessionKeys {
    fn derive(
        security_type: SecurityType,
        shared: &[u8; 32],
        pop: &ProofOfPossession,
        client_pub: &[u8; 32],
        device_pub: &[u8; 32],
        device_random: &[u8; 16],
    ) -> Self {
        let mut pop_hash: [u8; 32] = Sha256::digest(pop.as_bytes()).into();

        let keys = match security_type {
            SecurityType::SecureV2 => {
                let mut material = Vec::with_capacity(32 * 4 + 16);
                material.extend_from_slice(shared);
                material.extend_from_slice(&pop_hash);
                material.extend_from_slice(client_pub);
                material.extend_from_slice(device_pub);
                material.extend_from_slice(device_random);
                let keys = Self {
                    client_to_device: blake3::derive_key(KDF_CLIENT_TO_DEVICE, &material),
                    device_to_client: blake3::derive_key(KDF_DEVICE_TO_CLIENT, &material),
                };
                material.zeroize();
                keys
            }
            _ => {
                let mut key = *shared;
                for (k, p) in key.iter_mut().zip(pop_hash.iter()) {
                    *k ^= p;
                }
                let keys = Self {
                    client_to_device: key,
                    device_to_client: key,
                };
                key.zeroize();
                keys
            }
        };

        pop_hash.zeroize();
        keys
    }
}

/// ChaCha20-Poly1305 keyed for one role
pub struct AeadCipher {
    sealer: ChaCha20Poly1305,
    opener: ChaCha20Poly1305,
    seal_direction: u8,
    open_direction: u8,
    salt: [u8; 3],
}

impl AeadCipher {
    fn new(keys: &SessionKeys, role: Role, device_random: &[u8; 16]) -> Result<Self, SecurityError> {
        let to_device = ChaCha20Poly1305::new_from_slice(&keys.client_to_device)
            .map_err(|e| SecurityError::Crypto(format!("Failed to create cipher: {}", e)))?;
        let to_client = ChaCha20Poly1305::new_from_slice(&keys.device_to_client)
            .map_err(|e| SecurityError::Crypto(format!("Failed to create cipher: {}", e)))?;

        let mut salt = [0u8; 3];
        salt.copy_from_slice(&device_random[..3]);

        Ok(match role {
            Role::Client => Self {
                sealer: to_device,
                opener: to_client,
                seal_direction: DIR_CLIENT_TO_DEVICE,
                open_direction: DIR_DEVICE_TO_CLIENT,
                salt,
            },
            Role::Device => Self {
                sealer: to_client,
                opener: to_device,
                seal_direction: DIR_DEVICE_TO_CLIENT,
                open_direction: DIR_CLIENT_TO_DEVICE,
                salt,
            },
        })
    }

    fn nonce(&self, direction: u8, counter: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0] = direction;
        nonce[1..4].copy_from_slice(&self.salt);
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }
}

impl FrameCipher for AeadCipher {
    fn seal(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let nonce = self.nonce(self.seal_direction, counter);
        let aad = counter.to_be_bytes();
        self.sealer
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| SecurityError::Crypto("seal failed".to_string()))
    }

    fn open(&self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let nonce = self.nonce(self.open_direction, counter);
        let aad = counter.to_be_bytes();
        self.opener
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| SecurityError::AuthenticationFailed)
    }
}

fn protocol_failure(detail: impl Into<String>) -> SecurityError {
    SecurityError::HandshakeFailed(HandshakeFailure::Protocol(detail.into()))
}

// ============================================================================
// CLIENT
// ============================================================================

/// Client half of secure-v1 / secure-v2
#[derive(Debug, Clone, Copy)]
pub struct EcdhScheme {
    security_type: SecurityType,
}

impl EcdhScheme {
    pub fn secure_v1() -> Self {
        Self {
            security_type: SecurityType::SecureV1,
        }
    }

    pub fn secure_v2() -> Self {
        Self {
            security_type: SecurityType::SecureV2,
        }
    }

    async fn round_trip(
        transport: &dyn Transport,
        message: &SessionMessage,
        timeout: Duration,
    ) -> Result<SessionMessage, SecurityError> {
        let request = protocol::encode(message).map_err(|e| protocol_failure(e.to_string()))?;
        let response = exchange(transport, EP_SESSION, &request, timeout)
            .await
            .map_err(|e| SecurityError::HandshakeFailed(HandshakeFailure::Transport(e.to_string())))?;
        protocol::decode(&response).map_err(|e| protocol_failure(e.to_string()))
    }
}

impl TryFrom<SecurityType> for EcdhScheme {
    type Error = SecurityError;

    fn try_from(security_type: SecurityType) -> Result<Self, Self::Error> {
        match security_type {
            SecurityType::SecureV1 => Ok(Self::secure_v1()),
            SecurityType::SecureV2 => Ok(Self::secure_v2()),
            SecurityType::None => Err(SecurityError::UnknownScheme(
                "none has no key exchange".to_string(),
            )),
        }
    }
}

#[async_trait]
impl SecurityScheme for EcdhScheme {
    fn security_type(&self) -> SecurityType {
        self.security_type
    }

    async fn handshake(
        &self,
        pop: &ProofOfPossession,
        transport: &dyn Transport,
        timeout: Duration,
    ) -> Result<Box<dyn FrameCipher>, SecurityError> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let client_pub = PublicKey::from(&secret);

        let command0 = SessionMessage::Command0 {
            sec_ver: self.security_type.version(),
            client_pubkey: client_pub.to_bytes(),
        };
        let (device_pub, device_random) = match Self::round_trip(transport, &command0, timeout).await? {
            SessionMessage::Response0 {
                status: Status::Success,
                device_pubkey,
                device_random,
            } => (device_pubkey, device_random),
            SessionMessage::Response0 { status, .. } => {
                return Err(protocol_failure(format!("device refused session: {}", status)))
            }
            other => return Err(protocol_failure(format!("expected Response0, got {:?}", other))),
        };

        let shared = secret.diffie_hellman(&PublicKey::from(device_pub));
        if !shared.was_contributory() {
            return Err(protocol_failure("device public key is low order"));
        }

        let keys = SessionKeys::derive(
            self.security_type,
            shared.as_bytes(),
            pop,
            client_pub.as_bytes(),
            &device_pub,
            &device_random,
        );
        let cipher = AeadCipher::new(&keys, Role::Client, &device_random)?;
        debug!("{} keys derived", self.security_type);

        let command1 = SessionMessage::Command1 {
            client_verify: cipher.seal(VERIFY_COUNTER, &device_pub)?,
        };
        let device_verify = match Self::round_trip(transport, &command1, timeout).await? {
            SessionMessage::Response1 {
                status: Status::Success,
                device_verify,
            } => device_verify,
            SessionMessage::Response1 {
                status: Status::InvalidProof,
                ..
            } => return Err(SecurityError::HandshakeFailed(HandshakeFailure::WrongSecret)),
            SessionMessage::Response1 { status, .. } => {
                return Err(protocol_failure(format!("device rejected verification: {}", status)))
            }
            other => return Err(protocol_failure(format!("expected Response1, got {:?}", other))),
        };

        match cipher.open(VERIFY_COUNTER, &device_verify) {
            Ok(echo) if echo == client_pub.as_bytes() => Ok(Box::new(cipher)),
            _ => {
                warn!("device verification token did not match");
                Err(SecurityError::HandshakeFailed(HandshakeFailure::WrongSecret))
            }
        }
    }
}

// ============================================================================
// DEVICE
// ============================================================================

struct PendingVerification {
    cipher: AeadCipher,
    client_pub: [u8; 32],
    device_pub: [u8; 32],
}

/// Device half of secure-v1 / secure-v2, one command at a time
pub struct EcdhResponder {
    security_type: SecurityType,
    pop: ProofOfPossession,
    pending: Option<PendingVerification>,
}

impl EcdhResponder {
    pub fn new(security_type: SecurityType, pop: ProofOfPossession) -> Self {
        Self {
            security_type,
            pop,
            pending: None,
        }
    }

    /// Answer one handshake command. The second element is the device session,
    /// present once the client has proven the pop.
    pub fn respond(&mut self, command: SessionMessage) -> (SessionMessage, Option<SecuritySession>) {
        match command {
            SessionMessage::Command0 {
                sec_ver,
                client_pubkey,
            } => (self.start(sec_ver, client_pubkey), None),
            SessionMessage::Command1 { client_verify } => self.verify(&client_verify),
            _ => (
                SessionMessage::Response1 {
                    status: Status::InvalidProto,
                    device_verify: Vec::new(),
                },
                None,
            ),
        }
    }

    fn start(&mut self, sec_ver: u8, client_pubkey: [u8; 32]) -> SessionMessage {
        self.pending = None;
        let refuse = |status| SessionMessage::Response0 {
            status,
            device_pubkey: [0u8; 32],
            device_random: [0u8; 16],
        };

        if sec_ver != self.security_type.version() {
            return refuse(Status::InvalidSecScheme);
        }

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let device_pub = PublicKey::from(&secret).to_bytes();
        let mut device_random = [0u8; 16];
        OsRng.fill_bytes(&mut device_random);

        let shared = secret.diffie_hellman(&PublicKey::from(client_pubkey));
        if !shared.was_contributory() {
            return refuse(Status::InvalidArgument);
        }

        let keys = SessionKeys::derive(
            self.security_type,
            shared.as_bytes(),
            &self.pop,
            &client_pubkey,
            &device_pub,
            &device_random,
        );
        match AeadCipher::new(&keys, Role::Device, &device_random) {
            Ok(cipher) => {
                self.pending = Some(PendingVerification {
                    cipher,
                    client_pub: client_pubkey,
                    device_pub,
                });
                SessionMessage::Response0 {
                    status: Status::Success,
                    device_pubkey: device_pub,
                    device_random,
                }
            }
            Err(_) => refuse(Status::InternalError),
        }
    }

    fn verify(&mut self, client_verify: &[u8]) -> (SessionMessage, Option<SecuritySession>) {
        let reply = |status, device_verify| SessionMessage::Response1 {
            status,
            device_verify,
        };

        let Some(pending) = self.pending.take() else {
            return (reply(Status::InvalidProto, Vec::new()), None);
        };

        match pending.cipher.open(VERIFY_COUNTER, client_verify) {
            Ok(token) if token == pending.device_pub => {}
            _ => return (reply(Status::InvalidProof, Vec::new()), None),
        }

        match pending.cipher.seal(VERIFY_COUNTER, &pending.client_pub) {
            Ok(device_verify) => {
                let session =
                    SecuritySession::established(self.security_type, Box::new(pending.cipher));
                (reply(Status::Success, device_verify), Some(session))
            }
            Err(_) => (reply(Status::InternalError, Vec::new()), None),
        }
    }
}
