/// GATT layout for the provisioning service
///
/// Each provisioning endpoint is a characteristic of one primary service. A
/// request is written to the endpoint's characteristic and the response is read
/// back from the same characteristic. Payloads larger than the negotiated MTU
/// are split into framed chunks on write and collected again on read.

use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{EP_CONTROL, EP_SCAN, EP_SESSION, EP_CONFIG, EP_VERSION};

/// Default provisioning service UUID
pub const PROV_SERVICE_UUID: Uuid = Uuid::from_u128(0x021a9004_0382_4aea_bff4_6b3f1c5adfb4);

/// Default ATT payload size when the link did not negotiate a larger MTU
pub const DEFAULT_ATT_PAYLOAD: usize = 20;

/// Largest payload a single characteristic write may carry
pub const MAX_ATT_PAYLOAD: usize = 512;

/// Short id of the first custom endpoint characteristic
const FIRST_CUSTOM_SHORT_ID: u16 = 0xFF54;

/// Errors for GATT framing and endpoint lookups
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Fragmentation error: {0}")]
    FragmentationError(String),
    #[error("Reassembly error: {0}")]
    ReassemblyError(String),
    #[error("No characteristic for endpoint {0}")]
    UnknownEndpoint(String),
    #[error("Endpoint space exhausted")]
    EndpointSpaceExhausted,
}

/// Derive a characteristic UUID by placing `short_id` in bits 80..96 of the service UUID
pub fn characteristic_uuid(service: Uuid, short_id: u16) -> Uuid {
    let mut bytes = *service.as_bytes();
    bytes[2..4].copy_from_slice(&short_id.to_be_bytes());
    Uuid::from_bytes(bytes)
}

/// Endpoint name → characteristic UUID table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMap {
    service: Uuid,
    endpoints: BTreeMap<String, Uuid>,
    next_custom: u16,
}

impl EndpointMap {
    /// Standard layout: ctrl 0xFF4F, scan 0xFF50, session 0xFF51, config 0xFF52, version 0xFF53
    pub fn standard(service: Uuid) -> Self {
        let mut endpoints = BTreeMap::new();
        for (name, short_id) in [
            (EP_CONTROL, 0xFF4Fu16),
            (EP_SCAN, 0xFF50),
            (EP_SESSION, 0xFF51),
            (EP_CONFIG, 0xFF52),
            (EP_VERSION, 0xFF53),
        ] {
            endpoints.insert(name.to_string(), characteristic_uuid(service, short_id));
        }
        Self {
            service,
            endpoints,
            next_custom: FIRST_CUSTOM_SHORT_ID,
        }
    }

    pub fn service(&self) -> Uuid {
        self.service
    }

    /// Allocate the next custom characteristic for `name`.
    /// Registering an existing name returns its current UUID.
    pub fn register_custom(&mut self, name: &str) -> Result<Uuid, GattError> {
        if let Some(uuid) = self.endpoints.get(name) {
            return Ok(*uuid);
        }
        if self.next_custom == u16::MAX {
            return Err(GattError::EndpointSpaceExhausted);
        }
        let uuid = characteristic_uuid(self.service, self.next_custom);
        self.next_custom += 1;
        self.endpoints.insert(name.to_string(), uuid);
        Ok(uuid)
    }

    pub fn resolve(&self, name: &str) -> Result<Uuid, GattError> {
        self.endpoints
            .get(name)
            .copied()
            .ok_or_else(|| GattError::UnknownEndpoint(name.to_string()))
    }
}

/// Chunk header: [index: u16 BE | total: u16 BE]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub index: u16,
    pub total: u16,
}

impl ChunkHeader {
    pub const SIZE: usize = 4;

    pub fn new(index: u16, total: u16) -> Result<Self, GattError> {
        if total == 0 || index >= total {
            return Err(GattError::FragmentationError(format!(
                "chunk {} of {} is out of range",
                index, total
            )));
        }
        Ok(Self { index, total })
    }

    pub fn to_bytes(self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0..2].copy_from_slice(&self.index.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.total.to_be_bytes());
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, GattError> {
        if bytes.len() < Self::SIZE {
            return Err(GattError::ReassemblyError("chunk header too short".to_string()));
        }
        let index = u16::from_be_bytes([bytes[0], bytes[1]]);
        let total = u16::from_be_bytes([bytes[2], bytes[3]]);
        Self::new(index, total).map_err(|e| GattError::ReassemblyError(e.to_string()))
    }
}

/// Splits payloads into MTU-sized characteristic writes
#[derive(Debug, Clone, Copy)]
pub struct GattFragmenter {
    att_payload: usize,
}

impl GattFragmenter {
    pub fn new(att_payload: usize) -> Result<Self, GattError> {
        if att_payload <= ChunkHeader::SIZE || att_payload > MAX_ATT_PAYLOAD {
            return Err(GattError::FragmentationError(format!(
                "ATT payload {} outside {}..={}",
                att_payload,
                ChunkHeader::SIZE + 1,
                MAX_ATT_PAYLOAD
            )));
        }
        Ok(Self { att_payload })
    }

    pub fn chunk_capacity(&self) -> usize {
        self.att_payload - ChunkHeader::SIZE
    }

    /// Always yields at least one chunk, so empty payloads are still delivered.
    pub fn fragment(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, GattError> {
        let capacity = self.chunk_capacity();
        let total = data.len().div_ceil(capacity).max(1);
        if total > u16::MAX as usize {
            return Err(GattError::FragmentationError(format!(
                "payload of {} bytes needs {} chunks",
                data.len(),
                total
            )));
        }

        if data.is_empty() {
            return Ok(vec![ChunkHeader::new(0, 1)?.to_bytes().to_vec()]);
        }

        data.chunks(capacity)
            .enumerate()
            .map(|(index, chunk)| {
                let header = ChunkHeader::new(index as u16, total as u16)?;
                let mut frame = Vec::with_capacity(ChunkHeader::SIZE + chunk.len());
                frame.extend_from_slice(&header.to_bytes());
                frame.extend_from_slice(chunk);
                Ok(frame)
            })
            .collect()
    }
}

/// Collects chunks read from a characteristic until a payload is complete
#[derive(Debug, Default)]
pub struct GattReassembler {
    total: Option<u16>,
    next_index: u16,
    buffer: Vec<u8>,
}

impl GattReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the payload once the final chunk arrives.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, GattError> {
        let header = ChunkHeader::parse(chunk)?;
        match self.total {
            None => self.total = Some(header.total),
            Some(total) if total != header.total => {
                self.reset();
                return Err(GattError::ReassemblyError(format!(
                    "chunk claims {} parts, expected {}",
                    header.total, total
                )));
            }
            Some(_) => {}
        }
        if header.index != self.next_index {
            let expected = self.next_index;
            self.reset();
            return Err(GattError::ReassemblyError(format!(
                "expected chunk {}, got {}",
                expected, header.index
            )));
        }

        self.buffer.extend_from_slice(&chunk[ChunkHeader::SIZE..]);
        self.next_index += 1;

        if self.next_index == header.total {
            let payload = std::mem::take(&mut self.buffer);
            self.reset();
            return Ok(Some(payload));
        }
        Ok(None)
    }

    /// Chunks still missing, if a payload is in progress
    pub fn remaining(&self) -> Option<u16> {
        self.total.map(|total| total - self.next_index)
    }

    pub fn reset(&mut self) {
        self.total = None;
        self.next_index = 0;
        self.buffer.clear();
    }
}
