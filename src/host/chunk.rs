//! In-memory chunk payload
//!
//! ```text
//! "CHK1" | entity count (u32 LE) | count x 16-byte UUID | block bytes
//! ```
//!
//! Payloads without the magic are treated as raw block data with no
//! entities, so partitions written by other tools still load.

use uuid::Uuid;

use crate::partition::ChunkPos;

use super::errors::{HostError, HostResult};

const MAGIC: &[u8; 4] = b"CHK1";
const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkData {
    pub blocks: Vec<u8>,
    pub entities: Vec<Uuid>,
}

impl ChunkData {
    pub fn new(blocks: impl Into<Vec<u8>>) -> Self {
        Self {
            blocks: blocks.into(),
            entities: Vec::new(),
        }
    }

    pub fn with_entity(mut self, id: Uuid) -> Self {
        self.entities.push(id);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.entities.len() * 16 + self.blocks.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(self.entities.len() as u32).to_le_bytes());
        for id in &self.entities {
            out.extend_from_slice(id.as_bytes());
        }
        out.extend_from_slice(&self.blocks);
        out
    }

    pub fn decode(pos: ChunkPos, bytes: &[u8]) -> HostResult<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Ok(Self::new(bytes));
        }

        let mut count = [0u8; 4];
        count.copy_from_slice(&bytes[4..8]);
        let count = u32::from_le_bytes(count) as usize;

        let ids_end = count
            .checked_mul(16)
            .and_then(|n| n.checked_add(HEADER_LEN))
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| HostError::MalformedChunk {
                pos,
                reason: format!("{} entities do not fit in {} bytes", count, bytes.len()),
            })?;

        let entities = bytes[HEADER_LEN..ids_end]
            .chunks_exact(16)
            .map(|raw| {
                let mut id = [0u8; 16];
                id.copy_from_slice(raw);
                Uuid::from_bytes(id)
            })
            .collect();

        Ok(Self {
            blocks: bytes[ids_end..].to_vec(),
            entities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entities_survive_encoding() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let chunk = ChunkData::new(b"stone".to_vec()).with_entity(a).with_entity(b);
        let decoded = ChunkData::decode(ChunkPos::new(0, 0), &chunk.encode()).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_raw_payload_is_blocks_only() {
        let decoded = ChunkData::decode(ChunkPos::new(0, 0), b"x").unwrap();
        assert_eq!(decoded.blocks, b"x".to_vec());
        assert!(decoded.entities.is_empty());
    }

    #[test]
    fn test_truncated_entity_table_rejected() {
        let mut bytes = ChunkData::new(Vec::new()).with_entity(Uuid::new_v4()).encode();
        bytes.truncate(12);
        let err = ChunkData::decode(ChunkPos::new(2, 3), &bytes).unwrap_err();
        assert!(matches!(err, HostError::MalformedChunk { .. }));
    }
}
