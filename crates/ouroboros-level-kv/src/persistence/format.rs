///! Binary format definitions for WAL and checkpoint files
///!
///! ## WAL File Format
///!
///! ```text
///! Header: [Magic:8 | Version:4 | Created:8 | Reserved:12] = 32 bytes
///! Entry:  [Length:4 | Timestamp:8 | OpType:1 | Payload:N | CRC32:4]
///! ```
///!
///! ## Checkpoint File Format
///!
///! ```text
///! Header: [Magic:8 | Version:4 | Created:8 | Codec:1 | Reserved:3 | Sequence:8 | Entries:8 | Blocks:4 | SHA256:32] = 76 bytes
///! Block:  [Length:4 | CRC32:4 | Payload:N]   (payload = bincode Vec<(key, value)>, optionally deflated)
///! ```

use crate::persistence::{PersistenceError, Result};
use crate::types::{BatchOp, Sequence};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// WAL file magic number: "LVWAL001"
pub const WAL_MAGIC: &[u8; 8] = b"LVWAL001";

/// WAL format version
pub const WAL_VERSION: u32 = 1;

/// WAL header size in bytes
pub const WAL_HEADER_LEN: u64 = 32;

/// Checkpoint file magic number: "LVCKPT01"
pub const CHECKPOINT_MAGIC: &[u8; 8] = b"LVCKPT01";

/// Checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// WAL operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalOpType {
    Put = 1,
    Delete = 2,
    Batch = 3,
}

impl WalOpType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(WalOpType::Put),
            2 => Some(WalOpType::Delete),
            3 => Some(WalOpType::Batch),
            _ => None,
        }
    }
}

/// WAL operation data
///
/// `sequence` is the sequence of the first mutation in the record; a batch of
/// N ops occupies `sequence..sequence + N`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    Put {
        sequence: Sequence,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        sequence: Sequence,
        key: Vec<u8>,
    },
    Batch {
        sequence: Sequence,
        ops: Vec<BatchOp>,
    },
}

impl WalOp {
    /// Build the record for a committed write
    pub fn from_ops(sequence: Sequence, ops: &[BatchOp]) -> Self {
        match ops {
            [BatchOp::Put { key, value }] => WalOp::Put {
                sequence,
                key: key.to_vec(),
                value: value.to_vec(),
            },
            [BatchOp::Delete { key }] => WalOp::Delete {
                sequence,
                key: key.to_vec(),
            },
            _ => WalOp::Batch {
                sequence,
                ops: ops.to_vec(),
            },
        }
    }

    pub fn op_type(&self) -> WalOpType {
        match self {
            WalOp::Put { .. } => WalOpType::Put,
            WalOp::Delete { .. } => WalOpType::Delete,
            WalOp::Batch { .. } => WalOpType::Batch,
        }
    }

    /// First sequence covered by this record
    pub fn sequence(&self) -> Sequence {
        match self {
            WalOp::Put { sequence, .. }
            | WalOp::Delete { sequence, .. }
            | WalOp::Batch { sequence, .. } => *sequence,
        }
    }

    /// Expand the record back into batch operations
    pub fn into_ops(self) -> Vec<BatchOp> {
        match self {
            WalOp::Put { key, value, .. } => vec![BatchOp::put(key, value)],
            WalOp::Delete { key, .. } => vec![BatchOp::delete(key)],
            WalOp::Batch { ops, .. } => ops,
        }
    }
}

/// WAL entry with metadata
#[derive(Debug, Clone)]
pub struct WalEntry {
    /// Timestamp in nanoseconds since Unix epoch
    pub timestamp: i64,

    /// The operation
    pub op: WalOp,
}

/// WAL file header (32 bytes)
#[derive(Debug, Clone)]
pub struct WalHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub created_at: i64, // Unix timestamp in nanoseconds
}

impl WalHeader {
    pub fn new() -> Self {
        Self {
            magic: *WAL_MAGIC,
            version: WAL_VERSION,
            created_at: super::unix_nanos(),
        }
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_be_bytes())?;
        writer.write_all(&self.created_at.to_be_bytes())?;
        writer.write_all(&[0u8; 12])?; // Reserved
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;

        if &magic != WAL_MAGIC {
            return Err(PersistenceError::InvalidMagic {
                expected: WAL_MAGIC.to_vec(),
                actual: magic.to_vec(),
            });
        }

        let mut version_bytes = [0u8; 4];
        reader.read_exact(&mut version_bytes)?;
        let version = u32::from_be_bytes(version_bytes);

        if version != WAL_VERSION {
            return Err(PersistenceError::UnsupportedVersion(version));
        }

        let mut created_bytes = [0u8; 8];
        reader.read_exact(&mut created_bytes)?;
        let created_at = i64::from_be_bytes(created_bytes);

        let mut reserved = [0u8; 12];
        reader.read_exact(&mut reserved)?;

        Ok(Self {
            magic,
            version,
            created_at,
        })
    }
}

impl Default for WalHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Checkpoint file header (76 bytes)
#[derive(Debug, Clone)]
pub struct CheckpointHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub created_at: i64,
    pub codec: u8,
    /// Every mutation up to and including this sequence is in the image
    pub sequence: Sequence,
    pub total_entries: u64,
    pub num_blocks: u32,
    pub checksum: [u8; 32], // SHA256 of all block bytes
}

impl CheckpointHeader {
    pub fn new(codec: u8, sequence: Sequence, total_entries: u64, num_blocks: u32, checksum: [u8; 32]) -> Self {
        Self {
            magic: *CHECKPOINT_MAGIC,
            version: CHECKPOINT_VERSION,
            created_at: super::unix_nanos(),
            codec,
            sequence,
            total_entries,
            num_blocks,
            checksum,
        }
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_be_bytes())?;
        writer.write_all(&self.created_at.to_be_bytes())?;
        writer.write_all(&[self.codec, 0, 0, 0])?;
        writer.write_all(&self.sequence.to_be_bytes())?;
        writer.write_all(&self.total_entries.to_be_bytes())?;
        writer.write_all(&self.num_blocks.to_be_bytes())?;
        writer.write_all(&self.checksum)?;
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;

        if &magic != CHECKPOINT_MAGIC {
            return Err(PersistenceError::InvalidMagic {
                expected: CHECKPOINT_MAGIC.to_vec(),
                actual: magic.to_vec(),
            });
        }

        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];

        reader.read_exact(&mut buf4)?;
        let version = u32::from_be_bytes(buf4);
        if version != CHECKPOINT_VERSION {
            return Err(PersistenceError::UnsupportedVersion(version));
        }

        reader.read_exact(&mut buf8)?;
        let created_at = i64::from_be_bytes(buf8);

        reader.read_exact(&mut buf4)?;
        let codec = buf4[0];

        reader.read_exact(&mut buf8)?;
        let sequence = u64::from_be_bytes(buf8);

        reader.read_exact(&mut buf8)?;
        let total_entries = u64::from_be_bytes(buf8);

        reader.read_exact(&mut buf4)?;
        let num_blocks = u32::from_be_bytes(buf4);

        let mut checksum = [0u8; 32];
        reader.read_exact(&mut checksum)?;

        Ok(Self {
            magic,
            version,
            created_at,
            codec,
            sequence,
            total_entries,
            num_blocks,
            checksum,
        })
    }
}

/// Calculate CRC32 checksum
pub fn calculate_crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Calculate SHA256 checksum
pub fn calculate_sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Encode a WAL entry with checksum
pub fn encode_wal_entry(entry: &WalEntry) -> Result<Vec<u8>> {
    let op_bytes = bincode::serialize(&entry.op)?;

    // timestamp + op_type + payload + crc32
    let total_length = 8 + 1 + op_bytes.len() + 4;

    let mut buffer = Vec::with_capacity(4 + total_length);
    buffer.extend_from_slice(&(total_length as u32).to_be_bytes());
    buffer.extend_from_slice(&entry.timestamp.to_be_bytes());
    buffer.push(entry.op.op_type() as u8);
    buffer.extend_from_slice(&op_bytes);

    // Checksum of everything except the length prefix
    let checksum = calculate_crc32(&buffer[4..]);
    buffer.extend_from_slice(&checksum.to_be_bytes());

    Ok(buffer)
}

/// Decode a WAL entry and verify checksum
pub fn decode_wal_entry(data: &[u8], position: u64) -> Result<WalEntry> {
    if data.len() < 4 {
        return Err(PersistenceError::CorruptedWal {
            pos: position,
            reason: format!("Too short: {} bytes", data.len()),
        });
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length < 13 || data.len() < 4 + length {
        return Err(PersistenceError::CorruptedWal {
            pos: position,
            reason: format!("Incomplete entry: expected {} bytes, got {}", 4 + length, data.len()),
        });
    }

    let expected_checksum = u32::from_be_bytes([
        data[4 + length - 4],
        data[4 + length - 3],
        data[4 + length - 2],
        data[4 + length - 1],
    ]);
    let actual_checksum = calculate_crc32(&data[4..4 + length - 4]);

    if expected_checksum != actual_checksum {
        return Err(PersistenceError::ChecksumMismatch {
            pos: position,
            expected: expected_checksum,
            actual: actual_checksum,
        });
    }

    let timestamp = i64::from_be_bytes([
        data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
    ]);

    let op_type_byte = data[12];
    let op_type = WalOpType::from_u8(op_type_byte).ok_or_else(|| PersistenceError::CorruptedWal {
        pos: position,
        reason: format!("Invalid op type: {}", op_type_byte),
    })?;

    let op_bytes = &data[13..4 + length - 4];
    let op: WalOp = bincode::deserialize(op_bytes).map_err(|e| PersistenceError::CorruptedWal {
        pos: position,
        reason: format!("Deserialization failed: {}", e),
    })?;

    if op.op_type() != op_type {
        return Err(PersistenceError::CorruptedWal {
            pos: position,
            reason: format!("Op type {:?} does not match payload {:?}", op_type, op.op_type()),
        });
    }

    Ok(WalEntry { timestamp, op })
}
