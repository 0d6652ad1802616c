///! Checkpoint creation and loading
///!
///! A checkpoint is a full image of the live key set as of one sequence.
///! Entries are written in key order, packed into blocks of roughly
///! `block_size` bytes, each optionally deflated.

use super::format::{calculate_crc32, calculate_sha256, CheckpointHeader};
use super::{PersistenceError, Result};
use crate::options::Compression;
use crate::types::Sequence;
use bytes::Bytes;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression as DeflateLevel;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CHECKPOINT_PREFIX: &str = "checkpoint-";
const CHECKPOINT_SUFFIX: &str = ".ckpt";

/// Checkpoint file name for a sequence; zero-padded so names sort by sequence
pub fn checkpoint_file_name(sequence: Sequence) -> String {
    format!("{}{:020}{}", CHECKPOINT_PREFIX, sequence, CHECKPOINT_SUFFIX)
}

/// Checkpoint writer
pub struct CheckpointWriter {
    compression: Compression,
    block_size: usize,
    keep_count: usize,
}

impl CheckpointWriter {
    pub fn new(compression: Compression, block_size: usize, keep_count: usize) -> Self {
        Self {
            compression,
            block_size: block_size.max(1),
            keep_count: keep_count.max(1),
        }
    }

    /// Write a checkpoint of `entries` (ascending key order) taken at `sequence`
    pub fn write<I>(&self, data_dir: &Path, sequence: Sequence, entries: I) -> Result<PathBuf>
    where
        I: IntoIterator<Item = (Bytes, Bytes)>,
    {
        let name = checkpoint_file_name(sequence);
        let temp_path = data_dir.join(format!("{}.tmp", name));
        let final_path = data_dir.join(&name);

        let mut body = Vec::new();
        let mut block: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut block_bytes = 0usize;
        let mut total_entries = 0u64;
        let mut num_blocks = 0u32;

        for (key, value) in entries {
            block_bytes += key.len() + value.len();
            block.push((key.to_vec(), value.to_vec()));
            total_entries += 1;

            if block_bytes >= self.block_size {
                self.append_block(&mut body, &block)?;
                num_blocks += 1;
                block.clear();
                block_bytes = 0;
            }
        }
        if !block.is_empty() {
            self.append_block(&mut body, &block)?;
            num_blocks += 1;
        }

        let header = CheckpointHeader::new(
            self.compression.tag(),
            sequence,
            total_entries,
            num_blocks,
            calculate_sha256(&body),
        );

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        header.write(&mut writer)?;
        writer.write_all(&body)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        fs::rename(&temp_path, &final_path)?;

        info!(
            "Checkpoint written: {} ({} entries, {} blocks, sequence {})",
            final_path.display(),
            total_entries,
            num_blocks,
            sequence
        );

        self.cleanup_old_checkpoints(data_dir)?;

        Ok(final_path)
    }

    fn append_block(&self, body: &mut Vec<u8>, block: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let raw = bincode::serialize(block)?;
        let payload = match self.compression {
            Compression::None => raw,
            Compression::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), DeflateLevel::default());
                encoder.write_all(&raw)?;
                encoder.finish()?
            }
        };

        body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        body.extend_from_slice(&calculate_crc32(&payload).to_be_bytes());
        body.extend_from_slice(&payload);
        Ok(())
    }

    /// Keep only the newest `keep_count` checkpoints
    fn cleanup_old_checkpoints(&self, data_dir: &Path) -> Result<()> {
        let checkpoints = find_checkpoint_files(data_dir)?;
        if checkpoints.len() <= self.keep_count {
            return Ok(());
        }

        let excess = checkpoints.len() - self.keep_count;
        for path in &checkpoints[..excess] {
            debug!("Deleting old checkpoint: {}", path.display());
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to delete checkpoint {}: {}", path.display(), e);
            }
        }

        Ok(())
    }
}

/// Checkpoint contents loaded from disk
#[derive(Debug)]
pub struct CheckpointData {
    pub sequence: Sequence,
    pub entries: Vec<(Bytes, Bytes)>,
}

/// Checkpoint loader
pub struct CheckpointLoader;

impl CheckpointLoader {
    /// Load the newest checkpoint
    ///
    /// Older checkpoints predate the last WAL reset and are not a fallback.
    pub fn load_latest(data_dir: &Path) -> Result<Option<CheckpointData>> {
        match find_checkpoint_files(data_dir)?.last() {
            Some(path) => Self::load(path).map(Some),
            None => Ok(None),
        }
    }

    /// Load and verify a single checkpoint file
    pub fn load(path: &Path) -> Result<CheckpointData> {
        info!("Loading checkpoint: {}", path.display());

        let mut reader = BufReader::new(File::open(path)?);
        let header = CheckpointHeader::read(&mut reader)?;
        let compression = Compression::from_tag(header.codec)
            .ok_or(PersistenceError::UnsupportedCodec(header.codec))?;

        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;

        if calculate_sha256(&body) != header.checksum {
            return Err(PersistenceError::CorruptedCheckpoint(format!(
                "SHA-256 mismatch in {}",
                path.display()
            )));
        }

        let mut entries = Vec::with_capacity(header.total_entries as usize);
        let mut offset = 0usize;

        for block_index in 0..header.num_blocks {
            if offset + 8 > body.len() {
                return Err(PersistenceError::CorruptedCheckpoint(format!(
                    "block {} truncated",
                    block_index
                )));
            }
            let len = u32::from_be_bytes([body[offset], body[offset + 1], body[offset + 2], body[offset + 3]])
                as usize;
            let crc = u32::from_be_bytes([
                body[offset + 4],
                body[offset + 5],
                body[offset + 6],
                body[offset + 7],
            ]);
            offset += 8;

            if offset + len > body.len() {
                return Err(PersistenceError::CorruptedCheckpoint(format!(
                    "block {} truncated",
                    block_index
                )));
            }
            let payload = &body[offset..offset + len];
            let actual = calculate_crc32(payload);
            if actual != crc {
                return Err(PersistenceError::ChecksumMismatch {
                    pos: offset as u64,
                    expected: crc,
                    actual,
                });
            }
            offset += len;

            let raw = match compression {
                Compression::None => payload.to_vec(),
                Compression::Deflate => {
                    let mut decoded = Vec::new();
                    DeflateDecoder::new(payload).read_to_end(&mut decoded)?;
                    decoded
                }
            };

            let block: Vec<(Vec<u8>, Vec<u8>)> = bincode::deserialize(&raw)?;
            entries.extend(block.into_iter().map(|(k, v)| (Bytes::from(k), Bytes::from(v))));
        }

        if entries.len() as u64 != header.total_entries {
            return Err(PersistenceError::CorruptedCheckpoint(format!(
                "expected {} entries, found {}",
                header.total_entries,
                entries.len()
            )));
        }

        info!(
            "Loaded checkpoint: {} entries at sequence {}",
            entries.len(),
            header.sequence
        );

        Ok(CheckpointData {
            sequence: header.sequence,
            entries,
        })
    }
}

/// Checkpoint files in `data_dir`, oldest first
pub fn find_checkpoint_files(data_dir: &Path) -> Result<Vec<PathBuf>> {
    if !data_dir.exists() {
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();

    for entry in fs::read_dir(data_dir)? {
        let path = entry?.path();

        if path.is_file() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with(CHECKPOINT_PREFIX) && name.ends_with(CHECKPOINT_SUFFIX) {
                    checkpoints.push(path);
                }
            }
        }
    }

    checkpoints.sort();

    Ok(checkpoints)
}
