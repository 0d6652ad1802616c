///! Write-Ahead Log (WAL) implementation
///!
///! Append-only log of committed writes. Every record carries the sequence of
///! its first mutation so recovery can skip what a checkpoint already holds.
///!
///! ## Lifecycle
///!
///! - Single active file `wal-current.log`, appended through a 64KB buffer
///! - Background flusher fsyncs on an interval; `sync` writes fsync inline
///! - After a checkpoint the log is reset to an empty file (header only)

use super::format::{decode_wal_entry, encode_wal_entry, WalEntry, WalHeader, WalOp, WAL_HEADER_LEN};
use super::{PersistenceError, Result, WAL_FILE};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Upper bound for a single encoded record, enforced on append and replay
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// WAL writer with batched fsync
pub struct WalWriter {
    file: BufWriter<File>,
    path: PathBuf,
    position: u64,
    unflushed_bytes: usize,
    last_fsync: Instant,
    flush_interval: Duration,
}

impl WalWriter {
    /// Open (or create) the active WAL in `data_dir`
    pub fn open(data_dir: &Path, flush_interval: Duration) -> Result<Self> {
        let wal_path = data_dir.join(WAL_FILE);

        let file = OpenOptions::new().create(true).append(true).open(&wal_path)?;
        let existing = file.metadata()?.len();

        let mut writer = BufWriter::with_capacity(64 * 1024, file);

        if existing == 0 {
            WalHeader::new().write(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_data()?;
            debug!("Created new WAL file: {}", wal_path.display());
        }

        let position = writer.seek(SeekFrom::End(0))?;

        Ok(Self {
            file: writer,
            path: wal_path,
            position,
            unflushed_bytes: 0,
            last_fsync: Instant::now(),
            flush_interval,
        })
    }

    /// Append a record; returns its offset in the file
    ///
    /// Records the reader would refuse are rejected before any byte is written.
    pub fn append(&mut self, op: WalOp) -> Result<u64> {
        let entry = WalEntry {
            timestamp: super::unix_nanos(),
            op,
        };
        let encoded = encode_wal_entry(&entry)?;
        let len = encoded.len() - 4;
        if len > MAX_RECORD_LEN {
            return Err(PersistenceError::RecordTooLarge {
                len,
                max: MAX_RECORD_LEN,
            });
        }

        let position = self.position;
        self.file.write_all(&encoded)?;
        self.position += encoded.len() as u64;
        self.unflushed_bytes += encoded.len();

        Ok(position)
    }

    /// Flush buffered records and fsync
    pub fn flush(&mut self) -> Result<()> {
        if self.unflushed_bytes == 0 {
            return Ok(());
        }

        let flushed = self.unflushed_bytes;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        self.unflushed_bytes = 0;
        self.last_fsync = Instant::now();

        debug!("WAL fsynced at position {}, {} bytes", self.position, flushed);

        Ok(())
    }

    /// Whether the flush interval has elapsed with data pending
    pub fn should_flush(&self) -> bool {
        self.unflushed_bytes > 0 && self.last_fsync.elapsed() >= self.flush_interval
    }

    /// Replace the log with an empty one once its records are checkpointed
    pub fn reset(&mut self) -> Result<()> {
        self.flush()?;

        let dir = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        let new_path = dir.join("wal-current-new.log");
        let new_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&new_path)?;

        let mut new_writer = BufWriter::with_capacity(64 * 1024, new_file);
        WalHeader::new().write(&mut new_writer)?;
        new_writer.flush()?;
        new_writer.get_ref().sync_data()?;

        fs::rename(&new_path, &self.path)?;

        // Reopen in append mode so writes land at the end
        let file = OpenOptions::new().append(true).open(&self.path)?;
        info!("Reset WAL after checkpoint: {} bytes discarded", self.position - WAL_HEADER_LEN);

        self.file = BufWriter::with_capacity(64 * 1024, file);
        self.position = WAL_HEADER_LEN;
        self.unflushed_bytes = 0;
        self.last_fsync = Instant::now();

        Ok(())
    }

    /// Current file length including buffered bytes
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes of records written since the last reset
    pub fn record_bytes(&self) -> u64 {
        self.position.saturating_sub(WAL_HEADER_LEN)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// WAL reader for replaying records
pub struct WalReader {
    file: File,
    path: PathBuf,
    position: u64,
    file_size: u64,
}

/// Outcome of reading one record
#[derive(Debug)]
pub enum ReadOutcome {
    /// A verified record
    Entry(WalEntry),
    /// A complete but damaged record; the reader has moved past it
    Corrupt(PersistenceError),
    /// End of log, or a torn tail that cannot be framed
    End,
}

impl WalReader {
    /// Open a WAL file for reading
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        WalHeader::read(&mut file)?;

        let position = file.stream_position()?;
        let file_size = file.metadata()?.len();

        debug!("Opened WAL for reading: {} ({} bytes)", path.display(), file_size);

        Ok(Self {
            file,
            path,
            position,
            file_size,
        })
    }

    /// Read the next record
    ///
    /// Checksum failures inside a well-framed record are reported as
    /// `Corrupt` and skipped. A record whose frame runs past the end of the
    /// file ends the log.
    pub fn read_entry(&mut self) -> Result<ReadOutcome> {
        if self.position + 4 > self.file_size {
            return Ok(ReadOutcome::End);
        }

        let mut length_bytes = [0u8; 4];
        self.file.read_exact(&mut length_bytes)?;
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_RECORD_LEN || self.position + 4 + length as u64 > self.file_size {
            debug!(
                "Torn WAL tail at position {} (frame length {})",
                self.position, length
            );
            return Ok(ReadOutcome::End);
        }

        let mut entry_bytes = vec![0u8; 4 + length];
        entry_bytes[0..4].copy_from_slice(&length_bytes);
        self.file.read_exact(&mut entry_bytes[4..])?;

        let entry_pos = self.position;
        self.position += (4 + length) as u64;

        match decode_wal_entry(&entry_bytes, entry_pos) {
            Ok(entry) => Ok(ReadOutcome::Entry(entry)),
            Err(e) => Ok(ReadOutcome::Corrupt(e)),
        }
    }

    /// Offset just past the last framed record
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}

/// Cut a torn tail so new records append after the last framed one
pub fn truncate_wal(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BatchOp;
    use tempfile::TempDir;

    fn put(sequence: u64, key: &str, value: &str) -> WalOp {
        WalOp::Put {
            sequence,
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn read_all(path: &Path) -> Vec<WalOp> {
        let mut reader = WalReader::new(path).unwrap();
        let mut ops = Vec::new();
        loop {
            match reader.read_entry().unwrap() {
                ReadOutcome::Entry(entry) => ops.push(entry.op),
                ReadOutcome::Corrupt(_) => continue,
                ReadOutcome::End => break,
            }
        }
        ops
    }

    #[test]
    fn test_wal_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(temp_dir.path(), Duration::from_millis(100)).unwrap();

        let ops = vec![
            put(1, "key1", "value1"),
            WalOp::Batch {
                sequence: 2,
                ops: vec![BatchOp::put("key2", "v"), BatchOp::delete("key1")],
            },
            WalOp::Delete {
                sequence: 4,
                key: b"key2".to_vec(),
            },
        ];
        for op in &ops {
            writer.append(op.clone()).unwrap();
        }
        writer.flush().unwrap();

        assert_eq!(read_all(writer.path()), ops);
    }

    #[test]
    fn test_wal_reset() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(temp_dir.path(), Duration::from_millis(100)).unwrap();

        writer.append(put(1, "a", "1")).unwrap();
        assert!(writer.record_bytes() > 0);

        writer.reset().unwrap();
        assert_eq!(writer.record_bytes(), 0);
        assert!(read_all(writer.path()).is_empty());

        writer.append(put(2, "b", "2")).unwrap();
        writer.flush().unwrap();
        assert_eq!(read_all(writer.path()), vec![put(2, "b", "2")]);
    }

    #[test]
    fn test_wal_reopen_appends() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut writer = WalWriter::open(temp_dir.path(), Duration::from_millis(100)).unwrap();
            writer.append(put(1, "a", "1")).unwrap();
            writer.flush().unwrap();
        }
        let mut writer = WalWriter::open(temp_dir.path(), Duration::from_millis(100)).unwrap();
        writer.append(put(2, "b", "2")).unwrap();
        writer.flush().unwrap();

        assert_eq!(read_all(writer.path()).len(), 2);
    }

    #[test]
    fn test_wal_corrupted_entry_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(temp_dir.path(), Duration::from_millis(100)).unwrap();
        writer.append(put(1, "test", "value")).unwrap();
        writer.append(put(2, "next", "value")).unwrap();
        writer.flush().unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);

        // Flip bytes inside the first record's payload
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(WAL_HEADER_LEN + 20)).unwrap();
        file.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        drop(file);

        let mut reader = WalReader::new(&path).unwrap();
        assert!(matches!(reader.read_entry().unwrap(), ReadOutcome::Corrupt(_)));
        match reader.read_entry().unwrap() {
            ReadOutcome::Entry(entry) => assert_eq!(entry.op, put(2, "next", "value")),
            other => panic!("expected entry, got {:?}", other),
        }
        assert!(matches!(reader.read_entry().unwrap(), ReadOutcome::End));
    }

    #[test]
    fn test_wal_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(temp_dir.path(), Duration::from_millis(100)).unwrap();
        writer.append(put(1, "a", "1")).unwrap();
        let second = writer.append(put(2, "b", "2")).unwrap();
        writer.flush().unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);

        truncate_wal(&path, second + 6).unwrap();

        let mut reader = WalReader::new(&path).unwrap();
        assert!(matches!(reader.read_entry().unwrap(), ReadOutcome::Entry(_)));
        assert!(matches!(reader.read_entry().unwrap(), ReadOutcome::End));
        assert_eq!(reader.position(), second);
    }

    #[test]
    fn test_wal_rejects_record_over_limit() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(temp_dir.path(), Duration::from_millis(100)).unwrap();
        writer.append(put(1, "a", "1")).unwrap();
        let before = writer.record_bytes();

        let big = WalOp::Put {
            sequence: 2,
            key: b"big".to_vec(),
            value: vec![7u8; MAX_RECORD_LEN],
        };
        let err = writer.append(big).unwrap_err();
        assert!(matches!(err, PersistenceError::RecordTooLarge { max: MAX_RECORD_LEN, .. }));
        assert_eq!(writer.record_bytes(), before);

        writer.append(put(2, "b", "2")).unwrap();
        writer.flush().unwrap();
        assert_eq!(read_all(writer.path()), vec![put(1, "a", "1"), put(2, "b", "2")]);
    }

    #[test]
    fn test_wal_flush_timing() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(temp_dir.path(), Duration::from_millis(50)).unwrap();

        assert!(!writer.should_flush());
        writer.append(put(1, "test", "value")).unwrap();

        std::thread::sleep(Duration::from_millis(80));
        assert!(writer.should_flush());

        writer.flush().unwrap();
        assert!(!writer.should_flush());
    }
}
