//! Per-file metadata journal.
//!
//! Zone files persist their metadata as tagged record streams (see
//! [`crate::zonefile`]); this module durably journals those records so
//! files survive crashes. The journal is an append-only file of CRC-framed
//! records:
//!
//! ```text
//! [FRAME_LEN u32 LE][KIND u8][PAYLOAD][CRC32 u32 LE]
//! [FRAME_LEN u32 LE][KIND u8][PAYLOAD][CRC32 u32 LE]
//! ...
//! ```
//!
//! - `FRAME_LEN` counts the kind byte plus the payload.
//! - `KIND` is [`JournalEntry`]'s discriminant: a metadata *update* (delta
//!   since the last sync), a full *snapshot* (replaces the file's extent
//!   list on replay), or a *delete*.
//! - `CRC32` covers `FRAME_LEN || KIND || PAYLOAD`.
//!
//! # Replay policy
//!
//! Replay walks frames in order and stops cleanly at a torn tail (a frame
//! cut short by a crash mid-write). A frame that is fully present but
//! fails its checksum is *mid-journal damage* and surfaces as an error —
//! silently skipping it would drop metadata that later frames build on.
//! First error wins; nothing after a damaged frame is applied.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::encoding::{get_fixed64, put_fixed64};
use crate::zonefile::{FileError, MetadataWriter};

const U32_SIZE: usize = std::mem::size_of::<u32>();

const KIND_UPDATE: u8 = 1;
const KIND_SNAPSHOT: u8 = 2;
const KIND_DELETE: u8 = 3;

/// Upper bound on a single metadata frame (16 MiB). Rejects allocation
/// bombs from corrupted length fields.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by journal operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A fully-present frame failed its checksum.
    #[error("journal checksum mismatch at offset {offset}")]
    ChecksumMismatch {
        /// Byte offset of the damaged frame.
        offset: u64,
    },

    /// A frame violates the journal format.
    #[error("journal corruption: {0}")]
    Corruption(String),
}

// ------------------------------------------------------------------------------------------------
// Replayed entries
// ------------------------------------------------------------------------------------------------

/// One replayed journal record.
#[derive(Debug, PartialEq, Eq)]
pub enum JournalEntry {
    /// Metadata delta: extents added since the previous sync.
    Update(Vec<u8>),

    /// Full metadata record; replaces the file's extent list on replay.
    Snapshot(Vec<u8>),

    /// The file with this ID was deleted.
    Delete(u64),
}

// ------------------------------------------------------------------------------------------------
// MetaJournal
// ------------------------------------------------------------------------------------------------

/// Append-only, CRC-protected journal of per-file metadata records.
#[derive(Debug)]
pub struct MetaJournal {
    inner: Mutex<File>,
    path: PathBuf,
}

impl MetaJournal {
    /// Open or create the journal at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        let path_ref = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path_ref)?;

        info!(path = %path_ref.display(), "metadata journal opened");
        Ok(Self {
            inner: Mutex::new(file),
            path: path_ref.to_path_buf(),
        })
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, File> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn append_frame(&self, kind: u8, payload: &[u8]) -> Result<(), ManifestError> {
        let frame_len = u32::try_from(payload.len() + 1)
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                ManifestError::Corruption(format!("frame of {} bytes too large", payload.len()))
            })?;

        let len_bytes = frame_len.to_le_bytes();
        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(&[kind]);
        hasher.update(payload);
        let checksum = hasher.finalize();

        let mut guard = self.lock_inner();
        guard.write_all(&len_bytes)?;
        guard.write_all(&[kind])?;
        guard.write_all(payload)?;
        guard.write_all(&checksum.to_le_bytes())?;
        guard.sync_all()?;

        trace!(
            kind,
            len = frame_len,
            crc = format_args!("{checksum:08x}"),
            "journal frame appended"
        );
        Ok(())
    }

    /// Append a full-snapshot record for a file.
    pub fn persist_snapshot(&self, file_id: u64, record: &[u8]) -> Result<(), ManifestError> {
        debug!(file = file_id, "journaling metadata snapshot");
        self.append_frame(KIND_SNAPSHOT, record)
    }

    /// Append a delete record for a file.
    pub fn persist_delete(&self, file_id: u64) -> Result<(), ManifestError> {
        debug!(file = file_id, "journaling file delete");
        let mut payload = Vec::with_capacity(8);
        put_fixed64(&mut payload, file_id);
        self.append_frame(KIND_DELETE, &payload)
    }

    /// Replay all intact frames in order.
    ///
    /// Stops cleanly at a torn tail; fails on mid-journal damage.
    pub fn replay(&self) -> Result<Vec<JournalEntry>, ManifestError> {
        let mut guard = self.lock_inner();
        let file_len = guard.metadata()?.len();
        guard.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        let mut offset = 0u64;

        loop {
            let mut len_bytes = [0u8; U32_SIZE];
            match guard.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let frame_len = u32::from_le_bytes(len_bytes);
            if frame_len == 0 || frame_len > MAX_FRAME_LEN {
                return Err(ManifestError::Corruption(format!(
                    "frame length {frame_len} at offset {offset}"
                )));
            }

            // A frame cut short by a crash is a tolerated torn tail.
            let frame_end = offset + U32_SIZE as u64 + u64::from(frame_len) + U32_SIZE as u64;
            if frame_end > file_len {
                warn!(offset, "journal ends in a torn frame, discarding tail");
                guard.seek(SeekFrom::End(0))?;
                break;
            }

            let mut frame = vec![0u8; frame_len as usize];
            guard.read_exact(&mut frame)?;

            let mut crc_bytes = [0u8; U32_SIZE];
            guard.read_exact(&mut crc_bytes)?;
            let stored = u32::from_le_bytes(crc_bytes);

            let mut hasher = Crc32::new();
            hasher.update(&len_bytes);
            hasher.update(&frame);
            if hasher.finalize() != stored {
                return Err(ManifestError::ChecksumMismatch { offset });
            }

            let (kind, payload) = frame.split_first().ok_or_else(|| {
                ManifestError::Corruption(format!("empty frame at offset {offset}"))
            })?;
            let entry = match *kind {
                KIND_UPDATE => JournalEntry::Update(payload.to_vec()),
                KIND_SNAPSHOT => JournalEntry::Snapshot(payload.to_vec()),
                KIND_DELETE => {
                    let mut input = payload;
                    let file_id = get_fixed64(&mut input).map_err(|_| {
                        ManifestError::Corruption(format!(
                            "truncated delete frame at offset {offset}"
                        ))
                    })?;
                    JournalEntry::Delete(file_id)
                }
                other => {
                    return Err(ManifestError::Corruption(format!(
                        "unknown frame kind {other} at offset {offset}"
                    )));
                }
            };
            entries.push(entry);
            offset = frame_end;
        }

        debug!(frames = entries.len(), "journal replayed");
        Ok(entries)
    }
}

impl MetadataWriter for MetaJournal {
    fn persist(&self, file_id: u64, record: &[u8]) -> Result<(), FileError> {
        trace!(file = file_id, len = record.len(), "journaling metadata update");
        self.append_frame(KIND_UPDATE, record)
            .map_err(|e| FileError::Metadata(e.to_string()))
    }
}
