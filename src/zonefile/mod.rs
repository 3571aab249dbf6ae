//! Zone files: the core file object and the WAL append/recover protocol.
//!
//! A [`ZoneFile`] maps a logical byte stream onto *extents* — contiguous
//! runs of blocks inside one zone — and persists its metadata as a tagged
//! record stream so files survive crashes. On top of the generic file it
//! layers the WAL append path: sequence-numbered, order-agnostic zone
//! appends grouped into durability *barriers*, and a chunk-wise read side
//! that restores logical order by sorting on the embedded sequence numbers.
//!
//! # On-media record layout
//!
//! ```text
//! dense extent       : [payload ............................][zero pad]
//! sparse extent      : [len u64 LE][payload ................][zero pad]
//! sparse WAL extent  : [len u64 LE][seq u64 LE][payload .....][zero pad]
//! ```
//!
//! Every record starts on a block boundary and is zero-padded to the next
//! one. The extent recorded in memory points at the *payload* (header
//! excluded) and its length excludes both header and padding.
//!
//! # WAL ordering model
//!
//! Zone appends complete in arbitrary order, so on-media LBA order says
//! nothing about append order *within* a barrier window. Each record
//! carries its sequence number in-line; the reader recovers one
//! barrier-sized chunk at a time, sorts the records by sequence, and serves
//! reads from the sorted chunk cache. Across barriers, order is total:
//! every barrier ends with a device sync that drains all in-flight appends
//! before any later append is submitted.
//!
//! # Concurrency
//!
//! File state sits behind one `RwLock`; the reader-side chunk cache has its
//! own `Mutex` so concurrent readers serialize only against each other.
//! The exclusive open-for-write gate is an atomic flag held for the
//! lifetime of a writable view. Zone ownership is taken through the
//! allocator's busy flags.

#[cfg(test)]
pub(crate) mod tests;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::FsConfig;
use crate::device::{DeviceError, ZonedBackend};
use crate::encoding::{
    EncodingError, decode_fixed64_at, get_fixed32, get_fixed64, get_length_prefixed_slice,
    put_fixed32, put_fixed64, put_length_prefixed_slice,
};
use crate::oncelog::{LogError, OnceLog};
use crate::zone::{IoType, WriteLifeTimeHint, ZoneAllocator, ZoneClass, ZoneError, ZoneId};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Size of the per-extent length header for sparse files (bytes).
pub const SPARSE_HEADER_SIZE: u64 = 8;

/// Size of the additional sequence-number header for WAL files (bytes).
pub const SPARSE_WAL_HEADER_SIZE: u64 = 8;

/// Sentinel for "no active extent": the file was closed cleanly.
pub const NO_EXTENT: u64 = u64::MAX;

/// Migration copy step (128 KiB).
const MIGRATE_STEP: usize = 128 << 10;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by zone-file operations.
#[derive(Debug, Error)]
pub enum FileError {
    /// Zone or allocator failure (including out-of-space).
    #[error("zone error: {0}")]
    Zone(#[from] ZoneError),

    /// Once-log failure.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// Device failure.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Metadata encoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// On-media bytes violate the expected format.
    #[error("corruption: {0}")]
    Corruption(String),

    /// I/O-level failure that is not a format violation.
    #[error("I/O error: {0}")]
    Io(String),

    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Metadata journal failure while persisting.
    #[error("metadata persist error: {0}")]
    Metadata(String),
}

// ------------------------------------------------------------------------------------------------
// Metadata persistence seam
// ------------------------------------------------------------------------------------------------

/// Sink for per-file metadata records.
///
/// Implemented by the metadata journal; called with the already-encoded
/// tag stream so the journal never has to reach back into file locks.
pub trait MetadataWriter: Send + Sync {
    /// Durably persist one metadata update record for `file_id`.
    fn persist(&self, file_id: u64, record: &[u8]) -> Result<(), FileError>;
}

// ------------------------------------------------------------------------------------------------
// Extents
// ------------------------------------------------------------------------------------------------

/// A contiguous run of one file's bytes inside a single zone.
///
/// `start` is the device LBA of the extent *payload* — for sparse extents
/// the on-media record begins `header` bytes earlier. `length` excludes
/// headers and padding. Zones are referenced by stable arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneExtent {
    /// Device byte LBA of the payload.
    pub start: u64,

    /// Payload length in bytes.
    pub length: u64,

    /// Arena index of the zone holding the extent.
    pub zone: ZoneId,
}

impl ZoneExtent {
    /// Append the wire form (`start u64 LE || length u64 LE`) to `out`.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        put_fixed64(out, self.start);
        put_fixed64(out, self.length);
    }

    /// Decode `(start, length)` from a full extent record slice.
    pub fn decode_raw(record: &[u8]) -> Result<(u64, u64), FileError> {
        if record.len() != 16 {
            return Err(FileError::Corruption(format!(
                "extent record length mismatch: {} bytes",
                record.len()
            )));
        }
        let mut input = record;
        let start = get_fixed64(&mut input)?;
        let length = get_fixed64(&mut input)?;
        Ok((start, length))
    }
}

// ------------------------------------------------------------------------------------------------
// Metadata tags
// ------------------------------------------------------------------------------------------------

const TAG_FILE_ID: u32 = 1;
// Tag 2 carried the file name in an older metadata layout; the link list
// (tag 9) replaced it.
const TAG_FILE_NAME_DEPRECATED: u32 = 2;
const TAG_FILE_SIZE: u32 = 3;
const TAG_LIFETIME_HINT: u32 = 4;
const TAG_EXTENT: u32 = 5;
const TAG_MODIFICATION_TIME: u32 = 6;
const TAG_ACTIVE_EXTENT_START: u32 = 7;
const TAG_IS_SPARSE: u32 = 8;
const TAG_LINKED_FILENAME: u32 = 9;
const TAG_WAL_SEQ: u32 = 10;

// ------------------------------------------------------------------------------------------------
// Internal state
// ------------------------------------------------------------------------------------------------

/// Writer-side file state, behind the file's `RwLock`.
#[derive(Debug)]
struct FileState {
    extents: Vec<ZoneExtent>,
    linkfiles: Vec<String>,
    active_zone: Option<ZoneId>,
    extent_start: u64,
    extent_filepos: u64,
    file_size: u64,
    lifetime: WriteLifeTimeHint,
    io_type: IoType,
    is_wal: bool,
    is_sparse: bool,
    is_deleted: bool,
    m_time: u64,
    nr_synced_extents: usize,
    append_bytes_since_barrier: u64,
    wal_syncs: u64,
    wal_writes: u64,
}

/// One recovered barrier window: records sorted by sequence number.
#[derive(Debug, Default)]
struct LoadedChunk {
    /// File offset of the first byte held by the chunk.
    start: u64,
    /// File offset one past the last byte held by the chunk.
    end: u64,
    /// Number of records that belonged to earlier chunks; converts a file
    /// extent index into an index into `entries`.
    jump: usize,
    /// `(sequence, payload)` pairs, ascending by sequence.
    entries: Vec<(u64, Vec<u8>)>,
}

/// Reader-side state: the resident chunk plus the sequential-read cursor.
#[derive(Debug, Default)]
struct WalReader {
    chunk: LoadedChunk,
    chunk_id: u64,
    /// Extent index the next sequential read continues from.
    extent_index: usize,
    /// Offset within that extent.
    extent_offset: u64,
    /// File position the cursor corresponds to.
    position: u64,
}

// ------------------------------------------------------------------------------------------------
// ZoneFile
// ------------------------------------------------------------------------------------------------

/// A file stored as extents on a zoned block device.
pub struct ZoneFile {
    backend: Arc<dyn ZonedBackend>,
    allocator: Arc<ZoneAllocator>,
    config: FsConfig,
    block_size: u64,
    file_id: AtomicU64,
    state: RwLock<FileState>,
    wal_seq: AtomicU64,
    wal: Mutex<Option<Arc<OnceLog>>>,
    reader: Mutex<WalReader>,
    open_for_wr: AtomicBool,
    metadata_writer: Option<Arc<dyn MetadataWriter>>,
}

impl std::fmt::Debug for ZoneFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneFile")
            .field("file_id", &self.id())
            .field("wal_seq", &self.wal_seq.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ZoneFile {
    /// Create an empty file object.
    pub fn new(
        backend: Arc<dyn ZonedBackend>,
        allocator: Arc<ZoneAllocator>,
        config: FsConfig,
        file_id: u64,
        metadata_writer: Option<Arc<dyn MetadataWriter>>,
    ) -> Self {
        let block_size = u64::from(backend.geometry().block_size);
        Self {
            backend,
            allocator,
            config,
            block_size,
            file_id: AtomicU64::new(file_id),
            state: RwLock::new(FileState {
                extents: Vec::new(),
                linkfiles: Vec::new(),
                active_zone: None,
                extent_start: NO_EXTENT,
                extent_filepos: 0,
                file_size: 0,
                lifetime: WriteLifeTimeHint::NotSet,
                io_type: IoType::Unknown,
                is_wal: false,
                is_sparse: false,
                is_deleted: false,
                m_time: 0,
                nr_synced_extents: 0,
                append_bytes_since_barrier: 0,
                wal_syncs: 0,
                wal_writes: 0,
            }),
            wal_seq: AtomicU64::new(0),
            wal: Mutex::new(None),
            reader: Mutex::new(WalReader::default()),
            open_for_wr: AtomicBool::new(false),
            metadata_writer,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, FileState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, FileState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_wal(&self) -> MutexGuard<'_, Option<Arc<OnceLog>>> {
        match self.wal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_reader(&self) -> MutexGuard<'_, WalReader> {
        match self.reader.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Attribute accessors
    // --------------------------------------------------------------------------------------------

    /// Unique file identifier.
    pub fn id(&self) -> u64 {
        self.file_id.load(Ordering::Acquire)
    }

    /// Primary link name (the first hard link), or empty if unnamed.
    pub fn filename(&self) -> String {
        self.read_state()
            .linkfiles
            .first()
            .cloned()
            .unwrap_or_default()
    }

    /// Logical file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.read_state().file_size
    }

    /// Overwrite the logical file size (truncate support).
    pub fn set_file_size(&self, size: u64) {
        self.write_state().file_size = size;
    }

    /// Device block size in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// The file-system configuration this file was built with.
    pub fn config(&self) -> FsConfig {
        self.config
    }

    /// Whether this file takes the WAL append path.
    pub fn is_wal(&self) -> bool {
        self.read_state().is_wal
    }

    /// Whether writes carry inline length headers.
    pub fn is_sparse(&self) -> bool {
        self.read_state().is_sparse
    }

    /// Mark the file sparse or dense. Decided once at open, before data.
    pub fn set_sparse(&self, sparse: bool) {
        self.write_state().is_sparse = sparse;
    }

    /// Whether the last link was removed.
    pub fn is_deleted(&self) -> bool {
        self.read_state().is_deleted
    }

    /// Mark the file deleted.
    pub fn set_deleted(&self) {
        self.write_state().is_deleted = true;
    }

    /// Last modification time (seconds since the epoch).
    pub fn modification_time(&self) -> u64 {
        self.read_state().m_time
    }

    /// Set the modification time.
    pub fn set_modification_time(&self, m_time: u64) {
        self.write_state().m_time = m_time;
    }

    /// The file's write-lifetime hint.
    pub fn lifetime_hint(&self) -> WriteLifeTimeHint {
        self.read_state().lifetime
    }

    /// Set the write-lifetime hint, propagated to zone allocation.
    pub fn set_lifetime_hint(&self, hint: WriteLifeTimeHint) {
        self.write_state().lifetime = hint;
    }

    /// IO classification of the file's traffic.
    pub fn io_type(&self) -> IoType {
        self.read_state().io_type
    }

    /// Classify the file's traffic. A file whose primary link ends in
    /// `.log` and carries WAL traffic takes the WAL append path.
    pub fn set_io_type(&self, io_type: IoType) {
        let mut state = self.write_state();
        state.io_type = io_type;
        state.is_wal = io_type == IoType::Wal
            && state
                .linkfiles
                .first()
                .is_some_and(|name| name.ends_with(".log"));
        if state.is_wal {
            debug!(file = self.id(), "file classified as WAL");
        }
    }

    /// Snapshot of the extent list.
    pub fn extents(&self) -> Vec<ZoneExtent> {
        self.read_state().extents.clone()
    }

    /// Next WAL sequence number to be assigned.
    pub fn wal_seq(&self) -> u64 {
        self.wal_seq.load(Ordering::Acquire)
    }

    /// Number of device syncs forced by barrier boundaries.
    pub fn wal_syncs(&self) -> u64 {
        self.read_state().wal_syncs
    }

    /// Number of WAL append iterations submitted.
    pub fn wal_writes(&self) -> u64 {
        self.read_state().wal_writes
    }

    /// Whether a crash would leave unrecovered data past the last metadata
    /// sync.
    pub fn has_active_extent(&self) -> bool {
        self.read_state().extent_start != NO_EXTENT
    }

    /// Device LBA the active extent started at, or [`NO_EXTENT`].
    pub fn extent_start(&self) -> u64 {
        self.read_state().extent_start
    }

    // --------------------------------------------------------------------------------------------
    // Open-for-write gate
    // --------------------------------------------------------------------------------------------

    /// Take the exclusive writer gate, spinning until it is free.
    pub fn acquire_wr_lock(&self) {
        while !self.try_acquire_wr_lock() {
            std::hint::spin_loop();
        }
    }

    /// Try to take the exclusive writer gate.
    pub fn try_acquire_wr_lock(&self) -> bool {
        self.open_for_wr
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the writer gate.
    pub fn release_wr_lock(&self) {
        if self
            .open_for_wr
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(file = self.id(), "writer gate released while not held");
        }
    }

    /// Whether a writable view currently owns the file.
    pub fn is_open_for_wr(&self) -> bool {
        self.open_for_wr.load(Ordering::Acquire)
    }

    // --------------------------------------------------------------------------------------------
    // Link management
    // --------------------------------------------------------------------------------------------

    /// Add a hard-link name. The first added link is the primary name.
    pub fn add_link(&self, link: &str) {
        self.write_state().linkfiles.push(link.to_string());
    }

    /// Remove a hard-link name.
    pub fn remove_link(&self, link: &str) -> Result<(), FileError> {
        let mut state = self.write_state();
        let index = state
            .linkfiles
            .iter()
            .position(|l| l == link)
            .ok_or_else(|| FileError::Io(format!("failed to find link {link}")))?;
        state.linkfiles.remove(index);
        Ok(())
    }

    /// Rename a hard-link name.
    pub fn rename_link(&self, src: &str, dest: &str) -> Result<(), FileError> {
        let mut state = self.write_state();
        let index = state
            .linkfiles
            .iter()
            .position(|l| l == src)
            .ok_or_else(|| FileError::Io(format!("failed to find link {src}")))?;
        state.linkfiles.remove(index);
        state.linkfiles.push(dest.to_string());
        Ok(())
    }

    /// Number of hard links.
    pub fn nr_links(&self) -> usize {
        self.read_state().linkfiles.len()
    }

    /// All hard-link names.
    pub fn link_files(&self) -> Vec<String> {
        self.read_state().linkfiles.clone()
    }

    // --------------------------------------------------------------------------------------------
    // Zone lifecycle
    // --------------------------------------------------------------------------------------------

    fn allocate_new_zone_locked(&self, state: &mut FileState) -> Result<(), FileError> {
        let zone_id = if state.is_wal {
            let mut wal = self.lock_wal();
            let (zone_id, log) = self.allocator.allocate_wal_zone(wal.clone())?;
            *wal = Some(log);
            zone_id
        } else {
            self.allocator
                .allocate_io_zone(state.lifetime, state.io_type)?
        };

        let zone = self.allocator.zone(zone_id);
        state.active_zone = Some(zone_id);
        state.extent_start = zone.write_pointer();
        state.extent_filepos = state.file_size;

        trace!(file = self.id(), zone = zone_id, "active zone allocated");

        // Persist now so a crash before the next metadata sync can recover
        // the active extent from the zone write pointer.
        self.persist_metadata_locked(state)
    }

    fn close_active_zone_locked(&self, state: &mut FileState) -> Result<(), FileError> {
        if state.is_wal {
            let wal = self.lock_wal();
            if let Some(log) = wal.as_ref() {
                log.sync()
                    .map_err(|e| FileError::Io(format!("failed syncing WAL: {e}")))?;
            }
        }

        if let Some(zone_id) = state.active_zone.take() {
            let zone = self.allocator.zone(zone_id);
            let full = zone.is_full();
            zone.close()?;
            if !zone.release() {
                warn!(file = self.id(), zone = zone_id, "active zone was not busy");
            }
            if zone.class() == ZoneClass::Io {
                self.allocator.put_open_io_token();
                if full {
                    self.allocator.put_active_io_token();
                }
            }
            trace!(file = self.id(), zone = zone_id, full, "active zone closed");
        }
        Ok(())
    }

    /// Record the pending dense extent `[extent_filepos, file_size)`.
    pub fn push_extent(&self) {
        let mut state = self.write_state();
        self.push_extent_locked(&mut state);
    }

    fn push_extent_locked(&self, state: &mut FileState) {
        let Some(zone_id) = state.active_zone else {
            return;
        };
        let length = state.file_size - state.extent_filepos;
        if length == 0 {
            return;
        }

        let extent = ZoneExtent {
            start: state.extent_start,
            length,
            zone: zone_id,
        };
        self.allocator.zone(zone_id).add_used(length);
        state.extents.push(extent);
        state.extent_start = self.allocator.zone(zone_id).write_pointer();
        state.extent_filepos = state.file_size;
    }

    // --------------------------------------------------------------------------------------------
    // Append paths
    // --------------------------------------------------------------------------------------------

    /// Direct dense append. `data` must be block-aligned; extents are
    /// recorded later by [`ZoneFile::push_extent`].
    pub fn append(&self, data: &[u8]) -> Result<(), FileError> {
        let mut state = self.write_state();
        let mut offset = 0usize;
        let mut left = data.len();

        if state.active_zone.is_none() {
            self.allocate_new_zone_locked(&mut state)?;
        }

        while left > 0 {
            let zone_id = state
                .active_zone
                .ok_or_else(|| FileError::Io("no active zone".to_string()))?;
            if self.allocator.zone(zone_id).capacity_remaining() == 0 {
                self.push_extent_locked(&mut state);
                self.close_active_zone_locked(&mut state)?;
                self.allocate_new_zone_locked(&mut state)?;
                continue;
            }

            let zone = self.allocator.zone(zone_id);
            let wr_size = (left as u64).min(zone.capacity_remaining()) as usize;
            zone.append(&data[offset..offset + wr_size])?;

            state.file_size += wr_size as u64;
            left -= wr_size;
            offset += wr_size;
        }
        Ok(())
    }

    /// Buffered dense append: one extent per flush, zero-padded to the
    /// block boundary. The buffer must have room for the padding tail.
    pub fn buffered_append(&self, buffer: &mut [u8], data_size: usize) -> Result<(), FileError> {
        let mut state = self.write_state();
        let mut left = data_size as u64;

        if state.active_zone.is_none() {
            self.allocate_new_zone_locked(&mut state)?;
        }

        while left > 0 {
            let zone_id = state
                .active_zone
                .ok_or_else(|| FileError::Io("no active zone".to_string()))?;
            let zone = self.allocator.zone(zone_id);

            let wr_size = left.min(zone.capacity_remaining());
            let pad = self.pad_to_block(wr_size);
            let total = (wr_size + pad) as usize;

            if buffer.len() < total {
                return Err(FileError::Io(format!(
                    "append buffer of {} bytes cannot hold {total}-byte padded write",
                    buffer.len()
                )));
            }
            buffer[wr_size as usize..total].fill(0);

            zone.append(&buffer[..total])?;

            let extent = ZoneExtent {
                start: state.extent_start,
                length: wr_size,
                zone: zone_id,
            };
            state.extents.push(extent);
            state.extent_start = zone.write_pointer();
            zone.add_used(wr_size);
            state.file_size += wr_size;
            left -= wr_size;

            if zone.capacity_remaining() == 0 {
                self.close_active_zone_locked(&mut state)?;
                if left > 0 {
                    buffer.copy_within(wr_size as usize..(wr_size + left) as usize, 0);
                }
                self.allocate_new_zone_locked(&mut state)?;
            }
        }
        Ok(())
    }

    /// Sparse append: the write hot-path for WAL and sparse files.
    ///
    /// `buffer` holds `header_size` reserved (callee-written) bytes, then
    /// `data_size` payload bytes, then at least one spare block for
    /// padding. WAL appends are submitted through the once-log and carry a
    /// sequence number; non-WAL sparse appends go through the sequential
    /// zone write.
    pub fn sparse_append(&self, buffer: &mut [u8], data_size: usize) -> Result<(), FileError> {
        let mut state = self.write_state();
        let header_size = self.header_size_locked(&state);
        let mut left = data_size as u64;

        if (buffer.len() as u64) < header_size + data_size as u64 + self.block_size {
            return Err(FileError::Io(format!(
                "sparse buffer of {} bytes lacks header/padding room for {data_size} payload bytes",
                buffer.len()
            )));
        }

        if state.active_zone.is_none() {
            self.allocate_new_zone_locked(&mut state)?;
        }

        while left > 0 {
            // Barrier boundary: make everything in flight durable before
            // the window counter restarts.
            if state.is_wal && state.append_bytes_since_barrier >= self.config.wal_barrier_size {
                self.wal_sync_locked()?;
                state.wal_syncs += 1;
                state.append_bytes_since_barrier = 0;
                trace!(file = self.id(), syncs = state.wal_syncs, "barrier sync");
            }
            if state.is_wal {
                state.wal_writes += 1;
            }

            let zone_id = state
                .active_zone
                .ok_or_else(|| FileError::Io("no active zone".to_string()))?;
            let zone = self.allocator.zone(zone_id);

            let mut wr_size = (left + header_size).min(zone.capacity_remaining());
            if state.is_wal {
                wr_size =
                    wr_size.min(self.config.wal_barrier_size - state.append_bytes_since_barrier);
            }

            let pad = self.pad_to_block(wr_size);
            let total = (wr_size + pad) as usize;
            buffer[wr_size as usize..total].fill(0);

            let extent_length = wr_size - header_size;
            buffer[..8].copy_from_slice(&extent_length.to_le_bytes());

            if state.is_wal {
                let seq = self.wal_seq.fetch_add(1, Ordering::AcqRel);
                buffer[8..16].copy_from_slice(&seq.to_le_bytes());

                let wal = self.lock_wal();
                let log = wal
                    .as_ref()
                    .ok_or_else(|| FileError::Io("WAL append without a log handle".to_string()))?;
                zone.zone_append(&buffer[..total], log)?;
                drop(wal);
                state.append_bytes_since_barrier += wr_size + pad;
            } else {
                zone.append(&buffer[..total])?;
            }

            let extent = ZoneExtent {
                start: state.extent_start + header_size,
                length: extent_length,
                zone: zone_id,
            };
            state.extents.push(extent);
            state.extent_start = zone.write_pointer();
            zone.add_used(extent_length);
            state.file_size += extent_length;
            left -= extent_length;

            if zone.capacity_remaining() == 0 {
                self.close_active_zone_locked(&mut state)?;
                if left > 0 {
                    // Preserve the caller's header slot: the unwritten
                    // payload tail moves up right behind it.
                    buffer.copy_within(
                        wr_size as usize..(wr_size + left) as usize,
                        header_size as usize,
                    );
                }
                self.allocate_new_zone_locked(&mut state)?;
            }
        }
        Ok(())
    }

    fn header_size_locked(&self, state: &FileState) -> u64 {
        SPARSE_HEADER_SIZE + if state.is_wal { SPARSE_WAL_HEADER_SIZE } else { 0 }
    }

    fn pad_to_block(&self, size: u64) -> u64 {
        let align = size % self.block_size;
        if align == 0 { 0 } else { self.block_size - align }
    }

    // --------------------------------------------------------------------------------------------
    // WAL durability
    // --------------------------------------------------------------------------------------------

    /// Flush all in-flight WAL appends to durable media.
    pub fn wal_sync(&self) -> Result<(), FileError> {
        self.wal_sync_locked()
    }

    fn wal_sync_locked(&self) -> Result<(), FileError> {
        let wal = self.lock_wal();
        if let Some(log) = wal.as_ref() {
            log.sync()
                .map_err(|e| FileError::Io(format!("WAL sync error: {e}")))?;
        }
        Ok(())
    }

    /// Reset all zones backing this file's WAL, rewinding its once-log to
    /// an empty history. Sequencing continues from the stored `wal_seq` —
    /// it never regresses.
    pub fn reset_wal_zones(&self) -> Result<(), FileError> {
        let state = self.read_state();
        // Lock order: state, reader, wal — same as the read path.
        let mut reader = self.lock_reader();
        let mut wal = self.lock_wal();
        let mut acquired: Option<ZoneId> = None;

        if wal.is_none() {
            if let Some(first) = state.extents.first() {
                let zone = self.allocator.zone(first.zone);
                zone.acquire();
                acquired = Some(first.zone);
                match self.allocator.open_wal_zone(first.zone) {
                    Ok(log) => *wal = Some(log),
                    Err(e) => {
                        zone.release();
                        return Err(e.into());
                    }
                }
            }
        }

        let result = if let Some(log) = wal.as_ref() {
            log.reset_all()
                .map_err(|e| FileError::Io(format!("WAL sync error: {e}")))
                .and_then(|()| {
                    self.allocator
                        .release_unused_wal_zones()
                        .map_err(FileError::from)
                })
        } else {
            Ok(())
        };

        if let Some(zone_id) = acquired {
            self.allocator.zone(zone_id).release();
        }

        // The resident chunk cache describes media that no longer exists.
        *reader = WalReader::default();

        info!(file = self.id(), "WAL zones reset");
        result
    }

    // --------------------------------------------------------------------------------------------
    // Read paths
    // --------------------------------------------------------------------------------------------

    /// Read up to `n` bytes at `offset` into `scratch`, returning the byte
    /// count. Reads past the file size return zero bytes.
    pub fn positioned_read(
        &self,
        offset: u64,
        n: usize,
        scratch: &mut [u8],
        direct: bool,
    ) -> Result<usize, FileError> {
        let state = self.read_state();
        if offset >= state.file_size {
            return Ok(0);
        }
        if state.is_wal {
            self.wal_positioned_read_locked(&state, offset, n, scratch)
        } else {
            self.normal_positioned_read_locked(&state, offset, n, scratch, direct)
        }
    }

    /// Find the extent containing `file_offset`; returns the extent index
    /// and the offset inside that extent.
    fn extent_for_offset(state: &FileState, mut file_offset: u64) -> Option<(usize, u64)> {
        for (index, extent) in state.extents.iter().enumerate() {
            if file_offset < extent.length {
                return Some((index, file_offset));
            }
            file_offset -= extent.length;
        }
        None
    }

    fn wal_positioned_read_locked(
        &self,
        state: &FileState,
        offset: u64,
        n: usize,
        scratch: &mut [u8],
    ) -> Result<usize, FileError> {
        let mut reader = self.lock_reader();
        self.try_recover_wal_locked(state, &mut reader, offset)?;

        // Sequential-read fast path: reuse the saved cursor when this read
        // continues exactly where the previous one stopped.
        let (mut index, mut extent_offset) = if reader.position == offset {
            (reader.extent_index, reader.extent_offset)
        } else {
            match Self::extent_for_offset(state, offset) {
                Some(found) => found,
                None => return Ok(0),
            }
        };

        let r_sz = (n as u64)
            .min(state.file_size - offset)
            .min(scratch.len() as u64) as usize;
        let mut read = 0usize;

        while read < r_sz {
            let Some(chunk_index) = index.checked_sub(reader.chunk.jump) else {
                break;
            };
            let Some((_, payload)) = reader.chunk.entries.get(chunk_index) else {
                break;
            };
            let Some(extent) = state.extents.get(index) else {
                break;
            };

            // Guard against a length mismatch between the metadata extent
            // and the recovered record.
            let extent_len = extent.length.min(payload.len() as u64);
            let take = ((r_sz - read) as u64).min(extent_len - extent_offset) as usize;
            scratch[read..read + take].copy_from_slice(
                &payload[extent_offset as usize..extent_offset as usize + take],
            );
            read += take;
            extent_offset += take as u64;

            if extent_offset == extent_len {
                index += 1;
                extent_offset = 0;
                // The next extent may live in the next barrier chunk.
                self.try_recover_wal_locked(state, &mut reader, offset + read as u64)?;
            }
        }

        reader.extent_index = index;
        reader.extent_offset = extent_offset;
        reader.position = offset + read as u64;
        Ok(read)
    }

    fn normal_positioned_read_locked(
        &self,
        state: &FileState,
        offset: u64,
        n: usize,
        scratch: &mut [u8],
        direct: bool,
    ) -> Result<usize, FileError> {
        let Some((mut index, mut in_offset)) = Self::extent_for_offset(state, offset) else {
            return Ok(0);
        };

        let r_sz = (n as u64)
            .min(state.file_size - offset)
            .min(scratch.len() as u64) as usize;
        let mut read = 0usize;

        while read < r_sz {
            let Some(extent) = state.extents.get(index) else {
                // Read beyond the end of synced data.
                break;
            };

            let dev_offset = extent.start + in_offset;
            let take = ((r_sz - read) as u64).min(extent.length - in_offset) as usize;

            if direct && (dev_offset % self.block_size != 0 || take as u64 % self.block_size != 0) {
                // Unaligned direct read: bounce through a block-aligned
                // buffer covering the touched blocks.
                let aligned_start = dev_offset - dev_offset % self.block_size;
                let aligned_end =
                    dev_offset + take as u64 + self.pad_to_block(dev_offset + take as u64);
                let mut bounce = vec![0u8; (aligned_end - aligned_start) as usize];
                self.backend
                    .read(&mut bounce, aligned_start, true)
                    .map_err(|e| FileError::Io(format!("pread error: {e}")))?;
                let skip = (dev_offset - aligned_start) as usize;
                scratch[read..read + take].copy_from_slice(&bounce[skip..skip + take]);
            } else {
                self.backend
                    .read(&mut scratch[read..read + take], dev_offset, direct)
                    .map_err(|e| FileError::Io(format!("pread error: {e}")))?;
            }

            read += take;
            in_offset += take as u64;
            if in_offset == extent.length {
                index += 1;
                in_offset = 0;
            }
        }
        Ok(read)
    }

    // --------------------------------------------------------------------------------------------
    // Chunked WAL recovery
    // --------------------------------------------------------------------------------------------

    /// Ensure the chunk cache covers `offset` (clamped to the file size),
    /// loading barrier-sized windows from the once-log as needed.
    pub fn try_recover_wal(&self, offset: u64) -> Result<(), FileError> {
        let state = self.read_state();
        let mut reader = self.lock_reader();
        self.try_recover_wal_locked(&state, &mut reader, offset)
    }

    fn try_recover_wal_locked(
        &self,
        state: &FileState,
        reader: &mut WalReader,
        offset: u64,
    ) -> Result<(), FileError> {
        // Still in range.
        if !reader.chunk.entries.is_empty()
            && reader.chunk.start <= offset
            && reader.chunk.end > offset
        {
            return Ok(());
        }

        // A seek before the resident chunk rewinds the scan; chunks only
        // march forward from the log tail.
        if offset < reader.chunk.start {
            reader.chunk = LoadedChunk::default();
            reader.chunk_id = 0;
        }

        let log = {
            let mut wal = self.lock_wal();
            match wal.as_ref() {
                Some(log) => log.clone(),
                None => {
                    let Some(first) = state.extents.first() else {
                        return Ok(());
                    };
                    let log = self.allocator.open_wal_zone(first.zone)?;
                    *wal = Some(log.clone());
                    log
                }
            }
        };

        // The layer above sometimes asks past the end of the file.
        let offset = offset.min(state.file_size);
        let shift = log.block_shift();
        let barrier = self.config.wal_barrier_size;

        loop {
            let jump = reader.chunk.entries.len();
            let tail_bytes = log.write_tail() << shift;
            let head_bytes = log.write_head() << shift;

            let lba_in = (tail_bytes + reader.chunk_id * barrier).min(head_bytes);
            let lba_out = (tail_bytes + (reader.chunk_id + 1) * barrier).min(head_bytes);
            if lba_in >= lba_out {
                // End of log.
                break;
            }

            self.recover_wal_chunk_from(&log, lba_in, lba_out, &mut reader.chunk.entries)?;

            let chunk_bytes: u64 = reader
                .chunk
                .entries
                .iter()
                .map(|(_, payload)| payload.len() as u64)
                .sum();
            reader.chunk.start = reader.chunk.end;
            reader.chunk.end = reader.chunk.start + chunk_bytes;
            reader.chunk.jump += jump;
            reader.chunk_id += 1;

            trace!(
                file = self.id(),
                chunk = reader.chunk_id - 1,
                start = reader.chunk.start,
                end = reader.chunk.end,
                records = reader.chunk.entries.len(),
                "WAL chunk recovered"
            );

            if reader.chunk.entries.is_empty() || reader.chunk.end > offset {
                break;
            }
        }
        Ok(())
    }

    /// Decode one barrier window `[begin, end)` of the WAL into
    /// `(sequence, payload)` records, sorted ascending by sequence.
    pub fn recover_wal_chunk(
        &self,
        begin: u64,
        end: u64,
        entries: &mut Vec<(u64, Vec<u8>)>,
    ) -> Result<(), FileError> {
        let log = self
            .lock_wal()
            .as_ref()
            .cloned()
            .ok_or_else(|| FileError::Io("no WAL handle open".to_string()))?;
        self.recover_wal_chunk_from(&log, begin, end, entries)
    }

    fn recover_wal_chunk_from(
        &self,
        log: &OnceLog,
        begin: u64,
        end: u64,
        entries: &mut Vec<(u64, Vec<u8>)>,
    ) -> Result<(), FileError> {
        entries.clear();

        let shift = log.block_shift();
        let size = (end - begin) as usize;
        let mut buf = vec![0u8; size];
        log.read(begin >> shift, &mut buf, true)
            .map_err(|e| FileError::Io(format!("WAL read I/O error: {e}")))?;

        let header = (SPARSE_HEADER_SIZE + SPARSE_WAL_HEADER_SIZE) as usize;
        let tail_bytes = log.write_tail() << shift;
        let mut cursor = 0usize;

        while cursor + header <= size {
            let length = decode_fixed64_at(&buf, cursor)? as usize;
            // Reached the padding tail of the window.
            if length == 0 {
                break;
            }
            let seq = decode_fixed64_at(&buf, cursor + 8)?;
            // Sequence zero is only legal as the very first record of the
            // log; anywhere else it is barrier padding.
            if seq == 0 && begin > tail_bytes {
                break;
            }
            if cursor + header + length > size {
                return Err(FileError::Corruption(format!(
                    "WAL record of {length} bytes at chunk offset {cursor} overshoots the window"
                )));
            }

            entries.push((seq, buf[cursor + header..cursor + header + length].to_vec()));

            // Records start on block boundaries.
            let consumed = (cursor + header + length) as u64;
            cursor = (consumed + self.pad_to_block(consumed)) as usize;
        }

        entries.sort_by_key(|(seq, _)| *seq);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Metadata codec
    // --------------------------------------------------------------------------------------------

    /// Encode the metadata record, including extents from
    /// `extent_start_index` onwards.
    pub fn encode_to(&self, out: &mut Vec<u8>, extent_start_index: usize) -> Result<(), FileError> {
        let state = self.read_state();
        self.encode_to_locked(&state, out, extent_start_index)
    }

    /// Encode only the extents added since the last metadata sync.
    pub fn encode_update_to(&self, out: &mut Vec<u8>) -> Result<(), FileError> {
        let state = self.read_state();
        self.encode_to_locked(&state, out, state.nr_synced_extents)
    }

    /// Encode the full metadata record.
    pub fn encode_snapshot_to(&self, out: &mut Vec<u8>) -> Result<(), FileError> {
        self.encode_to(out, 0)
    }

    fn encode_to_locked(
        &self,
        state: &FileState,
        out: &mut Vec<u8>,
        extent_start_index: usize,
    ) -> Result<(), FileError> {
        put_fixed32(out, TAG_FILE_ID);
        put_fixed64(out, self.id());

        put_fixed32(out, TAG_FILE_SIZE);
        put_fixed64(out, state.file_size);

        put_fixed32(out, TAG_LIFETIME_HINT);
        put_fixed32(out, state.lifetime as u32);

        for extent in state.extents.iter().skip(extent_start_index) {
            let mut record = Vec::with_capacity(16);
            extent.encode_to(&mut record);
            put_fixed32(out, TAG_EXTENT);
            put_length_prefixed_slice(out, &record)?;
        }

        if state.is_wal {
            put_fixed32(out, TAG_WAL_SEQ);
            put_fixed64(out, self.wal_seq.load(Ordering::Acquire));
        }

        put_fixed32(out, TAG_MODIFICATION_TIME);
        put_fixed64(out, state.m_time);

        // The active extent start is enough to find crash-written data:
        // the zone is recoverable from the LBA, the end from its write
        // pointer.
        put_fixed32(out, TAG_ACTIVE_EXTENT_START);
        put_fixed64(out, state.extent_start);

        if state.is_sparse {
            put_fixed32(out, TAG_IS_SPARSE);
        }

        for link in &state.linkfiles {
            put_fixed32(out, TAG_LINKED_FILENAME);
            put_length_prefixed_slice(out, link.as_bytes())?;
        }
        Ok(())
    }

    /// Decode a metadata record into this file, resolving extents against
    /// the allocator and lazily binding the WAL handle.
    pub fn decode_from(&self, input: &mut &[u8]) -> Result<(), FileError> {
        let mut state = self.write_state();

        let tag = get_fixed32(input)
            .map_err(|_| FileError::Corruption("file ID missing".to_string()))?;
        if tag != TAG_FILE_ID {
            return Err(FileError::Corruption("file ID missing".to_string()));
        }
        let file_id = get_fixed64(input)
            .map_err(|_| FileError::Corruption("file ID missing".to_string()))?;
        self.file_id.store(file_id, Ordering::Release);

        let mut is_wal = false;
        let mut pad_bytes = 0u64;

        while !input.is_empty() {
            let tag = get_fixed32(input)?;
            match tag {
                TAG_FILE_SIZE => {
                    state.file_size = get_fixed64(input)
                        .map_err(|_| FileError::Corruption("missing file size".to_string()))?;
                }
                TAG_LIFETIME_HINT => {
                    let raw = get_fixed32(input)
                        .map_err(|_| FileError::Corruption("missing lifetime hint".to_string()))?;
                    state.lifetime = WriteLifeTimeHint::from_u32(raw);
                }
                TAG_EXTENT => {
                    let record = get_length_prefixed_slice(input)?;
                    let (start, length) = ZoneExtent::decode_raw(record)?;
                    let zone = self
                        .allocator
                        .zone_for_lba(start)
                        .ok_or_else(|| FileError::Corruption("invalid zone extent".to_string()))?;
                    zone.add_used(length);

                    let align = length % self.block_size;
                    if align != 0 {
                        pad_bytes += self.block_size - align;
                    }

                    state.extents.push(ZoneExtent {
                        start,
                        length,
                        zone: zone.id(),
                    });

                    // The once-log may already be open from a previous
                    // decode of a file sharing its zones.
                    let mut wal = self.lock_wal();
                    if wal.is_none() {
                        *wal = self.allocator.wal_for_lba(start);
                    }
                }
                TAG_MODIFICATION_TIME => {
                    state.m_time = get_fixed64(input).map_err(|_| {
                        FileError::Corruption("missing modification time".to_string())
                    })?;
                }
                TAG_ACTIVE_EXTENT_START => {
                    state.extent_start = get_fixed64(input).map_err(|_| {
                        FileError::Corruption("missing active extent start".to_string())
                    })?;
                }
                TAG_IS_SPARSE => {
                    state.is_sparse = true;
                }
                TAG_LINKED_FILENAME => {
                    let raw = get_length_prefixed_slice(input)?;
                    if raw.is_empty() {
                        return Err(FileError::Corruption(
                            "zero-length link filename".to_string(),
                        ));
                    }
                    let name = String::from_utf8(raw.to_vec()).map_err(|_| {
                        FileError::Corruption("link filename is not UTF-8".to_string())
                    })?;
                    state.linkfiles.push(name);
                }
                TAG_WAL_SEQ => {
                    let seq = get_fixed64(input)
                        .map_err(|_| FileError::Corruption("missing WAL sequence".to_string()))?;
                    is_wal = true;
                    self.wal_seq.store(seq, Ordering::Release);
                }
                TAG_FILE_NAME_DEPRECATED => {
                    return Err(FileError::Corruption("unexpected tag".to_string()));
                }
                _ => {
                    return Err(FileError::Corruption("unexpected tag".to_string()));
                }
            }
        }

        if is_wal {
            state.is_wal = true;
            state.io_type = IoType::Wal;
            // Restore the barrier window position from the on-media bytes
            // (payload plus per-record padding) written so far.
            state.append_bytes_since_barrier =
                (state.file_size + pad_bytes) % self.config.wal_barrier_size;
            debug!(
                file = self.id(),
                seq = self.wal_seq.load(Ordering::Acquire),
                barrier_fill = state.append_bytes_since_barrier,
                "WAL metadata decoded"
            );
        }

        state.nr_synced_extents = state.extents.len();
        Ok(())
    }

    /// Apply one decoded metadata delta to this file.
    ///
    /// With `replace`, the extent list is rebuilt from the update — an
    /// upsert-replace reserved for journal snapshot records. The WAL
    /// sequence only ever moves forward.
    pub fn merge_update(&self, update: &ZoneFile, replace: bool) -> Result<(), FileError> {
        if self.id() != update.id() {
            return Err(FileError::Corruption(format!(
                "file ID mismatch in metadata update: {} vs {}",
                self.id(),
                update.id()
            )));
        }

        let other = update.read_state();
        let mut state = self.write_state();

        state.file_size = other.file_size;
        state.lifetime = other.lifetime;
        state.m_time = other.m_time;

        let update_seq = update.wal_seq.load(Ordering::Acquire);
        self.wal_seq.fetch_max(update_seq, Ordering::AcqRel);
        if other.is_wal {
            state.is_wal = true;
            state.io_type = IoType::Wal;
            state.append_bytes_since_barrier = other.append_bytes_since_barrier;
        }

        if replace {
            self.clear_extents_locked(&mut state);
        }
        for extent in &other.extents {
            self.allocator.zone(extent.zone).add_used(extent.length);
            state.extents.push(*extent);
        }
        state.extent_start = other.extent_start;
        state.is_sparse = other.is_sparse;
        state.nr_synced_extents = state.extents.len();

        state.linkfiles = other.linkfiles.clone();
        Ok(())
    }

    /// Mark every extent as covered by persisted metadata.
    pub fn metadata_synced(&self) {
        let mut state = self.write_state();
        state.nr_synced_extents = state.extents.len();
    }

    /// Mark the metadata as fully unsynced (forces a snapshot encode).
    pub fn metadata_unsynced(&self) {
        self.write_state().nr_synced_extents = 0;
    }

    /// Persist a metadata update through the attached writer.
    pub fn persist_metadata(&self) -> Result<(), FileError> {
        let mut state = self.write_state();
        self.persist_metadata_locked(&mut state)
    }

    fn persist_metadata_locked(&self, state: &mut FileState) -> Result<(), FileError> {
        let Some(writer) = self.metadata_writer.as_ref() else {
            return Ok(());
        };
        let mut record = Vec::new();
        self.encode_to_locked(state, &mut record, state.nr_synced_extents)?;
        writer.persist(self.id(), &record)?;
        state.nr_synced_extents = state.extents.len();
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Crash recovery
    // --------------------------------------------------------------------------------------------

    /// Recover data written after the last metadata sync, using the zone
    /// write pointer to find the crash-written tail.
    pub fn recover(&self) -> Result<(), FileError> {
        let mut state = self.write_state();

        // No active extent: the file was closed cleanly, or never written.
        if state.extent_start == NO_EXTENT {
            return Ok(());
        }

        let zone = self
            .allocator
            .zone_for_lba(state.extent_start)
            .ok_or_else(|| {
                FileError::Io("could not find zone for extent start while recovering".to_string())
            })?;
        let zone_id = zone.id();
        let wp = zone.write_pointer();

        if wp < state.extent_start {
            return Err(FileError::Io(
                "zone write pointer is smaller than the active extent start".to_string(),
            ));
        }

        let to_recover = wp - state.extent_start;
        if to_recover == 0 {
            state.extent_start = NO_EXTENT;
            return Ok(());
        }

        if state.is_sparse {
            let start = state.extent_start;
            self.recover_sparse_extents_locked(&mut state, start, wp, zone_id)?;
        } else {
            zone.add_used(to_recover);
            let start = state.extent_start;
            state.extents.push(ZoneExtent {
                start,
                length: to_recover,
                zone: zone_id,
            });
        }

        state.extent_start = NO_EXTENT;
        state.file_size = state.extents.iter().map(|e| e.length).sum();

        info!(
            file = self.id(),
            size = state.file_size,
            extents = state.extents.len(),
            "file recovered"
        );
        Ok(())
    }

    /// Walk `[start, end)` of a zone decoding per-extent sparse headers,
    /// rebuilding the extent list and the WAL sequence counter.
    pub fn recover_sparse_extents(&self, start: u64, end: u64, zone: ZoneId) -> Result<(), FileError> {
        let mut state = self.write_state();
        self.recover_sparse_extents_locked(&mut state, start, end, zone)
    }

    fn recover_sparse_extents_locked(
        &self,
        state: &mut FileState,
        start: u64,
        end: u64,
        zone_id: ZoneId,
    ) -> Result<(), FileError> {
        let header_size = self.header_size_locked(state);
        let zone = self.allocator.zone(zone_id);
        let mut next_extent_start = start;
        let mut buffer = vec![0u8; self.block_size as usize];

        let mut max_seq: Option<u64> = None;
        let mut recovered = 0u32;

        while next_extent_start < end {
            let read = self
                .backend
                .read(&mut buffer, next_extent_start, false)
                .map_err(|e| FileError::Io(format!("unexpected read error while recovering: {e}")))?;
            if read != buffer.len() {
                return Err(FileError::Io(
                    "unexpected short read while recovering".to_string(),
                ));
            }

            let extent_length = decode_fixed64_at(&buffer, 0)?;
            if extent_length == 0 {
                return Err(FileError::Corruption(
                    "zero-length extent while recovering".to_string(),
                ));
            }

            if state.is_wal {
                let seq = decode_fixed64_at(&buffer, 8)?;
                max_seq = Some(max_seq.map_or(seq, |m| m.max(seq)));
            }
            recovered += 1;

            zone.add_used(extent_length);
            state.extents.push(ZoneExtent {
                start: next_extent_start + header_size,
                length: extent_length,
                zone: zone_id,
            });

            let record = extent_length + header_size;
            next_extent_start += record + self.pad_to_block(record);
        }

        // Sequencing must continue past the highest record seen on media,
        // even if the metadata snapshot predates those appends.
        if let Some(max_seq) = max_seq {
            self.wal_seq.fetch_max(max_seq + 1, Ordering::AcqRel);
        }

        debug!(
            file = self.id(),
            recovered,
            seq = self.wal_seq.load(Ordering::Acquire),
            "sparse extents recovered"
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Extent maintenance
    // --------------------------------------------------------------------------------------------

    /// Drop every extent, returning its bytes to the zones' used-capacity
    /// accounting.
    pub fn clear_extents(&self) {
        let mut state = self.write_state();
        self.clear_extents_locked(&mut state);
    }

    fn clear_extents_locked(&self, state: &mut FileState) {
        for extent in state.extents.drain(..) {
            self.allocator.zone(extent.zone).sub_used(extent.length);
        }
    }

    /// Swap in a relocated extent list of identical cardinality. Requires
    /// the writer gate (garbage collection holds it during migration).
    pub fn replace_extent_list(&self, new_list: Vec<ZoneExtent>) -> Result<(), FileError> {
        if !self.is_open_for_wr() {
            return Err(FileError::Io(
                "extent list replaced without the writer gate".to_string(),
            ));
        }
        let mut state = self.write_state();
        if new_list.len() != state.extents.len() {
            return Err(FileError::Io(format!(
                "extent list cardinality changed: {} vs {}",
                new_list.len(),
                state.extents.len()
            )));
        }
        state.extents = new_list;
        Ok(())
    }

    /// Copy `length` bytes of device data at `offset` into `target_zone`
    /// in block-aligned 128 KiB steps. Used by zone garbage collection;
    /// the caller owns the target zone.
    pub fn migrate_data(
        &self,
        mut offset: u64,
        mut length: u64,
        target_zone: ZoneId,
    ) -> Result<(), FileError> {
        if offset % self.block_size != 0 {
            return Err(FileError::Io(
                "migrate offset is not block-aligned".to_string(),
            ));
        }

        let zone = self.allocator.zone(target_zone);
        let mut buf = vec![0u8; MIGRATE_STEP];

        while length > 0 {
            let read_size = length.min(MIGRATE_STEP as u64);
            let padded = read_size + self.pad_to_block(read_size);

            self.backend
                .read(&mut buf[..padded as usize], offset, true)
                .map_err(|e| FileError::Io(format!("migrate read failed: {e}")))?;
            zone.append(&buf[..padded as usize])?;

            length -= read_size;
            offset += padded;
        }
        Ok(())
    }

    /// Advisory cache invalidation over `[pos, pos + size)` of the file.
    pub fn invalidate_cache(&self, pos: u64, size: u64) -> Result<(), FileError> {
        let state = self.read_state();
        let mut offset = pos;
        let mut left = if size == 0 { state.file_size } else { size };

        while left > 0 {
            let Some((index, in_offset)) = Self::extent_for_offset(&state, offset) else {
                return Err(FileError::Io(
                    "extent not found while invalidating cache".to_string(),
                ));
            };
            let extent = &state.extents[index];
            let span = (extent.length - in_offset).min(left);
            self.backend
                .invalidate_cache(extent.start + in_offset, span)?;
            left -= span;
            offset += span;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Close
    // --------------------------------------------------------------------------------------------

    /// Close the writer side: mark the file cleanly closed, persist
    /// metadata, release the writer gate and the active zone.
    pub fn close_wr(&self) -> Result<(), FileError> {
        let mut state = self.write_state();
        state.extent_start = NO_EXTENT;
        self.persist_metadata_locked(&mut state)?;
        self.release_wr_lock();
        self.close_active_zone_locked(&mut state)
    }
}

impl Drop for ZoneFile {
    fn drop(&mut self) {
        // Flush any WAL appends still in flight; losing them on a clean
        // drop would turn a process exit into data loss.
        let wal = self.lock_wal();
        if let Some(log) = wal.as_ref() {
            if let Err(e) = log.sync() {
                warn!(file = self.id(), error = %e, "WAL sync failed on drop");
            }
        }
        drop(wal);
        self.clear_extents();
    }
}
