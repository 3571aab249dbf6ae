//! Append-only once-log over a run of zones.
//!
//! An [`OnceLog`] is the WAL-side view of one or more LBA-contiguous zones:
//! a log that is only ever appended to via the device's zone-append
//! primitive and reclaimed by resetting every zone it spans. It tracks two
//! monotonic block pointers:
//!
//! - `write_head` — the next block to be written (grows on every submitted
//!   append),
//! - `write_tail` — the oldest live block (only moves on reset).
//!
//! `head - tail` is the live extent of the log in blocks. Both pointers are
//! log-relative: block 0 is the first block of the first spanned zone.
//!
//! # Ordering
//!
//! [`OnceLog::async_append`] returns at submit time. In-flight appends may
//! land on media in any order; only [`OnceLog::sync`] establishes a
//! happens-before edge with later reads. The head is advanced at submit
//! time — it is a space reservation, not a durability statement.


use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, trace};

use crate::device::{DeviceError, ZonedBackend};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by once-log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// Underlying device failure.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Append data is not a whole number of blocks.
    #[error("append of {len} bytes is not block-aligned (block size {block_size})")]
    Unaligned {
        /// Length of the rejected append.
        len: usize,
        /// Device block size.
        block_size: u32,
    },

    /// The log has no room left for the append.
    #[error("log full: need {needed} blocks, {remaining} remaining")]
    OutOfSpace {
        /// Blocks required by the append.
        needed: u64,
        /// Blocks left before the end of the spanned zones.
        remaining: u64,
    },

    /// A read touches blocks outside the spanned zones.
    #[error("read out of range: {0}")]
    OutOfRange(String),
}

// ------------------------------------------------------------------------------------------------
// Block-shift helper
// ------------------------------------------------------------------------------------------------

/// Shift converting between blocks and bytes for the given block size.
pub fn block_shift_for(block_size: u32) -> u32 {
    match block_size {
        512 => 9,
        _ => 12,
    }
}

// ------------------------------------------------------------------------------------------------
// OnceLog
// ------------------------------------------------------------------------------------------------

/// Append-only log spanning a contiguous run of zones.
///
/// One WAL file owns exactly one handle; the handle may be shared with the
/// allocator's recovery lookup. All byte addressing inside the log is
/// relative to [`OnceLog::base_lba`].
pub struct OnceLog {
    id: u64,
    base_lba: u64,
    end_lba: AtomicU64,
    block_shift: u32,
    write_head: AtomicU64,
    write_tail: AtomicU64,
    backend: Arc<dyn ZonedBackend>,
}

impl std::fmt::Debug for OnceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceLog")
            .field("id", &self.id)
            .field("base_lba", &self.base_lba)
            .field("end_lba", &self.end_lba.load(Ordering::Acquire))
            .field("write_head", &self.write_head.load(Ordering::Acquire))
            .field("write_tail", &self.write_tail.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl OnceLog {
    /// Create a handle over `[base_lba, end_lba)` with an empty history.
    pub fn new(id: u64, base_lba: u64, end_lba: u64, backend: Arc<dyn ZonedBackend>) -> Self {
        let block_shift = block_shift_for(backend.geometry().block_size);
        Self {
            id,
            base_lba,
            end_lba: AtomicU64::new(end_lba),
            block_shift,
            write_head: AtomicU64::new(0),
            write_tail: AtomicU64::new(0),
            backend,
        }
    }

    /// Create a handle over already-populated zones, seeding the head at
    /// `head` blocks. Used when reopening a log during recovery.
    pub fn with_head(
        id: u64,
        base_lba: u64,
        end_lba: u64,
        head: u64,
        backend: Arc<dyn ZonedBackend>,
    ) -> Self {
        let log = Self::new(id, base_lba, end_lba, backend);
        log.write_head.store(head, Ordering::Release);
        debug!(id, base_lba, end_lba, head, "once-log reopened");
        log
    }

    /// Identifier assigned by the allocator.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// First absolute byte LBA covered by the log.
    pub fn base_lba(&self) -> u64 {
        self.base_lba
    }

    /// One past the last absolute byte LBA covered by the log.
    pub fn end_lba(&self) -> u64 {
        self.end_lba.load(Ordering::Acquire)
    }

    /// Shift converting log block indices to byte offsets.
    pub fn block_shift(&self) -> u32 {
        self.block_shift
    }

    /// Next block to be written (log-relative).
    pub fn write_head(&self) -> u64 {
        self.write_head.load(Ordering::Acquire)
    }

    /// Oldest live block (log-relative).
    pub fn write_tail(&self) -> u64 {
        self.write_tail.load(Ordering::Acquire)
    }

    /// Whether `lba` (absolute) falls inside the spanned zones.
    pub fn contains_lba(&self, lba: u64) -> bool {
        lba >= self.base_lba && lba < self.end_lba()
    }

    /// Total log capacity in blocks.
    fn capacity_blocks(&self) -> u64 {
        (self.end_lba() - self.base_lba) >> self.block_shift
    }

    /// Grow the log to cover zones up to `end_lba`. Called by the allocator
    /// when a fresh zone is appended to the run.
    pub(crate) fn extend(&self, end_lba: u64) {
        self.end_lba.fetch_max(end_lba, Ordering::AcqRel);
        trace!(id = self.id, end_lba, "once-log extended");
    }

    /// Submit an append against the zone starting at `zone_start`.
    ///
    /// Reserves head space and queues the write; returns at submit time.
    /// `data` must be a whole number of blocks.
    pub fn async_append(&self, zone_start: u64, data: &[u8]) -> Result<usize, LogError> {
        let block_size = 1u64 << self.block_shift;
        if data.is_empty() || data.len() as u64 % block_size != 0 {
            return Err(LogError::Unaligned {
                len: data.len(),
                block_size: block_size as u32,
            });
        }

        let blocks = data.len() as u64 >> self.block_shift;
        let head = self.write_head.load(Ordering::Acquire);
        let remaining = self.capacity_blocks().saturating_sub(head);
        if blocks > remaining {
            return Err(LogError::OutOfSpace {
                needed: blocks,
                remaining,
            });
        }

        self.backend.zone_append(zone_start, data)?;
        self.write_head.fetch_add(blocks, Ordering::AcqRel);

        trace!(id = self.id, blocks, head, "log append submitted");
        Ok(data.len())
    }

    /// Flush all in-flight appends to durable media.
    pub fn sync(&self) -> Result<(), LogError> {
        self.backend.append_sync()?;
        Ok(())
    }

    /// Read `buf.len()` bytes starting at log block `block_index`.
    pub fn read(&self, block_index: u64, buf: &mut [u8], direct: bool) -> Result<usize, LogError> {
        let offset = block_index << self.block_shift;
        let end = offset + buf.len() as u64;
        if end > self.end_lba() - self.base_lba {
            return Err(LogError::OutOfRange(format!(
                "read of {} bytes at block {block_index} beyond log end",
                buf.len()
            )));
        }
        let read = self.backend.read(buf, self.base_lba + offset, direct)?;
        Ok(read)
    }

    /// Reset every zone the log spans and rewind both pointers to zero.
    ///
    /// After the reset the log covers only its first zone again; the
    /// allocator re-extends it on the next WAL zone allocation.
    pub fn reset_all(&self) -> Result<(), LogError> {
        let zone_size = self.backend.geometry().zone_size;
        let end = self.end_lba();

        let mut zone_start = self.base_lba;
        while zone_start < end {
            self.backend.reset(zone_start)?;
            zone_start += zone_size;
        }

        self.write_head.store(0, Ordering::Release);
        self.write_tail.store(0, Ordering::Release);
        self.end_lba
            .store(self.base_lba + zone_size, Ordering::Release);

        debug!(id = self.id, base = self.base_lba, "once-log reset");
        Ok(())
    }
}
