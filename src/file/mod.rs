//! File views: the outward file API over a shared zone file.
//!
//! The three views are stateless adapters in the sense that all durable
//! state lives in the underlying [`ZoneFile`]; a view only carries its own
//! buffering or read cursor:
//!
//! - [`ZonedWritableFile`] — append-only writer with optional buffering.
//!   Sparse files stage writes in a buffer that reserves the record header
//!   slot up front plus one spare block for padding, so a flush can hand
//!   the whole buffer to [`ZoneFile::sparse_append`] without copying.
//! - [`ZonedSequentialFile`] — forward reader with a read pointer.
//! - [`ZonedRandomAccessFile`] — positioned reader.
//!
//! # Sync semantics
//!
//! `sync` (and `range_sync` past the write pointer) flushes data only;
//! `fsync` additionally persists metadata — except for buffered dense
//! files, whose data sync already persisted it (their file size is not
//! recoverable from the block-aligned zone write pointer, so the data sync
//! must). Closing a view syncs data, persists metadata, releases the
//! writer gate and the active zone.

#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, trace};

use crate::zonefile::{FileError, SPARSE_HEADER_SIZE, SPARSE_WAL_HEADER_SIZE, ZoneFile};

// ------------------------------------------------------------------------------------------------
// Writable view
// ------------------------------------------------------------------------------------------------

/// Writer-side buffer and write-pointer state.
#[derive(Debug)]
struct WriteBuffer {
    /// Staging buffer. For sparse files the first `header` bytes are the
    /// reserved record-header slot and the last block is padding spare.
    data: Vec<u8>,
    /// Payload bytes currently staged.
    pos: usize,
    /// Payload capacity of one flush.
    capacity: usize,
    /// Offset where staged payload begins (the header slot size).
    header: usize,
    /// Logical write pointer of the file.
    wp: u64,
}

/// Append-only writable view over a zone file.
pub struct ZonedWritableFile {
    file: Arc<ZoneFile>,
    buffered: bool,
    sparse: bool,
    buffer: Mutex<WriteBuffer>,
    open: Mutex<bool>,
}

impl ZonedWritableFile {
    /// Wrap an open-for-write zone file.
    ///
    /// `buffered` selects the staging-buffer write path; unbuffered writes
    /// go directly to the device and must be block-aligned.
    pub fn new(file: Arc<ZoneFile>, buffered: bool) -> Self {
        let sparse = file.is_sparse();
        let block = file.block_size() as usize;

        let (data, capacity, header) = if buffered {
            if sparse {
                let header = (SPARSE_HEADER_SIZE
                    + if file.is_wal() {
                        SPARSE_WAL_HEADER_SIZE
                    } else {
                        0
                    }) as usize;
                let total = file.config().sparse_buffer_size as usize + block;
                (vec![0u8; total], total - header - block, header)
            } else {
                let total = file.config().dense_buffer_size as usize;
                (vec![0u8; total], total, 0)
            }
        } else {
            (Vec::new(), 0, 0)
        };

        let wp = file.file_size();
        Self {
            file,
            buffered,
            sparse,
            buffer: Mutex::new(WriteBuffer {
                data,
                pos: 0,
                capacity,
                header,
                wp,
            }),
            open: Mutex::new(true),
        }
    }

    /// The wrapped zone file.
    pub fn zone_file(&self) -> &Arc<ZoneFile> {
        &self.file
    }

    /// Whether writes bypass the staging buffer.
    pub fn use_direct_io(&self) -> bool {
        !self.buffered
    }

    /// Alignment required for unbuffered appends.
    pub fn required_buffer_alignment(&self) -> u64 {
        self.file.block_size()
    }

    /// Propagate a write-lifetime hint to zone allocation.
    pub fn set_write_lifetime_hint(&self, hint: crate::zone::WriteLifeTimeHint) {
        self.file.set_lifetime_hint(hint);
    }

    /// The file's current write-lifetime hint.
    pub fn write_lifetime_hint(&self) -> crate::zone::WriteLifeTimeHint {
        self.file.lifetime_hint()
    }

    fn lock_buffer(&self) -> MutexGuard<'_, WriteBuffer> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append `data` at the current write pointer.
    pub fn append(&self, data: &[u8]) -> Result<(), FileError> {
        let mut buffer = self.lock_buffer();
        if self.buffered {
            self.buffered_write(&mut buffer, data)
        } else {
            self.file.append(data)?;
            buffer.wp += data.len() as u64;
            Ok(())
        }
    }

    /// Append at an explicit offset, which must equal the write pointer.
    pub fn positioned_append(&self, data: &[u8], offset: u64) -> Result<(), FileError> {
        let mut buffer = self.lock_buffer();
        if offset != buffer.wp {
            return Err(FileError::Io(
                "positioned append not at write pointer".to_string(),
            ));
        }
        if self.buffered {
            self.buffered_write(&mut buffer, data)
        } else {
            self.file.append(data)?;
            buffer.wp += data.len() as u64;
            Ok(())
        }
    }

    fn buffered_write(&self, buffer: &mut WriteBuffer, data: &[u8]) -> Result<(), FileError> {
        let mut remaining = data;
        while !remaining.is_empty() {
            if buffer.pos == buffer.capacity {
                self.flush_buffer(buffer)?;
            }
            let to_buffer = remaining.len().min(buffer.capacity - buffer.pos);
            let at = buffer.header + buffer.pos;
            buffer.data[at..at + to_buffer].copy_from_slice(&remaining[..to_buffer]);
            buffer.pos += to_buffer;
            remaining = &remaining[to_buffer..];
        }
        Ok(())
    }

    fn flush_buffer(&self, buffer: &mut WriteBuffer) -> Result<(), FileError> {
        if buffer.pos == 0 {
            return Ok(());
        }
        let pos = buffer.pos;
        if self.sparse {
            self.file.sparse_append(&mut buffer.data, pos)?;
        } else {
            self.file.buffered_append(&mut buffer.data, pos)?;
        }
        buffer.wp += pos as u64;
        buffer.pos = 0;
        trace!(file = self.file.id(), flushed = pos, "buffer flushed");
        Ok(())
    }

    fn data_sync(&self) -> Result<(), FileError> {
        if self.file.is_wal() {
            self.file.wal_sync()?;
        }

        if self.buffered {
            let mut buffer = self.lock_buffer();
            self.flush_buffer(&mut buffer)?;
            drop(buffer);

            // Dense file sizes are not recoverable from the block-aligned
            // zone write pointer, so the new extent must be persisted now.
            if !self.sparse {
                return self.file.persist_metadata();
            }
        } else {
            self.file.push_extent();
        }
        Ok(())
    }

    /// Flush staged data to durable media. Does not persist metadata.
    pub fn sync(&self) -> Result<(), FileError> {
        self.data_sync()
    }

    /// Flush staged data and persist metadata.
    pub fn fsync(&self) -> Result<(), FileError> {
        self.data_sync()?;
        // Buffered dense files persisted metadata inside the data sync.
        if self.buffered && !self.sparse {
            return Ok(());
        }
        self.file.persist_metadata()
    }

    /// Sync if `[offset, offset + nbytes)` reaches past the write pointer.
    pub fn range_sync(&self, offset: u64, nbytes: u64) -> Result<(), FileError> {
        let wp = self.lock_buffer().wp;
        if wp < offset + nbytes {
            return self.data_sync();
        }
        Ok(())
    }

    /// No-op: data reaches the device on sync.
    pub fn flush(&self) -> Result<(), FileError> {
        Ok(())
    }

    /// Adjust the logical file size.
    pub fn truncate(&self, size: u64) -> Result<(), FileError> {
        self.file.set_file_size(size);
        Ok(())
    }

    /// Close the view: sync data, persist metadata, release the writer
    /// gate and the active zone.
    pub fn close(&self) -> Result<(), FileError> {
        self.close_internal()
    }

    fn close_internal(&self) -> Result<(), FileError> {
        let mut open = match self.open.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !*open {
            return Ok(());
        }
        self.data_sync()?;
        self.file.close_wr()?;
        *open = false;
        Ok(())
    }
}

impl Drop for ZonedWritableFile {
    fn drop(&mut self) {
        if let Err(e) = self.close_internal() {
            error!(file = self.file.id(), error = %e, "writable file close failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Sequential view
// ------------------------------------------------------------------------------------------------

/// Forward reader with an internal read pointer.
pub struct ZonedSequentialFile {
    file: Arc<ZoneFile>,
    rp: u64,
    direct: bool,
}

impl ZonedSequentialFile {
    /// Wrap a zone file for sequential reading.
    ///
    /// Direct reads are disabled for sparse files: their payload is not
    /// block-aligned on media.
    pub fn new(file: Arc<ZoneFile>, use_direct_reads: bool) -> Self {
        let direct = use_direct_reads && !file.is_sparse();
        Self {
            file,
            rp: 0,
            direct,
        }
    }

    /// Read up to `n` bytes at the read pointer, advancing it.
    pub fn read(&mut self, n: usize, scratch: &mut [u8]) -> Result<usize, FileError> {
        let read = self.file.positioned_read(self.rp, n, scratch, self.direct)?;
        self.rp += read as u64;
        Ok(read)
    }

    /// Read at an explicit offset without touching the read pointer.
    pub fn positioned_read(
        &self,
        offset: u64,
        n: usize,
        scratch: &mut [u8],
    ) -> Result<usize, FileError> {
        self.file.positioned_read(offset, n, scratch, self.direct)
    }

    /// Skip `n` bytes. Skipping to or past end-of-file is an error.
    pub fn skip(&mut self, n: u64) -> Result<(), FileError> {
        if self.rp + n >= self.file.file_size() {
            return Err(FileError::InvalidArgument(
                "skip beyond end of file".to_string(),
            ));
        }
        self.rp += n;
        Ok(())
    }

    /// Alignment required for direct reads.
    pub fn required_buffer_alignment(&self) -> u64 {
        self.file.block_size()
    }

    /// Advisory cache invalidation.
    pub fn invalidate_cache(&self, offset: u64, length: u64) -> Result<(), FileError> {
        self.file.invalidate_cache(offset, length)
    }
}

// ------------------------------------------------------------------------------------------------
// Random-access view
// ------------------------------------------------------------------------------------------------

/// Positioned reader without any cursor state.
pub struct ZonedRandomAccessFile {
    file: Arc<ZoneFile>,
    direct: bool,
}

impl ZonedRandomAccessFile {
    /// Wrap a zone file for positioned reading.
    pub fn new(file: Arc<ZoneFile>, use_direct_reads: bool) -> Self {
        let direct = use_direct_reads && !file.is_sparse();
        Self { file, direct }
    }

    /// Read up to `n` bytes at `offset`.
    pub fn read(&self, offset: u64, n: usize, scratch: &mut [u8]) -> Result<usize, FileError> {
        self.file.positioned_read(offset, n, scratch, self.direct)
    }

    /// Alignment required for direct reads.
    pub fn required_buffer_alignment(&self) -> u64 {
        self.file.block_size()
    }

    /// Advisory cache invalidation.
    pub fn invalidate_cache(&self, offset: u64, length: u64) -> Result<(), FileError> {
        self.file.invalidate_cache(offset, length)
    }
}
