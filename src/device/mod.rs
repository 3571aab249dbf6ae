//! Zoned block device backend.
//!
//! This module defines the [`ZonedBackend`] trait — the thin adapter the
//! rest of the crate talks to — plus an mmap-backed [`EmulatedBackend`] used
//! by tests and by deployments without real ZBD hardware.
//!
//! A host-managed zoned device exposes storage as fixed-size zones. Regular
//! writes must land exactly at a zone's write pointer; a zone is reclaimed
//! only by resetting it as a whole. The one escape hatch is the *zone
//! append* primitive: the device picks the landing LBA inside the target
//! zone, which lets many appends be in flight concurrently without write
//! pointer coordination.
//!
//! # Async appends
//!
//! [`ZonedBackend::zone_append`] queues an append and returns at submit
//! time, not completion time. Nothing is ordered or durable until
//! [`ZonedBackend::append_sync`] drains the queue and flushes device
//! caches. The order in which queued appends land on media is decided by
//! the backend; [`EmulatedBackend`] delegates that decision to an
//! [`AppendScheduler`], so tests can force adversarial completion orders
//! (the FIFO scheduler is the production default).
//!
//! # Environment checks
//!
//! Real host-managed devices additionally require the `mq-deadline` I/O
//! scheduler; [`verify_scheduler`] performs the sysfs check a hardware
//! backend must run before accepting an open.


use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use crossbeam::channel::{Receiver, Sender, unbounded};
use memmap2::MmapMut;
use thiserror::Error;
use tracing::{debug, info, trace};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by backend operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The device is not a host-managed zoned device.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Environment or argument validation failure.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A direct-I/O position or size is not block-aligned.
    #[error("unaligned access: pos {pos}, len {len}, block size {block_size}")]
    Unaligned {
        /// Requested device position.
        pos: u64,
        /// Requested transfer length.
        len: usize,
        /// Device block size.
        block_size: u32,
    },

    /// Access outside the device or zone bounds.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// A write did not land at the zone write pointer.
    #[error("sequential write violation: zone write pointer is {wp}, write at {pos}")]
    NotSequential {
        /// Current write pointer of the target zone.
        wp: u64,
        /// Position the caller attempted to write at.
        pos: u64,
    },
}

// ------------------------------------------------------------------------------------------------
// Device description
// ------------------------------------------------------------------------------------------------

/// Static geometry of a zoned device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceGeometry {
    /// Physical block size in bytes (512 or 4096).
    pub block_size: u32,

    /// Zone size in bytes. A multiple of the block size.
    pub zone_size: u64,

    /// Number of zones on the device.
    pub nr_zones: u32,

    /// Maximum number of zones the device allows in the active state.
    pub max_active_zones: u32,

    /// Maximum number of zones the device allows open for writing.
    pub max_open_zones: u32,
}

impl DeviceGeometry {
    /// Total addressable size of the device in bytes.
    pub fn device_size(&self) -> u64 {
        self.zone_size * u64::from(self.nr_zones)
    }
}

/// Snapshot of a single zone as reported by the device.
#[derive(Debug, Clone, Copy)]
pub struct ZoneReport {
    /// First LBA of the zone (bytes).
    pub start: u64,

    /// Current write pointer (bytes, absolute).
    pub wp: u64,

    /// Writable capacity of the zone in bytes, measured from `start`.
    pub capacity: u64,

    /// Whether the device took the zone offline.
    pub offline: bool,
}

// ------------------------------------------------------------------------------------------------
// Backend contract
// ------------------------------------------------------------------------------------------------

/// Adapter over a host-managed zoned block device.
///
/// All positions are absolute byte LBAs. Implementations must be safe to
/// share across threads; the file layer issues concurrent reads, writes to
/// distinct zones, and queued appends.
pub trait ZonedBackend: Send + Sync {
    /// Device geometry (block size, zone size, zone count, limits).
    fn geometry(&self) -> DeviceGeometry;

    /// Report all zones.
    fn list_zones(&self) -> Result<Vec<ZoneReport>, DeviceError>;

    /// Reset the zone starting at `start`, returning its post-reset state.
    fn reset(&self, start: u64) -> Result<ZoneReport, DeviceError>;

    /// Transition the zone starting at `start` to full.
    fn finish(&self, start: u64) -> Result<(), DeviceError>;

    /// Close the zone starting at `start` (release device open resources).
    fn close(&self, start: u64) -> Result<(), DeviceError>;

    /// Read `buf.len()` bytes at `pos`. Direct reads must be block-aligned.
    ///
    /// Returns the number of bytes read.
    fn read(&self, buf: &mut [u8], pos: u64, direct: bool) -> Result<usize, DeviceError>;

    /// Write `data` at `pos`. `pos` must equal the target zone's write
    /// pointer and `data` must be a whole number of blocks.
    ///
    /// Returns the number of bytes written.
    fn write(&self, data: &[u8], pos: u64) -> Result<usize, DeviceError>;

    /// Queue a zone append against the zone starting at `zone_start`.
    ///
    /// Returns at submit time with the number of bytes accepted; the device
    /// picks the landing LBA when the append completes. Completion order is
    /// unspecified until [`ZonedBackend::append_sync`].
    fn zone_append(&self, zone_start: u64, data: &[u8]) -> Result<usize, DeviceError>;

    /// Drain all queued appends to media and flush device caches.
    ///
    /// This is the only operation that establishes a happens-before edge
    /// between queued appends and later reads.
    fn append_sync(&self) -> Result<(), DeviceError>;

    /// Advisory: drop any cached data for `[pos, pos + size)`.
    fn invalidate_cache(&self, pos: u64, size: u64) -> Result<(), DeviceError>;
}

// ------------------------------------------------------------------------------------------------
// Append completion scheduling
// ------------------------------------------------------------------------------------------------

/// Strategy deciding the order in which queued zone appends land on media.
///
/// Production backends use [`FifoScheduler`]. Tests plug in reordering
/// schedulers to exercise the out-of-order completion paths that real
/// devices exhibit under load.
pub trait AppendScheduler: Send + Sync {
    /// Return a permutation of `0..pending` giving the completion order.
    fn order(&self, pending: usize) -> Vec<usize>;
}

/// Completes appends in submission order.
#[derive(Debug, Default)]
pub struct FifoScheduler;

impl AppendScheduler for FifoScheduler {
    fn order(&self, pending: usize) -> Vec<usize> {
        (0..pending).collect()
    }
}

/// Completes appends in reverse submission order. Test-oriented.
#[derive(Debug, Default)]
pub struct ReverseScheduler;

impl AppendScheduler for ReverseScheduler {
    fn order(&self, pending: usize) -> Vec<usize> {
        (0..pending).rev().collect()
    }
}

// ------------------------------------------------------------------------------------------------
// Scheduler environment check
// ------------------------------------------------------------------------------------------------

/// Verify that the block device `name` (e.g. `nvme0n1`) uses the
/// `mq-deadline` I/O scheduler.
///
/// Host-managed devices served through the kernel block layer require
/// `mq-deadline` to preserve write ordering; hardware backends must call
/// this before accepting an open.
pub fn verify_scheduler(name: &str) -> Result<(), DeviceError> {
    let path = format!("/sys/block/{name}/queue/scheduler");
    verify_scheduler_at(Path::new(&path))
}

/// [`verify_scheduler`] against an explicit sysfs path.
pub fn verify_scheduler_at(path: &Path) -> Result<(), DeviceError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        DeviceError::InvalidArgument(format!("failed to open {}: {e}", path.display()))
    })?;

    if !contents.contains("[mq-deadline]") {
        return Err(DeviceError::InvalidArgument(
            "I/O scheduler is not mq-deadline, set it to mq-deadline".to_string(),
        ));
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Emulated backend
// ------------------------------------------------------------------------------------------------

/// An append queued through [`ZonedBackend::zone_append`] but not yet on
/// media.
struct PendingAppend {
    zone_start: u64,
    data: Vec<u8>,
}

/// Mutable device state: the memory-mapped image and per-zone write
/// pointers.
struct DeviceState {
    image: MmapMut,
    zone_wp: Vec<u64>,
}

/// A zoned block device emulated over a memory-mapped file.
///
/// Behaves like a host-managed device: writes are rejected unless they land
/// at the target zone's write pointer, reads of reset zones return zeros,
/// and zone appends are queued until [`ZonedBackend::append_sync`] drains
/// them in the order chosen by the configured [`AppendScheduler`].
pub struct EmulatedBackend {
    geometry: DeviceGeometry,
    state: Mutex<DeviceState>,
    pending_tx: Sender<PendingAppend>,
    pending_rx: Receiver<PendingAppend>,
    scheduler: Box<dyn AppendScheduler>,
}

impl EmulatedBackend {
    /// Create (or overwrite) a device image at `path` with the given
    /// geometry and a FIFO completion order.
    pub fn create(path: &Path, geometry: DeviceGeometry) -> Result<Self, DeviceError> {
        Self::create_with_scheduler(path, geometry, Box::new(FifoScheduler))
    }

    /// Create a device image with an explicit completion-order strategy.
    pub fn create_with_scheduler(
        path: &Path,
        geometry: DeviceGeometry,
        scheduler: Box<dyn AppendScheduler>,
    ) -> Result<Self, DeviceError> {
        if geometry.zone_size == 0 || geometry.zone_size % u64::from(geometry.block_size) != 0 {
            return Err(DeviceError::InvalidArgument(format!(
                "zone size {} is not a multiple of the block size {}",
                geometry.zone_size, geometry.block_size
            )));
        }
        if geometry.nr_zones == 0 {
            return Err(DeviceError::InvalidArgument(
                "device has no zones".to_string(),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(geometry.device_size())?;

        // Safety: the file is exclusively owned by this backend for the
        // lifetime of the mapping.
        let image = unsafe { MmapMut::map_mut(&file)? };

        let zone_wp = (0..geometry.nr_zones)
            .map(|i| u64::from(i) * geometry.zone_size)
            .collect();

        let (pending_tx, pending_rx) = unbounded();

        info!(
            path = %path.display(),
            zones = geometry.nr_zones,
            zone_size = geometry.zone_size,
            block_size = geometry.block_size,
            "emulated zoned device created"
        );

        Ok(Self {
            geometry,
            state: Mutex::new(DeviceState { image, zone_wp }),
            pending_tx,
            pending_rx,
            scheduler,
        })
    }

    /// Open an existing device image, preserving its contents.
    ///
    /// Write pointers are restored by scanning each zone backwards for the
    /// last non-zero block, the same way a report would after power loss.
    pub fn open(path: &Path, geometry: DeviceGeometry) -> Result<Self, DeviceError> {
        let backend = Self::create(path, geometry)?;
        {
            let mut state = backend.lock_state();
            for zone in 0..geometry.nr_zones as usize {
                let start = zone as u64 * geometry.zone_size;
                let mut wp = start + geometry.zone_size;
                let block = u64::from(geometry.block_size);
                while wp > start {
                    let probe = &state.image[(wp - block) as usize..wp as usize];
                    if probe.iter().any(|b| *b != 0) {
                        break;
                    }
                    wp -= block;
                }
                state.zone_wp[zone] = wp;
            }
        }
        Ok(backend)
    }

    /// Drop all queued-but-unsynced appends. Simulates a crash before the
    /// in-flight appends reached media.
    pub fn discard_pending(&self) {
        let dropped = self.pending_rx.try_iter().count();
        if dropped > 0 {
            debug!(dropped, "discarded pending zone appends");
        }
    }

    /// Number of appends queued and not yet drained.
    pub fn pending_appends(&self) -> usize {
        self.pending_rx.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        // The mutex can only be poisoned by a panic inside this module,
        // which leaves no partially-updated device state worth salvaging.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn zone_index(&self, start: u64) -> Result<usize, DeviceError> {
        if start % self.geometry.zone_size != 0 {
            return Err(DeviceError::InvalidArgument(format!(
                "LBA {start} is not a zone start"
            )));
        }
        let index = (start / self.geometry.zone_size) as usize;
        if index >= self.geometry.nr_zones as usize {
            return Err(DeviceError::OutOfRange(format!(
                "zone start {start} beyond device end"
            )));
        }
        Ok(index)
    }

    fn check_block_aligned(&self, pos: u64, len: usize) -> Result<(), DeviceError> {
        let block = u64::from(self.geometry.block_size);
        if pos % block != 0 || len as u64 % block != 0 {
            return Err(DeviceError::Unaligned {
                pos,
                len,
                block_size: self.geometry.block_size,
            });
        }
        Ok(())
    }

    /// Land one append on media at the target zone's device-side write
    /// pointer.
    fn complete_append(
        &self,
        state: &mut DeviceState,
        append: &PendingAppend,
    ) -> Result<u64, DeviceError> {
        let zone = self.zone_index(append.zone_start)?;
        let wp = state.zone_wp[zone];
        let end = append.zone_start + self.geometry.zone_size;

        if wp + append.data.len() as u64 > end {
            return Err(DeviceError::OutOfRange(format!(
                "zone append of {} bytes does not fit at wp {wp} (zone end {end})",
                append.data.len()
            )));
        }

        state.image[wp as usize..wp as usize + append.data.len()].copy_from_slice(&append.data);
        state.zone_wp[zone] = wp + append.data.len() as u64;

        trace!(zone, lba = wp, len = append.data.len(), "zone append landed");
        Ok(wp)
    }
}

impl ZonedBackend for EmulatedBackend {
    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn list_zones(&self) -> Result<Vec<ZoneReport>, DeviceError> {
        let state = self.lock_state();
        Ok((0..self.geometry.nr_zones as usize)
            .map(|i| ZoneReport {
                start: i as u64 * self.geometry.zone_size,
                wp: state.zone_wp[i],
                capacity: self.geometry.zone_size,
                offline: false,
            })
            .collect())
    }

    fn reset(&self, start: u64) -> Result<ZoneReport, DeviceError> {
        let zone = self.zone_index(start)?;
        let mut state = self.lock_state();
        let end = (start + self.geometry.zone_size) as usize;
        state.image[start as usize..end].fill(0);
        state.zone_wp[zone] = start;

        debug!(zone, start, "zone reset");
        Ok(ZoneReport {
            start,
            wp: start,
            capacity: self.geometry.zone_size,
            offline: false,
        })
    }

    fn finish(&self, start: u64) -> Result<(), DeviceError> {
        let zone = self.zone_index(start)?;
        let mut state = self.lock_state();
        state.zone_wp[zone] = start + self.geometry.zone_size;
        debug!(zone, start, "zone finished");
        Ok(())
    }

    fn close(&self, start: u64) -> Result<(), DeviceError> {
        self.zone_index(start)?;
        trace!(start, "zone closed");
        Ok(())
    }

    fn read(&self, buf: &mut [u8], pos: u64, direct: bool) -> Result<usize, DeviceError> {
        if direct {
            self.check_block_aligned(pos, buf.len())?;
        }
        let end = pos + buf.len() as u64;
        if end > self.geometry.device_size() {
            return Err(DeviceError::OutOfRange(format!(
                "read of {} bytes at {pos} beyond device end",
                buf.len()
            )));
        }

        let state = self.lock_state();
        buf.copy_from_slice(&state.image[pos as usize..end as usize]);
        Ok(buf.len())
    }

    fn write(&self, data: &[u8], pos: u64) -> Result<usize, DeviceError> {
        self.check_block_aligned(pos, data.len())?;

        let zone = (pos / self.geometry.zone_size) as usize;
        if zone >= self.geometry.nr_zones as usize {
            return Err(DeviceError::OutOfRange(format!("write at {pos}")));
        }

        let mut state = self.lock_state();
        if state.zone_wp[zone] != pos {
            return Err(DeviceError::NotSequential {
                wp: state.zone_wp[zone],
                pos,
            });
        }
        let zone_end = (zone as u64 + 1) * self.geometry.zone_size;
        if pos + data.len() as u64 > zone_end {
            return Err(DeviceError::OutOfRange(format!(
                "write of {} bytes at {pos} crosses zone end {zone_end}",
                data.len()
            )));
        }

        state.image[pos as usize..pos as usize + data.len()].copy_from_slice(data);
        state.zone_wp[zone] = pos + data.len() as u64;
        Ok(data.len())
    }

    fn zone_append(&self, zone_start: u64, data: &[u8]) -> Result<usize, DeviceError> {
        self.zone_index(zone_start)?;
        self.check_block_aligned(0, data.len())?;

        self.pending_tx
            .send(PendingAppend {
                zone_start,
                data: data.to_vec(),
            })
            .map_err(|_| DeviceError::Io(io::Error::other("append queue disconnected")))?;

        trace!(zone_start, len = data.len(), "zone append queued");
        Ok(data.len())
    }

    fn append_sync(&self) -> Result<(), DeviceError> {
        let pending: Vec<PendingAppend> = self.pending_rx.try_iter().collect();
        if pending.is_empty() {
            return Ok(());
        }

        let order = self.scheduler.order(pending.len());
        debug!(appends = pending.len(), "draining zone append queue");

        let mut state = self.lock_state();
        for index in order {
            let append = pending.get(index).ok_or_else(|| {
                DeviceError::InvalidArgument(format!(
                    "scheduler produced out-of-range completion index {index}"
                ))
            })?;
            self.complete_append(&mut state, append)?;
        }
        state.image.flush()?;
        Ok(())
    }

    fn invalidate_cache(&self, _pos: u64, _size: u64) -> Result<(), DeviceError> {
        Ok(())
    }
}
