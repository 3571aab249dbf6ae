//! Zones and the zone allocator.
//!
//! A [`Zone`] is one slot of the allocator-owned arena mirroring a device
//! zone: its write pointer, remaining capacity, the used-capacity counter
//! maintained by the extents pointing into it, a busy flag, and its class
//! (regular IO or WAL). Extents refer to zones by stable [`ZoneId`] index —
//! never by reference — so the arena can be rebuilt at mount without
//! dangling pointers.
//!
//! The [`ZoneAllocator`] owns the arena and arbitrates ownership:
//!
//! - **IO pool** — zones handed to regular files via
//!   [`ZoneAllocator::allocate_io_zone`], honoring write-lifetime hints.
//! - **WAL pool** — zones at the front of the device handed out via
//!   [`ZoneAllocator::allocate_wal_zone`] so that consecutive allocations
//!   stay LBA-adjacent and a single [`OnceLog`] can span them.
//!
//! # Ownership discipline
//!
//! A zone is owned by at most one writer at a time, tracked by an atomic
//! busy flag. Ownership is taken with [`Zone::try_acquire`] (the targeted
//! WAL-adjacency path spins on it) and returned with [`Zone::release`].
//! The used-capacity counter is independent of ownership: it is shared by
//! every file holding extents in the zone, and reaching zero makes the zone
//! eligible for reclaim.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::device::{DeviceError, ZonedBackend};
use crate::oncelog::{LogError, OnceLog};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by zone and allocator operations.
#[derive(Debug, Error)]
pub enum ZoneError {
    /// Underlying device failure.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Underlying once-log failure.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// The requested write does not fit the zone's remaining capacity.
    #[error("zone full: requested {requested} bytes, {remaining} remaining")]
    Full {
        /// Bytes the caller attempted to write.
        requested: u64,
        /// Remaining capacity of the zone.
        remaining: u64,
    },

    /// No zone could be allocated.
    #[error("no space: {0}")]
    NoSpace(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Classification types
// ------------------------------------------------------------------------------------------------

/// Stable index of a zone in the allocator arena.
pub type ZoneId = usize;

/// Pool a zone belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneClass {
    /// Regular data zone.
    Io,
    /// Zone reserved for WAL once-logs.
    Wal,
}

/// Expected lifetime of the data written to a file, propagated to the
/// allocator for placement decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum WriteLifeTimeHint {
    /// No hint set.
    NotSet = 0,
    /// Explicitly no expected lifetime.
    None = 1,
    /// Short-lived data (e.g. L0 flushes).
    Short = 2,
    /// Medium-lived data.
    Medium = 3,
    /// Long-lived data (e.g. bottom-level compaction output).
    Long = 4,
    /// Effectively immortal data.
    Extreme = 5,
}

impl WriteLifeTimeHint {
    /// Decode a hint from its wire value, falling back to `NotSet`.
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::None,
            2 => Self::Short,
            3 => Self::Medium,
            4 => Self::Long,
            5 => Self::Extreme,
            _ => Self::NotSet,
        }
    }
}

/// The kind of traffic a file carries. Only used on the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    /// Not classified.
    Unknown,
    /// Write-ahead log.
    Wal,
    /// Memtable flush output.
    Flush,
    /// Compaction output.
    Compaction,
}

// ------------------------------------------------------------------------------------------------
// Zone
// ------------------------------------------------------------------------------------------------

/// One zone of the device, as tracked by the allocator arena.
///
/// All counters are atomic: the write pointer and capacity are only touched
/// by the owning writer, but the used-capacity counter is shared by every
/// file with extents in the zone.
pub struct Zone {
    id: ZoneId,
    start: u64,
    size: u64,
    class: ZoneClass,
    wp: AtomicU64,
    capacity: AtomicU64,
    used_capacity: AtomicU64,
    busy: AtomicBool,
    lifetime: AtomicU32,
    backend: Arc<dyn ZonedBackend>,
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("class", &self.class)
            .field("wp", &self.wp.load(Ordering::Acquire))
            .field("capacity", &self.capacity.load(Ordering::Acquire))
            .field("used_capacity", &self.used_capacity.load(Ordering::Acquire))
            .field("busy", &self.busy.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Zone {
    /// Stable arena index.
    pub fn id(&self) -> ZoneId {
        self.id
    }

    /// First byte LBA of the zone.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Zone size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Pool the zone belongs to.
    pub fn class(&self) -> ZoneClass {
        self.class
    }

    /// Current write pointer (absolute bytes).
    pub fn write_pointer(&self) -> u64 {
        self.wp.load(Ordering::Acquire)
    }

    /// Remaining writable capacity in bytes.
    pub fn capacity_remaining(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Bytes referenced by live extents in this zone.
    pub fn used_capacity(&self) -> u64 {
        self.used_capacity.load(Ordering::Acquire)
    }

    /// Add `bytes` to the used-capacity counter.
    pub fn add_used(&self, bytes: u64) {
        self.used_capacity.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Subtract `bytes` from the used-capacity counter.
    pub fn sub_used(&self, bytes: u64) {
        let previous = self.used_capacity.fetch_sub(bytes, Ordering::AcqRel);
        if previous < bytes {
            warn!(
                zone = self.id,
                previous, bytes, "used-capacity counter underflow"
            );
        }
    }

    /// Whether the zone has no remaining capacity.
    pub fn is_full(&self) -> bool {
        self.capacity_remaining() == 0
    }

    /// Whether nothing has been written to the zone.
    pub fn is_empty(&self) -> bool {
        self.write_pointer() == self.start
    }

    /// Whether any live extent still references the zone.
    pub fn is_used(&self) -> bool {
        self.used_capacity() > 0
    }

    /// Whether a writer currently owns the zone.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Try to take writer ownership of the zone.
    pub fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Take writer ownership, spinning until the current owner releases.
    pub fn acquire(&self) {
        while !self.try_acquire() {
            std::hint::spin_loop();
        }
    }

    /// Return writer ownership.
    pub fn release(&self) -> bool {
        self.busy
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Write lifetime of the data currently placed in this zone.
    pub fn lifetime(&self) -> WriteLifeTimeHint {
        WriteLifeTimeHint::from_u32(self.lifetime.load(Ordering::Acquire))
    }

    pub(crate) fn set_lifetime(&self, hint: WriteLifeTimeHint) {
        self.lifetime.store(hint as u32, Ordering::Release);
    }

    /// Sequential write at the zone write pointer. `data` must be a whole
    /// number of blocks; the caller owns the zone.
    pub fn append(&self, data: &[u8]) -> Result<(), ZoneError> {
        let remaining = self.capacity_remaining();
        if data.len() as u64 > remaining {
            return Err(ZoneError::Full {
                requested: data.len() as u64,
                remaining,
            });
        }

        let wp = self.write_pointer();
        self.backend.write(data, wp)?;
        self.wp.fetch_add(data.len() as u64, Ordering::AcqRel);
        self.capacity.fetch_sub(data.len() as u64, Ordering::AcqRel);

        trace!(zone = self.id, wp, len = data.len(), "zone append");
        Ok(())
    }

    /// Device-chosen-offset append routed through the file's once-log.
    ///
    /// The write pointer is advanced at submit time as a space reservation;
    /// the data lands when the log is synced.
    pub fn zone_append(&self, data: &[u8], log: &OnceLog) -> Result<(), ZoneError> {
        let remaining = self.capacity_remaining();
        if data.len() as u64 > remaining {
            return Err(ZoneError::Full {
                requested: data.len() as u64,
                remaining,
            });
        }

        log.async_append(self.start, data)?;
        self.wp.fetch_add(data.len() as u64, Ordering::AcqRel);
        self.capacity.fetch_sub(data.len() as u64, Ordering::AcqRel);

        trace!(zone = self.id, len = data.len(), "zone append submitted");
        Ok(())
    }

    /// Reset the zone on the device and rewind the arena state.
    pub fn reset(&self) -> Result<(), ZoneError> {
        let report = self.backend.reset(self.start)?;
        self.wp.store(report.start, Ordering::Release);
        let capacity = if report.offline { 0 } else { report.capacity };
        self.capacity.store(capacity, Ordering::Release);
        debug!(zone = self.id, offline = report.offline, "zone reset");
        Ok(())
    }

    /// Transition the zone to full on the device.
    pub fn finish(&self) -> Result<(), ZoneError> {
        self.backend.finish(self.start)?;
        self.wp.store(self.start + self.size, Ordering::Release);
        self.capacity.store(0, Ordering::Release);
        Ok(())
    }

    /// Close the zone on the device, releasing its open resources.
    ///
    /// Empty and full zones are not explicitly open, so there is nothing to
    /// close for them.
    pub fn close(&self) -> Result<(), ZoneError> {
        if !self.is_empty() && !self.is_full() {
            self.backend.close(self.start)?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Zone allocator
// ------------------------------------------------------------------------------------------------

/// Owner of the zone arena and arbiter of zone ownership.
pub struct ZoneAllocator {
    backend: Arc<dyn ZonedBackend>,
    zones: Vec<Zone>,
    wal_zone_count: usize,
    logs: Mutex<Vec<Arc<OnceLog>>>,
    next_log_id: AtomicU64,
    open_io_zones: AtomicU32,
    active_io_zones: AtomicU32,
}

impl std::fmt::Debug for ZoneAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneAllocator")
            .field("zones", &self.zones.len())
            .field("wal_zone_count", &self.wal_zone_count)
            .finish_non_exhaustive()
    }
}

impl ZoneAllocator {
    /// Build the arena from a device report, reserving the first
    /// `wal_zones` zones for WAL once-logs.
    pub fn open(backend: Arc<dyn ZonedBackend>, wal_zones: u32) -> Result<Self, ZoneError> {
        let geometry = backend.geometry();
        if wal_zones >= geometry.nr_zones {
            return Err(ZoneError::NoSpace(format!(
                "{wal_zones} WAL zones leave no IO zones on a {}-zone device",
                geometry.nr_zones
            )));
        }

        let reports = backend.list_zones()?;
        let wal_zone_count = wal_zones as usize;

        let zones = reports
            .iter()
            .enumerate()
            .map(|(id, report)| {
                let written = report.wp - report.start;
                Zone {
                    id,
                    start: report.start,
                    size: geometry.zone_size,
                    class: if id < wal_zone_count {
                        ZoneClass::Wal
                    } else {
                        ZoneClass::Io
                    },
                    wp: AtomicU64::new(report.wp),
                    capacity: AtomicU64::new(if report.offline {
                        0
                    } else {
                        report.capacity.saturating_sub(written)
                    }),
                    used_capacity: AtomicU64::new(0),
                    busy: AtomicBool::new(false),
                    lifetime: AtomicU32::new(WriteLifeTimeHint::NotSet as u32),
                    backend: backend.clone(),
                }
            })
            .collect();

        info!(
            zones = reports.len(),
            wal_zones, "zone allocator initialized"
        );

        Ok(Self {
            backend,
            zones,
            wal_zone_count,
            logs: Mutex::new(Vec::new()),
            next_log_id: AtomicU64::new(1),
            open_io_zones: AtomicU32::new(geometry.max_open_zones),
            active_io_zones: AtomicU32::new(geometry.max_active_zones),
        })
    }

    /// Access a zone by its stable index.
    pub fn zone(&self, id: ZoneId) -> &Zone {
        &self.zones[id]
    }

    /// Number of zones in the arena.
    pub fn nr_zones(&self) -> usize {
        self.zones.len()
    }

    /// The zone containing the byte LBA, if any.
    pub fn zone_for_lba(&self, lba: u64) -> Option<&Zone> {
        let zone_size = self.backend.geometry().zone_size;
        let index = (lba / zone_size) as usize;
        self.zones.get(index)
    }

    /// The once-log whose zone run contains `lba`, if one is open.
    pub fn wal_for_lba(&self, lba: u64) -> Option<Arc<OnceLog>> {
        self.lock_logs()
            .iter()
            .find(|log| log.contains_lba(lba))
            .cloned()
    }

    fn lock_logs(&self) -> std::sync::MutexGuard<'_, Vec<Arc<OnceLog>>> {
        match self.logs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn take_open_io_token(&self) -> Result<(), ZoneError> {
        let mut current = self.open_io_zones.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(ZoneError::NoSpace("open-zone limit reached".to_string()));
            }
            match self.open_io_zones.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Return an open-zone token after closing a zone.
    pub fn put_open_io_token(&self) {
        self.open_io_zones.fetch_add(1, Ordering::AcqRel);
    }

    fn take_active_io_token(&self) -> Result<(), ZoneError> {
        let mut current = self.active_io_zones.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(ZoneError::NoSpace("active-zone limit reached".to_string()));
            }
            match self.active_io_zones.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Return an active-zone token after a zone filled up.
    pub fn put_active_io_token(&self) {
        self.active_io_zones.fetch_add(1, Ordering::AcqRel);
    }

    /// Allocate an IO zone for a file with the given lifetime hint.
    ///
    /// Placement: first a non-empty, non-full zone already carrying the
    /// same lifetime (co-location), then an empty zone, then any non-full
    /// zone. The returned zone is acquired by the caller.
    pub fn allocate_io_zone(
        &self,
        lifetime: WriteLifeTimeHint,
        _io_type: IoType,
    ) -> Result<ZoneId, ZoneError> {
        let io_zones = &self.zones[self.wal_zone_count..];

        for zone in io_zones {
            if zone.is_full() || zone.is_empty() || zone.lifetime() != lifetime {
                continue;
            }
            if zone.try_acquire() {
                self.take_open_io_token().inspect_err(|_| {
                    zone.release();
                })?;
                trace!(zone = zone.id, ?lifetime, "co-located IO zone");
                return Ok(zone.id);
            }
        }

        for zone in io_zones {
            if !zone.is_empty() || zone.is_full() {
                continue;
            }
            if zone.try_acquire() {
                if let Err(e) = self.take_open_io_token() {
                    zone.release();
                    return Err(e);
                }
                if let Err(e) = self.take_active_io_token() {
                    self.put_open_io_token();
                    zone.release();
                    return Err(e);
                }
                zone.set_lifetime(lifetime);
                debug!(zone = zone.id, ?lifetime, "fresh IO zone allocated");
                return Ok(zone.id);
            }
        }

        for zone in io_zones {
            if zone.is_full() {
                continue;
            }
            if zone.try_acquire() {
                self.take_open_io_token().inspect_err(|_| {
                    zone.release();
                })?;
                return Ok(zone.id);
            }
        }

        Err(ZoneError::NoSpace("no allocatable IO zone".to_string()))
    }

    /// Allocate the next WAL zone for a file, keeping the zone run
    /// LBA-contiguous so one once-log can span it.
    ///
    /// With an existing `log`, the zone right after the log's current end
    /// is claimed and the log extended over it. Without one, the first
    /// empty WAL zone starts a fresh log. The returned zone is acquired.
    pub fn allocate_wal_zone(
        &self,
        log: Option<Arc<OnceLog>>,
    ) -> Result<(ZoneId, Arc<OnceLog>), ZoneError> {
        if let Some(log) = log {
            let end = log.end_lba();
            let zone = self
                .zone_for_lba(end)
                .filter(|z| z.class() == ZoneClass::Wal)
                .ok_or_else(|| {
                    ZoneError::NoSpace("WAL pool exhausted: no zone after log end".to_string())
                })?;
            if !zone.is_empty() {
                return Err(ZoneError::NoSpace(format!(
                    "WAL zone {} after log end is not empty",
                    zone.id
                )));
            }
            zone.acquire();
            log.extend(zone.start + zone.size);
            debug!(zone = zone.id, log = log.id(), "WAL log extended onto zone");
            return Ok((zone.id, log));
        }

        for zone in &self.zones[..self.wal_zone_count] {
            if !zone.is_empty() {
                continue;
            }
            if zone.try_acquire() {
                let id = self.next_log_id.fetch_add(1, Ordering::AcqRel);
                let log = Arc::new(OnceLog::new(
                    id,
                    zone.start,
                    zone.start + zone.size,
                    self.backend.clone(),
                ));
                let mut logs = self.lock_logs();
                // Drop reset (empty) logs that still claim this zone, so
                // LBA lookups resolve to the live handle.
                logs.retain(|l| l.write_head() > 0 || !l.contains_lba(zone.start));
                logs.push(log.clone());
                drop(logs);
                info!(zone = zone.id, log = id, "WAL log opened");
                return Ok((zone.id, log));
            }
        }

        Err(ZoneError::NoSpace("no empty WAL zone".to_string()))
    }

    /// Open a once-log over already-populated zones during recovery.
    ///
    /// The log spans the run of consecutive non-empty WAL zones starting at
    /// `zone`; its head is derived from the device write pointers.
    pub fn open_wal_zone(&self, zone: ZoneId) -> Result<Arc<OnceLog>, ZoneError> {
        let first = self
            .zones
            .get(zone)
            .filter(|z| z.class() == ZoneClass::Wal)
            .ok_or_else(|| ZoneError::Internal(format!("zone {zone} is not a WAL zone")))?;

        if let Some(log) = self.wal_for_lba(first.start) {
            return Ok(log);
        }

        // The log was written front to back, so the populated run is a full
        // prefix: every zone before the last one written is full.
        let mut last = zone;
        while last + 1 < self.wal_zone_count
            && self.zones[last].is_full()
            && !self.zones[last + 1].is_empty()
        {
            last += 1;
        }

        let base = first.start;
        let end = self.zones[last].start + self.zones[last].size;
        let head_bytes = self.zones[last].write_pointer() - base;
        let shift = crate::oncelog::block_shift_for(self.backend.geometry().block_size);

        let id = self.next_log_id.fetch_add(1, Ordering::AcqRel);
        let log = Arc::new(OnceLog::with_head(
            id,
            base,
            end,
            head_bytes >> shift,
            self.backend.clone(),
        ));
        self.lock_logs().push(log.clone());

        info!(
            zone,
            log = id,
            head_blocks = head_bytes >> shift,
            "WAL log recovered"
        );
        Ok(log)
    }

    /// Refresh arena state for WAL zones no longer covered by any live log
    /// extent, making reset zones allocatable again.
    pub fn release_unused_wal_zones(&self) -> Result<(), ZoneError> {
        let reports = self.backend.list_zones()?;
        let logs = self.lock_logs();

        for zone in &self.zones[..self.wal_zone_count] {
            if zone.is_busy() {
                continue;
            }
            // Log spans shrink on reset, so span membership is the live set.
            let covered = logs.iter().any(|log| log.contains_lba(zone.start));
            if covered {
                continue;
            }

            let report = reports
                .get(zone.id)
                .ok_or_else(|| ZoneError::Internal("zone report mismatch".to_string()))?;
            let written = report.wp - report.start;
            zone.wp.store(report.wp, Ordering::Release);
            zone.capacity
                .store(report.capacity.saturating_sub(written), Ordering::Release);
            trace!(zone = zone.id, wp = report.wp, "WAL zone state refreshed");
        }
        Ok(())
    }
}
