#[cfg(test)]
mod tests {
    use crate::device::{DeviceGeometry, EmulatedBackend};
    use crate::zone::{IoType, WriteLifeTimeHint, ZoneAllocator, ZoneError};
    use std::sync::Arc;
    use tempfile::TempDir;

    const BLOCK: u64 = 4096;
    const ZONE: u64 = 8 * BLOCK;

    fn allocator_with(dir: &TempDir, nr_zones: u32, wal_zones: u32) -> ZoneAllocator {
        let backend = Arc::new(
            EmulatedBackend::create(
                &dir.path().join("zbd.img"),
                DeviceGeometry {
                    block_size: BLOCK as u32,
                    zone_size: ZONE,
                    nr_zones,
                    max_active_zones: nr_zones,
                    max_open_zones: nr_zones,
                },
            )
            .unwrap(),
        );
        ZoneAllocator::open(backend, wal_zones).unwrap()
    }

    #[test]
    fn io_allocation_prefers_empty_zone() {
        let tmp = TempDir::new().unwrap();
        let allocator = allocator_with(&tmp, 6, 2);

        let id = allocator
            .allocate_io_zone(WriteLifeTimeHint::Short, IoType::Flush)
            .unwrap();
        assert!(id >= 2, "IO allocation must not touch the WAL pool");
        assert!(allocator.zone(id).is_busy());
        assert_eq!(allocator.zone(id).lifetime(), WriteLifeTimeHint::Short);
    }

    #[test]
    fn io_allocation_co_locates_matching_lifetime() {
        let tmp = TempDir::new().unwrap();
        let allocator = allocator_with(&tmp, 6, 2);

        let first = allocator
            .allocate_io_zone(WriteLifeTimeHint::Long, IoType::Compaction)
            .unwrap();
        let zone = allocator.zone(first);
        zone.append(&vec![0u8; BLOCK as usize]).unwrap();
        zone.release();

        let second = allocator
            .allocate_io_zone(WriteLifeTimeHint::Long, IoType::Compaction)
            .unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn wal_allocation_starts_a_log_and_stays_adjacent() {
        let tmp = TempDir::new().unwrap();
        let allocator = allocator_with(&tmp, 6, 3);

        let (first, log) = allocator.allocate_wal_zone(None).unwrap();
        assert_eq!(allocator.zone(first).start(), log.base_lba());
        assert_eq!(log.end_lba(), log.base_lba() + ZONE);

        // Fill the zone so the run must grow.
        allocator.zone(first).finish().unwrap();
        allocator.zone(first).release();

        let (second, log) = allocator.allocate_wal_zone(Some(log)).unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(log.end_lba(), allocator.zone(second).start() + ZONE);
    }

    #[test]
    fn wal_pool_exhaustion_is_no_space() {
        let tmp = TempDir::new().unwrap();
        let allocator = allocator_with(&tmp, 4, 1);

        let (zone, log) = allocator.allocate_wal_zone(None).unwrap();
        allocator.zone(zone).finish().unwrap();

        let err = allocator.allocate_wal_zone(Some(log)).unwrap_err();
        assert!(matches!(err, ZoneError::NoSpace(_)));
    }

    #[test]
    fn wal_lookup_by_lba() {
        let tmp = TempDir::new().unwrap();
        let allocator = allocator_with(&tmp, 6, 2);

        assert!(allocator.wal_for_lba(0).is_none());
        let (_zone, log) = allocator.allocate_wal_zone(None).unwrap();
        let found = allocator.wal_for_lba(log.base_lba() + 100).unwrap();
        assert_eq!(found.id(), log.id());
    }

    #[test]
    fn zone_for_lba_resolves_interior_addresses() {
        let tmp = TempDir::new().unwrap();
        let allocator = allocator_with(&tmp, 6, 2);

        let zone = allocator.zone_for_lba(ZONE + 100).unwrap();
        assert_eq!(zone.id(), 1);
        assert!(allocator.zone_for_lba(6 * ZONE).is_none());
    }

    #[test]
    fn recovered_log_head_matches_device_state() {
        let tmp = TempDir::new().unwrap();
        let allocator = allocator_with(&tmp, 6, 3);

        // Populate two WAL zones directly: one full, one half.
        allocator.zone(0).finish().unwrap();
        let zone1 = allocator.zone(1);
        zone1.acquire();
        zone1.append(&vec![0x31u8; 4 * BLOCK as usize]).unwrap();
        zone1.release();

        let log = allocator.open_wal_zone(0).unwrap();
        assert_eq!(log.base_lba(), 0);
        assert_eq!(log.end_lba(), 2 * ZONE);
        assert_eq!(log.write_head(), 8 + 4);
    }

    #[test]
    fn open_wal_zone_returns_existing_log() {
        let tmp = TempDir::new().unwrap();
        let allocator = allocator_with(&tmp, 6, 2);

        let (zone, log) = allocator.allocate_wal_zone(None).unwrap();
        let reopened = allocator.open_wal_zone(zone).unwrap();
        assert_eq!(reopened.id(), log.id());
    }
}
