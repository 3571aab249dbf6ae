#[cfg(test)]
mod tests {
    use crate::encoding::{put_fixed32, put_fixed64};
    use crate::zonefile::tests::helpers::{BLOCK, Fixture, one_block_payload, sparse_buf};
    use crate::zonefile::{FileError, NO_EXTENT, SPARSE_HEADER_SIZE};
    use tempfile::TempDir;

    #[test]
    fn clean_close_needs_no_recovery() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);
        let file = fx.new_file(1);

        assert_eq!(file.extent_start(), NO_EXTENT);
        file.recover().unwrap();
        assert!(file.extents().is_empty());
    }

    #[test]
    fn dense_tail_is_recovered_from_the_write_pointer() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);

        // Write 3 blocks directly, then "crash" before pushing the extent:
        // only the metadata with the active extent start survives.
        let writer = fx.new_file(1);
        writer.add_link("000001.sst");
        writer.append(&vec![0x99u8; 3 * BLOCK as usize]).unwrap();

        let mut record = Vec::new();
        writer.encode_snapshot_to(&mut record).unwrap();
        drop(writer);

        let reopened = fx.new_file(0);
        reopened.decode_from(&mut record.as_slice()).unwrap();
        assert!(reopened.has_active_extent());
        assert!(reopened.extents().is_empty());

        reopened.recover().unwrap();
        let extents = reopened.extents();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].length, 3 * BLOCK);
        assert_eq!(reopened.file_size(), 3 * BLOCK);
        assert!(!reopened.has_active_extent());
    }

    #[test]
    fn sparse_tail_recovery_walks_record_headers() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);

        let writer = fx.new_sparse_file(1, "000001.sst");
        // First extent is covered by metadata; two more follow before the
        // crash.
        let payload = vec![0x51u8; 700];
        let mut buf = sparse_buf(SPARSE_HEADER_SIZE, &payload);
        writer.sparse_append(&mut buf, payload.len()).unwrap();

        let mut record = Vec::new();
        writer.encode_snapshot_to(&mut record).unwrap();

        for fill in [0x52u8, 0x53] {
            let payload = vec![fill; 700];
            let mut buf = sparse_buf(SPARSE_HEADER_SIZE, &payload);
            writer.sparse_append(&mut buf, payload.len()).unwrap();
        }
        drop(writer);

        let reopened = fx.new_file(0);
        reopened.decode_from(&mut record.as_slice()).unwrap();
        assert_eq!(reopened.extents().len(), 1);

        reopened.recover().unwrap();
        let extents = reopened.extents();
        assert_eq!(extents.len(), 3);
        assert!(extents.iter().all(|e| e.length == 700));
        assert_eq!(reopened.file_size(), 3 * 700);
    }

    #[test]
    fn wal_sequence_resumes_past_recovered_records() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);

        let writer = fx.new_wal_file(1, "000001.log");
        let payload = one_block_payload(b'w');

        let mut buf = sparse_buf(16, &payload);
        writer.sparse_append(&mut buf, payload.len()).unwrap();
        writer.wal_sync().unwrap();

        // Metadata snapshot covers only the first record (seq 0).
        let mut record = Vec::new();
        writer.encode_snapshot_to(&mut record).unwrap();

        for _ in 0..2 {
            let mut buf = sparse_buf(16, &payload);
            writer.sparse_append(&mut buf, payload.len()).unwrap();
        }
        writer.wal_sync().unwrap();
        assert_eq!(writer.wal_seq(), 3);
        drop(writer);

        let reopened = fx.new_file(0);
        reopened.decode_from(&mut record.as_slice()).unwrap();
        assert_eq!(reopened.wal_seq(), 1);

        reopened.recover().unwrap();
        assert_eq!(reopened.extents().len(), 3);
        // The next assigned sequence must not collide with media records.
        assert_eq!(reopened.wal_seq(), 3);
        assert_eq!(reopened.file_size(), 3 * payload.len() as u64);
    }

    #[test]
    fn empty_tail_clears_the_active_extent() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);

        let writer = fx.new_sparse_file(1, "000001.sst");
        let payload = vec![0x11u8; 64];
        let mut buf = sparse_buf(SPARSE_HEADER_SIZE, &payload);
        writer.sparse_append(&mut buf, payload.len()).unwrap();

        // Metadata written after the append: extent start equals the zone
        // write pointer, nothing to recover.
        let mut record = Vec::new();
        writer.encode_snapshot_to(&mut record).unwrap();
        drop(writer);

        let reopened = fx.new_file(0);
        reopened.decode_from(&mut record.as_slice()).unwrap();
        reopened.recover().unwrap();

        assert_eq!(reopened.extents().len(), 1);
        assert!(!reopened.has_active_extent());
    }

    #[test]
    fn write_pointer_behind_extent_start_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);

        // Forge metadata whose active extent start lies past the write
        // pointer of an untouched zone.
        let mut record = Vec::new();
        put_fixed32(&mut record, 1);
        put_fixed64(&mut record, 9);
        put_fixed32(&mut record, 7);
        put_fixed64(&mut record, 5 * BLOCK);

        let file = fx.new_file(0);
        file.decode_from(&mut record.as_slice()).unwrap();
        let err = file.recover().unwrap_err();
        assert!(matches!(err, FileError::Io(_)));
    }

    #[test]
    fn migration_relocates_an_extent() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);

        // A dense file with one block-aligned extent.
        let file = fx.new_file(1);
        file.add_link("000001.sst");
        file.append(&vec![0xC3u8; 2 * BLOCK as usize]).unwrap();
        file.push_extent();

        let old = file.extents()[0];

        // Copy the extent into a fresh zone, garbage-collection style.
        let target = fx.allocator.zone(6);
        assert!(target.try_acquire());
        let target_start = target.write_pointer();
        file.migrate_data(old.start, old.length, target.id()).unwrap();

        file.acquire_wr_lock();
        file.replace_extent_list(vec![crate::zonefile::ZoneExtent {
            start: target_start,
            length: old.length,
            zone: target.id(),
        }])
        .unwrap();
        file.release_wr_lock();
        target.release();

        // Reads now come from the relocated copy.
        let mut out = vec![0u8; 2 * BLOCK as usize];
        let read = file
            .positioned_read(0, out.len(), &mut out, false)
            .unwrap();
        assert_eq!(read, 2 * BLOCK as usize);
        assert!(out.iter().all(|b| *b == 0xC3));
        assert_eq!(file.extents()[0].zone, target.id());
    }

    #[test]
    fn replace_extent_list_requires_writer_gate() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);
        let file = fx.new_file(1);

        let err = file.replace_extent_list(Vec::new()).unwrap_err();
        assert!(matches!(err, FileError::Io(_)));
    }

    #[test]
    fn zero_length_sparse_header_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);

        // A zone with data on media but an all-zero header block.
        let zone = fx.allocator.zone(4);
        zone.acquire();
        zone.append(&vec![0u8; BLOCK as usize]).unwrap();
        zone.release();

        let file = fx.new_sparse_file(1, "000001.sst");
        let err = file
            .recover_sparse_extents(zone.start(), zone.start() + BLOCK, zone.id())
            .unwrap_err();
        assert!(matches!(err, FileError::Corruption(_)));
    }
}
