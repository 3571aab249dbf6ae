#[cfg(test)]
mod tests {
    use crate::file::{ZonedRandomAccessFile, ZonedSequentialFile, ZonedWritableFile};
    use crate::zonefile::FileError;
    use crate::zonefile::tests::helpers::{BLOCK, Fixture};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_wal_writer(fx: &Fixture, id: u64, name: &str) -> (Arc<crate::zonefile::ZoneFile>, ZonedWritableFile) {
        let file = Arc::new(fx.new_wal_file(id, name));
        file.acquire_wr_lock();
        let writer = ZonedWritableFile::new(file.clone(), true);
        (file, writer)
    }

    #[test]
    fn buffered_writes_coalesce_until_flush() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);
        let (file, writer) = open_wal_writer(&fx, 1, "000001.log");

        writer.append(b"hello ").unwrap();
        writer.append(b"world").unwrap();
        assert_eq!(file.file_size(), 0);

        writer.sync().unwrap();
        assert_eq!(file.file_size(), 11);
        assert_eq!(file.extents().len(), 1);

        writer.close().unwrap();
    }

    #[test]
    fn buffer_overflow_triggers_intermediate_flush() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);
        let (file, writer) = open_wal_writer(&fx, 1, "000001.log");

        // Sparse payload capacity is sparse_buffer_size - header; writing
        // more than that forces a flush mid-append.
        let capacity = fx.config.sparse_buffer_size as usize - 16;
        writer.append(&vec![0xAAu8; capacity + 100]).unwrap();

        assert_eq!(file.file_size(), capacity as u64);
        writer.sync().unwrap();
        assert_eq!(file.file_size(), capacity as u64 + 100);
        writer.close().unwrap();
    }

    #[test]
    fn positioned_append_must_match_write_pointer() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);

        let file = Arc::new(fx.new_file(1));
        file.add_link("000001.sst");
        file.acquire_wr_lock();
        let writer = ZonedWritableFile::new(file, false);

        let block = vec![0x21u8; BLOCK as usize];
        writer.positioned_append(&block, 0).unwrap();
        writer.positioned_append(&block, BLOCK).unwrap();

        let err = writer.positioned_append(&block, 0).unwrap_err();
        assert!(matches!(err, FileError::Io(ref m) if m.contains("write pointer")));
        writer.close().unwrap();
    }

    #[test]
    fn range_sync_flushes_only_past_write_pointer() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);
        let (file, writer) = open_wal_writer(&fx, 1, "000001.log");

        writer.append(b"0123456789").unwrap();

        // Entirely behind the (flushed) write pointer: no-op.
        writer.range_sync(0, 0).unwrap();
        assert_eq!(file.file_size(), 0);

        // Reaching past it: flushes.
        writer.range_sync(0, 10).unwrap();
        assert_eq!(file.file_size(), 10);
        writer.close().unwrap();
    }

    #[test]
    fn close_releases_writer_gate_and_zone() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);
        let (file, writer) = open_wal_writer(&fx, 1, "000001.log");

        writer.append(b"payload").unwrap();
        writer.close().unwrap();

        assert!(!file.is_open_for_wr());
        assert!(!file.has_active_extent());
        let zone = fx.allocator.zone(file.extents()[0].zone);
        assert!(!zone.is_busy());

        // Closing twice is harmless.
        writer.close().unwrap();
    }

    #[test]
    fn truncate_adjusts_logical_size() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);
        let (file, writer) = open_wal_writer(&fx, 1, "000001.log");

        writer.append(b"0123456789").unwrap();
        writer.sync().unwrap();
        writer.truncate(4).unwrap();
        assert_eq!(file.file_size(), 4);
        writer.close().unwrap();
    }

    #[test]
    fn sequential_read_follows_appends() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);
        let (file, writer) = open_wal_writer(&fx, 1, "000001.log");

        writer.append(b"the quick brown fox").unwrap();
        writer.sync().unwrap();
        writer.close().unwrap();

        let mut reader = ZonedSequentialFile::new(file.clone(), false);
        let mut scratch = vec![0u8; 9];
        let read = reader.read(9, &mut scratch).unwrap();
        assert_eq!(&scratch[..read], b"the quick");

        let read = reader.read(9, &mut scratch).unwrap();
        assert_eq!(&scratch[..read], b" brown fo");
    }

    #[test]
    fn sequential_skip_past_eof_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);
        let (file, writer) = open_wal_writer(&fx, 1, "000001.log");

        writer.append(b"abcdef").unwrap();
        writer.sync().unwrap();
        writer.close().unwrap();

        let mut reader = ZonedSequentialFile::new(file, false);
        reader.skip(3).unwrap();
        let err = reader.skip(3).unwrap_err();
        assert!(matches!(err, FileError::InvalidArgument(_)));
    }

    #[test]
    fn random_access_read_at_offsets() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);
        let (file, writer) = open_wal_writer(&fx, 1, "000001.log");

        writer.append(b"randomly addressable payload").unwrap();
        writer.sync().unwrap();
        writer.close().unwrap();

        let reader = ZonedRandomAccessFile::new(file, false);
        let mut scratch = vec![0u8; 11];
        let read = reader.read(9, 11, &mut scratch).unwrap();
        assert_eq!(&scratch[..read], b"addressable");
    }

    #[test]
    fn dense_direct_writer_pushes_extents_on_sync() {
        let tmp = TempDir::new().unwrap();
        let fx = Fixture::new(&tmp);

        let file = Arc::new(fx.new_file(2));
        file.add_link("000002.sst");
        file.acquire_wr_lock();
        let writer = ZonedWritableFile::new(file.clone(), false);

        writer.append(&vec![0x5Au8; 2 * BLOCK as usize]).unwrap();
        assert!(file.extents().is_empty());

        writer.sync().unwrap();
        assert_eq!(file.extents().len(), 1);
        assert_eq!(file.file_size(), 2 * BLOCK);
        writer.close().unwrap();

        let reader = ZonedRandomAccessFile::new(file, true);
        let mut scratch = vec![0u8; BLOCK as usize];
        reader.read(0, BLOCK as usize, &mut scratch).unwrap();
        assert!(scratch.iter().all(|b| *b == 0x5A));
    }
}
