//! End-to-end scenarios exercising the WAL append/recover protocol, the
//! barrier durability boundary, and crash recovery through a full
//! remount.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use zonewal::config::FsConfig;
use zonewal::device::{AppendScheduler, DeviceGeometry, EmulatedBackend, ZonedBackend};
use zonewal::fs::{FileOptions, ZonedFs};
use zonewal::zonefile::{SPARSE_HEADER_SIZE, SPARSE_WAL_HEADER_SIZE, ZoneFile};

const BLOCK: u64 = 4096;
const WAL_HEADER: u64 = SPARSE_HEADER_SIZE + SPARSE_WAL_HEADER_SIZE;

fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::DEBUG)
        .try_init();
}

fn geometry(zone_blocks: u64, nr_zones: u32) -> DeviceGeometry {
    DeviceGeometry {
        block_size: BLOCK as u32,
        zone_size: zone_blocks * BLOCK,
        nr_zones,
        max_active_zones: nr_zones,
        max_open_zones: nr_zones,
    }
}

fn wal_config() -> FsConfig {
    FsConfig {
        sparse_buffer_size: 16 * BLOCK,
        wal_barrier_size: 16 * BLOCK,
        wal_zones: 6,
        dense_buffer_size: 16 * BLOCK,
    }
}

/// Append one record through the sparse WAL path.
fn append_record(file: &ZoneFile, payload: &[u8]) {
    let mut buf = vec![0u8; WAL_HEADER as usize + payload.len() + BLOCK as usize];
    buf[WAL_HEADER as usize..WAL_HEADER as usize + payload.len()].copy_from_slice(payload);
    file.sparse_append(&mut buf, payload.len()).unwrap();
}

fn read_range(fs: &ZonedFs, path: &str, offset: u64, n: usize) -> Vec<u8> {
    let reader = fs
        .new_random_access_file(path, FileOptions::default())
        .unwrap();
    let mut scratch = vec![0u8; n];
    let read = reader.read(offset, n, &mut scratch).unwrap();
    scratch.truncate(read);
    scratch
}

// ------------------------------------------------------------------------------------------------
// Scenario: unordered completion, sorted read
// ------------------------------------------------------------------------------------------------

/// Lands the first two queued appends in swapped order.
struct SwapFirstTwo;

impl AppendScheduler for SwapFirstTwo {
    fn order(&self, pending: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..pending).collect();
        if pending >= 2 {
            order.swap(0, 1);
        }
        order
    }
}

#[test]
fn unordered_completion_sorted_read() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let backend = Arc::new(
        EmulatedBackend::create_with_scheduler(
            &tmp.path().join("zbd.img"),
            geometry(64, 12),
            Box::new(SwapFirstTwo),
        )
        .unwrap(),
    );
    let fs = ZonedFs::mount(backend, wal_config(), &tmp.path().join("meta")).unwrap();

    let writer = fs.new_writable_file("w.log", FileOptions::wal()).unwrap();
    let file = fs.zone_file("w.log").unwrap();

    // Three 16-byte records, sequences 0, 1, 2.
    let records: [&[u8]; 3] = [b"AAAAAAAAAAAAAAAA", b"BBBBBBBBBBBBBBBB", b"CCCCCCCCCCCCCCCC"];
    for record in records {
        append_record(&file, record);
    }
    file.wal_sync().unwrap();

    // The device completed the appends as B, A, C.
    let zone_start = file.extents()[0].start - WAL_HEADER;
    let mut media = vec![0u8; BLOCK as usize];
    fs.backend().read(&mut media, zone_start, true).unwrap();
    assert_eq!(&media[WAL_HEADER as usize..WAL_HEADER as usize + 16], records[1]);

    // The read side restores append order: A || B || C.
    let expected: Vec<u8> = records.concat();
    assert_eq!(read_range(&fs, "w.log", 0, 48), expected);

    writer.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Scenario: barrier partition
// ------------------------------------------------------------------------------------------------

#[test]
fn barrier_partitions_crash_damage() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("zbd.img");
    let meta = tmp.path().join("meta");
    let config = wal_config();
    let barrier = config.wal_barrier_size;

    // Four records fill one barrier exactly; a fifth is submitted but
    // never reaches storage.
    let record_media = barrier / 4;
    let payload_len = (record_media - WAL_HEADER) as usize;

    let backend = Arc::new(EmulatedBackend::create(&image, geometry(64, 12)).unwrap());
    {
        let fs = ZonedFs::mount(backend.clone(), config, &meta).unwrap();
        let writer = fs.new_writable_file("b.log", FileOptions::wal()).unwrap();
        let file = fs.zone_file("b.log").unwrap();

        for fill in [1u8, 2, 3, 4] {
            append_record(&file, &vec![fill; payload_len]);
        }
        // The fifth append forces the barrier sync (records 1-4 become
        // durable), then queues.
        append_record(&file, &vec![5u8; payload_len]);
        assert_eq!(file.wal_syncs(), 1);

        // Crash: the queued fifth record is lost, nothing is closed.
        backend.discard_pending();
        std::mem::forget(writer);
    }

    let reopened = Arc::new(EmulatedBackend::open(&image, geometry(64, 12)).unwrap());
    let fs = ZonedFs::mount(reopened, config, &meta).unwrap();
    let file = fs.zone_file("b.log").unwrap();

    // Only the four barrier-covered records survive.
    assert_eq!(file.extents().len(), 4);
    assert_eq!(file.file_size(), 4 * payload_len as u64);
    assert_eq!(file.wal_seq(), 4);

    let contents = read_range(&fs, "b.log", 0, 4 * payload_len);
    for (i, fill) in [1u8, 2, 3, 4].into_iter().enumerate() {
        assert!(
            contents[i * payload_len..(i + 1) * payload_len]
                .iter()
                .all(|b| *b == fill),
            "record {i} corrupted"
        );
    }
}

// ------------------------------------------------------------------------------------------------
// Scenario: chunked read
// ------------------------------------------------------------------------------------------------

#[test]
fn chunked_read_pages_in_barrier_windows() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let backend = Arc::new(
        EmulatedBackend::create(&tmp.path().join("zbd.img"), geometry(64, 12)).unwrap(),
    );
    let fs = ZonedFs::mount(backend, wal_config(), &tmp.path().join("meta")).unwrap();

    let writer = fs.new_writable_file("c.log", FileOptions::wal()).unwrap();
    let file = fs.zone_file("c.log").unwrap();

    // Three barriers of block-filling records.
    let payload_len = (BLOCK - WAL_HEADER) as usize;
    let per_barrier = (wal_config().wal_barrier_size / BLOCK) as usize;
    let total = 3 * per_barrier;

    let records: Vec<Vec<u8>> = (0..total)
        .map(|i| vec![(i % 251) as u8; payload_len])
        .collect();
    for record in &records {
        append_record(&file, record);
    }
    file.wal_sync().unwrap();

    let expected: Vec<u8> = records.concat();

    // Loading the chunk for offset 0 serves reads inside the first
    // barrier window.
    file.try_recover_wal(0).unwrap();
    assert_eq!(
        read_range(&fs, "c.log", 0, 4 * payload_len),
        expected[..4 * payload_len].to_vec()
    );

    // A read in the middle of the log pages in the later windows.
    let offset = (total / 2) * payload_len + payload_len / 2;
    let want = 3 * payload_len;
    assert_eq!(
        read_range(&fs, "c.log", offset as u64, want),
        expected[offset..offset + want].to_vec()
    );

    // A full scan matches the writes byte for byte.
    assert_eq!(read_range(&fs, "c.log", 0, expected.len()), expected);

    // Random positioned reads, including chunk-boundary stragglers.
    let mut rng = StdRng::seed_from_u64(0x5EED);
    for _ in 0..50 {
        let offset = rng.random_range(0..expected.len());
        let len = rng.random_range(1..=(expected.len() - offset).min(3 * payload_len));
        assert_eq!(
            read_range(&fs, "c.log", offset as u64, len),
            expected[offset..offset + len].to_vec(),
            "random read at {offset}+{len}"
        );
    }

    writer.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Scenario: metadata recovery after dirty shutdown
// ------------------------------------------------------------------------------------------------

#[test]
fn dirty_shutdown_recovers_unsynced_extents() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("zbd.img");
    let meta = tmp.path().join("meta");
    let config = wal_config();

    let payload_len = 700usize;
    let backend = Arc::new(EmulatedBackend::create(&image, geometry(64, 12)).unwrap());
    {
        let fs = ZonedFs::mount(backend.clone(), config, &meta).unwrap();
        let writer = fs
            .new_writable_file("d.sst", FileOptions::default())
            .unwrap();
        let file = fs.zone_file("d.sst").unwrap();

        // Five extents covered by persisted metadata...
        for i in 0..5u8 {
            let payload = vec![0x10 + i; payload_len];
            let mut buf = vec![0u8; 8 + payload_len + BLOCK as usize];
            buf[8..8 + payload_len].copy_from_slice(&payload);
            file.sparse_append(&mut buf, payload_len).unwrap();
        }
        file.persist_metadata().unwrap();

        // ...three more appended before the crash, never persisted.
        for i in 5..8u8 {
            let payload = vec![0x10 + i; payload_len];
            let mut buf = vec![0u8; 8 + payload_len + BLOCK as usize];
            buf[8..8 + payload_len].copy_from_slice(&payload);
            file.sparse_append(&mut buf, payload_len).unwrap();
        }
        std::mem::forget(writer);
    }

    let reopened = Arc::new(EmulatedBackend::open(&image, geometry(64, 12)).unwrap());
    let fs = ZonedFs::mount(reopened, config, &meta).unwrap();
    let file = fs.zone_file("d.sst").unwrap();

    assert_eq!(file.extents().len(), 8);
    assert_eq!(file.file_size(), 8 * payload_len as u64);

    let contents = read_range(&fs, "d.sst", 0, 8 * payload_len);
    for i in 0..8usize {
        assert!(
            contents[i * payload_len..(i + 1) * payload_len]
                .iter()
                .all(|b| *b == 0x10 + i as u8),
            "extent {i} corrupted"
        );
    }
}

// ------------------------------------------------------------------------------------------------
// Scenario: reset and reuse
// ------------------------------------------------------------------------------------------------

#[test]
fn wal_zone_reset_never_regresses_sequencing() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let backend = Arc::new(
        EmulatedBackend::create(&tmp.path().join("zbd.img"), geometry(64, 12)).unwrap(),
    );
    let fs = ZonedFs::mount(backend, wal_config(), &tmp.path().join("meta")).unwrap();

    let writer = fs.new_writable_file("r.log", FileOptions::wal()).unwrap();
    let file = fs.zone_file("r.log").unwrap();

    let payload_len = (BLOCK - WAL_HEADER) as usize;
    for i in 0..6u8 {
        append_record(&file, &vec![i; payload_len]);
    }
    file.wal_sync().unwrap();
    assert_eq!(file.wal_seq(), 6);

    let log_base = file.extents()[0].start - WAL_HEADER;
    let log = fs.allocator().wal_for_lba(log_base).unwrap();
    assert!(log.write_head() > 0);

    file.reset_wal_zones().unwrap();
    assert_eq!(log.write_head(), 0);
    assert_eq!(log.write_tail(), 0);

    // Sequencing resumes from the stored counter.
    append_record(&file, &vec![0xEEu8; payload_len]);
    file.wal_sync().unwrap();
    assert_eq!(file.wal_seq(), 7);

    // The new record landed at the start of the reclaimed zone run with
    // sequence 6.
    let mut media = vec![0u8; BLOCK as usize];
    fs.backend().read(&mut media, log_base, true).unwrap();
    assert_eq!(
        u64::from_le_bytes(media[..8].try_into().unwrap()),
        payload_len as u64
    );
    assert_eq!(u64::from_le_bytes(media[8..16].try_into().unwrap()), 6);

    writer.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Scenario: dense non-WAL across zones
// ------------------------------------------------------------------------------------------------

#[test]
fn dense_file_spans_zones_without_headers() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    // 8 MiB zones: 10 MiB of data spans exactly two.
    let backend = Arc::new(
        EmulatedBackend::create(&tmp.path().join("zbd.img"), geometry(2048, 4)).unwrap(),
    );
    let config = FsConfig {
        wal_zones: 1,
        ..wal_config()
    };
    let fs = ZonedFs::mount(backend, config, &tmp.path().join("meta")).unwrap();

    let writer = fs
        .new_writable_file(
            "e.sst",
            FileOptions {
                buffered: false,
                use_direct_reads: true,
                ..FileOptions::default()
            },
        )
        .unwrap();
    let file = fs.zone_file("e.sst").unwrap();

    // 10 MiB in aligned 64 KiB chunks.
    let chunk = vec![0xD7u8; 64 * 1024];
    for _ in 0..160 {
        writer.append(&chunk).unwrap();
    }
    writer.fsync().unwrap();
    writer.close().unwrap();

    assert_eq!(file.file_size(), 10 * 1024 * 1024);

    let extents = file.extents();
    assert_eq!(extents.len(), 2);
    assert_eq!(extents[0].length, 8 * 1024 * 1024);
    assert_eq!(extents[1].length, 2 * 1024 * 1024);
    assert_ne!(extents[0].zone, extents[1].zone);

    // No header bytes on media: the payload starts at the extent LBA.
    let mut media = vec![0u8; BLOCK as usize];
    fs.backend().read(&mut media, extents[0].start, true).unwrap();
    assert!(media.iter().all(|b| *b == 0xD7));

    // Spot-check both sides of the zone seam.
    let seam = 8 * 1024 * 1024 - 512;
    let across = read_range(&fs, "e.sst", seam, 1024);
    assert_eq!(across.len(), 1024);
    assert!(across.iter().all(|b| *b == 0xD7));
}
