//! Shared fixtures for zone-file tests.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::config::FsConfig;
use crate::device::{AppendScheduler, DeviceGeometry, EmulatedBackend, FifoScheduler};
use crate::zone::{IoType, ZoneAllocator};
use crate::zonefile::ZoneFile;

/// Block size used by all zone-file tests.
pub const BLOCK: u64 = 4096;

/// Zone size: 16 blocks (64 KiB).
pub const ZONE: u64 = 16 * BLOCK;

/// Barrier size: 4 blocks (16 KiB).
pub const BARRIER: u64 = 4 * BLOCK;

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

pub fn test_config() -> FsConfig {
    FsConfig {
        sparse_buffer_size: 2 * BLOCK,
        wal_barrier_size: BARRIER,
        wal_zones: 4,
        dense_buffer_size: 4 * BLOCK,
    }
}

pub fn geometry() -> DeviceGeometry {
    DeviceGeometry {
        block_size: BLOCK as u32,
        zone_size: ZONE,
        nr_zones: 8,
        max_active_zones: 8,
        max_open_zones: 8,
    }
}

pub struct Fixture {
    pub backend: Arc<EmulatedBackend>,
    pub allocator: Arc<ZoneAllocator>,
    pub config: FsConfig,
}

impl Fixture {
    pub fn new(dir: &TempDir) -> Self {
        Self::with_scheduler(dir, Box::new(FifoScheduler))
    }

    pub fn with_scheduler(dir: &TempDir, scheduler: Box<dyn AppendScheduler>) -> Self {
        init_tracing();
        let config = test_config();
        let backend = Arc::new(
            EmulatedBackend::create_with_scheduler(
                &dir.path().join("zbd.img"),
                geometry(),
                scheduler,
            )
            .unwrap(),
        );
        let allocator = Arc::new(ZoneAllocator::open(backend.clone(), config.wal_zones).unwrap());
        Self {
            backend,
            allocator,
            config,
        }
    }

    pub fn new_file(&self, id: u64) -> ZoneFile {
        ZoneFile::new(
            self.backend.clone(),
            self.allocator.clone(),
            self.config,
            id,
            None,
        )
    }

    pub fn new_wal_file(&self, id: u64, name: &str) -> ZoneFile {
        assert!(Path::new(name).extension().is_some_and(|e| e == "log"));
        let file = self.new_file(id);
        file.add_link(name);
        file.set_io_type(IoType::Wal);
        file.set_sparse(true);
        file
    }

    pub fn new_sparse_file(&self, id: u64, name: &str) -> ZoneFile {
        let file = self.new_file(id);
        file.add_link(name);
        file.set_io_type(IoType::Flush);
        file.set_sparse(true);
        file
    }
}

/// Build a sparse-append buffer: `header` reserved bytes, then `payload`,
/// then one spare block for padding.
pub fn sparse_buf(header: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; header as usize + payload.len() + BLOCK as usize];
    buf[header as usize..header as usize + payload.len()].copy_from_slice(payload);
    buf
}

/// Payload that fills exactly one block together with a WAL header.
pub fn one_block_payload(tag: u8) -> Vec<u8> {
    vec![tag; (BLOCK - 16) as usize]
}
