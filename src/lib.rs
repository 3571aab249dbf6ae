//! # zonewal
//!
//! A file layer over **host-managed zoned block devices (ZBDs)**,
//! specialized for high-throughput write-ahead-log ingest in LSM-tree
//! storage engines.
//!
//! A zoned device exposes storage as fixed-size zones that must be written
//! sequentially at a per-zone write pointer and are reclaimed only by
//! whole-zone reset. `zonewal` maps ordinary file writes onto *extents*
//! inside zones and journals per-file metadata so files survive crashes.
//! Its core is the WAL append path: concurrent, order-agnostic *zone
//! appends* carrying in-line sequence numbers, bounded by periodic
//! durability *barriers*, and read back through chunk-wise recovery that
//! sorts records by sequence on demand.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        ZonedFs                          │
//! │  ┌───────────────┐ ┌───────────────┐ ┌──────────────┐   │
//! │  │  Writable /   │ │   ZoneFile    │ │ MetaJournal  │   │
//! │  │  Sequential / │ │  extents +    │ │ (CRC-framed  │   │
//! │  │  RandomAccess │ │  WAL protocol │ │  records)    │   │
//! │  │  views        │ │               │ │              │   │
//! │  └───────┬───────┘ └──────┬────────┘ └──────────────┘   │
//! │          │    append/read │                             │
//! │  ┌───────┴───────────────┴────────┐ ┌───────────────┐   │
//! │  │      Zones + ZoneAllocator     │ │    OnceLog    │   │
//! │  │  (arena, busy flags, pools)    │ │ (WAL zone run)│   │
//! │  └───────────────┬────────────────┘ └──────┬────────┘   │
//! │                  │      zone append / sync │            │
//! │  ┌───────────────┴─────────────────────────┴────────┐   │
//! │  │          ZonedBackend (device adapter)           │   │
//! │  └──────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`fs`] | Mount, namespace, and the outward file API |
//! | [`file`] | Writable / sequential / random-access views |
//! | [`zonefile`] | The file core: extents, sparse/WAL appends, chunked recovery, metadata codec |
//! | [`oncelog`] | Append-only log over a run of WAL zones |
//! | [`zone`] | Zone arena and allocator (IO + WAL pools) |
//! | [`device`] | Zoned-device trait and the mmap-backed emulation |
//! | [`manifest`] | CRC-protected per-file metadata journal |
//! | [`encoding`] | Fixed-width little-endian wire helpers |
//! | [`config`] | Immutable mount configuration |
//!
//! ## Key properties
//!
//! - **Order-agnostic WAL ingest** — appends to a zone need no write
//!   pointer coordination; the device picks each record's LBA.
//! - **Sequence-sorted reads** — every WAL record embeds a sequence
//!   number; reads reconstruct append order one barrier chunk at a time.
//! - **Bounded recovery** — a barrier forces a device sync every
//!   `wal_barrier_size` bytes, capping both unordered in-flight data and
//!   the sort window on the read side.
//! - **Crash consistency** — metadata lags data on purpose: after a
//!   crash, the zone write pointer locates data past the last metadata
//!   sync and per-record headers rebuild the extent list.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zonewal::config::FsConfig;
//! use zonewal::device::{DeviceGeometry, EmulatedBackend};
//! use zonewal::fs::{FileOptions, ZonedFs};
//!
//! let geometry = DeviceGeometry {
//!     block_size: 4096,
//!     zone_size: 64 * 1024 * 1024,
//!     nr_zones: 32,
//!     max_active_zones: 8,
//!     max_open_zones: 8,
//! };
//! let backend = EmulatedBackend::create("/tmp/zbd.img".as_ref(), geometry).unwrap();
//! let fs = ZonedFs::mount(Arc::new(backend), FsConfig::default(), "/tmp/zbd.meta".as_ref()).unwrap();
//!
//! // WAL ingest
//! let wal = fs.new_writable_file("000001.log", FileOptions::wal()).unwrap();
//! wal.append(b"put k1 v1").unwrap();
//! wal.sync().unwrap();
//! wal.close().unwrap();
//!
//! // Sequence-ordered read-back
//! let mut reader = fs.new_sequential_file("000001.log", FileOptions::default()).unwrap();
//! let mut buf = vec![0u8; 9];
//! let n = reader.read(9, &mut buf).unwrap();
//! assert_eq!(&buf[..n], b"put k1 v1");
//! ```

#![allow(dead_code)]

pub mod config;
pub mod device;
pub mod encoding;
pub mod file;
pub mod fs;
pub mod manifest;
pub mod oncelog;
pub mod zone;
pub mod zonefile;
