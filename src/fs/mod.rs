//! The zoned file system: mount, namespace, and file views.
//!
//! [`ZonedFs`] ties the layers together: it owns the backend, the zone
//! allocator, the metadata journal, and the name → file map. Mounting
//! replays the journal into zone files, then runs per-file tail recovery
//! so data written after the last metadata sync (found via the zone write
//! pointers) is not lost.
//!
//! # WAL classification
//!
//! A file takes the WAL append path exactly when it is opened with
//! [`IoType::Wal`] and its primary link name ends in `.log` — the same
//! rule the key-value engine above uses for its write-ahead logs. Dropping
//! a WAL's last link resets the zones backing its once-log so the
//! allocator can hand them out again.


use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, FsConfig};
use crate::device::{DeviceError, ZonedBackend};
use crate::file::{ZonedRandomAccessFile, ZonedSequentialFile, ZonedWritableFile};
use crate::manifest::{JournalEntry, ManifestError, MetaJournal};
use crate::zone::{IoType, WriteLifeTimeHint, ZoneAllocator, ZoneError};
use crate::zonefile::{FileError, MetadataWriter, ZoneFile};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by file-system operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Configuration rejected at mount.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Device failure.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Zone or allocator failure.
    #[error("zone error: {0}")]
    Zone(#[from] ZoneError),

    /// File-layer failure.
    #[error("file error: {0}")]
    File(#[from] FileError),

    /// Metadata journal failure.
    #[error("journal error: {0}")]
    Manifest(#[from] ManifestError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No file is linked under the given name.
    #[error("file not found: {0}")]
    NotFound(String),

    /// A caller-supplied argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// Open options
// ------------------------------------------------------------------------------------------------

/// Options for opening a file.
#[derive(Debug, Clone, Copy)]
pub struct FileOptions {
    /// Traffic classification, propagated to zone placement and WAL
    /// detection.
    pub io_type: IoType,

    /// Expected data lifetime, propagated to the allocator.
    pub lifetime: WriteLifeTimeHint,

    /// Stage writes in a buffer (sparse on-media layout). Unbuffered
    /// writers issue direct, block-aligned appends (dense layout).
    pub buffered: bool,

    /// Bypass the page cache on reads where alignment permits.
    pub use_direct_reads: bool,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            io_type: IoType::Unknown,
            lifetime: WriteLifeTimeHint::NotSet,
            buffered: true,
            use_direct_reads: false,
        }
    }
}

impl FileOptions {
    /// Options for a write-ahead log file.
    pub fn wal() -> Self {
        Self {
            io_type: IoType::Wal,
            lifetime: WriteLifeTimeHint::Short,
            ..Self::default()
        }
    }
}

// ------------------------------------------------------------------------------------------------
// ZonedFs
// ------------------------------------------------------------------------------------------------

/// A file system over one host-managed zoned block device.
pub struct ZonedFs {
    backend: Arc<dyn ZonedBackend>,
    allocator: Arc<ZoneAllocator>,
    config: FsConfig,
    journal: Arc<MetaJournal>,
    files: RwLock<HashMap<String, Arc<ZoneFile>>>,
    next_file_id: AtomicU64,
}

impl std::fmt::Debug for ZonedFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZonedFs")
            .field("next_file_id", &self.next_file_id.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ZonedFs {
    /// Mount the file system: validate the configuration, build the zone
    /// arena, replay the metadata journal, and recover crash-written file
    /// tails.
    pub fn mount(
        backend: Arc<dyn ZonedBackend>,
        config: FsConfig,
        journal_path: &Path,
    ) -> Result<Self, FsError> {
        config.validate(backend.geometry().block_size)?;

        let allocator = Arc::new(ZoneAllocator::open(backend.clone(), config.wal_zones)?);
        let journal = Arc::new(MetaJournal::open(journal_path)?);
        let writer: Arc<dyn MetadataWriter> = journal.clone();

        let mut by_id: HashMap<u64, Arc<ZoneFile>> = HashMap::new();
        for entry in journal.replay()? {
            match entry {
                JournalEntry::Update(record) | JournalEntry::Snapshot(record)
                    if record.is_empty() =>
                {
                    return Err(ManifestError::Corruption("empty metadata record".into()).into());
                }
                JournalEntry::Update(record) => {
                    Self::apply_record(
                        &mut by_id,
                        &record,
                        false,
                        &backend,
                        &allocator,
                        config,
                        &writer,
                    )?;
                }
                JournalEntry::Snapshot(record) => {
                    Self::apply_record(
                        &mut by_id,
                        &record,
                        true,
                        &backend,
                        &allocator,
                        config,
                        &writer,
                    )?;
                }
                JournalEntry::Delete(file_id) => {
                    if by_id.remove(&file_id).is_none() {
                        warn!(file = file_id, "delete record for unknown file");
                    }
                }
            }
        }

        let mut files = HashMap::new();
        let mut next_file_id = 1u64;
        for file in by_id.into_values() {
            file.recover()?;
            next_file_id = next_file_id.max(file.id() + 1);
            for link in file.link_files() {
                files.insert(link, file.clone());
            }
        }

        info!(
            files = files.len(),
            next_file_id, "zoned file system mounted"
        );

        Ok(Self {
            backend,
            allocator,
            config,
            journal,
            files: RwLock::new(files),
            next_file_id: AtomicU64::new(next_file_id),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_record(
        by_id: &mut HashMap<u64, Arc<ZoneFile>>,
        record: &[u8],
        replace: bool,
        backend: &Arc<dyn ZonedBackend>,
        allocator: &Arc<ZoneAllocator>,
        config: FsConfig,
        writer: &Arc<dyn MetadataWriter>,
    ) -> Result<(), FsError> {
        let decoded = ZoneFile::new(
            backend.clone(),
            allocator.clone(),
            config,
            0,
            Some(writer.clone()),
        );
        decoded.decode_from(&mut &record[..])?;

        match by_id.get(&decoded.id()) {
            Some(existing) => {
                existing.merge_update(&decoded, replace)?;
                // `decoded` drops here and returns its extent accounting.
            }
            None => {
                by_id.insert(decoded.id(), Arc::new(decoded));
            }
        }
        Ok(())
    }

    /// The allocator arbitrating this device's zones.
    pub fn allocator(&self) -> &Arc<ZoneAllocator> {
        &self.allocator
    }

    /// The backing device adapter.
    pub fn backend(&self) -> &Arc<dyn ZonedBackend> {
        &self.backend
    }

    fn read_files(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ZoneFile>>> {
        match self.files.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_files(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ZoneFile>>> {
        match self.files.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lookup(&self, path: &str) -> Result<Arc<ZoneFile>, FsError> {
        self.read_files()
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// Whether a file is linked under `path`.
    pub fn file_exists(&self, path: &str) -> bool {
        self.read_files().contains_key(path)
    }

    /// Logical size of the file linked under `path`.
    pub fn file_size(&self, path: &str) -> Result<u64, FsError> {
        Ok(self.lookup(path)?.file_size())
    }

    /// All linked names, sorted.
    pub fn list_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_files().keys().cloned().collect();
        names.sort();
        names
    }

    /// The zone file linked under `path`.
    pub fn zone_file(&self, path: &str) -> Result<Arc<ZoneFile>, FsError> {
        self.lookup(path)
    }

    /// Create a file and open it for writing. An existing file under the
    /// same name is deleted first.
    pub fn new_writable_file(
        &self,
        path: &str,
        opts: FileOptions,
    ) -> Result<ZonedWritableFile, FsError> {
        if path.is_empty() {
            return Err(FsError::InvalidArgument("empty file name".to_string()));
        }
        if self.file_exists(path) {
            self.delete_file(path)?;
        }

        let file_id = self.next_file_id.fetch_add(1, Ordering::AcqRel);
        let writer: Arc<dyn MetadataWriter> = self.journal.clone();
        let file = Arc::new(ZoneFile::new(
            self.backend.clone(),
            self.allocator.clone(),
            self.config,
            file_id,
            Some(writer),
        ));

        file.add_link(path);
        file.set_io_type(opts.io_type);
        file.set_sparse(opts.buffered);
        file.set_lifetime_hint(opts.lifetime);
        file.set_modification_time(unix_time());
        file.acquire_wr_lock();
        file.persist_metadata()?;

        self.write_files().insert(path.to_string(), file.clone());

        debug!(file = file_id, path, "writable file created");
        Ok(ZonedWritableFile::new(file, opts.buffered))
    }

    /// Open the file linked under `path` for sequential reading.
    pub fn new_sequential_file(
        &self,
        path: &str,
        opts: FileOptions,
    ) -> Result<ZonedSequentialFile, FsError> {
        Ok(ZonedSequentialFile::new(
            self.lookup(path)?,
            opts.use_direct_reads,
        ))
    }

    /// Open the file linked under `path` for positioned reading.
    pub fn new_random_access_file(
        &self,
        path: &str,
        opts: FileOptions,
    ) -> Result<ZonedRandomAccessFile, FsError> {
        Ok(ZonedRandomAccessFile::new(
            self.lookup(path)?,
            opts.use_direct_reads,
        ))
    }

    /// Remove the link `path`. Dropping a file's last link deletes the
    /// file and, for WALs, resets the zones backing its once-log.
    pub fn delete_file(&self, path: &str) -> Result<(), FsError> {
        let file = {
            let mut files = self.write_files();
            files
                .remove(path)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?
        };

        file.remove_link(path)?;
        if file.nr_links() == 0 {
            file.set_deleted();
            if file.is_wal() {
                file.reset_wal_zones()?;
            }
            self.journal.persist_delete(file.id())?;
            info!(file = file.id(), path, "file deleted");
        } else {
            file.persist_metadata()?;
        }
        Ok(())
    }

    /// Rename the link `src` to `dest`.
    pub fn rename_file(&self, src: &str, dest: &str) -> Result<(), FsError> {
        let mut files = self.write_files();
        let file = files
            .remove(src)
            .ok_or_else(|| FsError::NotFound(src.to_string()))?;

        file.rename_link(src, dest)?;
        // Renaming over an existing name replaces it.
        files.insert(dest.to_string(), file.clone());
        drop(files);

        file.persist_metadata()?;
        Ok(())
    }

    /// Add a hard link `dest` to the file linked under `src`.
    pub fn link_file(&self, src: &str, dest: &str) -> Result<(), FsError> {
        let file = self.lookup(src)?;
        if self.file_exists(dest) {
            return Err(FsError::InvalidArgument(format!(
                "link target {dest} already exists"
            )));
        }
        file.add_link(dest);
        self.write_files().insert(dest.to_string(), file.clone());
        file.persist_metadata()?;
        Ok(())
    }

    /// Journal a full metadata snapshot for every live file.
    pub fn checkpoint(&self) -> Result<(), FsError> {
        let files: Vec<Arc<ZoneFile>> = {
            let guard = self.read_files();
            let mut seen = Vec::new();
            let mut out = Vec::new();
            for file in guard.values() {
                if !seen.contains(&file.id()) {
                    seen.push(file.id());
                    out.push(file.clone());
                }
            }
            out
        };

        for file in files {
            let mut record = Vec::new();
            file.encode_snapshot_to(&mut record)?;
            self.journal.persist_snapshot(file.id(), &record)?;
            file.metadata_synced();
        }
        Ok(())
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
