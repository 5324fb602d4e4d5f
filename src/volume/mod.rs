//! Volume Module
//!
//! A volume is one append-only data file plus its index. It is the unit of
//! replication and of capacity accounting.
//!
//! ## Responsibilities
//! - Own the `.dat` file (superblock + needle records) and the `.idx` file
//! - Serialize appends so the write offset always equals the end of file
//! - Serve reads through the index with positioned reads
//! - Rebuild the index from a full scan when the `.idx` file is missing
//!   or does not match the data file
//!
//! ## Lifecycle
//! ```text
//! Loading ──► Ready ──► ReadOnly ──► Destroyed
//!               │                       ▲
//!               └──► Expired ───────────┘
//! ```
//! `Loading` covers [`Volume::open`]. `Expired` is derived from the TTL and
//! the clock, see [`Volume::lifecycle_at`].

mod read_write;
mod scan;
mod super_block;

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::index::{NeedleMap, NeedleValue};
use crate::needle::{disk_size, NeedleHeader, Ttl, Version, NEEDLE_HEADER_SIZE, NEEDLE_PADDING_SIZE};

pub use scan::scan_volume_file;
pub use super_block::{ReplicaPlacement, SuperBlock, SUPER_BLOCK_SIZE};

// =============================================================================
// Volume Id
// =============================================================================

/// Numeric volume identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub u32);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VolumeId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u32>()
            .map(VolumeId)
            .map_err(|_| StorageError::InvalidVolumeId(s.to_string()))
    }
}

impl From<u32> for VolumeId {
    fn from(id: u32) -> Self {
        VolumeId(id)
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Loading,
    Ready,
    ReadOnly,
    Expired,
    Destroyed,
}

/// Current unix time in seconds
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// Volume
// =============================================================================

/// One data file and its index
///
/// ## Concurrency:
/// - `data_file`: Mutex held for a whole write or delete, covering the
///   append and the index update that follows it
/// - `reader`: a second handle used for positioned reads, no lock needed
/// - `nm`: internally locked
pub struct Volume {
    id: VolumeId,
    dir: PathBuf,
    collection: String,
    super_block: SuperBlock,

    /// Write handle; the lock serializes every append
    data_file: Mutex<File>,
    reader: File,
    data_file_size: AtomicU64,

    nm: NeedleMap,

    /// Largest needle modification time seen, or the file mtime (unix secs)
    last_modified: AtomicU64,
    state: RwLock<VolumeState>,
}

impl Volume {
    /// Open the volume `id` in `dir`, creating its data file if needed.
    ///
    /// For an existing data file the superblock on disk wins over
    /// `replica_placement` and `ttl`. `preallocate` is advisory.
    pub fn open(
        dir: &Path,
        collection: &str,
        id: VolumeId,
        replica_placement: ReplicaPlacement,
        ttl: Ttl,
        preallocate: u64,
    ) -> Result<Self> {
        let base = file_base(dir, collection, id);
        let dat_path = with_suffix(&base, "dat");
        let idx_path = with_suffix(&base, "idx");

        let (mut file, read_only) = open_data_file(&dat_path)?;
        let mut len = file.metadata()?.len();

        let super_block = if len == 0 {
            if read_only {
                return Err(StorageError::ReadOnlyVolume(id));
            }
            let sb = SuperBlock::new(replica_placement, ttl);
            file.write_all(&sb.to_bytes())?;
            file.sync_all()?;
            len = SUPER_BLOCK_SIZE as u64;
            if preallocate > 0 {
                tracing::debug!(
                    "volume {}: preallocation of {} bytes requested, not supported on this platform",
                    id,
                    preallocate
                );
            }
            tracing::info!(
                "created volume {} in {} collection={:?} replication={} ttl={}",
                id,
                dir.display(),
                collection,
                replica_placement,
                ttl
            );
            sb
        } else {
            read_super_block(&file)?
        };

        let reader = file.try_clone()?;
        let nm = load_index(&reader, len, super_block.version, &idx_path)?;

        let last_modified = file
            .metadata()?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_else(now_unix);

        let state = if read_only {
            VolumeState::ReadOnly
        } else {
            VolumeState::Ready
        };

        Ok(Self {
            id,
            dir: dir.to_path_buf(),
            collection: collection.to_string(),
            super_block,
            data_file: Mutex::new(file),
            reader,
            data_file_size: AtomicU64::new(len),
            nm,
            last_modified: AtomicU64::new(last_modified),
            state: RwLock::new(state),
        })
    }

    /// Open an existing volume with whatever its superblock says
    pub fn load(dir: &Path, collection: &str, id: VolumeId) -> Result<Self> {
        Self::open(dir, collection, id, ReplicaPlacement::default(), Ttl::EMPTY, 0)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    pub fn version(&self) -> Version {
        self.super_block.version
    }

    pub fn replica_placement(&self) -> ReplicaPlacement {
        self.super_block.replica_placement
    }

    pub fn ttl(&self) -> Ttl {
        self.super_block.ttl
    }

    /// `<dir>/<collection>_<id>.dat`
    pub fn data_file_path(&self) -> PathBuf {
        with_suffix(&file_base(&self.dir, &self.collection, self.id), "dat")
    }

    /// `<dir>/<collection>_<id>.idx`
    pub fn index_file_path(&self) -> PathBuf {
        with_suffix(&file_base(&self.dir, &self.collection, self.id), "idx")
    }

    /// Physical size of the data file, superblock included
    pub fn data_file_size(&self) -> u64 {
        self.data_file_size.load(Ordering::Acquire)
    }

    /// Logical bytes ever written to this volume
    pub fn content_size(&self) -> u64 {
        self.nm.content_size()
    }

    pub fn file_count(&self) -> u64 {
        self.nm.file_count()
    }

    pub fn deleted_count(&self) -> u64 {
        self.nm.deleted_count()
    }

    pub fn deleted_size(&self) -> u64 {
        self.nm.deleted_size()
    }

    pub fn max_file_key(&self) -> u64 {
        self.nm.max_file_key()
    }

    pub fn last_modified_time(&self) -> u64 {
        self.last_modified.load(Ordering::Acquire)
    }

    /// Index entry for `key`, deleted entries included
    pub fn index_entry(&self, key: u64) -> Option<NeedleValue> {
        self.nm.get(key)
    }

    pub fn needle_map(&self) -> &NeedleMap {
        &self.nm
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn state(&self) -> VolumeState {
        *self.state.read()
    }

    pub fn is_read_only(&self) -> bool {
        self.state() == VolumeState::ReadOnly
    }

    pub fn set_read_only(&self, read_only: bool) -> Result<()> {
        let mut state = self.state.write();
        match *state {
            VolumeState::Destroyed => Err(StorageError::VolumeNotFound(self.id)),
            _ => {
                *state = if read_only {
                    VolumeState::ReadOnly
                } else {
                    VolumeState::Ready
                };
                Ok(())
            }
        }
    }

    /// Stored state, or `Expired` when the whole-volume TTL has run out
    pub fn lifecycle_at(&self, volume_size_limit: u64, now: u64) -> VolumeState {
        match self.state() {
            VolumeState::Destroyed => VolumeState::Destroyed,
            _ if self.expired_at(volume_size_limit, now) => VolumeState::Expired,
            other => other,
        }
    }

    /// Whether the volume TTL has elapsed since the last modification.
    ///
    /// Volumes without a TTL, empty volumes, and nodes that have not been
    /// told a size limit never expire.
    pub fn expired_at(&self, volume_size_limit: u64, now: u64) -> bool {
        if volume_size_limit == 0 || self.content_size() == 0 {
            return false;
        }
        let ttl_minutes = self.ttl().minutes();
        if ttl_minutes == 0 {
            return false;
        }
        let lived_minutes = now.saturating_sub(self.last_modified_time()) / 60;
        u64::from(ttl_minutes) < lived_minutes
    }

    /// Whether an expired volume has outlived its removal grace period,
    /// a tenth of its TTL capped at `max_delay_minutes`.
    pub fn expired_long_enough_at(&self, max_delay_minutes: u32, now: u64) -> bool {
        let ttl_minutes = self.ttl().minutes();
        if ttl_minutes == 0 {
            return false;
        }
        let removal_delay = (ttl_minutes / 10).min(max_delay_minutes);
        u64::from(ttl_minutes + removal_delay) * 60 + self.last_modified_time() < now
    }

    /// Flush and sync both files
    pub fn close(&self) -> Result<()> {
        let file = self.data_file.lock();
        file.sync_all()?;
        self.nm.sync()
    }

    fn check_writable(&self) -> Result<()> {
        match self.state() {
            VolumeState::ReadOnly => Err(StorageError::ReadOnlyVolume(self.id)),
            VolumeState::Destroyed => Err(StorageError::VolumeNotFound(self.id)),
            _ => Ok(()),
        }
    }

    fn check_live(&self) -> Result<()> {
        match self.state() {
            VolumeState::Destroyed => Err(StorageError::VolumeNotFound(self.id)),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("collection", &self.collection)
            .field("super_block", &self.super_block)
            .field("data_file_size", &self.data_file_size())
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// File Helpers
// =============================================================================

/// `<dir>/<collection>_<id>` or `<dir>/<id>` without extension
pub(crate) fn file_base(dir: &Path, collection: &str, id: VolumeId) -> PathBuf {
    if collection.is_empty() {
        dir.join(id.to_string())
    } else {
        dir.join(format!("{}_{}", collection, id))
    }
}

fn with_suffix(base: &Path, ext: &str) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Open read-write, falling back to read-only when permissions forbid writing
fn open_data_file(path: &Path) -> Result<(File, bool)> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
    {
        Ok(file) => Ok((file, false)),
        Err(e) if e.kind() == ErrorKind::PermissionDenied && path.exists() => {
            tracing::warn!("{} is not writable, opening read-only", path.display());
            Ok((File::open(path)?, true))
        }
        Err(e) => Err(e.into()),
    }
}

fn read_super_block(file: &File) -> Result<SuperBlock> {
    let mut buf = [0u8; SUPER_BLOCK_SIZE];
    read_exact_at(file, &mut buf, 0)?;
    SuperBlock::parse(&buf)
}

/// Load the `.idx` file if it agrees with the data file, else rebuild it
fn load_index(data: &File, data_len: u64, version: Version, idx_path: &Path) -> Result<NeedleMap> {
    if idx_path.exists() {
        match index_matches_data(data, data_len, idx_path) {
            Ok(true) => return NeedleMap::load(idx_path),
            Ok(false) => tracing::warn!(
                "index {} does not match its data file, rebuilding",
                idx_path.display()
            ),
            Err(e) => tracing::warn!(
                "cannot check index {}: {}, rebuilding",
                idx_path.display(),
                e
            ),
        }
    }
    scan::build_index(data, version, idx_path).map(|(nm, _)| nm)
}

/// Every append writes one index entry, so the last entry must point at the
/// last record of the data file and name the same needle.
fn index_matches_data(data: &File, data_len: u64, idx_path: &Path) -> Result<bool> {
    let last = match crate::index::read_last_entry(idx_path)? {
        Some(last) => last,
        None => return Ok(data_len <= SUPER_BLOCK_SIZE as u64),
    };

    let offset = u64::from(last.offset) * NEEDLE_PADDING_SIZE;
    let size = if last.is_deleted() { 0 } else { last.size };
    if offset < SUPER_BLOCK_SIZE as u64 || offset + disk_size(size) != data_len {
        return Ok(false);
    }

    let mut buf = [0u8; NEEDLE_HEADER_SIZE];
    read_exact_at(data, &mut buf, offset)?;
    let header = NeedleHeader::parse(&buf)?;
    Ok(header.id == last.key && header.size == size)
}

/// Fill `buf` from `offset` without moving any shared cursor
#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
