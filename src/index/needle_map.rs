//! Needle Map
//!
//! The in-memory [`CompactMap`] of a volume together with its companion
//! `.idx` file and the volume's file/deletion counters.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::needle::TOMBSTONE_FILE_SIZE;

use super::{CompactMap, NeedleValue};

/// Key (8) + Offset (4) + Size (4)
pub const INDEX_ENTRY_SIZE: usize = 16;

/// Index of one volume
///
/// ## Concurrency:
/// - `map`: internally locked per section
/// - `index_file`: Mutex, appends are serialized
/// - counters: atomics, updated after the map
pub struct NeedleMap {
    path: PathBuf,
    map: CompactMap,
    index_file: Mutex<BufWriter<File>>,

    file_count: AtomicU64,
    file_bytes: AtomicU64,
    deleted_count: AtomicU64,
    deleted_bytes: AtomicU64,
    max_file_key: AtomicU64,
}

impl NeedleMap {
    /// Create an empty map, truncating any index file at `path`
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::with_file(path, file))
    }

    /// Load a map by replaying the index file at `path`.
    ///
    /// A trailing partial entry (torn write) is dropped from the file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();

        let whole = file_len - file_len % INDEX_ENTRY_SIZE as u64;
        if whole != file_len {
            tracing::warn!(
                "index file {} has {} trailing bytes, dropping partial entry",
                path.display(),
                file_len - whole
            );
            file.set_len(whole)?;
        }

        let appender = OpenOptions::new().append(true).open(path)?;
        let nm = Self::with_file(path, appender);

        let mut reader = BufReader::new(file);
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        let mut entries = 0u64;
        for _ in 0..whole / INDEX_ENTRY_SIZE as u64 {
            reader.read_exact(&mut buf)?;
            let entry = decode_entry(&buf);
            if entry.offset > 0 && entry.size != TOMBSTONE_FILE_SIZE {
                nm.apply_put(entry.key, entry.offset, entry.size);
            } else {
                nm.apply_delete(entry.key);
            }
            entries += 1;
        }

        tracing::debug!(
            "loaded {} index entries from {}, {} live files",
            entries,
            path.display(),
            nm.file_count() - nm.deleted_count()
        );

        Ok(nm)
    }

    fn with_file(path: &Path, file: File) -> Self {
        Self {
            path: path.to_path_buf(),
            map: CompactMap::new(),
            index_file: Mutex::new(BufWriter::new(file)),
            file_count: AtomicU64::new(0),
            file_bytes: AtomicU64::new(0),
            deleted_count: AtomicU64::new(0),
            deleted_bytes: AtomicU64::new(0),
            max_file_key: AtomicU64::new(0),
        }
    }

    /// Record that `key` now lives at `offset` (8-byte units) with body `size`.
    ///
    /// The entry is persisted first; if that fails the map is left as it was.
    pub fn put(&self, key: u64, offset: u32, size: u32) -> Result<()> {
        self.append_entry(NeedleValue::new(key, offset, size))?;
        self.apply_put(key, offset, size);
        Ok(())
    }

    /// Mark `key` deleted; `offset` locates the tombstone record.
    /// Returns the size freed.
    pub fn delete(&self, key: u64, offset: u32) -> Result<u32> {
        self.append_entry(NeedleValue::new(key, offset, TOMBSTONE_FILE_SIZE))?;
        Ok(self.apply_delete(key))
    }

    pub fn get(&self, key: u64) -> Option<NeedleValue> {
        self.map.get(key)
    }

    /// Visit every live entry
    pub fn visit<E, F>(&self, visit: F) -> std::result::Result<(), E>
    where
        F: FnMut(&NeedleValue) -> std::result::Result<(), E>,
    {
        self.map.visit(visit)
    }

    /// The underlying compact map
    pub fn compact_map(&self) -> &CompactMap {
        &self.map
    }

    // =========================================================================
    // Accounting
    // =========================================================================

    /// Number of puts ever recorded
    pub fn file_count(&self) -> u64 {
        self.file_count.load(Ordering::Acquire)
    }

    /// Number of entries deleted or superseded
    pub fn deleted_count(&self) -> u64 {
        self.deleted_count.load(Ordering::Acquire)
    }

    /// Bytes held by deleted or superseded entries
    pub fn deleted_size(&self) -> u64 {
        self.deleted_bytes.load(Ordering::Acquire)
    }

    /// Bytes of every body ever put
    pub fn content_size(&self) -> u64 {
        self.file_bytes.load(Ordering::Acquire)
    }

    pub fn max_file_key(&self) -> u64 {
        self.max_file_key.load(Ordering::Acquire)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffered entries and sync the index file
    pub fn sync(&self) -> Result<()> {
        let mut file = self.index_file.lock();
        file.flush()?;
        file.get_ref().sync_all()?;
        Ok(())
    }

    /// Remove the index file
    pub fn destroy(&self) -> Result<()> {
        {
            let mut file = self.index_file.lock();
            let _ = file.flush();
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn apply_put(&self, key: u64, offset: u32, size: u32) {
        let old = self.map.set(key, offset, size);
        self.max_file_key.fetch_max(key, Ordering::AcqRel);
        self.file_count.fetch_add(1, Ordering::AcqRel);
        self.file_bytes.fetch_add(u64::from(size), Ordering::AcqRel);
        if let Some(old) = old {
            if old.offset > 0 && !old.is_deleted() {
                self.deleted_count.fetch_add(1, Ordering::AcqRel);
                self.deleted_bytes
                    .fetch_add(u64::from(old.size), Ordering::AcqRel);
            }
        }
    }

    fn apply_delete(&self, key: u64) -> u32 {
        let freed = self.map.delete(key);
        if freed > 0 {
            self.deleted_count.fetch_add(1, Ordering::AcqRel);
            self.deleted_bytes
                .fetch_add(u64::from(freed), Ordering::AcqRel);
        }
        freed
    }

    fn append_entry(&self, entry: NeedleValue) -> Result<()> {
        let mut file = self.index_file.lock();
        file.write_all(&encode_entry(&entry))?;
        // Entries must be on disk before the next load can see the data record
        file.flush()?;
        Ok(())
    }
}

fn encode_entry(entry: &NeedleValue) -> [u8; INDEX_ENTRY_SIZE] {
    let mut buf = [0u8; INDEX_ENTRY_SIZE];
    buf[0..8].copy_from_slice(&entry.key.to_be_bytes());
    buf[8..12].copy_from_slice(&entry.offset.to_be_bytes());
    buf[12..16].copy_from_slice(&entry.size.to_be_bytes());
    buf
}

fn decode_entry(buf: &[u8; INDEX_ENTRY_SIZE]) -> NeedleValue {
    NeedleValue {
        key: u64::from_be_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]),
        offset: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        size: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
    }
}

/// Last entry of an index file, if it has one
pub(crate) fn read_last_entry(path: &Path) -> Result<Option<NeedleValue>> {
    use std::io::{Seek, SeekFrom};

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let whole = len - len % INDEX_ENTRY_SIZE as u64;
    if whole == 0 {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(whole - INDEX_ENTRY_SIZE as u64))?;
    let mut buf = [0u8; INDEX_ENTRY_SIZE];
    file.read_exact(&mut buf)?;
    Ok(Some(decode_entry(&buf)))
}
