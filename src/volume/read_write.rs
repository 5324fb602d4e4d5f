//! Needle reads, appends and deletes on a single volume.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;

use bytes::Bytes;

use crate::error::{Result, StorageError};
use crate::needle::{
    checksum, disk_size, Needle, NeedleHeader, MAX_POSSIBLE_VOLUME_SIZE, NEEDLE_PADDING_SIZE,
    TOMBSTONE_FILE_SIZE,
};

use super::{now_unix, read_exact_at, Volume, VolumeState};

impl Volume {
    // =========================================================================
    // Write Path
    // =========================================================================

    /// Append `n` to the volume and index it. Returns the payload size.
    ///
    /// Rewriting a needle with the same checksum and data is a no-op unless
    /// either the needle or the volume carries a TTL.
    pub fn write(&self, n: &mut Needle) -> Result<u32> {
        self.check_writable()?;
        if n.data.is_empty() {
            return Err(StorageError::InvalidNeedle(format!(
                "needle {:x} has no data",
                n.id
            )));
        }

        let mut file = self.data_file.lock();
        // State may have changed while waiting for the lock
        self.check_writable()?;

        if self.is_file_unchanged(n) {
            tracing::debug!("volume {}: needle {:x} is unchanged", self.id, n.id);
            return Ok(n.data_size);
        }

        let encoded = n.encode(self.version())?;
        let offset = self.append(&mut file, &encoded.bytes)?;

        let slot = (offset / NEEDLE_PADDING_SIZE) as u32;
        let replace = match self.nm.get(n.id) {
            Some(nv) => u64::from(nv.offset) * NEEDLE_PADDING_SIZE < offset,
            None => true,
        };
        if replace {
            self.nm.put(n.id, slot, encoded.size)?;
        }

        let modified = if n.has_last_modified() {
            n.last_modified
        } else {
            now_unix()
        };
        self.last_modified.fetch_max(modified, Ordering::AcqRel);

        tracing::debug!(
            "volume {}: wrote needle {:x} at {} ({} bytes on disk)",
            self.id,
            n.id,
            offset,
            encoded.disk_size
        );
        Ok(encoded.data_size)
    }

    /// Append a tombstone for `n` and mark it deleted in the index.
    ///
    /// Returns the size that was freed; 0 if the needle was absent or
    /// already deleted.
    pub fn delete(&self, n: &Needle) -> Result<u32> {
        let mut file = self.data_file.lock();
        self.check_writable()?;

        let nv = match self.nm.get(n.id) {
            Some(nv) if !nv.is_deleted() => nv,
            _ => return Ok(0),
        };

        let mut tombstone = Needle::tombstone(n.id, n.cookie);
        let encoded = tombstone.encode(self.version())?;
        let offset = self.append(&mut file, &encoded.bytes)?;
        let freed = self
            .nm
            .delete(n.id, (offset / NEEDLE_PADDING_SIZE) as u32)?;

        tracing::debug!(
            "volume {}: deleted needle {:x}, freed {} bytes",
            self.id,
            n.id,
            nv.size
        );
        Ok(freed)
    }

    /// Append a record that was already encoded elsewhere (replica catch-up).
    ///
    /// The blob must be one complete record. Returns the offset it was
    /// written at.
    pub fn append_blob(&self, blob: &[u8]) -> Result<u64> {
        self.check_writable()?;
        let header = NeedleHeader::parse(blob)?;
        if blob.len() as u64 != disk_size(header.size) {
            return Err(StorageError::CorruptRecord(format!(
                "blob for needle {:x} is {} bytes, record needs {}",
                header.id,
                blob.len(),
                disk_size(header.size)
            )));
        }

        let mut file = self.data_file.lock();
        self.check_writable()?;
        let offset = self.append(&mut file, blob)?;
        let slot = (offset / NEEDLE_PADDING_SIZE) as u32;
        if header.size > 0 && header.size != TOMBSTONE_FILE_SIZE {
            self.nm.put(header.id, slot, header.size)?;
        } else {
            self.nm.delete(header.id, slot)?;
        }
        Ok(offset)
    }

    /// Write `bytes` at the next aligned offset past the end of the data
    /// file. A failed write is truncated back to where it started.
    fn append(&self, file: &mut File, bytes: &[u8]) -> Result<u64> {
        let end = file.seek(SeekFrom::End(0))?;
        let tracked = self.data_file_size.load(Ordering::Acquire);
        if end != tracked {
            tracing::warn!(
                "volume {}: tracked size {} != actual data file size {}",
                self.id,
                tracked,
                end
            );
        }

        let offset = end.div_ceil(NEEDLE_PADDING_SIZE) * NEEDLE_PADDING_SIZE;
        let new_size = offset + bytes.len() as u64;
        if new_size > MAX_POSSIBLE_VOLUME_SIZE {
            return Err(StorageError::CapacityExceeded {
                volume: self.id,
                size: offset,
                limit: MAX_POSSIBLE_VOLUME_SIZE,
            });
        }

        let result = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(bytes));
        if let Err(e) = result {
            if let Err(te) = file.set_len(end) {
                return Err(StorageError::TruncateFailed {
                    path: self.data_file_path(),
                    offset: end,
                    cause: e.to_string(),
                    source: te,
                });
            }
            return Err(e.into());
        }

        self.data_file_size.store(new_size, Ordering::Release);
        Ok(offset)
    }

    /// Whether the live entry for `n` already holds the same payload.
    /// Caller holds the data file lock.
    fn is_file_unchanged(&self, n: &mut Needle) -> bool {
        if !self.ttl().is_empty() || n.has_ttl() {
            return false;
        }
        let nv = match self.nm.get(n.id) {
            Some(nv) if nv.offset > 0 && !nv.is_deleted() => nv,
            _ => return false,
        };
        let old = match self.read_record(nv.offset, nv.size) {
            Ok(old) => old,
            Err(e) => {
                tracing::warn!(
                    "volume {}: cannot check needle {:x} for changes: {}",
                    self.id,
                    n.id,
                    e
                );
                return false;
            }
        };
        if old.checksum == checksum(&n.data) && old.data == n.data {
            n.data_size = old.data_size;
            n.size = old.size;
            n.checksum = old.checksum;
            return true;
        }
        false
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Fill `n` from the record stored under `n.id`. Returns the payload size.
    pub fn read(&self, n: &mut Needle) -> Result<usize> {
        self.read_at(n, now_unix())
    }

    /// [`Volume::read`] with an explicit clock (unix seconds)
    pub fn read_at(&self, n: &mut Needle, now: u64) -> Result<usize> {
        self.check_live()?;
        let nv = match self.nm.get(n.id) {
            Some(nv) if nv.offset > 0 && !nv.is_deleted() => nv,
            _ => return Err(StorageError::NotFound(n.id)),
        };

        let found = self.read_record(nv.offset, nv.size)?;
        if found.id != n.id {
            return Err(StorageError::CorruptRecord(format!(
                "index entry for needle {:x} points at needle {:x}",
                n.id, found.id
            )));
        }
        if found.is_expired_at(now) {
            return Err(StorageError::NotFound(n.id));
        }

        *n = found;
        Ok(n.data.len())
    }

    /// Read and decode the record at `slot` (8-byte units)
    fn read_record(&self, slot: u32, size: u32) -> Result<Needle> {
        let offset = u64::from(slot) * NEEDLE_PADDING_SIZE;
        let mut buf = vec![0u8; disk_size(size) as usize];
        read_exact_at(&self.reader, &mut buf, offset)?;
        Needle::from_record(Bytes::from(buf), size, self.version())
    }

    // =========================================================================
    // Destroy
    // =========================================================================

    /// Remove the data and index files. The volume is unusable afterwards.
    pub fn destroy(&self) -> Result<()> {
        let _file = self.data_file.lock();
        {
            let mut state = self.state.write();
            match *state {
                VolumeState::ReadOnly => return Err(StorageError::ReadOnlyVolume(self.id)),
                VolumeState::Destroyed => return Ok(()),
                _ => *state = VolumeState::Destroyed,
            }
        }

        match fs::remove_file(self.data_file_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.nm.destroy()?;
        tracing::info!("destroyed volume {} in {}", self.id, self.dir.display());
        Ok(())
    }
}
