//! Needle Module
//!
//! A needle is one stored file: its key, cookie, payload and optional
//! metadata, encoded into a single 8-byte aligned record inside a volume.
//!
//! ## Record Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (16 bytes, big-endian)                                │
//! │   Cookie: u32 (4) | Id: u64 (8) | Size: u32 (4)              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Body (Size bytes)                                            │
//! │   v1: [Data]                                                 │
//! │   v2: [DataSize: u32][Data][Flags: u8]                       │
//! │       [NameSize: u8][Name]          if FLAG_HAS_NAME         │
//! │       [MimeSize: u8][Mime]          if FLAG_HAS_MIME         │
//! │       [LastModified: 5 bytes]       if FLAG_HAS_LAST_MODIFIED│
//! │       [Ttl: 2 bytes]                if FLAG_HAS_TTL          │
//! │       [PairsSize: u16][Pairs]       if FLAG_HAS_PAIRS        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Checksum: CRC32 of Data (4) | Padding to a multiple of 8     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A v2 needle with empty data has `Size = 0` and no body at all; this is
//! the tombstone record appended on delete.

mod codec;
mod file_id;
mod ttl;

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::error::{Result, StorageError};

pub use codec::{checksum, disk_size, verify_checksum, EncodedNeedle, NeedleHeader};
pub use file_id::{parse_key_hash, FileId};
pub use ttl::{Ttl, TtlUnit, TTL_BYTES_LENGTH};

// =============================================================================
// Format Constants
// =============================================================================

/// Fixed header: cookie (4) + id (8) + size (4)
pub const NEEDLE_HEADER_SIZE: usize = 16;

/// Every record starts and ends on this boundary
pub const NEEDLE_PADDING_SIZE: u64 = 8;

pub const NEEDLE_CHECKSUM_SIZE: usize = 4;

/// Offsets are stored as u32 in units of the padding size, so a volume
/// can address at most 4G * 8 = 32 GiB.
pub const MAX_POSSIBLE_VOLUME_SIZE: u64 = 4 * 1024 * 1024 * 1024 * 8;

/// Index size sentinel for a deleted needle
pub const TOMBSTONE_FILE_SIZE: u32 = u32::MAX;

/// Only the low 5 bytes of the modification time are persisted
pub const LAST_MODIFIED_BYTES_LENGTH: usize = 5;

pub const MAX_NAME_LENGTH: usize = u8::MAX as usize;
pub const MAX_MIME_LENGTH: usize = u8::MAX as usize;
pub const MAX_PAIRS_LENGTH: usize = u16::MAX as usize;

// -----------------------------------------------------------------------------
// Flags
// -----------------------------------------------------------------------------

pub const FLAG_GZIP: u8 = 0x01;
pub const FLAG_HAS_NAME: u8 = 0x02;
pub const FLAG_HAS_MIME: u8 = 0x04;
pub const FLAG_HAS_LAST_MODIFIED: u8 = 0x08;
pub const FLAG_HAS_TTL: u8 = 0x10;
pub const FLAG_HAS_PAIRS: u8 = 0x20;
pub const FLAG_IS_CHUNK_MANIFEST: u8 = 0x80;

// =============================================================================
// Version
// =============================================================================

/// Needle record format version, recorded in each volume's superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    V1 = 1,
    V2 = 2,
}

impl Version {
    pub const CURRENT: Version = Version::V2;

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Version::V1),
            2 => Ok(Version::V2),
            other => Err(StorageError::UnsupportedVersion(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_byte())
    }
}

// =============================================================================
// Needle
// =============================================================================

/// One uploaded and stored file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Needle {
    /// Random number that makes ids hard to guess
    pub cookie: u32,
    pub id: u64,

    /// Length of the serialized body (excludes header, checksum and padding)
    pub size: u32,

    /// Length of `data` as recorded in a v2 body
    pub data_size: u32,
    pub data: Bytes,
    pub flags: u8,

    /// At most 255 bytes
    pub name: Bytes,

    /// At most 255 bytes
    pub mime: Bytes,

    /// JSON object of string pairs, at most 64 KiB
    pub pairs: Bytes,

    /// Unix seconds
    pub last_modified: u64,
    pub ttl: Ttl,

    /// CRC32 of `data`
    pub checksum: u32,
}

impl Needle {
    /// Create a needle carrying `data`; the checksum is computed immediately
    pub fn new(id: u64, cookie: u32, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let checksum = checksum(&data);
        Self {
            id,
            cookie,
            data,
            checksum,
            ..Default::default()
        }
    }

    /// Tombstone record for `id`
    pub fn tombstone(id: u64, cookie: u32) -> Self {
        Self::new(id, cookie, Bytes::new())
    }

    pub fn with_name(mut self, name: impl Into<Bytes>) -> Self {
        self.name = name.into();
        self.flags |= FLAG_HAS_NAME;
        self
    }

    pub fn with_mime(mut self, mime: impl Into<Bytes>) -> Self {
        self.mime = mime.into();
        self.flags |= FLAG_HAS_MIME;
        self
    }

    pub fn with_last_modified(mut self, unix_secs: u64) -> Self {
        self.last_modified = unix_secs;
        self.flags |= FLAG_HAS_LAST_MODIFIED;
        self
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        if ttl.is_empty() {
            self.flags &= !FLAG_HAS_TTL;
        } else {
            self.flags |= FLAG_HAS_TTL;
        }
        self
    }

    /// Attach name/value pairs, serialized as a JSON object
    pub fn with_pairs(mut self, pairs: &BTreeMap<String, String>) -> Result<Self> {
        self.set_pairs(pairs)?;
        Ok(self)
    }

    pub fn set_pairs(&mut self, pairs: &BTreeMap<String, String>) -> Result<()> {
        if pairs.is_empty() {
            self.pairs = Bytes::new();
            self.flags &= !FLAG_HAS_PAIRS;
            return Ok(());
        }
        let encoded = serde_json::to_vec(pairs)?;
        if encoded.len() > MAX_PAIRS_LENGTH {
            return Err(StorageError::InvalidNeedle(format!(
                "pairs are {} bytes (max {})",
                encoded.len(),
                MAX_PAIRS_LENGTH
            )));
        }
        self.pairs = Bytes::from(encoded);
        self.flags |= FLAG_HAS_PAIRS;
        Ok(())
    }

    /// Decode the stored pairs (empty when the needle has none)
    pub fn pairs_map(&self) -> Result<BTreeMap<String, String>> {
        if !self.has_pairs() || self.pairs.is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_slice(&self.pairs)?)
    }

    // -------------------------------------------------------------------------
    // Flags
    // -------------------------------------------------------------------------

    pub fn is_gzipped(&self) -> bool {
        self.flags & FLAG_GZIP != 0
    }

    pub fn set_gzipped(&mut self) {
        self.flags |= FLAG_GZIP;
    }

    pub fn has_name(&self) -> bool {
        self.flags & FLAG_HAS_NAME != 0
    }

    pub fn has_mime(&self) -> bool {
        self.flags & FLAG_HAS_MIME != 0
    }

    pub fn has_last_modified(&self) -> bool {
        self.flags & FLAG_HAS_LAST_MODIFIED != 0
    }

    pub fn has_ttl(&self) -> bool {
        self.flags & FLAG_HAS_TTL != 0
    }

    pub fn has_pairs(&self) -> bool {
        self.flags & FLAG_HAS_PAIRS != 0
    }

    pub fn is_chunk_manifest(&self) -> bool {
        self.flags & FLAG_IS_CHUNK_MANIFEST != 0
    }

    pub fn set_chunk_manifest(&mut self) {
        self.flags |= FLAG_IS_CHUNK_MANIFEST;
    }

    // -------------------------------------------------------------------------
    // Sizes and expiry
    // -------------------------------------------------------------------------

    /// On-disk footprint of this needle's last encoded size
    pub fn disk_size(&self) -> u64 {
        disk_size(self.size)
    }

    /// Whether the needle's own TTL has elapsed at `now` (unix seconds).
    ///
    /// Expired iff `now >= last_modified + ttl_minutes * 60`; needles without
    /// a TTL or without a modification time never expire.
    pub fn is_expired_at(&self, now: u64) -> bool {
        if !self.has_ttl() || !self.has_last_modified() {
            return false;
        }
        let minutes = self.ttl.minutes();
        if minutes == 0 {
            return false;
        }
        now >= self.last_modified + u64::from(minutes) * 60
    }
}

impl fmt::Display for Needle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cookie:{}, Id:{}, Size:{}, DataSize:{}, Name: {}, Mime: {}",
            self.cookie,
            self.id,
            self.size,
            self.data_size,
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.mime)
        )
    }
}
