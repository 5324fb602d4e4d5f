//! Index Module
//!
//! Maps needle ids to where their records live in a volume.
//!
//! ## Responsibilities
//! - Point lookup of `(offset, size)` by needle id in O(log n)
//! - Cheap storage for mostly-ascending keys (see [`CompactMap`])
//! - Persisting every mutation to the companion `.idx` file
//! - File and deletion accounting per volume
//!
//! ## Index File Format
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Entry (16 bytes, big-endian)           │
//! │ ┌──────────┬────────────┬───────────┐  │
//! │ │ Key (8)  │ Offset (4) │ Size (4)  │  │
//! │ └──────────┴────────────┴───────────┘  │
//! │ ... one entry per put or delete ...    │
//! └────────────────────────────────────────┘
//! ```
//! `Offset` is in 8-byte units. `Size = u32::MAX` records a deletion.

mod compact_map;
mod needle_map;
mod section;

pub use compact_map::CompactMap;
pub use needle_map::{NeedleMap, INDEX_ENTRY_SIZE};
pub(crate) use needle_map::read_last_entry;
pub use section::{CompactSection, SearchResult, SECTION_BATCH};

use crate::needle::TOMBSTONE_FILE_SIZE;

/// One index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeedleValue {
    pub key: u64,
    /// Volume offset in 8-byte units; 32 GiB addressable
    pub offset: u32,
    /// Body size of the record, or [`TOMBSTONE_FILE_SIZE`] once deleted
    pub size: u32,
}

impl NeedleValue {
    pub fn new(key: u64, offset: u32, size: u32) -> Self {
        Self { key, offset, size }
    }

    pub fn is_deleted(&self) -> bool {
        self.size == TOMBSTONE_FILE_SIZE
    }
}
