//! Volume superblock
//!
//! ## Format (8 bytes)
//! ```text
//! ┌─────────────┬──────────────────┬──────────┬──────────────┐
//! │ Version (1) │ Replication (1)  │ TTL (2)  │ Reserved (4) │
//! └─────────────┴──────────────────┴──────────┴──────────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::needle::{Ttl, Version};

/// Size of the superblock at the start of every data file
pub const SUPER_BLOCK_SIZE: usize = 8;

// =============================================================================
// Replica Placement
// =============================================================================

/// How many extra copies of a volume the cluster keeps, written `"xyz"`:
/// x in other data centers, y on other racks, z on the same rack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ReplicaPlacement {
    pub diff_data_center_count: u8,
    pub diff_rack_count: u8,
    pub same_rack_count: u8,
}

impl ReplicaPlacement {
    pub fn from_byte(b: u8) -> Result<Self> {
        format!("{:03}", b).parse()
    }

    pub fn as_byte(&self) -> u8 {
        self.packed() as u8
    }

    fn packed(&self) -> u16 {
        u16::from(self.diff_data_center_count) * 100
            + u16::from(self.diff_rack_count) * 10
            + u16::from(self.same_rack_count)
    }

    /// Total number of copies including the original
    pub fn copy_count(&self) -> usize {
        usize::from(self.diff_data_center_count)
            + usize::from(self.diff_rack_count)
            + usize::from(self.same_rack_count)
            + 1
    }
}

impl FromStr for ReplicaPlacement {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        let digits: Vec<u8> = s
            .chars()
            .map(|c| {
                c.to_digit(10)
                    .map(|d| d as u8)
                    .ok_or_else(|| StorageError::InvalidReplicaPlacement(s.to_string()))
            })
            .collect::<Result<_>>()?;

        // Short forms are right-aligned: "1" == "001"
        if digits.len() > 3 {
            return Err(StorageError::InvalidReplicaPlacement(s.to_string()));
        }
        let mut padded = [0u8; 3];
        padded[3 - digits.len()..].copy_from_slice(&digits);

        let rp = Self {
            diff_data_center_count: padded[0],
            diff_rack_count: padded[1],
            same_rack_count: padded[2],
        };
        // Must fit the single superblock byte
        if rp.packed() > u16::from(u8::MAX) {
            return Err(StorageError::InvalidReplicaPlacement(s.to_string()));
        }
        Ok(rp)
    }
}

impl fmt::Display for ReplicaPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.diff_data_center_count, self.diff_rack_count, self.same_rack_count
        )
    }
}

// =============================================================================
// SuperBlock
// =============================================================================

/// Volume-wide metadata stored in the first bytes of the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub version: Version,
    pub replica_placement: ReplicaPlacement,
    pub ttl: Ttl,
}

impl SuperBlock {
    pub fn new(replica_placement: ReplicaPlacement, ttl: Ttl) -> Self {
        Self {
            version: Version::CURRENT,
            replica_placement,
            ttl,
        }
    }

    pub fn to_bytes(&self) -> [u8; SUPER_BLOCK_SIZE] {
        let mut bytes = [0u8; SUPER_BLOCK_SIZE];
        bytes[0] = self.version.as_byte();
        bytes[1] = self.replica_placement.as_byte();
        bytes[2..4].copy_from_slice(&self.ttl.to_bytes());
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SUPER_BLOCK_SIZE {
            return Err(StorageError::CorruptRecord(format!(
                "superblock needs {} bytes, got {}",
                SUPER_BLOCK_SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            version: Version::from_byte(bytes[0])?,
            replica_placement: ReplicaPlacement::from_byte(bytes[1])?,
            ttl: Ttl::from_bytes([bytes[2], bytes[3]]),
        })
    }
}

impl Default for SuperBlock {
    fn default() -> Self {
        Self::new(ReplicaPlacement::default(), Ttl::EMPTY)
    }
}
