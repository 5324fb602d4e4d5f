//! File ids
//!
//! A file id is how front ends address a needle: `<volume id>,<key><cookie>`,
//! where the key is lower-case hex and the cookie is always the last eight
//! hex digits.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StorageError};
use crate::volume::VolumeId;

use super::Needle;

/// Fully qualified address of one needle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub volume_id: VolumeId,
    pub key: u64,
    pub cookie: u32,
}

impl FileId {
    pub fn new(volume_id: VolumeId, key: u64, cookie: u32) -> Self {
        Self {
            volume_id,
            key,
            cookie,
        }
    }

    pub fn from_needle(volume_id: VolumeId, n: &Needle) -> Self {
        Self::new(volume_id, n.id, n.cookie)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{:x}{:08x}", self.volume_id, self.key, self.cookie)
    }
}

impl FromStr for FileId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        let (vid, key_hash) = s
            .split_once(',')
            .ok_or_else(|| StorageError::InvalidFileId(format!("missing ',' in {:?}", s)))?;
        let volume_id: VolumeId = vid.parse()?;
        let (key, cookie) = parse_key_hash(key_hash)?;
        Ok(Self::new(volume_id, key, cookie))
    }
}

/// Split `<key hex><cookie 8 hex>` into its key and cookie
pub fn parse_key_hash(key_hash: &str) -> Result<(u64, u32)> {
    if key_hash.len() <= 8 {
        return Err(StorageError::InvalidFileId(format!(
            "key hash {:?} is too short",
            key_hash
        )));
    }
    if key_hash.len() > 24 {
        return Err(StorageError::InvalidFileId(format!(
            "key hash {:?} is too long",
            key_hash
        )));
    }
    if !key_hash.is_ascii() {
        return Err(StorageError::InvalidFileId(format!(
            "key hash {:?} is not hex",
            key_hash
        )));
    }

    let split = key_hash.len() - 8;
    let key = u64::from_str_radix(&key_hash[..split], 16)
        .map_err(|e| StorageError::InvalidFileId(format!("parse key error: {}", e)))?;
    let cookie = u32::from_str_radix(&key_hash[split..], 16)
        .map_err(|e| StorageError::InvalidFileId(format!("parse cookie error: {}", e)))?;
    Ok((key, cookie))
}
