//! Sequential scans of a volume data file
//!
//! Used to rebuild a missing or stale `.idx` file and by offline tooling.

use std::fs::File;
use std::path::Path;

use bytes::Bytes;

use crate::error::{Result, StorageError};
use crate::index::NeedleMap;
use crate::needle::{
    disk_size, Needle, NeedleHeader, Version, NEEDLE_HEADER_SIZE, NEEDLE_PADDING_SIZE,
};

use super::{file_base, read_exact_at, with_suffix, SuperBlock, Volume, VolumeId, SUPER_BLOCK_SIZE};

/// Walk every record of the volume `id` in `dir`.
///
/// `visit_super_block` is called once, then `visit_needle` for each record
/// with its byte offset. With `read_body` the records are fully decoded;
/// otherwise only the header fields are filled. A truncated trailing record
/// ends the scan. The first error returned by a visitor stops the scan and
/// is returned.
pub fn scan_volume_file<S, V>(
    dir: &Path,
    collection: &str,
    id: VolumeId,
    read_body: bool,
    mut visit_super_block: S,
    visit_needle: V,
) -> Result<()>
where
    S: FnMut(&SuperBlock) -> Result<()>,
    V: FnMut(&Needle, u64) -> Result<()>,
{
    let path = with_suffix(&file_base(dir, collection, id), "dat");
    let file = File::open(&path)?;

    let mut buf = [0u8; SUPER_BLOCK_SIZE];
    read_exact_at(&file, &mut buf, 0)?;
    let super_block = SuperBlock::parse(&buf)?;
    visit_super_block(&super_block)?;

    scan_records(&file, super_block.version, read_body, visit_needle)?;
    Ok(())
}

/// Visit each record after the superblock. Returns the number of records.
pub(crate) fn scan_records<V>(
    file: &File,
    version: Version,
    read_body: bool,
    mut visit: V,
) -> Result<u64>
where
    V: FnMut(&Needle, u64) -> Result<()>,
{
    let len = file.metadata()?.len();
    let mut offset = SUPER_BLOCK_SIZE as u64;
    let mut records = 0u64;
    let mut header_buf = [0u8; NEEDLE_HEADER_SIZE];

    while offset + NEEDLE_HEADER_SIZE as u64 <= len {
        read_exact_at(file, &mut header_buf, offset)?;
        let header = NeedleHeader::parse(&header_buf)?;
        let record_len = disk_size(header.size);

        if offset + record_len > len {
            tracing::warn!(
                "record at {} claims {} bytes but only {} remain, stopping scan",
                offset,
                record_len,
                len - offset
            );
            break;
        }

        let mut n = Needle {
            cookie: header.cookie,
            id: header.id,
            size: header.size,
            ..Default::default()
        };

        if read_body && header.size > 0 {
            let mut body = vec![0u8; header.size as usize];
            read_exact_at(file, &mut body, offset + NEEDLE_HEADER_SIZE as u64)?;
            n.decode_body(Bytes::from(body), version);
            n.checksum = crate::needle::checksum(&n.data);

            // Some old releases wrote a data length that does not fit the
            // body; such records count as empty.
            if version == Version::V2 && n.data_size >= n.size {
                tracing::debug!(
                    "needle {:x} at {}: data size {} >= size {}, treating as empty",
                    n.id,
                    offset,
                    n.data_size,
                    n.size
                );
                n.size = 0;
            }
        }

        visit(&n, offset)?;
        records += 1;
        offset += record_len;
    }

    Ok(records)
}

/// Build a fresh `.idx` at `idx_path` from the records in `data`.
/// Also returns the number of records indexed.
pub(crate) fn build_index(
    data: &File,
    version: Version,
    idx_path: &Path,
) -> Result<(NeedleMap, u64)> {
    let nm = NeedleMap::create(idx_path)?;
    let records = scan_records(data, version, false, |n, offset| {
        let slot = (offset / NEEDLE_PADDING_SIZE) as u32;
        if n.size > 0 {
            nm.put(n.id, slot, n.size)
        } else {
            nm.delete(n.id, slot).map(|_| ())
        }
    })?;
    nm.sync()?;
    tracing::info!(
        "rebuilt index {} from {} records",
        idx_path.display(),
        records
    );
    Ok((nm, records))
}

impl Volume {
    /// Recreate the `.idx` file of volume `id` from a full scan of its data
    /// file. Returns the number of records indexed.
    ///
    /// The volume must not be open in this process.
    pub fn rebuild_index(dir: &Path, collection: &str, id: VolumeId) -> Result<u64> {
        let base = file_base(dir, collection, id);
        let dat_path = with_suffix(&base, "dat");
        if !dat_path.exists() {
            return Err(StorageError::VolumeNotFound(id));
        }
        let file = File::open(&dat_path)?;

        let mut buf = [0u8; SUPER_BLOCK_SIZE];
        read_exact_at(&file, &mut buf, 0)?;
        let super_block = SuperBlock::parse(&buf)?;

        let (_, records) = build_index(&file, super_block.version, &with_suffix(&base, "idx"))?;
        Ok(records)
    }
}
