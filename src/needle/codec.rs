//! Needle Codec
//!
//! Encodes needles into their on-disk records and decodes them back.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, StorageError};

use super::{
    Needle, Ttl, Version, LAST_MODIFIED_BYTES_LENGTH, MAX_MIME_LENGTH, MAX_NAME_LENGTH,
    MAX_PAIRS_LENGTH, NEEDLE_CHECKSUM_SIZE, NEEDLE_HEADER_SIZE, NEEDLE_PADDING_SIZE,
    TOMBSTONE_FILE_SIZE, TTL_BYTES_LENGTH,
};

/// CRC32 of a needle payload
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Recompute the CRC32 of `data` and compare it to the stored value
pub fn verify_checksum(data: &[u8], stored: u32) -> bool {
    checksum(data) == stored
}

/// Narrow a body length to the header field. `TOMBSTONE_FILE_SIZE` is
/// reserved for deletions and cannot be a body length.
fn body_size(size: u64) -> Result<u32> {
    match u32::try_from(size) {
        Ok(size) if size != TOMBSTONE_FILE_SIZE => Ok(size),
        _ => Err(StorageError::InvalidNeedle(format!(
            "record body of {} bytes does not fit the size field",
            size
        ))),
    }
}

/// Total bytes a record with body length `size` occupies on disk:
/// header + body + checksum, rounded up to the padding size.
pub fn disk_size(size: u32) -> u64 {
    let raw = (NEEDLE_HEADER_SIZE + NEEDLE_CHECKSUM_SIZE) as u64 + u64::from(size);
    raw.div_ceil(NEEDLE_PADDING_SIZE) * NEEDLE_PADDING_SIZE
}

fn padding_length(size: u32) -> usize {
    let raw = (NEEDLE_HEADER_SIZE + NEEDLE_CHECKSUM_SIZE) as u64 + u64::from(size);
    (disk_size(size) - raw) as usize
}

// =============================================================================
// Header
// =============================================================================

/// The fixed 16-byte prefix of every record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleHeader {
    pub cookie: u32,
    pub id: u64,
    pub size: u32,
}

impl NeedleHeader {
    /// Parse the first 16 bytes of `bytes`
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NEEDLE_HEADER_SIZE {
            return Err(StorageError::CorruptRecord(format!(
                "needle header needs {} bytes, got {}",
                NEEDLE_HEADER_SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            cookie: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            id: u64::from_be_bytes([
                bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11],
            ]),
            size: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }

    /// Bytes that follow the header: body + checksum + padding
    pub fn rest_length(&self) -> u64 {
        disk_size(self.size) - NEEDLE_HEADER_SIZE as u64
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Output of [`Needle::encode`]
#[derive(Debug, Clone)]
pub struct EncodedNeedle {
    /// The complete record, padding included
    pub bytes: Bytes,
    /// Body length written into the header
    pub size: u32,
    /// Payload length
    pub data_size: u32,
    /// `bytes.len()`, always a multiple of 8
    pub disk_size: u64,
}

impl Needle {
    /// Serialize this needle for `version`.
    ///
    /// Updates `size`, `data_size` and `checksum` to match what was written.
    pub fn encode(&mut self, version: Version) -> Result<EncodedNeedle> {
        self.validate()?;

        let data_size = u32::try_from(self.data.len()).map_err(|_| {
            StorageError::InvalidNeedle(format!("data is too large: {} bytes", self.data.len()))
        })?;
        self.data_size = data_size;
        self.checksum = super::checksum(&self.data);

        self.size = match version {
            Version::V1 => body_size(u64::from(data_size))?,
            Version::V2 => self.body_size_v2()?,
        };

        let disk_size = disk_size(self.size);
        let mut buf = BytesMut::with_capacity(disk_size as usize);

        // Header
        buf.put_u32(self.cookie);
        buf.put_u64(self.id);
        buf.put_u32(self.size);

        // Body
        match version {
            Version::V1 => buf.put_slice(&self.data),
            Version::V2 => {
                if data_size > 0 {
                    self.put_body_v2(&mut buf);
                }
            }
        }

        // Footer
        buf.put_u32(self.checksum);
        buf.put_bytes(0, padding_length(self.size));

        debug_assert_eq!(buf.len() as u64, disk_size);

        Ok(EncodedNeedle {
            bytes: buf.freeze(),
            size: self.size,
            data_size,
            disk_size,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.has_name() && self.name.len() > MAX_NAME_LENGTH {
            return Err(StorageError::InvalidNeedle(format!(
                "name is {} bytes (max {})",
                self.name.len(),
                MAX_NAME_LENGTH
            )));
        }
        if self.has_mime() && self.mime.len() > MAX_MIME_LENGTH {
            return Err(StorageError::InvalidNeedle(format!(
                "mime is {} bytes (max {})",
                self.mime.len(),
                MAX_MIME_LENGTH
            )));
        }
        if self.has_pairs() && self.pairs.len() > MAX_PAIRS_LENGTH {
            return Err(StorageError::InvalidNeedle(format!(
                "pairs are {} bytes (max {})",
                self.pairs.len(),
                MAX_PAIRS_LENGTH
            )));
        }
        Ok(())
    }

    /// Composite v2 body length; 0 when there is no data
    fn body_size_v2(&self) -> Result<u32> {
        if self.data.is_empty() {
            return Ok(0);
        }
        let len = |b: &Bytes| b.len() as u64;
        let mut size = 4 + len(&self.data) + 1;
        if self.has_name() {
            size += 1 + len(&self.name);
        }
        if self.has_mime() {
            size += 1 + len(&self.mime);
        }
        if self.has_last_modified() {
            size += LAST_MODIFIED_BYTES_LENGTH as u64;
        }
        if self.has_ttl() {
            size += TTL_BYTES_LENGTH as u64;
        }
        if self.has_pairs() {
            size += 2 + len(&self.pairs);
        }
        body_size(size)
    }

    fn put_body_v2(&self, buf: &mut BytesMut) {
        buf.put_u32(self.data_size);
        buf.put_slice(&self.data);
        buf.put_u8(self.flags);
        if self.has_name() {
            buf.put_u8(self.name.len() as u8);
            buf.put_slice(&self.name);
        }
        if self.has_mime() {
            buf.put_u8(self.mime.len() as u8);
            buf.put_slice(&self.mime);
        }
        if self.has_last_modified() {
            let ts = self.last_modified.to_be_bytes();
            buf.put_slice(&ts[8 - LAST_MODIFIED_BYTES_LENGTH..]);
        }
        if self.has_ttl() {
            buf.put_slice(&self.ttl.to_bytes());
        }
        if self.has_pairs() {
            buf.put_u16(self.pairs.len() as u16);
            buf.put_slice(&self.pairs);
        }
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    /// Fill in the fields carried by a record body of `self.size` bytes.
    ///
    /// Returns `false` if a v2 body ended before all flagged fields were
    /// read. Records written by some old releases declared a data length
    /// longer than the body; those are kept as-is with the remaining fields
    /// unset instead of being rejected.
    pub fn decode_body(&mut self, body: Bytes, version: Version) -> bool {
        match version {
            Version::V1 => {
                self.data_size = body.len() as u32;
                self.data = body;
                true
            }
            Version::V2 => self.decode_body_v2(body),
        }
    }

    fn decode_body_v2(&mut self, body: Bytes) -> bool {
        let len = body.len();
        if len == 0 {
            return true;
        }
        if len < 4 {
            return false;
        }

        self.data_size = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let mut index = 4;
        let data_end = index + self.data_size as usize;
        if data_end > len {
            return false;
        }
        self.data = body.slice(index..data_end);
        index = data_end;

        if index >= len {
            return false;
        }
        self.flags = body[index];
        index += 1;

        if index < len && self.has_name() {
            let n = body[index] as usize;
            index += 1;
            if index + n > len {
                return false;
            }
            self.name = body.slice(index..index + n);
            index += n;
        }
        if index < len && self.has_mime() {
            let n = body[index] as usize;
            index += 1;
            if index + n > len {
                return false;
            }
            self.mime = body.slice(index..index + n);
            index += n;
        }
        if index < len && self.has_last_modified() {
            if index + LAST_MODIFIED_BYTES_LENGTH > len {
                return false;
            }
            let mut ts = [0u8; 8];
            ts[8 - LAST_MODIFIED_BYTES_LENGTH..]
                .copy_from_slice(&body[index..index + LAST_MODIFIED_BYTES_LENGTH]);
            self.last_modified = u64::from_be_bytes(ts);
            index += LAST_MODIFIED_BYTES_LENGTH;
        }
        if index < len && self.has_ttl() {
            if index + TTL_BYTES_LENGTH > len {
                return false;
            }
            self.ttl = Ttl::from_bytes([body[index], body[index + 1]]);
            index += TTL_BYTES_LENGTH;
        }
        if index < len && self.has_pairs() {
            if index + 2 > len {
                return false;
            }
            let n = u16::from_be_bytes([body[index], body[index + 1]]) as usize;
            index += 2;
            if index + n > len {
                return false;
            }
            self.pairs = body.slice(index..index + n);
        }
        true
    }

    /// Decode one complete record read from disk.
    ///
    /// `expected_size` is the size the index holds for this needle; a header
    /// that disagrees means the index points at the wrong bytes.
    pub fn from_record(record: Bytes, expected_size: u32, version: Version) -> Result<Needle> {
        let header = NeedleHeader::parse(&record)?;
        if header.size != expected_size {
            return Err(StorageError::CorruptRecord(format!(
                "needle {:x} header size {} does not match index size {}",
                header.id, header.size, expected_size
            )));
        }

        let body_end = NEEDLE_HEADER_SIZE + header.size as usize;
        let checksum_end = body_end + NEEDLE_CHECKSUM_SIZE;
        if record.len() < checksum_end {
            return Err(StorageError::CorruptRecord(format!(
                "needle {:x} record is {} bytes, expected at least {}",
                header.id,
                record.len(),
                checksum_end
            )));
        }

        let mut n = Needle {
            cookie: header.cookie,
            id: header.id,
            size: header.size,
            ..Default::default()
        };
        let complete = n.decode_body(record.slice(NEEDLE_HEADER_SIZE..body_end), version);

        if header.size == 0 {
            return Ok(n);
        }

        let stored = u32::from_be_bytes([
            record[body_end],
            record[body_end + 1],
            record[body_end + 2],
            record[body_end + 3],
        ]);

        if !complete {
            tracing::warn!(
                needle = n.id,
                size = n.size,
                data_size = n.data_size,
                "malformed legacy record, skipping checksum verification"
            );
            n.checksum = super::checksum(&n.data);
            return Ok(n);
        }

        if !verify_checksum(&n.data, stored) {
            return Err(StorageError::CorruptRecord(format!(
                "needle {:x} CRC mismatch, data on disk corrupted",
                n.id
            )));
        }
        n.checksum = stored;
        Ok(n)
    }
}
