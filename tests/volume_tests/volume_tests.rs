//! Tests for Volume
//!
//! These tests verify:
//! - Write, read and delete of single needles
//! - Record alignment and data file growth
//! - Deduplication of unchanged writes
//! - Read-only and destroyed volumes
//! - Index persistence and rebuild from the data file
//! - Needle and volume TTL handling
//! - The hard size ceiling and writes racing a destroy

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use needlestore::needle::{disk_size, Needle, Ttl, Version, MAX_POSSIBLE_VOLUME_SIZE};
use needlestore::volume::{
    now_unix, ReplicaPlacement, Volume, VolumeId, VolumeState, SUPER_BLOCK_SIZE,
};
use needlestore::StorageError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_volume(dir: &Path, id: u32) -> Volume {
    Volume::open(
        dir,
        "",
        VolumeId(id),
        ReplicaPlacement::default(),
        Ttl::EMPTY,
        0,
    )
    .unwrap()
}

fn read_data(v: &Volume, id: u64) -> Result<Vec<u8>, StorageError> {
    let mut n = Needle {
        id,
        ..Default::default()
    };
    v.read(&mut n)?;
    Ok(n.data.to_vec())
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_write_read_delete_roundtrip() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 7);
    assert_eq!(v.data_file_size(), SUPER_BLOCK_SIZE as u64);
    assert!(temp.path().join("7.dat").exists());

    let mut n = Needle::new(42, 0xABCD, &b"hello"[..]);
    assert_eq!(v.write(&mut n).unwrap(), 5);
    assert_eq!(v.data_file_size(), 8 + 32);
    assert_eq!(v.file_count(), 1);
    assert_eq!(v.max_file_key(), 42);

    let mut out = Needle {
        id: 42,
        ..Default::default()
    };
    assert_eq!(v.read(&mut out).unwrap(), 5);
    assert_eq!(&out.data[..], b"hello");
    assert_eq!(out.cookie, 0xABCD);

    let freed = v.delete(&Needle::tombstone(42, 0xABCD)).unwrap();
    assert_eq!(freed, 10);
    assert_eq!(v.data_file_size(), 8 + 32 + 24);
    assert_eq!(v.deleted_count(), 1);

    assert!(matches!(
        read_data(&v, 42),
        Err(StorageError::NotFound(42))
    ));
    assert_eq!(v.delete(&Needle::tombstone(42, 0xABCD)).unwrap(), 0);
    assert_eq!(v.data_file_size(), 8 + 32 + 24);
}

#[test]
fn test_read_missing_needle() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 1);
    assert!(read_data(&v, 1).unwrap_err().is_not_found());
    assert_eq!(v.delete(&Needle::tombstone(1, 0)).unwrap(), 0);
}

#[test]
fn test_empty_data_is_rejected() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 1);

    let mut n = Needle::new(1, 1, Vec::new());
    assert!(matches!(
        v.write(&mut n),
        Err(StorageError::InvalidNeedle(_))
    ));
    assert_eq!(v.data_file_size(), SUPER_BLOCK_SIZE as u64);
}

#[test]
fn test_collection_file_names() {
    let temp = TempDir::new().unwrap();
    let v = Volume::open(
        temp.path(),
        "pics",
        VolumeId(3),
        ReplicaPlacement::default(),
        Ttl::EMPTY,
        0,
    )
    .unwrap();

    assert_eq!(v.data_file_path(), temp.path().join("pics_3.dat"));
    assert_eq!(v.index_file_path(), temp.path().join("pics_3.idx"));
    assert!(v.data_file_path().exists());
    assert!(v.index_file_path().exists());
}

// =============================================================================
// Alignment
// =============================================================================

#[test]
fn test_records_are_aligned() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 1);

    for id in 1..=20u64 {
        let before = v.data_file_size();
        let mut n = Needle::new(id, 1, vec![id as u8; id as usize * 3]);
        v.write(&mut n).unwrap();

        let entry = v.index_entry(id).unwrap();
        assert_eq!(u64::from(entry.offset) * 8, before);
        assert_eq!(v.data_file_size() % 8, 0);
    }
}

#[test]
fn test_unaligned_tail_is_skipped() {
    let temp = TempDir::new().unwrap();
    {
        let v = open_volume(temp.path(), 1);
        v.write(&mut Needle::new(1, 1, &b"first"[..])).unwrap();
        v.close().unwrap();
    }
    {
        let mut file = OpenOptions::new()
            .append(true)
            .open(temp.path().join("1.dat"))
            .unwrap();
        file.write_all(&[9, 9, 9]).unwrap();
    }

    let v = open_volume(temp.path(), 1);
    assert_eq!(v.data_file_size(), 8 + 32 + 3);

    v.write(&mut Needle::new(2, 1, &b"second"[..])).unwrap();
    let entry = v.index_entry(2).unwrap();
    assert_eq!(u64::from(entry.offset) * 8, 48);

    assert_eq!(read_data(&v, 1).unwrap(), b"first");
    assert_eq!(read_data(&v, 2).unwrap(), b"second");
}

// =============================================================================
// Deduplication
// =============================================================================

#[test]
fn test_unchanged_write_is_skipped() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 1);

    assert_eq!(v.write(&mut Needle::new(1, 1, &b"same"[..])).unwrap(), 4);
    let size = v.data_file_size();

    assert_eq!(v.write(&mut Needle::new(1, 1, &b"same"[..])).unwrap(), 4);
    assert_eq!(v.data_file_size(), size);
    assert_eq!(v.file_count(), 1);

    v.write(&mut Needle::new(1, 1, &b"different"[..])).unwrap();
    assert!(v.data_file_size() > size);
    assert_eq!(v.file_count(), 2);
    assert_eq!(v.deleted_count(), 1);
    assert_eq!(read_data(&v, 1).unwrap(), b"different");
}

#[test]
fn test_ttl_disables_dedup() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 1);
    let ttl: Ttl = "1h".parse().unwrap();

    v.write(&mut Needle::new(1, 1, &b"same"[..]).with_ttl(ttl)).unwrap();
    let size = v.data_file_size();
    v.write(&mut Needle::new(1, 1, &b"same"[..]).with_ttl(ttl)).unwrap();
    assert!(v.data_file_size() > size);

    let v = Volume::open(
        temp.path(),
        "",
        VolumeId(2),
        ReplicaPlacement::default(),
        ttl,
        0,
    )
    .unwrap();
    v.write(&mut Needle::new(1, 1, &b"same"[..])).unwrap();
    let size = v.data_file_size();
    v.write(&mut Needle::new(1, 1, &b"same"[..])).unwrap();
    assert!(v.data_file_size() > size);
}

// =============================================================================
// State
// =============================================================================

#[test]
fn test_read_only_rejects_mutations() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 5);
    v.write(&mut Needle::new(1, 1, &b"keep"[..])).unwrap();

    v.set_read_only(true).unwrap();
    assert!(v.is_read_only());
    assert_eq!(v.state(), VolumeState::ReadOnly);

    assert!(matches!(
        v.write(&mut Needle::new(2, 1, &b"new"[..])),
        Err(StorageError::ReadOnlyVolume(VolumeId(5)))
    ));
    assert!(matches!(
        v.delete(&Needle::tombstone(1, 1)),
        Err(StorageError::ReadOnlyVolume(_))
    ));
    assert!(matches!(v.destroy(), Err(StorageError::ReadOnlyVolume(_))));
    assert_eq!(read_data(&v, 1).unwrap(), b"keep");

    v.set_read_only(false).unwrap();
    v.write(&mut Needle::new(2, 1, &b"new"[..])).unwrap();
}

#[test]
fn test_destroy_removes_files() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 9);
    v.write(&mut Needle::new(1, 1, &b"bye"[..])).unwrap();

    v.destroy().unwrap();
    assert_eq!(v.state(), VolumeState::Destroyed);
    assert!(!temp.path().join("9.dat").exists());
    assert!(!temp.path().join("9.idx").exists());
    assert!(matches!(
        read_data(&v, 1),
        Err(StorageError::VolumeNotFound(VolumeId(9)))
    ));
}

#[test]
fn test_corrupted_data_is_detected() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 1);
    v.write(&mut Needle::new(1, 1, &b"pristine"[..])).unwrap();

    {
        let mut file = OpenOptions::new()
            .write(true)
            .open(temp.path().join("1.dat"))
            .unwrap();
        // superblock (8) + header (16) + data size (4)
        file.seek(SeekFrom::Start(28)).unwrap();
        file.write_all(b"X").unwrap();
    }

    assert!(matches!(
        read_data(&v, 1),
        Err(StorageError::CorruptRecord(_))
    ));
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_reopen_keeps_super_block() {
    let temp = TempDir::new().unwrap();
    let rp: ReplicaPlacement = "001".parse().unwrap();
    let ttl: Ttl = "1h".parse().unwrap();
    {
        let v = Volume::open(temp.path(), "c", VolumeId(4), rp, ttl, 0).unwrap();
        v.close().unwrap();
    }

    let v = Volume::load(temp.path(), "c", VolumeId(4)).unwrap();
    assert_eq!(v.replica_placement(), rp);
    assert_eq!(v.ttl(), ttl);
    assert_eq!(v.version(), Version::CURRENT);
}

fn populate(v: &Volume) {
    for id in 1..=10u64 {
        v.write(&mut Needle::new(id, id as u32, format!("needle-{}", id)))
            .unwrap();
    }
    v.write(&mut Needle::new(3, 3, &b"rewritten"[..])).unwrap();
    v.delete(&Needle::tombstone(5, 5)).unwrap();
    v.delete(&Needle::tombstone(7, 7)).unwrap();
}

fn snapshot(v: &Volume) -> (Vec<Option<(u32, u32)>>, [u64; 5]) {
    let entries = (0..=11u64)
        .map(|id| v.index_entry(id).map(|e| (e.offset, e.size)))
        .collect();
    let counters = [
        v.file_count(),
        v.deleted_count(),
        v.deleted_size(),
        v.content_size(),
        v.max_file_key(),
    ];
    (entries, counters)
}

#[test]
fn test_index_load_matches_rebuild() {
    let temp = TempDir::new().unwrap();
    let expected = {
        let v = open_volume(temp.path(), 1);
        populate(&v);
        v.close().unwrap();
        snapshot(&v)
    };

    // Reopen through the .idx file
    {
        let v = open_volume(temp.path(), 1);
        assert_eq!(snapshot(&v), expected);
    }

    // Reopen without it
    fs::remove_file(temp.path().join("1.idx")).unwrap();
    let v = open_volume(temp.path(), 1);
    assert_eq!(snapshot(&v), expected);
    assert!(temp.path().join("1.idx").exists());

    assert_eq!(read_data(&v, 3).unwrap(), b"rewritten");
    assert!(read_data(&v, 5).unwrap_err().is_not_found());
    assert_eq!(read_data(&v, 10).unwrap(), b"needle-10");
}

#[test]
fn test_stale_index_is_rebuilt() {
    let temp = TempDir::new().unwrap();
    let idx = temp.path().join("1.idx");
    let stale = temp.path().join("stale.idx");
    {
        let v = open_volume(temp.path(), 1);
        v.write(&mut Needle::new(1, 1, &b"one"[..])).unwrap();
        v.close().unwrap();
        fs::copy(&idx, &stale).unwrap();
        v.write(&mut Needle::new(2, 1, &b"two"[..])).unwrap();
        v.close().unwrap();
    }
    fs::rename(&stale, &idx).unwrap();

    let v = open_volume(temp.path(), 1);
    assert_eq!(read_data(&v, 1).unwrap(), b"one");
    assert_eq!(read_data(&v, 2).unwrap(), b"two");
    assert_eq!(v.file_count(), 2);
}

// =============================================================================
// TTL
// =============================================================================

#[test]
fn test_needle_ttl_expiry_on_read() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 1);
    let mut n = Needle::new(1, 1, &b"short lived"[..])
        .with_last_modified(1_000)
        .with_ttl("1m".parse().unwrap());
    v.write(&mut n).unwrap();

    let mut out = Needle {
        id: 1,
        ..Default::default()
    };
    assert_eq!(v.read_at(&mut out, 1_059).unwrap(), 11);

    let mut out = Needle {
        id: 1,
        ..Default::default()
    };
    assert!(matches!(
        v.read_at(&mut out, 1_060),
        Err(StorageError::NotFound(1))
    ));
}

#[test]
fn test_volume_expiry() {
    let temp = TempDir::new().unwrap();
    let v = Volume::open(
        temp.path(),
        "",
        VolumeId(1),
        ReplicaPlacement::default(),
        "1h".parse().unwrap(),
        0,
    )
    .unwrap();

    // Empty volumes never expire
    let lm = v.last_modified_time();
    assert!(!v.expired_at(1, lm + 1_000_000));

    v.write(&mut Needle::new(1, 1, &b"x"[..])).unwrap();
    let lm = v.last_modified_time();

    assert!(!v.expired_at(0, lm + 1_000_000));
    assert!(!v.expired_at(1, lm + 60 * 60));
    assert!(v.expired_at(1, lm + 61 * 60));
    assert_eq!(v.lifecycle_at(1, lm + 61 * 60), VolumeState::Expired);
    assert_eq!(v.lifecycle_at(1, lm), VolumeState::Ready);

    // Grace period: min(60 / 10, 10) = 6 minutes
    assert!(!v.expired_long_enough_at(10, lm + 66 * 60));
    assert!(v.expired_long_enough_at(10, lm + 66 * 60 + 1));
    assert!(!v.expired_long_enough_at(2, lm + 62 * 60));
    assert!(v.expired_long_enough_at(2, lm + 62 * 60 + 1));
}

#[test]
fn test_volume_without_ttl_never_expires() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 1);
    v.write(&mut Needle::new(1, 1, &b"x"[..])).unwrap();

    assert!(!v.expired_at(1, u64::MAX / 2));
    assert!(!v.expired_long_enough_at(10, u64::MAX / 2));
}

// =============================================================================
// Replication Catch-up
// =============================================================================

#[test]
fn test_append_blob() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 1);

    let mut n = Needle::new(8, 2, &b"replicated"[..]);
    let encoded = n.encode(Version::V2).unwrap();
    let offset = v.append_blob(&encoded.bytes).unwrap();
    assert_eq!(offset, SUPER_BLOCK_SIZE as u64);
    assert_eq!(read_data(&v, 8).unwrap(), b"replicated");

    let mut tombstone = Needle::tombstone(8, 2);
    let encoded = tombstone.encode(Version::V2).unwrap();
    v.append_blob(&encoded.bytes).unwrap();
    assert!(read_data(&v, 8).unwrap_err().is_not_found());

    assert!(matches!(
        v.append_blob(&encoded.bytes[..20]),
        Err(StorageError::CorruptRecord(_))
    ));
}

#[test]
fn test_write_without_timestamp_uses_clock() {
    let temp = TempDir::new().unwrap();
    let v = open_volume(temp.path(), 1);
    let before = now_unix();
    v.write(&mut Needle::new(1, 1, &b"now"[..])).unwrap();
    assert!(v.last_modified_time() >= before);
    assert!(v.last_modified_time() <= now_unix());
}

// =============================================================================
// Limits
// =============================================================================

fn write_header(file: &mut std::fs::File, offset: u64, id: u64, size: u32) {
    let mut header = Vec::with_capacity(16);
    header.extend_from_slice(&1u32.to_be_bytes());
    header.extend_from_slice(&id.to_be_bytes());
    header.extend_from_slice(&size.to_be_bytes());
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&header).unwrap();
}

#[test]
fn test_hard_size_ceiling() {
    let temp = TempDir::new().unwrap();
    open_volume(temp.path(), 1).close().unwrap();

    // Fill the data file up to 8 bytes short of the ceiling with records
    // whose bodies are sparse holes: eight of 4 GiB - 8 bytes and a last
    // one of 48 bytes. Only headers are read when the index is rebuilt.
    let end = MAX_POSSIBLE_VOLUME_SIZE - 8;
    let big = u32::MAX - 27;
    assert_eq!(disk_size(big), 4 * 1024 * 1024 * 1024 - 8);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .open(temp.path().join("1.dat"))
            .unwrap();
        let mut offset = SUPER_BLOCK_SIZE as u64;
        let mut id = 1u64;
        while end - offset > disk_size(big) {
            write_header(&mut file, offset, id, big);
            offset += disk_size(big);
            id += 1;
        }
        let last = (end - offset - 20) as u32;
        assert_eq!(disk_size(last), end - offset);
        write_header(&mut file, offset, id, last);
        file.set_len(end).unwrap();
    }

    let v = open_volume(temp.path(), 1);
    assert_eq!(v.data_file_size(), end);
    assert_eq!(v.file_count(), 9);

    assert!(matches!(
        v.write(&mut Needle::new(100, 1, &b"x"[..])),
        Err(StorageError::CapacityExceeded {
            volume: VolumeId(1),
            ..
        })
    ));
    assert!(matches!(
        v.delete(&Needle::tombstone(1, 1)),
        Err(StorageError::CapacityExceeded { .. })
    ));

    // Rejected appends leave the file and the index untouched
    assert_eq!(v.data_file_size(), end);
    assert_eq!(fs::metadata(temp.path().join("1.dat")).unwrap().len(), end);
    assert!(v.index_entry(100).is_none());
    assert!(!v.index_entry(1).unwrap().is_deleted());
    assert_eq!(v.file_count(), 9);
}

#[test]
fn test_writes_racing_destroy_fail() {
    let temp = TempDir::new().unwrap();
    let v = Arc::new(open_volume(temp.path(), 1));

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let v = Arc::clone(&v);
            thread::spawn(move || {
                let mut id = t * 1_000_000;
                loop {
                    id += 1;
                    if let Err(e) = v.write(&mut Needle::new(id, 1, vec![7u8; 4096])) {
                        return e;
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    v.destroy().unwrap();
    let files_at_destroy = v.file_count();
    let size_at_destroy = v.data_file_size();

    for w in writers {
        let err = w.join().unwrap();
        assert!(
            matches!(err, StorageError::VolumeNotFound(VolumeId(1))),
            "unexpected error: {}",
            err
        );
    }

    // Nothing was appended once the volume was gone
    assert_eq!(v.file_count(), files_at_destroy);
    assert_eq!(v.data_file_size(), size_at_destroy);
    assert!(!temp.path().join("1.dat").exists());
    assert!(!temp.path().join("1.idx").exists());
}
