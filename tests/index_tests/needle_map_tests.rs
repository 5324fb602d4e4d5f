//! Tests for NeedleMap and its index file

use std::fs::{self, OpenOptions};
use std::io::Write;

use needlestore::index::{NeedleMap, INDEX_ENTRY_SIZE};
use needlestore::needle::TOMBSTONE_FILE_SIZE;
use tempfile::TempDir;

#[test]
fn test_put_and_delete_accounting() {
    let temp = TempDir::new().unwrap();
    let nm = NeedleMap::create(&temp.path().join("1.idx")).unwrap();

    nm.put(1, 1, 100).unwrap();
    nm.put(2, 20, 50).unwrap();
    // Replacing a live entry counts the old one as deleted
    nm.put(1, 30, 120).unwrap();

    assert_eq!(nm.file_count(), 3);
    assert_eq!(nm.content_size(), 270);
    assert_eq!(nm.deleted_count(), 1);
    assert_eq!(nm.deleted_size(), 100);
    assert_eq!(nm.max_file_key(), 2);

    assert_eq!(nm.delete(2, 40).unwrap(), 50);
    assert_eq!(nm.delete(2, 41).unwrap(), 0);
    assert_eq!(nm.deleted_count(), 2);
    assert_eq!(nm.deleted_size(), 150);
    assert_eq!(nm.get(2).unwrap().size, TOMBSTONE_FILE_SIZE);
}

#[test]
fn test_every_mutation_appends_an_entry() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("1.idx");
    let nm = NeedleMap::create(&path).unwrap();

    nm.put(1, 1, 100).unwrap();
    nm.put(2, 2, 100).unwrap();
    nm.delete(1, 3).unwrap();
    nm.sync().unwrap();

    let bytes = fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 3 * INDEX_ENTRY_SIZE);

    // Third entry: key 1, offset 3, tombstone size
    let entry = &bytes[2 * INDEX_ENTRY_SIZE..];
    assert_eq!(&entry[0..8], &1u64.to_be_bytes());
    assert_eq!(&entry[8..12], &3u32.to_be_bytes());
    assert_eq!(&entry[12..16], &TOMBSTONE_FILE_SIZE.to_be_bytes());
}

#[test]
fn test_load_replays_entries() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("1.idx");
    {
        let nm = NeedleMap::create(&path).unwrap();
        nm.put(5, 1, 10).unwrap();
        nm.put(6, 2, 20).unwrap();
        nm.put(5, 3, 30).unwrap();
        nm.delete(6, 4).unwrap();
        nm.sync().unwrap();
    }

    let nm = NeedleMap::load(&path).unwrap();
    assert_eq!(nm.get(5).unwrap().offset, 3);
    assert_eq!(nm.get(5).unwrap().size, 30);
    assert_eq!(nm.get(6).unwrap().size, TOMBSTONE_FILE_SIZE);
    assert_eq!(nm.file_count(), 3);
    assert_eq!(nm.deleted_count(), 2);
    assert_eq!(nm.deleted_size(), 30);
    assert_eq!(nm.content_size(), 60);
    assert_eq!(nm.max_file_key(), 6);

    // New entries go after the replayed ones
    nm.put(7, 5, 1).unwrap();
    nm.sync().unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), 5 * INDEX_ENTRY_SIZE as u64);
}

#[test]
fn test_load_drops_partial_tail() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("1.idx");
    {
        let nm = NeedleMap::create(&path).unwrap();
        nm.put(1, 1, 10).unwrap();
        nm.sync().unwrap();
    }
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xAA; 7]).unwrap();
    }

    let nm = NeedleMap::load(&path).unwrap();
    assert_eq!(nm.get(1).unwrap().size, 10);
    assert_eq!(nm.file_count(), 1);
    assert_eq!(fs::metadata(&path).unwrap().len(), INDEX_ENTRY_SIZE as u64);
}

#[test]
fn test_destroy_removes_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("1.idx");
    let nm = NeedleMap::create(&path).unwrap();
    nm.put(1, 1, 10).unwrap();

    nm.destroy().unwrap();
    assert!(!path.exists());
}

#[cfg(target_os = "linux")]
#[test]
fn test_failed_index_append_leaves_map_unchanged() {
    // Every write to /dev/full fails with ENOSPC
    let nm = NeedleMap::create(std::path::Path::new("/dev/full")).unwrap();

    assert!(nm.put(1, 1, 10).is_err());
    assert!(nm.get(1).is_none());
    assert_eq!(nm.file_count(), 0);
    assert_eq!(nm.content_size(), 0);
    assert_eq!(nm.max_file_key(), 0);
}
