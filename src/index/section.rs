//! Compact Section
//!
//! A bounded sorted run of index entries plus an overflow map for keys that
//! arrive out of order.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::needle::TOMBSTONE_FILE_SIZE;

use super::NeedleValue;

/// Maximum number of entries in a section's sorted run
pub const SECTION_BATCH: usize = 100_000;

/// Outcome of a binary search over a sorted run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// The key sits at this index
    Found(usize),
    /// The key is absent but falls inside the covered range
    NotPresent,
    /// The key is absent and larger than everything present
    WouldAppend,
}

struct SectionInner {
    /// Sorted run; only ever appended to
    values: Vec<NeedleValue>,
    overflow: HashMap<u64, NeedleValue>,
    /// Largest key ever set in this section
    end: u64,
}

impl SectionInner {
    fn search(&self, key: u64) -> SearchResult {
        binary_search_values(&self.values, key)
    }
}

/// Binary search over a sorted run of entries
pub(crate) fn binary_search_values(values: &[NeedleValue], key: u64) -> SearchResult {
    match values.last() {
        None => return SearchResult::WouldAppend,
        Some(last) if last.key < key => return SearchResult::WouldAppend,
        _ => {}
    }
    match values.binary_search_by_key(&key, |v| v.key) {
        Ok(i) => SearchResult::Found(i),
        Err(_) => SearchResult::NotPresent,
    }
}

/// One section of a [`CompactMap`](super::CompactMap), locked independently
pub struct CompactSection {
    start: u64,
    inner: RwLock<SectionInner>,
}

impl CompactSection {
    pub fn new(start: u64) -> Self {
        Self {
            start,
            inner: RwLock::new(SectionInner {
                values: Vec::new(),
                overflow: HashMap::new(),
                end: start,
            }),
        }
    }

    /// First key this section was created for
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Largest key set so far
    pub fn end(&self) -> u64 {
        self.inner.read().end
    }

    /// Number of entries in the sorted run
    pub fn counter(&self) -> usize {
        self.inner.read().values.len()
    }

    pub fn is_full(&self) -> bool {
        self.counter() >= SECTION_BATCH
    }

    pub fn overflow_len(&self) -> usize {
        self.inner.read().overflow.len()
    }

    /// Insert or overwrite `key`, returning the previous entry if any
    pub fn set(&self, key: u64, offset: u32, size: u32) -> Option<NeedleValue> {
        let mut inner = self.inner.write();
        if key > inner.end {
            inner.end = key;
        }

        let value = NeedleValue::new(key, offset, size);
        match inner.search(key) {
            SearchResult::Found(i) => {
                let old = inner.values[i];
                inner.values[i] = value;
                Some(old)
            }
            SearchResult::NotPresent => inner.overflow.insert(key, value),
            SearchResult::WouldAppend => {
                if inner.values.len() >= SECTION_BATCH {
                    inner.overflow.insert(key, value)
                } else {
                    inner.values.push(value);
                    None
                }
            }
        }
    }

    /// Mark `key` deleted, returning the size it had (0 if absent or already deleted)
    pub fn delete(&self, key: u64) -> u32 {
        let mut inner = self.inner.write();
        let mut freed = 0;
        if let SearchResult::Found(i) = inner.search(key) {
            let v = &mut inner.values[i];
            if v.size != TOMBSTONE_FILE_SIZE {
                freed = v.size;
                v.size = TOMBSTONE_FILE_SIZE;
            }
        }
        if let Some(v) = inner.overflow.remove(&key) {
            if v.size != TOMBSTONE_FILE_SIZE {
                freed = v.size;
            }
        }
        freed
    }

    /// Entry for `key`, including deleted ones
    pub fn get(&self, key: u64) -> Option<NeedleValue> {
        let inner = self.inner.read();
        if let Some(v) = inner.overflow.get(&key) {
            return Some(*v);
        }
        match inner.search(key) {
            SearchResult::Found(i) => Some(inner.values[i]),
            _ => None,
        }
    }

    /// Call `visit` for every live entry: overflow first, then the sorted run
    /// minus keys shadowed by overflow.
    pub fn visit<E, F>(&self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(&NeedleValue) -> Result<(), E>,
    {
        let inner = self.inner.read();
        for v in inner.overflow.values() {
            if !v.is_deleted() {
                visit(v)?;
            }
        }
        for v in &inner.values {
            if v.is_deleted() || inner.overflow.contains_key(&v.key) {
                continue;
            }
            visit(v)?;
        }
        Ok(())
    }
}
