//! Compact Map
//!
//! Needle ids are mostly handed out in increasing order, so the index is a
//! list of sorted sections rather than a general-purpose tree. Appending an
//! increasing key is a push onto the tail section's run; anything else falls
//! back to that section's overflow map.

use std::sync::Arc;

use parking_lot::RwLock;

use super::section::{CompactSection, SearchResult};
use super::NeedleValue;

/// Key → (offset, size) map tuned for ascending inserts
///
/// ## Concurrency:
/// - Each section has its own RwLock, so lookups in a cold section never
///   wait on writes to the hot tail section
/// - `list` is only locked to resolve a section or to add a new one; the
///   lock is released before any section-local work
#[derive(Default)]
pub struct CompactMap {
    /// Sections sorted by `start`
    list: RwLock<Vec<Arc<CompactSection>>>,
}

impl CompactMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`, returning the previous entry if any
    pub fn set(&self, key: u64, offset: u32, size: u32) -> Option<NeedleValue> {
        let section = match self.find_section(key) {
            Some(section) => section,
            None => self.add_section(key),
        };
        section.set(key, offset, size)
    }

    /// Mark `key` deleted, returning the size it had (0 if absent or already deleted)
    pub fn delete(&self, key: u64) -> u32 {
        match self.find_section(key) {
            Some(section) => section.delete(key),
            None => 0,
        }
    }

    /// Entry for `key`, including deleted ones
    pub fn get(&self, key: u64) -> Option<NeedleValue> {
        self.find_section(key)?.get(key)
    }

    /// Visit every live entry; stops at the first error returned by `visit`.
    ///
    /// No ordering is guaranteed across sections.
    pub fn visit<E, F>(&self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(&NeedleValue) -> Result<(), E>,
    {
        let sections: Vec<Arc<CompactSection>> = self.list.read().clone();
        for section in sections {
            section.visit(&mut visit)?;
        }
        Ok(())
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let mut count = 0;
        let _ = self.visit::<(), _>(|_| {
            count += 1;
            Ok(())
        });
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn section_count(&self) -> usize {
        self.list.read().len()
    }

    /// Entries held in overflow maps across all sections
    pub fn overflow_len(&self) -> usize {
        self.list.read().iter().map(|s| s.overflow_len()).sum()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn find_section(&self, key: u64) -> Option<Arc<CompactSection>> {
        let list = self.list.read();
        match binary_search_sections(&list, key) {
            SearchResult::Found(i) => Some(Arc::clone(&list[i])),
            _ => None,
        }
    }

    /// Create a section starting at `key` and keep the list sorted by start.
    /// New sections almost always land at the tail.
    fn add_section(&self, key: u64) -> Arc<CompactSection> {
        let mut list = self.list.write();

        // Another writer may have added a covering section meanwhile
        if let SearchResult::Found(i) = binary_search_sections(&list, key) {
            return Arc::clone(&list[i]);
        }

        let section = Arc::new(CompactSection::new(key));
        list.push(Arc::clone(&section));
        let mut x = list.len() - 1;
        while x > 0 && list[x - 1].start() > list[x].start() {
            list.swap(x - 1, x);
            x -= 1;
        }
        section
    }
}

/// Find the section covering `key`.
///
/// The tail section is checked first since increasing keys land there. It
/// covers every key at or above its start while it still has room, and up
/// to its largest key once full. `WouldAppend` means a new tail section is
/// needed; `NotPresent` means the key precedes every section.
fn binary_search_sections(list: &[Arc<CompactSection>], key: u64) -> SearchResult {
    let tail = match list.last() {
        Some(tail) => tail,
        None => return SearchResult::WouldAppend,
    };
    let h = list.len() - 1;
    if tail.start() <= key {
        if !tail.is_full() || key <= tail.end() {
            return SearchResult::Found(h);
        }
        return SearchResult::WouldAppend;
    }

    // Rightmost section whose start is <= key, among list[0..h]
    let idx = list[..h].partition_point(|s| s.start() <= key);
    if idx == 0 {
        SearchResult::NotPresent
    } else {
        SearchResult::Found(idx - 1)
    }
}
