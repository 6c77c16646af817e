use std::collections::BTreeSet;

use gradfeed_core::RecordKey;

/// Pagination stops after this many pages in a row with nothing new.
pub const STOP_AFTER_EMPTY_PAGES: u32 = 5;

/// Keys on the page that are not stored yet.
pub fn new_keys(
    page_keys: &BTreeSet<RecordKey>,
    existing: &BTreeSet<RecordKey>,
) -> BTreeSet<RecordKey> {
    page_keys.difference(existing).copied().collect()
}

/// Run-local page verdicts against a snapshot of stored keys.
#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    existing: BTreeSet<RecordKey>,
    stop_after: u32,
    consecutive_empty: u32,
    known_duplicates: BTreeSet<RecordKey>,
}

impl DuplicateDetector {
    pub fn new(existing: BTreeSet<RecordKey>) -> Self {
        Self::with_stop_after(existing, STOP_AFTER_EMPTY_PAGES)
    }

    pub fn with_stop_after(existing: BTreeSet<RecordKey>, stop_after: u32) -> Self {
        Self {
            existing,
            stop_after: stop_after.max(1),
            consecutive_empty: 0,
            known_duplicates: BTreeSet::new(),
        }
    }

    /// Returns the page's new keys and updates the empty-page streak.
    pub fn observe(&mut self, page_keys: &BTreeSet<RecordKey>) -> BTreeSet<RecordKey> {
        let fresh = new_keys(page_keys, &self.existing);
        self.known_duplicates
            .extend(page_keys.intersection(&self.existing).copied());
        if fresh.is_empty() {
            self.consecutive_empty += 1;
        } else {
            self.consecutive_empty = 0;
        }
        fresh
    }

    pub fn should_stop(&self) -> bool {
        self.consecutive_empty >= self.stop_after
    }

    pub fn consecutive_empty(&self) -> u32 {
        self.consecutive_empty
    }

    pub fn existing_count(&self) -> usize {
        self.existing.len()
    }

    pub fn into_known_duplicates(self) -> BTreeSet<RecordKey> {
        self.known_duplicates
    }
}
