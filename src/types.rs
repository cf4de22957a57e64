//! Shared data model and concurrency primitives used by every pipeline stage.
//!
//! # Ordering Discipline
//!
//! Every collection handed from one stage to the next is a [`Sorted`]
//! sequence ordered by a well-defined key. All tie-breaking downstream
//! (source selection, dispatch order, output order) derives from that
//! ordering, which makes the pipeline deterministic for a given input.
//!
//! # Group Hierarchy
//!
//! - [`SiblingGroup`]: paths sharing one inode (hardlinks), sorted by path.
//! - [`CandidateGroup`]: sibling groups of identical size, sorted by each
//!   group's first path. Potential duplicates prior to verification.
//! - [`DuplicateGroup`]: a candidate group proven byte-identical.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata for a scanned file, immutable after construction by the scanner.
///
/// Records are shared across stages as `Arc<FileRecord>`; their lifetime
/// spans the whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Absolute path to the file.
    pub path: PathBuf,
    /// File size in bytes at scan time.
    pub size: u64,
    /// Modification time at scan time (nanosecond precision where available).
    pub mtime: SystemTime,
    /// Device identifier from `stat`.
    pub dev: u64,
    /// Inode number from `stat`.
    pub ino: u64,
    /// Number of hardlinks to the inode at scan time.
    pub nlink: u64,
}

impl FileRecord {
    /// Modification time as signed nanoseconds since the Unix epoch.
    #[must_use]
    pub fn mtime_ns(&self) -> i64 {
        match self.mtime.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i64,
            Err(e) => -(e.duration().as_nanos() as i64),
        }
    }
}

/// An immutable sequence sorted at construction by a caller-supplied key.
///
/// Sorting happens exactly once, in [`Sorted::new`]; afterwards the
/// collection only hands out shared references, so the ordering invariant
/// cannot be violated.
#[derive(Debug, Clone, Default)]
pub struct Sorted<T> {
    items: Vec<T>,
}

impl<T> Sorted<T> {
    /// Build a sorted collection from `items`, ordered by `key`.
    pub fn new<K, F>(mut items: Vec<T>, key: F) -> Self
    where
        K: Ord + ?Sized,
        F: Fn(&T) -> &K,
    {
        items.sort_by(|a, b| key(a).cmp(key(b)));
        Self { items }
    }

    /// The sorted items.
    #[must_use]
    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// The item with the smallest key.
    ///
    /// # Panics
    ///
    /// Panics if the collection is empty. Pipeline groups are never
    /// constructed empty: the screener only emits groups of two or more.
    #[must_use]
    pub fn first(&self) -> &T {
        &self.items[0]
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over the items in key order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<'a, T> IntoIterator for &'a Sorted<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Files sharing the same inode (hardlinks), sorted by path.
pub type SiblingGroup = Sorted<Arc<FileRecord>>;

/// Builds a [`SiblingGroup`] sorted by file path.
#[must_use]
pub fn new_sibling_group(files: Vec<Arc<FileRecord>>) -> SiblingGroup {
    Sorted::new(files, |f| f.path.as_path())
}

/// Sibling groups of identical size, sorted by each group's first path.
pub type CandidateGroup = Sorted<SiblingGroup>;

/// Builds a [`CandidateGroup`] sorted by first file path.
#[must_use]
pub fn new_candidate_group(siblings: Vec<SiblingGroup>) -> CandidateGroup {
    Sorted::new(siblings, |sg| sg.first().path.as_path())
}

/// Sorted collection of candidate groups.
pub type CandidateGroups = Sorted<CandidateGroup>;

/// Builds sorted [`CandidateGroups`].
#[must_use]
pub fn new_candidate_groups(groups: Vec<CandidateGroup>) -> CandidateGroups {
    Sorted::new(groups, |cg| cg.first().first().path.as_path())
}

/// Sibling groups with proven identical content, sorted by first path.
pub type DuplicateGroup = Sorted<SiblingGroup>;

/// Builds a [`DuplicateGroup`] sorted by first file path.
#[must_use]
pub fn new_duplicate_group(siblings: Vec<SiblingGroup>) -> DuplicateGroup {
    Sorted::new(siblings, |sg| sg.first().path.as_path())
}

/// Sorted collection of duplicate groups.
pub type DuplicateGroups = Sorted<DuplicateGroup>;

/// Builds sorted [`DuplicateGroups`].
#[must_use]
pub fn new_duplicate_groups(groups: Vec<DuplicateGroup>) -> DuplicateGroups {
    Sorted::new(groups, |dg| dg.first().first().path.as_path())
}

/// Counting semaphore bounding concurrent access to a resource.
///
/// Used to limit simultaneously-open directories in the scanner and
/// concurrent file reads in the verifier. [`Semaphore::acquire`] blocks
/// until a permit is available and returns an RAII guard that releases
/// the permit on drop.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore allowing up to `n` concurrent holders.
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self {
            permits: Mutex::new(n),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available, then claim it.
    pub fn acquire(&self) -> SemaphorePermit<'_> {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
        SemaphorePermit { sem: self }
    }
}

/// RAII permit returned by [`Semaphore::acquire`]; released on drop.
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        let mut permits = self.sem.permits.lock().unwrap();
        *permits += 1;
        self.sem.available.notify_one();
    }
}
