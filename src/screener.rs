//! Stage 2: metadata-only candidate screening.
//!
//! # Overview
//!
//! The screener reduces the scan output to groups that *could* contain
//! content duplicates, using nothing but metadata; the stage is pure and
//! performs no I/O.
//!
//! Files are bucketed by size, then by identity key into sibling groups
//! (paths sharing one inode are hardlinks of each other). A size bucket
//! survives only if it holds at least two distinct inodes: fewer means the
//! bucket is unique or already fully deduplicated.
//!
//! # Identity Key
//!
//! By default the key is the inode alone, which is safe on network
//! filesystems where the same file can surface under different device IDs.
//! With `trust_device_boundaries` the key becomes `(device, inode)`,
//! appropriate for separately mounted local filesystems with independent
//! inode namespaces.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytesize::ByteSize;

use crate::progress::Bar;
use crate::types::{
    new_candidate_group, new_candidate_groups, new_sibling_group, CandidateGroup, CandidateGroups,
    FileRecord, SiblingGroup,
};

/// Screening summary printed on finish.
struct ScreenStats {
    candidate_files: usize,
    candidate_bytes: u64,
    start: Instant,
}

impl fmt::Display for ScreenStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Selected {} candidates ({}) in {:.1}s",
            self.candidate_files,
            ByteSize::b(self.candidate_bytes).to_string_as(true),
            self.start.elapsed().as_secs_f64(),
        )
    }
}

/// Screens scanned files down to candidate duplicate groups.
///
/// Single-use: create with [`Screener::new`], call [`Screener::run`] once.
#[derive(Debug)]
pub struct Screener {
    files: Vec<Arc<FileRecord>>,
    trust_device_boundaries: bool,
    show_progress: bool,
}

impl Screener {
    /// Create a screener over the scan output.
    #[must_use]
    pub fn new(
        files: Vec<Arc<FileRecord>>,
        trust_device_boundaries: bool,
        show_progress: bool,
    ) -> Self {
        Self {
            files,
            trust_device_boundaries,
            show_progress,
        }
    }

    /// Cluster files into candidate groups.
    pub fn run(self) -> CandidateGroups {
        let bar = Bar::spinner(self.show_progress);
        let start = Instant::now();

        let mut by_size: HashMap<u64, Vec<Arc<FileRecord>>> = HashMap::new();
        for file in self.files {
            by_size.entry(file.size).or_default().push(file);
        }

        let mut result = Vec::new();
        for files in by_size.into_values() {
            let group = if self.trust_device_boundaries {
                group_by_dev_ino(files)
            } else {
                group_by_ino(files)
            };
            // Two or more distinct inodes are required for a duplicate to
            // be possible at all.
            if group.len() >= 2 {
                result.push(group);
            }
        }

        let mut stats = ScreenStats {
            candidate_files: 0,
            candidate_bytes: 0,
            start,
        };
        for group in &result {
            stats.candidate_files += group.len();
            stats.candidate_bytes += group.first().first().size * group.len() as u64;
        }
        bar.finish(&stats);

        new_candidate_groups(result)
    }
}

/// Group files by inode alone (default, NFS-safe).
fn group_by_ino(files: Vec<Arc<FileRecord>>) -> CandidateGroup {
    let mut by_ino: HashMap<u64, Vec<Arc<FileRecord>>> = HashMap::new();
    for file in files {
        by_ino.entry(file.ino).or_default().push(file);
    }
    collect_siblings(by_ino)
}

/// Group files by `(device, inode)` under `--trust-device-boundaries`.
fn group_by_dev_ino(files: Vec<Arc<FileRecord>>) -> CandidateGroup {
    let mut by_dev_ino: HashMap<(u64, u64), Vec<Arc<FileRecord>>> = HashMap::new();
    for file in files {
        by_dev_ino.entry((file.dev, file.ino)).or_default().push(file);
    }
    collect_siblings(by_dev_ino)
}

fn collect_siblings<K>(buckets: HashMap<K, Vec<Arc<FileRecord>>>) -> CandidateGroup {
    let siblings: Vec<SiblingGroup> = buckets.into_values().map(new_sibling_group).collect();
    new_candidate_group(siblings)
}
