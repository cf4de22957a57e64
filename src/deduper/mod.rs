//! Stage 4: replacing duplicates with links.
//!
//! # Overview
//!
//! The deduper takes confirmed duplicate groups and replaces every file
//! outside the chosen source's sibling group with a hardlink to the source
//! (or a relative symlink across device boundaries, when enabled). Groups
//! are processed sequentially; the stage is I/O bound, and serialization
//! keeps per-target locking and stats simple.
//!
//! # Safety Mechanisms
//!
//! - An exclusive non-blocking advisory lock plus an mtime barrier detect
//!   files that other processes are using or have modified since the scan;
//!   such targets are skipped, never replaced.
//! - All mutations commit through the atomic rename protocol in [`links`],
//!   so a target path is never absent, not even transiently.
//! - The target handle is held only for the lock/stat/stage sequence and
//!   closed before the rename commits.
//! - Dry-run mode reports identically but changes nothing.
//!
//! # Source Selection
//!
//! Within each group, priority order: a path prefixed by a CLI root path
//! (roots in CLI order), then the sibling group with the highest link
//! count (joining an existing hardlink cluster preserves its other
//! references), then the lexicographically smallest path.

pub mod links;

use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use bytesize::ByteSize;
use thiserror::Error;

use crate::errors::ErrorSink;
use crate::progress::Bar;
use crate::types::{DuplicateGroup, DuplicateGroups, FileRecord, SiblingGroup};

use self::links::{stage_hardlink, stage_symlink};

/// Why a target was left unchanged.
#[derive(Debug, Error)]
pub enum SkipReason {
    /// Another process holds an advisory lock on the target.
    #[error("file in use (locked by another process)")]
    Locked,

    /// The target's mtime drifted between scan and replacement.
    #[error("file modified since scan")]
    Modified,

    /// Hardlink failed with `EXDEV` and symlink fallback is disabled.
    #[error("cannot hardlink across device boundaries (use --symlink-fallback)")]
    CrossDevice,

    /// Any other failure (permissions, `EMLINK`, read-only directory, ...).
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How a target was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Replaced with a hardlink to the source.
    Hardlink,
    /// Replaced with a relative symlink to the source.
    Symlink,
}

/// A successful (or dry-run) replacement, printable in verbose mode.
#[derive(Debug)]
pub struct Replacement {
    /// Path kept.
    pub source: PathBuf,
    /// Path replaced.
    pub target: PathBuf,
    /// Link type used.
    pub kind: LinkKind,
    /// Bytes reclaimed.
    pub bytes_saved: u64,
}

impl fmt::Display for Replacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            LinkKind::Hardlink => "hardlink",
            LinkKind::Symlink => "symlink",
        };
        write!(
            f,
            "Replaced {} with {kind} to {}",
            escape_path(&self.target),
            escape_path(&self.source),
        )
    }
}

/// Escape control characters in paths for safe terminal output.
fn escape_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\t', "\\t")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

/// Behavior switches for the deduper.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupeOptions {
    /// Report without modifying the filesystem.
    pub dry_run: bool,
    /// Fall back to relative symlinks on `EXDEV`.
    pub symlink_fallback: bool,
    /// Print one line per replacement to stdout.
    pub verbose: bool,
}

/// Deduplication progress counters.
struct DedupeStats {
    total_files: usize,
    processed_files: usize,
    total_sets: usize,
    processed_sets: usize,
    saved_bytes: u64,
    start: Instant,
}

impl fmt::Display for DedupeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = if self.total_files > 0 {
            self.processed_files as f64 / self.total_files as f64 * 100.0
        } else {
            0.0
        };
        write!(
            f,
            "Deduplicated {}/{} files in {}/{} sets ({pct:.0}%), saved {} in {:.1}s",
            self.processed_files,
            self.total_files,
            self.processed_sets,
            self.total_sets,
            ByteSize::b(self.saved_bytes).to_string_as(true),
            self.start.elapsed().as_secs_f64(),
        )
    }
}

/// Replaces duplicate files with links.
///
/// Single-use: create with [`Deduper::new`], call [`Deduper::run`] once.
pub struct Deduper {
    groups: DuplicateGroups,
    path_priority: Vec<PathBuf>,
    opts: DedupeOptions,
    show_progress: bool,
    errors: ErrorSink,
    shutdown: Option<Arc<AtomicBool>>,
}

impl Deduper {
    /// Create a deduper.
    ///
    /// `path_priority` is the list of CLI root paths in CLI order; it
    /// decides which copy keeps the data when a group spans several roots.
    #[must_use]
    pub fn new(
        groups: DuplicateGroups,
        path_priority: Vec<PathBuf>,
        opts: DedupeOptions,
        show_progress: bool,
        errors: ErrorSink,
    ) -> Self {
        // Records carry absolute paths, so priority prefixes must be
        // absolute too even when the user typed relative roots.
        let path_priority = path_priority
            .into_iter()
            .map(|p| std::path::absolute(&p).unwrap_or(p))
            .collect();
        Self {
            groups,
            path_priority,
            opts,
            show_progress,
            errors,
            shutdown: None,
        }
    }

    /// Set a shutdown flag checked between targets.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Execute deduplication over all duplicate groups.
    pub fn run(self) {
        let bar = Bar::spinner(self.show_progress);
        let mut stats = DedupeStats {
            total_files: count_target_files(&self.groups),
            processed_files: 0,
            total_sets: self.groups.len(),
            processed_sets: 0,
            saved_bytes: 0,
            start: Instant::now(),
        };
        bar.describe(&stats);

        for group in self.groups.iter() {
            if self.is_shutdown() {
                break;
            }
            if group.len() < 2 {
                continue;
            }

            let source = select_source(group, &self.path_priority);

            for target_siblings in group.iter() {
                // The source's sibling group is already hardlinked to it.
                if contains_inode(target_siblings, &source) {
                    continue;
                }
                for target in target_siblings.iter() {
                    if self.is_shutdown() {
                        break;
                    }
                    match self.dedupe_file(&source, target) {
                        Ok(replacement) => {
                            stats.saved_bytes += replacement.bytes_saved;
                            stats.processed_files += 1;
                            if self.opts.verbose {
                                eprint!("\r\x1b[K"); // clear the progress line
                                println!("{replacement}");
                            }
                            bar.describe(&stats);
                        }
                        Err(reason) => {
                            self.errors
                                .report(anyhow!("{}: {reason}", target.path.display()));
                        }
                    }
                }
            }

            stats.processed_sets += 1;
            bar.describe(&stats);
        }

        bar.finish(&stats);
    }

    /// Replace one target with a link to the source.
    ///
    /// The target is opened read-only just long enough to take the advisory
    /// lock, check the mtime barrier, and stage the replacement link; the
    /// handle is closed before the rename commits.
    fn dedupe_file(&self, source: &FileRecord, target: &FileRecord) -> Result<Replacement, SkipReason> {
        let file = File::open(&target.path)?;

        // Non-blocking: a busy peer means skip, never stall.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            return Err(SkipReason::Locked);
        }

        // Tamper barrier against concurrent writers since the scan.
        let info = file.metadata()?;
        if info.modified()? != target.mtime {
            return Err(SkipReason::Modified);
        }

        if self.opts.dry_run {
            return Ok(Replacement {
                source: source.path.clone(),
                target: target.path.clone(),
                kind: LinkKind::Hardlink,
                bytes_saved: target.size,
            });
        }

        let (pending, kind) = match stage_hardlink(&source.path, &target.path) {
            Ok(pending) => (pending, LinkKind::Hardlink),
            Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
                if !self.opts.symlink_fallback {
                    return Err(SkipReason::CrossDevice);
                }
                (stage_symlink(&source.path, &target.path)?, LinkKind::Symlink)
            }
            Err(err) => return Err(err.into()),
        };

        drop(file); // close (and unlock) before the atomic rename
        pending.commit()?;

        Ok(Replacement {
            source: source.path.clone(),
            target: target.path.clone(),
            kind,
            bytes_saved: target.size,
        })
    }
}

/// Total number of files to replace, for progress display. Approximate:
/// the first sibling group stands in for whichever group holds the source.
fn count_target_files(groups: &DuplicateGroups) -> usize {
    let mut total = 0;
    for group in groups.iter() {
        if group.len() < 2 {
            continue;
        }
        for siblings in group.iter() {
            total += siblings.len();
        }
        total -= group.first().len();
    }
    total
}

/// Whether a sibling group contains the given file's inode.
fn contains_inode(siblings: &SiblingGroup, file: &FileRecord) -> bool {
    siblings
        .iter()
        .any(|s| s.dev == file.dev && s.ino == file.ino)
}

/// Choose the file whose inode is kept as the link source.
fn select_source(group: &DuplicateGroup, path_priority: &[PathBuf]) -> Arc<FileRecord> {
    // Path priority wins outright, searching every path in every sibling
    // group in group order.
    for pref in path_priority {
        let pref_bytes = pref.as_os_str().as_bytes();
        for siblings in group.iter() {
            for file in siblings.iter() {
                if file.path.as_os_str().as_bytes().starts_with(pref_bytes) {
                    return Arc::clone(file);
                }
            }
        }
    }

    // Otherwise the sibling group with the most existing hardlinks; ties
    // fall to the lexicographically first path. Groups are sorted, so the
    // scan is deterministic.
    let mut best = group.first().first();
    for siblings in group.iter().skip(1) {
        let rep = siblings.first(); // all siblings share one nlink count
        if rep.nlink > best.nlink || (rep.nlink == best.nlink && rep.path < best.path) {
            best = rep;
        }
    }
    Arc::clone(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    fn record_for(path: &Path) -> Arc<FileRecord> {
        let md = fs::metadata(path).unwrap();
        Arc::new(FileRecord {
            path: path.to_path_buf(),
            size: md.len(),
            mtime: md.modified().unwrap(),
            dev: md.dev(),
            ino: md.ino(),
            nlink: md.nlink(),
        })
    }

    fn synthetic(path: &str, nlink: u64, dev: u64, ino: u64) -> Arc<FileRecord> {
        Arc::new(FileRecord {
            path: PathBuf::from(path),
            size: 100,
            mtime: UNIX_EPOCH,
            dev,
            ino,
            nlink,
        })
    }

    fn group_of(paths: &[&Path]) -> DuplicateGroups {
        let siblings: Vec<_> = paths
            .iter()
            .map(|p| crate::types::new_sibling_group(vec![record_for(p)]))
            .collect();
        crate::types::new_duplicate_groups(vec![crate::types::new_duplicate_group(siblings)])
    }

    fn run_deduper(groups: DuplicateGroups, priority: Vec<PathBuf>, opts: DedupeOptions) {
        Deduper::new(groups, priority, opts, false, ErrorSink::disabled()).run()
    }

    #[test]
    fn test_dedupe_links_identical_files() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, vec![b'D'; 1024]).unwrap();
        fs::write(&b, vec![b'D'; 1024]).unwrap();

        run_deduper(group_of(&[&a, &b]), vec![], DedupeOptions::default());

        assert_eq!(
            fs::metadata(&a).unwrap().ino(),
            fs::metadata(&b).unwrap().ino()
        );
        assert_eq!(fs::read(&a).unwrap(), vec![b'D'; 1024]);
        assert_eq!(fs::read(&b).unwrap(), vec![b'D'; 1024]);
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();

        run_deduper(
            group_of(&[&a, &b]),
            vec![],
            DedupeOptions {
                dry_run: true,
                ..Default::default()
            },
        );

        assert_ne!(
            fs::metadata(&a).unwrap().ino(),
            fs::metadata(&b).unwrap().ino()
        );
    }

    #[test]
    fn test_mtime_barrier_skips_modified_target() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();

        let groups = group_of(&[&a, &b]);
        // Target changes after the scan recorded its mtime.
        let then = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&b, then).unwrap();

        run_deduper(groups, vec![], DedupeOptions::default());

        assert_ne!(
            fs::metadata(&a).unwrap().ino(),
            fs::metadata(&b).unwrap().ino()
        );
    }

    #[test]
    fn test_source_sibling_group_is_skipped() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        fs::write(&a, b"data").unwrap();
        fs::hard_link(&a, &b).unwrap();
        fs::write(&c, b"data").unwrap();

        let siblings = vec![
            crate::types::new_sibling_group(vec![record_for(&a), record_for(&b)]),
            crate::types::new_sibling_group(vec![record_for(&c)]),
        ];
        let groups = crate::types::new_duplicate_groups(vec![
            crate::types::new_duplicate_group(siblings),
        ]);

        run_deduper(groups, vec![], DedupeOptions::default());

        // c joined the existing cluster; a and b were never touched.
        let ino = fs::metadata(&a).unwrap().ino();
        assert_eq!(fs::metadata(&b).unwrap().ino(), ino);
        assert_eq!(fs::metadata(&c).unwrap().ino(), ino);
        assert_eq!(fs::metadata(&a).unwrap().nlink(), 3);
    }

    #[test]
    fn test_select_source_prefers_priority_path() {
        let group = crate::types::new_duplicate_group(vec![
            crate::types::new_sibling_group(vec![synthetic("/backup/f", 1, 1, 1)]),
            crate::types::new_sibling_group(vec![synthetic("/work/f", 5, 1, 2)]),
        ]);
        let source = select_source(&group, &[PathBuf::from("/backup")]);
        assert_eq!(source.path, PathBuf::from("/backup/f"));
    }

    #[test]
    fn test_select_source_prefers_highest_nlink() {
        let group = crate::types::new_duplicate_group(vec![
            crate::types::new_sibling_group(vec![synthetic("/a", 1, 1, 1)]),
            crate::types::new_sibling_group(vec![
                synthetic("/x", 3, 1, 2),
                synthetic("/y", 3, 1, 2),
            ]),
        ]);
        let source = select_source(&group, &[]);
        assert_eq!(source.path, PathBuf::from("/x"));
    }

    #[test]
    fn test_select_source_tie_breaks_lexicographically() {
        let group = crate::types::new_duplicate_group(vec![
            crate::types::new_sibling_group(vec![synthetic("/b", 1, 1, 1)]),
            crate::types::new_sibling_group(vec![synthetic("/a", 1, 1, 2)]),
        ]);
        let source = select_source(&group, &[]);
        assert_eq!(source.path, PathBuf::from("/a"));
    }

    #[test]
    fn test_priority_order_follows_cli_order() {
        let group = crate::types::new_duplicate_group(vec![
            crate::types::new_sibling_group(vec![synthetic("/one/f", 1, 1, 1)]),
            crate::types::new_sibling_group(vec![synthetic("/two/f", 1, 1, 2)]),
        ]);
        let source = select_source(
            &group,
            &[PathBuf::from("/two"), PathBuf::from("/one")],
        );
        assert_eq!(source.path, PathBuf::from("/two/f"));
    }

    #[test]
    fn test_escape_path_controls() {
        assert_eq!(
            escape_path(Path::new("/a\tb\nc\rd")),
            "/a\\tb\\nc\\rd".to_string()
        );
    }

    #[test]
    fn test_count_target_files() {
        let groups = crate::types::new_duplicate_groups(vec![
            crate::types::new_duplicate_group(vec![
                crate::types::new_sibling_group(vec![synthetic("/a", 1, 1, 1)]),
                crate::types::new_sibling_group(vec![
                    synthetic("/b", 2, 1, 2),
                    synthetic("/c", 2, 1, 2),
                ]),
            ]),
        ]);
        // Three paths minus the first sibling group (one path).
        assert_eq!(count_target_files(&groups), 2);
    }

    #[test]
    fn test_replacement_display() {
        let replacement = Replacement {
            source: PathBuf::from("/d/a.txt"),
            target: PathBuf::from("/d/b.txt"),
            kind: LinkKind::Hardlink,
            bytes_saved: 1024,
        };
        assert_eq!(
            replacement.to_string(),
            "Replaced /d/b.txt with hardlink to /d/a.txt"
        );
    }
}
