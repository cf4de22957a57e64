//! Stage 1: parallel filesystem scanning.
//!
//! # Overview
//!
//! The scanner produces the complete set of regular files reachable from
//! the root paths, filtered by minimum size and basename glob patterns.
//! Anything that is not a regular file (symlinks, sockets, FIFOs, devices)
//! is silently skipped, and symlinks are never followed.
//!
//! # Concurrency Model
//!
//! Fan-out/fan-in with three roles:
//!
//! 1. **Walker tasks**: one task per discovered directory, spawned onto a
//!    rayon pool. A counting semaphore of capacity `workers` bounds how many
//!    directories are being read simultaneously; the permit is released
//!    after listing and *before* child tasks spawn, so parallelism survives
//!    deep trees ("breadth-controlled depth-first").
//! 2. **Collector**: the calling thread drains the fan-in channel into a
//!    vector. Each walker owns a clone of the channel sender; when the last
//!    walker finishes, the channel disconnects and the collector returns.
//!    No explicit wait-group is needed.
//! 3. **Stats**: atomic counters updated lock-free from any walker; the
//!    progress bar reads snapshots that need not be mutually consistent.
//!
//! Directory-level failures (permission denied, missing path, root is a
//! file) are reported on the error sink and scanning continues; nothing in
//! this stage is fatal.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use bytesize::ByteSize;
use glob::Pattern;

use crate::errors::ErrorSink;
use crate::progress::Bar;
use crate::types::{FileRecord, Semaphore};

/// Fan-in channel capacity; smooths walker/collector rate differences.
const RESULT_BUFFER: usize = 1000;

/// Scanning progress counters, updated lock-free from any walker.
///
/// Individual loads may not see a mutually consistent view across counters,
/// which is acceptable for display.
#[derive(Debug)]
struct ScanStats {
    scanned_files: AtomicU64,
    matched_files: AtomicU64,
    scanned_bytes: AtomicU64,
    matched_bytes: AtomicU64,
    start: Instant,
}

impl ScanStats {
    fn new() -> Self {
        Self {
            scanned_files: AtomicU64::new(0),
            matched_files: AtomicU64::new(0),
            scanned_bytes: AtomicU64::new(0),
            matched_bytes: AtomicU64::new(0),
            start: Instant::now(),
        }
    }
}

impl fmt::Display for ScanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Scanned {} ({}), matched {} files ({}) in {:.1}s",
            self.scanned_files.load(Ordering::Relaxed),
            ByteSize::b(self.scanned_bytes.load(Ordering::Relaxed)).to_string_as(true),
            self.matched_files.load(Ordering::Relaxed),
            ByteSize::b(self.matched_bytes.load(Ordering::Relaxed)).to_string_as(true),
            self.start.elapsed().as_secs_f64(),
        )
    }
}

/// Discovers files matching the filter criteria using parallel traversal.
///
/// Single-use: create with [`Scanner::new`], call [`Scanner::run`] once.
#[derive(Debug)]
pub struct Scanner {
    paths: Vec<PathBuf>,
    min_size: u64,
    excludes: Vec<Pattern>,
    workers: usize,
    show_progress: bool,
    errors: ErrorSink,
    shutdown: Option<Arc<AtomicBool>>,
}

/// Shared state for walker tasks.
struct WalkState {
    pool: rayon::ThreadPool,
    sem: Semaphore,
    stats: ScanStats,
    bar: Bar,
    min_size: u64,
    excludes: Vec<Pattern>,
    errors: ErrorSink,
    shutdown: Option<Arc<AtomicBool>>,
}

impl WalkState {
    fn is_shutdown(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Glob patterns are matched against the basename only.
    fn is_excluded(&self, path: &Path) -> bool {
        if self.excludes.is_empty() {
            return false;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        self.excludes.iter().any(|p| p.matches(&name))
    }
}

impl Scanner {
    /// Create a scanner over `paths`.
    #[must_use]
    pub fn new(
        paths: Vec<PathBuf>,
        min_size: u64,
        excludes: Vec<Pattern>,
        workers: usize,
        show_progress: bool,
        errors: ErrorSink,
    ) -> Self {
        Self {
            paths,
            min_size,
            excludes,
            workers,
            show_progress,
            errors,
            shutdown: None,
        }
    }

    /// Set a shutdown flag checked before each directory read.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Execute the scan and return the discovered records.
    ///
    /// Returns only after every walker task has completed and the fan-in
    /// channel has been drained. The output is unordered; overlapping roots
    /// may produce duplicate records, which downstream inode grouping
    /// tolerates.
    ///
    /// # Errors
    ///
    /// Only worker-pool construction can fail; per-directory errors go to
    /// the error sink.
    pub fn run(self) -> Result<Vec<Arc<FileRecord>>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("walker-{i}"))
            .build()
            .context("create walker pool")?;

        let state = Arc::new(WalkState {
            pool,
            sem: Semaphore::new(self.workers),
            stats: ScanStats::new(),
            bar: Bar::spinner(self.show_progress),
            min_size: self.min_size,
            excludes: self.excludes,
            errors: self.errors,
            shutdown: self.shutdown,
        });
        state.bar.describe(&state.stats);

        let (tx, rx) = sync_channel(RESULT_BUFFER);

        for path in &self.paths {
            match std::path::absolute(path) {
                Ok(abs) => spawn_walker(&state, abs, tx.clone()),
                Err(err) => state
                    .errors
                    .report(anyhow::Error::new(err).context(path.display().to_string())),
            }
        }
        drop(tx); // collector finishes once the walkers drop their clones

        let mut records = Vec::new();
        for rec in rx {
            records.push(rec);
        }

        state.bar.finish(&state.stats);
        Ok(records)
    }
}

fn spawn_walker(state: &Arc<WalkState>, dir: PathBuf, tx: SyncSender<Arc<FileRecord>>) {
    let task_state = Arc::clone(state);
    state
        .pool
        .spawn(move || walk_directory(&task_state, dir, tx));
}

/// Process one directory: list under the semaphore, enqueue matches, then
/// recurse into non-excluded subdirectories.
fn walk_directory(state: &Arc<WalkState>, dir: PathBuf, tx: SyncSender<Arc<FileRecord>>) {
    if state.is_shutdown() {
        return;
    }

    let listing = {
        let _permit = state.sem.acquire();
        list_directory(&dir)
    }; // permit released here, before any children spawn

    let (files, subdirs) = match listing {
        Ok(listing) => listing,
        Err(err) => {
            state
                .errors
                .report(anyhow::Error::new(err).context(dir.display().to_string()));
            return;
        }
    };

    for rec in files {
        state.stats.scanned_files.fetch_add(1, Ordering::Relaxed);
        state.stats.scanned_bytes.fetch_add(rec.size, Ordering::Relaxed);
        if rec.size >= state.min_size && !state.is_excluded(&rec.path) {
            state.stats.matched_files.fetch_add(1, Ordering::Relaxed);
            state.stats.matched_bytes.fetch_add(rec.size, Ordering::Relaxed);
            if tx.send(Arc::new(rec)).is_err() {
                return; // collector gone, nothing left to do
            }
        }
    }
    state.bar.describe(&state.stats);

    for sub in subdirs {
        // A pattern matching a directory basename prunes the whole subtree.
        if state.is_excluded(&sub) {
            continue;
        }
        spawn_walker(state, sub, tx.clone());
    }
}

/// Read a single directory, returning regular-file records and
/// subdirectory paths. The only place directory I/O happens.
fn list_directory(dir: &Path) -> io::Result<(Vec<FileRecord>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut subdirs = Vec::new();

    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else {
            continue; // entry vanished mid-listing
        };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();

        if file_type.is_dir() {
            subdirs.push(path);
        } else if file_type.is_file() {
            // Files we cannot stat (races, permissions) are skipped.
            let Ok(md) = entry.metadata() else {
                continue;
            };
            files.push(FileRecord {
                path,
                size: md.len(),
                mtime: md.modified().unwrap_or(std::time::UNIX_EPOCH),
                dev: md.dev(),
                ino: md.ino(),
                nlink: md.nlink(),
            });
        }
        // Symlinks, sockets, devices: skipped. Symlinks are never followed.
    }

    Ok((files, subdirs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn scan(dir: &Path, min_size: u64, excludes: &[&str]) -> Vec<Arc<FileRecord>> {
        let patterns = excludes
            .iter()
            .map(|p| Pattern::new(p).unwrap())
            .collect();
        Scanner::new(
            vec![dir.to_path_buf()],
            min_size,
            patterns,
            2,
            false,
            ErrorSink::disabled(),
        )
        .run()
        .unwrap()
    }

    fn write_file(path: &Path, content: &[u8]) {
        let mut f = File::create(path).unwrap();
        f.write_all(content).unwrap();
    }

    #[test]
    fn test_scanner_finds_nested_files() {
        let dir = TempDir::new().unwrap();
        write_file(&dir.path().join("a.txt"), b"hello");
        fs::create_dir(dir.path().join("sub")).unwrap();
        write_file(&dir.path().join("sub/b.txt"), b"world!");

        let mut names: Vec<_> = scan(dir.path(), 1, &[])
            .iter()
            .map(|r| r.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_scanner_records_stat_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        write_file(&path, b"12345");

        let records = scan(dir.path(), 1, &[]);
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.size, 5);
        assert!(rec.ino != 0);
        assert_eq!(rec.nlink, 1);
        assert!(rec.path.is_absolute());
    }

    #[test]
    fn test_scanner_min_size_filter() {
        let dir = TempDir::new().unwrap();
        write_file(&dir.path().join("small"), b"abc");
        write_file(&dir.path().join("large"), &[b'x'; 64]);

        let records = scan(dir.path(), 10, &[]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path.file_name().unwrap(), "large");
    }

    #[test]
    fn test_scanner_excludes_basenames() {
        let dir = TempDir::new().unwrap();
        write_file(&dir.path().join("keep.txt"), b"keep");
        write_file(&dir.path().join("skip.bak"), b"skip");

        let records = scan(dir.path(), 1, &["*.bak"]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path.file_name().unwrap(), "keep.txt");
    }

    #[test]
    fn test_scanner_prunes_excluded_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        write_file(&dir.path().join("node_modules/dep.js"), b"module");
        write_file(&dir.path().join("app.js"), b"app");

        let records = scan(dir.path(), 1, &["node_modules"]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path.file_name().unwrap(), "app.js");
    }

    #[test]
    fn test_scanner_skips_symlinks() {
        let dir = TempDir::new().unwrap();
        write_file(&dir.path().join("real"), b"content");
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        let records = scan(dir.path(), 1, &[]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path.file_name().unwrap(), "real");
    }

    #[test]
    fn test_scanner_keeps_every_hardlink_path() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        write_file(&a, b"shared");
        fs::hard_link(&a, dir.path().join("b")).unwrap();

        // Both paths are recorded; the screener groups them by inode later.
        let records = scan(dir.path(), 1, &[]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ino, records[1].ino);
        assert_eq!(records[0].nlink, 2);
    }

    #[test]
    fn test_scanner_missing_root_is_not_fatal() {
        let records = Scanner::new(
            vec![PathBuf::from("/nonexistent/dupedog-test-root")],
            1,
            Vec::new(),
            2,
            false,
            ErrorSink::disabled(),
        )
        .run()
        .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_scanner_overlapping_roots_duplicate_records() {
        let dir = TempDir::new().unwrap();
        write_file(&dir.path().join("f"), b"data");

        let records = Scanner::new(
            vec![dir.path().to_path_buf(), dir.path().to_path_buf()],
            1,
            Vec::new(),
            2,
            false,
            ErrorSink::disabled(),
        )
        .run()
        .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_scanner_shutdown_stops_walk() {
        let dir = TempDir::new().unwrap();
        for i in 0..20 {
            write_file(&dir.path().join(format!("f{i}")), b"data");
        }
        let flag = Arc::new(AtomicBool::new(true));

        let records = Scanner::new(
            vec![dir.path().to_path_buf()],
            1,
            Vec::new(),
            2,
            false,
            ErrorSink::disabled(),
        )
        .with_shutdown_flag(flag)
        .run()
        .unwrap();
        assert!(records.is_empty());
    }
}
