//! Atomic link replacement.
//!
//! Replacing a target with a link must never leave the target path absent.
//! The protocol: create the desired link under `<target>.dupedog.tmp`, then
//! commit with `rename(tmp, target)`; POSIX rename guarantees the target
//! exists at every instant, pointing at either the old file or the new
//! link. Staging and committing are split so the caller can close the
//! locked target handle between the two steps.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Suffix of the staging file created next to each target.
pub const TMP_SUFFIX: &str = ".dupedog.tmp";

/// Minimum age before a leftover tmp file is considered orphaned.
///
/// Younger files are assumed to belong to an active operation. One minute
/// is a heuristic: long enough that a live run will have renamed or removed
/// its tmp file, short enough that crash leftovers do not linger across
/// reruns.
const ORPHANED_TMP_MAX_AGE: Duration = Duration::from_secs(60);

/// A staged link awaiting its atomic rename over the target.
#[derive(Debug)]
pub struct PendingLink {
    tmp: PathBuf,
    target: PathBuf,
}

impl PendingLink {
    /// Commit the staged link by renaming it over the target.
    ///
    /// # Errors
    ///
    /// On failure the tmp file is removed best-effort and the rename error
    /// returned; the target is left unchanged.
    pub fn commit(self) -> io::Result<()> {
        if let Err(err) = fs::rename(&self.tmp, &self.target) {
            let _ = fs::remove_file(&self.tmp);
            return Err(err);
        }
        Ok(())
    }
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_os_string();
    os.push(TMP_SUFFIX);
    PathBuf::from(os)
}

/// Stage a hardlink to `source` next to `target`.
///
/// A colliding tmp file from an interrupted run is cleaned up (subject to
/// the safety rules of [`cleanup_orphaned_tmp`]) and the link retried once.
///
/// # Errors
///
/// Propagates link failures, notably `EXDEV` when source and target live
/// on different devices.
pub fn stage_hardlink(source: &Path, target: &Path) -> io::Result<PendingLink> {
    let tmp = tmp_path(target);
    if let Err(err) = fs::hard_link(source, &tmp) {
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(err);
        }
        cleanup_orphaned_tmp(&tmp, ORPHANED_TMP_MAX_AGE).map_err(|e| {
            io::Error::new(e.kind(), format!("tmp file exists and cannot be cleaned: {e}"))
        })?;
        fs::hard_link(source, &tmp)?;
    }
    Ok(PendingLink {
        tmp,
        target: target.to_path_buf(),
    })
}

/// Stage a symlink to `source` next to `target`.
///
/// The stored link target is relative to the target's directory so the
/// link survives mount-point renames; if relativization fails the absolute
/// path is used. The source is stat'ed first to avoid staging a dangling
/// link when it vanished after verification.
///
/// # Errors
///
/// Propagates stat and symlink failures.
pub fn stage_symlink(source: &Path, target: &Path) -> io::Result<PendingLink> {
    fs::metadata(source).map_err(|e| {
        io::Error::new(e.kind(), format!("source missing before symlink creation: {e}"))
    })?;

    let link_target = match target.parent() {
        Some(dir) => relative_to(dir, source),
        None => source.to_path_buf(),
    };

    let tmp = tmp_path(target);
    if let Err(err) = std::os::unix::fs::symlink(&link_target, &tmp) {
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(err);
        }
        cleanup_orphaned_tmp(&tmp, ORPHANED_TMP_MAX_AGE).map_err(|e| {
            io::Error::new(e.kind(), format!("tmp file exists and cannot be cleaned: {e}"))
        })?;
        std::os::unix::fs::symlink(&link_target, &tmp)?;
    }
    Ok(PendingLink {
        tmp,
        target: target.to_path_buf(),
    })
}

/// Remove an orphaned tmp file if, and only if, it is safe.
///
/// Both criteria must hold:
///
/// 1. mtime older than `max_age`, shielding concurrent live operations.
/// 2. The file is a symlink (no data of its own), or a regular file with
///    `nlink > 1` (another name still references the data). A regular file
///    with a single link is never deleted, as it may be the only copy.
///
/// # Errors
///
/// Returns an error describing which criterion failed; the file is left
/// in place.
fn cleanup_orphaned_tmp(path: &Path, max_age: Duration) -> io::Result<()> {
    let info = fs::symlink_metadata(path)?;

    let mtime = info.modified()?;
    let age = SystemTime::now()
        .duration_since(mtime)
        .unwrap_or(Duration::ZERO);
    if age < max_age {
        return Err(io::Error::other(format!(
            "file too recent (age {age:?}, cutoff {max_age:?})"
        )));
    }

    if info.file_type().is_symlink() {
        return fs::remove_file(path);
    }
    if !info.is_file() {
        return Err(io::Error::other("not a regular file or symlink"));
    }
    if info.nlink() <= 1 {
        return Err(io::Error::other(format!(
            "nlink={}, may be only copy of data",
            info.nlink()
        )));
    }
    fs::remove_file(path)
}

/// Compute the path of `source` relative to `dir`.
///
/// Falls back to `source` unchanged when the two share no common prefix
/// (which cannot happen for two absolute paths).
fn relative_to(dir: &Path, source: &Path) -> PathBuf {
    let dir_parts: Vec<Component<'_>> = dir.components().collect();
    let src_parts: Vec<Component<'_>> = source.components().collect();

    let common = dir_parts
        .iter()
        .zip(src_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 {
        return source.to_path_buf();
    }

    let mut rel = PathBuf::new();
    for _ in common..dir_parts.len() {
        rel.push("..");
    }
    for part in &src_parts[common..] {
        rel.push(part);
    }
    rel
}
