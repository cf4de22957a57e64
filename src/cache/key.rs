//! Wire-stable binary key format for cache entries.
//!
//! A key embeds every field that could invalidate a cached range hash; a
//! mismatch on any field is a miss. Layout:
//!
//! ```text
//! version:u8 || path_bytes || 0x00 || size:u64be || ino:u64be
//!            || mtime_ns:i64be || range_start:i64be || range_size:i64be
//! ```

use std::os::unix::ffi::OsStrExt;

use crate::types::FileRecord;

/// Incremented on any change to the key layout.
pub const KEY_VERSION: u8 = 1;

/// Build the deterministic lookup key for one file range.
#[must_use]
pub fn make_key(rec: &FileRecord, start: u64, size: u64) -> Vec<u8> {
    let path = rec.path.as_os_str().as_bytes();
    let mut key = Vec::with_capacity(1 + path.len() + 1 + 8 * 5);
    key.push(KEY_VERSION);
    key.extend_from_slice(path);
    key.push(0); // NUL separator between path and fixed-width fields
    key.extend_from_slice(&rec.size.to_be_bytes());
    key.extend_from_slice(&rec.ino.to_be_bytes());
    key.extend_from_slice(&rec.mtime_ns().to_be_bytes());
    key.extend_from_slice(&(start as i64).to_be_bytes());
    key.extend_from_slice(&(size as i64).to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{Duration, UNIX_EPOCH};

    fn record(path: &str) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            size: 4096,
            mtime: UNIX_EPOCH + Duration::new(100, 5),
            dev: 1,
            ino: 42,
            nlink: 1,
        }
    }

    #[test]
    fn test_key_starts_with_version_and_path() {
        let key = make_key(&record("/a/b"), 0, 1024);
        assert_eq!(key[0], KEY_VERSION);
        assert_eq!(&key[1..5], b"/a/b");
        assert_eq!(key[5], 0);
        assert_eq!(key.len(), 1 + 4 + 1 + 40);
    }

    #[test]
    fn test_any_field_change_yields_distinct_key() {
        let base = record("/a/b");
        let key = make_key(&base, 0, 1024);

        let mut other = base.clone();
        other.path = PathBuf::from("/a/c");
        assert_ne!(key, make_key(&other, 0, 1024));

        let mut other = base.clone();
        other.size = 4097;
        assert_ne!(key, make_key(&other, 0, 1024));

        let mut other = base.clone();
        other.ino = 43;
        assert_ne!(key, make_key(&other, 0, 1024));

        let mut other = base.clone();
        other.mtime += Duration::from_nanos(1);
        assert_ne!(key, make_key(&other, 0, 1024));

        assert_ne!(key, make_key(&base, 1, 1024));
        assert_ne!(key, make_key(&base, 0, 1025));
    }

    #[test]
    fn test_key_is_deterministic() {
        let rec = record("/a/b");
        assert_eq!(make_key(&rec, 7, 99), make_key(&rec, 7, 99));
    }
}
