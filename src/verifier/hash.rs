//! Range hashing with SHA-256.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};

/// Read buffer size for sequential range hashing.
pub(crate) const BLOCK_SIZE: usize = 64 * 1024;

/// Hash `size` bytes of `path` starting at `start`.
///
/// Returns the digest and the number of bytes actually read, which can be
/// short if the file shrank since it was scanned. The optional `cancel`
/// flag is checked at every buffer boundary; when set, hashing stops with
/// [`io::ErrorKind::Interrupted`] and the partial digest is discarded.
///
/// # Errors
///
/// Propagates open, seek, and read failures.
pub fn hash_range(
    path: &Path,
    start: u64,
    size: u64,
    cancel: Option<&AtomicBool>,
) -> io::Result<([u8; 32], u64)> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut remaining = size;
    let mut total = 0u64;

    while remaining > 0 {
        if let Some(flag) = cancel {
            if flag.load(Ordering::SeqCst) {
                return Err(io::ErrorKind::Interrupted.into());
            }
        }
        let want = BLOCK_SIZE.min(remaining as usize);
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            break; // file ended early (truncated since scan)
        }
        hasher.update(&buf[..n]);
        total += n as u64;
        remaining -= n as u64;
    }

    Ok((hasher.finalize().into(), total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    #[test]
    fn test_hash_range_full_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"hello world").unwrap();

        let (hash, n) = hash_range(&path, 0, 11, None).unwrap();
        assert_eq!(n, 11);
        // SHA-256 of "hello world".
        assert_eq!(
            hash[..4],
            [0xb9, 0x4d, 0x27, 0xb9],
        );
    }

    #[test]
    fn test_hash_range_subrange_differs_from_whole() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"abcdefgh").unwrap();

        let (whole, _) = hash_range(&path, 0, 8, None).unwrap();
        let (head, n) = hash_range(&path, 0, 4, None).unwrap();
        let (tail, m) = hash_range(&path, 4, 4, None).unwrap();
        assert_eq!(n, 4);
        assert_eq!(m, 4);
        assert_ne!(whole, head);
        assert_ne!(head, tail);
    }

    #[test]
    fn test_hash_range_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, vec![0xAB; 3 * BLOCK_SIZE + 17]).unwrap();

        let (a, _) = hash_range(&path, BLOCK_SIZE as u64, 2 * BLOCK_SIZE as u64, None).unwrap();
        let (b, _) = hash_range(&path, BLOCK_SIZE as u64, 2 * BLOCK_SIZE as u64, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_range_short_read_on_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"1234").unwrap();

        // Asking for more than the file holds reads what exists.
        let (_, n) = hash_range(&path, 0, 100, None).unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn test_hash_range_cancellation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, vec![0u8; 4 * BLOCK_SIZE]).unwrap();

        let cancel = AtomicBool::new(true);
        let err = hash_range(&path, 0, 4 * BLOCK_SIZE as u64, Some(&cancel)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn test_hash_range_missing_file() {
        assert!(hash_range(Path::new("/nonexistent/f"), 0, 1, None).is_err());
    }
}
