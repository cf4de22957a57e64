//! Persistent hash cache backed by SQLite.
//!
//! The cache makes re-runs fast by storing range hashes keyed on everything
//! that could invalidate them (path, size, inode, mtime, range). See
//! [`key`] for the exact layout.
//!
//! # Two-File Self-Cleaning Scheme
//!
//! Opening a cache at path `P` opens the existing database read-only and
//! creates `P.new` for writing. Every lookup *hit* copies the entry into
//! the new database; every fresh hash is written there too. On a clean
//! close, `P.new` is renamed over `P`. Entries that were never looked up
//! during the run are thereby pruned, so the cache never accumulates keys
//! for files that no longer exist.
//!
//! Exclusive creation of `P.new` serializes concurrent instances: a second
//! process opening the same cache path fails fast instead of corrupting
//! either database.
//!
//! # Disabled Mode
//!
//! [`Cache::open`] with `None` returns a no-op cache whose lookups always
//! miss and whose stores do nothing, so the verifier can drive it
//! unconditionally.

pub mod key;

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use thiserror::Error;

use crate::types::FileRecord;
use self::key::make_key;

/// SHA-256 digest length; values of any other length are rejected.
const HASH_SIZE: usize = 32;

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// SQLite-level failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem-level failure (create, rename).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `P.new` already exists, so another instance holds the cache.
    #[error("cache {0} is locked by another instance")]
    Locked(PathBuf),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

struct Inner {
    read_db: Option<Connection>,
    write_db: Option<Connection>,
    path: PathBuf,
    new_path: PathBuf,
}

/// Persistent range-hash cache, or a no-op when opened without a path.
pub struct Cache {
    inner: Option<Mutex<Inner>>,
}

impl Cache {
    /// Open the cache at `path`, or return a disabled no-op cache for `None`.
    ///
    /// # Errors
    ///
    /// Fails if the cache directory cannot be created, if `path.new` already
    /// exists (another instance is running), or if the new database cannot
    /// be initialized. An unreadable *existing* database is not an error:
    /// the run proceeds with an empty read side.
    pub fn open(path: Option<&Path>) -> CacheResult<Self> {
        let Some(path) = path.filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(Self { inner: None });
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let read_db = if path.exists() {
            Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).ok()
        } else {
            None
        };

        let mut new_os = path.as_os_str().to_os_string();
        new_os.push(".new");
        let new_path = PathBuf::from(new_os);

        // Exclusive creation is the instance lock.
        match OpenOptions::new().write(true).create_new(true).open(&new_path) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(CacheError::Locked(new_path));
            }
            Err(err) => return Err(err.into()),
        }

        let write_db = Connection::open(&new_path)?;
        write_db.execute(
            "CREATE TABLE IF NOT EXISTS hashes (
                key BLOB PRIMARY KEY,
                hash BLOB NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            inner: Some(Mutex::new(Inner {
                read_db,
                write_db: Some(write_db),
                path: path.to_path_buf(),
                new_path,
            })),
        })
    }

    /// Look up the cached hash for a byte range of `rec`.
    ///
    /// Returns `Ok(None)` on a miss or when disabled. A hit is copied into
    /// the write database so it survives into the next generation.
    ///
    /// # Errors
    ///
    /// Surfaces read errors; neither database is left corrupted.
    pub fn lookup(&self, rec: &FileRecord, start: u64, size: u64) -> CacheResult<Option<[u8; HASH_SIZE]>> {
        let Some(inner) = &self.inner else {
            return Ok(None);
        };
        let inner = inner.lock().unwrap();
        let Some(read_db) = &inner.read_db else {
            return Ok(None);
        };

        let cache_key = make_key(rec, start, size);
        let value: Option<Vec<u8>> = read_db
            .query_row(
                "SELECT hash FROM hashes WHERE key = ?1",
                [&cache_key],
                |row| row.get(0),
            )
            .optional()?;

        let Some(value) = value else {
            return Ok(None);
        };
        if value.len() != HASH_SIZE {
            return Ok(None);
        }

        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&value);

        // Self-cleaning: carry the live entry over to the new database. A
        // failed copy costs a future miss, not this hit.
        let _ = inner.put(&cache_key, &hash);

        Ok(Some(hash))
    }

    /// Store a freshly computed range hash in the write database.
    ///
    /// # Errors
    ///
    /// Surfaces write errors; callers report them and continue verifying.
    pub fn store(&self, rec: &FileRecord, start: u64, size: u64, hash: &[u8; HASH_SIZE]) -> CacheResult<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let inner = inner.lock().unwrap();
        inner.put(&make_key(rec, start, size), hash)
    }

    /// Close both databases and atomically promote the new generation.
    ///
    /// The rename of `P.new` over `P` only happens if the write database
    /// closed cleanly, so a failed run never clobbers the previous cache.
    ///
    /// # Errors
    ///
    /// Returns the first close or rename failure.
    pub fn close(self) -> CacheResult<()> {
        let Some(inner) = self.inner else {
            return Ok(());
        };
        let inner = inner.into_inner().unwrap();

        if let Some(db) = inner.read_db {
            let _ = db.close();
        }
        if let Some(db) = inner.write_db {
            db.close().map_err(|(_, err)| CacheError::Database(err))?;
            fs::rename(&inner.new_path, &inner.path)?;
        }
        Ok(())
    }
}

impl Inner {
    fn put(&self, cache_key: &[u8], hash: &[u8; HASH_SIZE]) -> CacheResult<()> {
        let Some(write_db) = &self.write_db else {
            return Ok(());
        };
        write_db.execute(
            "INSERT OR REPLACE INTO hashes (key, hash) VALUES (?1, ?2)",
            rusqlite::params![cache_key, &hash[..]],
        )?;
        Ok(())
    }
}
