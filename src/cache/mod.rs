//! Encrypted, TTL-scoped key/value store for connectors.
//!
//! Connectors use this cache to avoid redundant remote calls: a typical key
//! combines the resource name with the canonical constraint hash of
//! [`crate::protocol::QueryConstraint::hash`]. Values are (rows, metadata)
//! pairs; both are encrypted at rest and become unreadable once their TTL
//! elapses, with expiry enforced lazily at read time rather than by a
//! background sweep.
//!
//! # Storage layout
//!
//! The store is a single SQLite database at
//! `<platform cache dir>/tabwire/plugins/<segments...>`, where the last
//! path segment names the database file. Rows and metadata are two linked
//! records sharing one key namespace (`<key>` and `<key>-metadata`),
//! written in a single transaction so an interrupted set can never leave a
//! readable-but-wrong entry.
//!
//! The connection holds an exclusive file lock for its whole lifetime. If
//! the path is already locked by another instance, construction falls back
//! to a uniquely suffixed sibling file instead of blocking: liveness is
//! preferred over shared-cache semantics.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::crypto::EncryptionKey;

/// Key suffix of the metadata record linked to a value record.
const METADATA_SUFFIX: &str = "-metadata";

/// TTL applied when a set does not specify one.
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Default maximum on-disk size of the cache in bytes (64 MiB).
const DEFAULT_MAX_DISK_SIZE: u64 = 1 << 26;

/// Default maximum in-memory page cache size in bytes (8 MiB).
const DEFAULT_MAX_MEMORY_SIZE: u64 = 1 << 23;

/// SQLite page size assumed when translating the disk limit into pages.
const PAGE_SIZE: u64 = 4096;

/// String-keyed scalar metadata stored alongside the rows of an entry.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The entry is absent, expired, or undecodable.
    ///
    /// Callers treat this as "repopulate", never as fatal; the three causes
    /// are deliberately indistinguishable.
    #[error("cache entry not found")]
    Miss,

    /// The cache handle was closed.
    #[error("the cache is closed")]
    Closed,

    /// The encryption key is not 16, 24, or 32 bytes long.
    #[error("encryption key must be 16, 24 or 32 bytes long")]
    InvalidKeyLength,

    /// No path segments were supplied.
    #[error("at least one path segment is required")]
    MissingSegments,

    /// The platform cache directory could not be determined.
    #[error("failed to determine the cache directory")]
    NoCacheDir,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Construction options for [`Cache::open`].
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Hierarchical namespace under the cache root; the last segment names
    /// the database file. Must be unique per running plugin instance —
    /// typically the plugin name followed by a hash of the account the data
    /// belongs to.
    pub segments: Vec<String>,

    /// Encryption key; must be exactly 16, 24, or 32 bytes for AES-128,
    /// AES-192 and AES-256 respectively.
    pub encryption_key: Vec<u8>,

    /// Maximum on-disk size in bytes. Defaults to 64 MiB.
    pub max_disk_size: Option<u64>,

    /// Maximum in-memory page cache size in bytes. Defaults to 8 MiB.
    pub max_memory_size: Option<u64>,

    /// Override of the platform cache directory, mainly for tests.
    pub base_dir: Option<PathBuf>,
}

/// Encrypted, TTL-scoped key/value store.
///
/// A single handle needs no external locking but is bound to one thread at
/// a time (the underlying connection is not `Sync`). Two handles opened on
/// the same path concurrently do not share state: the second one lands on a
/// fallback file (see the module docs).
pub struct Cache {
    conn: Option<Connection>,
    key: EncryptionKey,
    path: PathBuf,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("conn", &self.conn.is_some())
            .field("key", &"<redacted>")
            .field("path", &self.path)
            .finish()
    }
}

impl Cache {
    /// Open (or create) the cache described by `options`.
    ///
    /// # Errors
    ///
    /// Fails synchronously on a bad encryption-key length, missing path
    /// segments, an unresolvable cache directory, or directory creation
    /// failure. A locked path is not an error: construction falls back to a
    /// suffixed sibling file.
    pub fn open(options: CacheOptions) -> CacheResult<Self> {
        if options.segments.is_empty() {
            return Err(CacheError::MissingSegments);
        }
        let key =
            EncryptionKey::new(&options.encryption_key).map_err(|_| CacheError::InvalidKeyLength)?;

        let base = match options.base_dir {
            Some(dir) => dir,
            None => dirs::cache_dir().ok_or(CacheError::NoCacheDir)?,
        };
        let mut path = base.join("tabwire").join("plugins");
        for segment in &options.segments {
            path.push(segment);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let max_disk = options.max_disk_size.unwrap_or(DEFAULT_MAX_DISK_SIZE);
        let max_memory = options.max_memory_size.unwrap_or(DEFAULT_MAX_MEMORY_SIZE);

        let (conn, path) = match Self::open_exclusive(&path) {
            Ok(conn) => (conn, path),
            Err(err) if is_busy(&err) => {
                // Another instance holds the lock; trade shared-cache
                // semantics for liveness and use a sibling file.
                let fallback = suffixed_sibling(&path);
                tracing::debug!(
                    path = %path.display(),
                    fallback = %fallback.display(),
                    "cache path is locked, falling back"
                );
                (Self::open_exclusive(&fallback)?, fallback)
            }
            Err(err) => return Err(err.into()),
        };

        Self::apply_limits(&conn, max_disk, max_memory)?;

        Ok(Self {
            conn: Some(conn),
            key,
            path,
        })
    }

    /// Open a connection that owns the file exclusively for its lifetime.
    ///
    /// The lock is taken eagerly so that a colliding instance fails fast
    /// with `SQLITE_BUSY` instead of waiting.
    fn open_exclusive(path: &Path) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::ZERO)?;
        conn.query_row("PRAGMA locking_mode = exclusive", [], |_| Ok(()))?;
        conn.execute_batch(
            "BEGIN EXCLUSIVE;
             CREATE TABLE IF NOT EXISTS entries (
                 key        TEXT PRIMARY KEY,
                 value      TEXT NOT NULL,
                 expires_at INTEGER NOT NULL
             );
             COMMIT;",
        )?;
        Ok(conn)
    }

    fn apply_limits(
        conn: &Connection,
        max_disk: u64,
        max_memory: u64,
    ) -> Result<(), rusqlite::Error> {
        let pages = (max_disk / PAGE_SIZE).max(1);
        conn.query_row(&format!("PRAGMA max_page_count = {pages}"), [], |_| Ok(()))?;

        // Negative cache_size means "limit in KiB".
        let kib = (max_memory / 1024).max(1);
        conn.execute_batch(&format!("PRAGMA cache_size = -{kib}"))?;
        Ok(())
    }

    fn conn(&self) -> CacheResult<&Connection> {
        self.conn.as_ref().ok_or(CacheError::Closed)
    }

    /// The file this cache actually landed on.
    ///
    /// Differs from the requested path when the collision fallback applied.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the rows and metadata stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Miss`] if the entry is absent, expired, or
    /// cannot be decrypted/decoded.
    pub fn get(&self, key: &str) -> CacheResult<(Vec<crate::protocol::Row>, Metadata)> {
        let conn = self.conn()?;
        let now = now_millis();

        let value = self.fetch_record(conn, key, now)?;
        let metadata = self.fetch_record(conn, &format!("{key}{METADATA_SUFFIX}"), now)?;

        let rows = serde_json::from_slice(&value).map_err(|_| CacheError::Miss)?;
        let metadata = serde_json::from_slice(&metadata).map_err(|_| CacheError::Miss)?;
        Ok((rows, metadata))
    }

    /// Read and decrypt one record, purging it lazily when expired.
    fn fetch_record(&self, conn: &Connection, key: &str, now: i64) -> CacheResult<Vec<u8>> {
        let record: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, expires_at FROM entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((ciphertext, expires_at)) = record else {
            return Err(CacheError::Miss);
        };

        if expires_at <= now {
            conn.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
            return Err(CacheError::Miss);
        }

        self.key.decrypt(&ciphertext).map_err(|_| CacheError::Miss)
    }

    /// Store rows and metadata under `key` for the duration of `ttl`.
    ///
    /// An unspecified `ttl` defaults to one hour. Both records are written
    /// in one transaction; an interrupted set leaves either the previous
    /// entry or the new one, never a mix.
    pub fn set(
        &self,
        key: &str,
        rows: &[crate::protocol::Row],
        metadata: &Metadata,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let conn = self.conn()?;

        let ttl = ttl.unwrap_or(DEFAULT_TTL);
        let expires_at = now_millis() + ttl.as_millis() as i64;

        let value = self
            .key
            .encrypt(&serde_json::to_vec(rows)?)
            .map_err(|e| CacheError::Crypto(e.to_string()))?;
        let meta = self
            .key
            .encrypt(&serde_json::to_vec(metadata)?)
            .map_err(|e| CacheError::Crypto(e.to_string()))?;

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![format!("{key}{METADATA_SUFFIX}"), meta, expires_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Delete the entry under `key` (both linked records).
    pub fn delete(&self, key: &str) -> CacheResult<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
        tx.execute(
            "DELETE FROM entries WHERE key = ?1",
            params![format!("{key}{METADATA_SUFFIX}")],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Delete every entry whose key starts with `prefix`.
    ///
    /// Typically used after a mutation to invalidate all cached pages of
    /// one resource. Metadata records share the value record's prefix, so
    /// they are swept by the same pattern.
    pub fn clear_with_prefix(&self, prefix: &str) -> CacheResult<()> {
        let conn = self.conn()?;
        let pattern = format!("{}%", escape_like(prefix));
        conn.execute(
            "DELETE FROM entries WHERE key LIKE ?1 ESCAPE '\\'",
            params![pattern],
        )?;
        Ok(())
    }

    /// Delete every entry in the cache.
    pub fn clear(&self) -> CacheResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM entries", [])?;
        Ok(())
    }

    /// Number of stored records and their total encrypted size in bytes.
    ///
    /// Each logical entry accounts for two records (value and metadata).
    pub fn stats(&self) -> CacheResult<CacheStats> {
        let conn = self.conn()?;
        let record_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        let total_size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(value)), 0) FROM entries",
            [],
            |row| row.get(0),
        )?;
        Ok(CacheStats {
            record_count: record_count as usize,
            total_size_bytes: total_size as usize,
        })
    }

    /// Close the cache, releasing the storage lock.
    ///
    /// Subsequent operations on this handle fail with
    /// [`CacheError::Closed`]; a new cache opened at the same path
    /// afterwards succeeds.
    pub fn close(&mut self) -> CacheResult<()> {
        match self.conn.take() {
            Some(conn) => conn.close().map_err(|(_, err)| err.into()),
            None => Err(CacheError::Closed),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of records in the store (two per logical entry).
    pub record_count: usize,
    /// Total size of all encrypted values in bytes.
    pub total_size_bytes: usize,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Whether the error is SQLite's "database is locked".
fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Escape LIKE wildcards so a prefix matches literally.
fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// A sibling path with a random 8-letter suffix, for the lock-collision
/// fallback.
fn suffixed_sibling(path: &Path) -> PathBuf {
    use rand::Rng;

    let mut rng = rand::rng();
    let suffix: String = (0..8).map(|_| rng.random_range(b'a'..=b'z') as char).collect();

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache".to_string());
    path.with_file_name(format!("{file_name}-{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("plain"), "plain");
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_suffixed_sibling_keeps_the_parent() {
        let path = PathBuf::from("/tmp/tabwire/plugins/demo/cache");
        let sibling = suffixed_sibling(&path);
        assert_eq!(sibling.parent(), path.parent());

        let name = sibling.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("cache-"));
        assert_eq!(name.len(), "cache-".len() + 8);
    }

    #[test]
    fn test_missing_segments_fail_construction() {
        let err = Cache::open(CacheOptions {
            segments: vec![],
            encryption_key: vec![0u8; 16],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, CacheError::MissingSegments));
    }

    #[test]
    fn test_bad_key_length_fails_construction() {
        let err = Cache::open(CacheOptions {
            segments: vec!["demo".to_string()],
            encryption_key: vec![0u8; 10],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, CacheError::InvalidKeyLength));
    }
}
