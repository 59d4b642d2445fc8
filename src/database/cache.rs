use super::{CACHE_FILE_NAME, FingerprintStore, ImageFingerprint, MutationSignature, StoreError};
use crate::core::hash::Hash64;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS fingerprints (
        path BLOB PRIMARY KEY,
        signature TEXT NOT NULL,
        profile TEXT NOT NULL,
        blur_score REAL NOT NULL,
        tenengrad REAL,
        phash INTEGER NOT NULL,
        dhash INTEGER NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )";

const SELECT_ROW: &str = "SELECT signature, profile, blur_score, tenengrad, phash, dhash, width, height
     FROM fingerprints WHERE path = ?1";

type RawRow = (String, String, f64, Option<f64>, i64, i64, u32, u32);

/// SQLite-backed fingerprint cache, one file per scanned folder.
///
/// The database runs in WAL mode so a crash between scans never leaves a
/// half-written row behind.
pub struct SqliteStore {
    conn: Connection,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the cache colocated with `folder`.
    pub fn open_at(folder: &Path) -> Result<Self, StoreError> {
        Self::open(&folder.join(CACHE_FILE_NAME))
    }

    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn,
            db_path: Some(db_path.to_path_buf()),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
            db_path: None,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Open the cache next to `folder`, discarding it and starting cold if
    /// the persisted state cannot be read.
    pub fn open_or_reset(folder: &Path) -> Result<Self, StoreError> {
        let db_path = folder.join(CACHE_FILE_NAME);
        match Self::open(&db_path) {
            Ok(store) => Ok(store),
            Err(StoreError::Corrupt { path, reason }) => {
                log::warn!("Discarding unreadable cache {}: {}", path, reason);
                Self::remove_files(&db_path)?;
                Self::open(&db_path)
            }
            Err(e) => Err(e),
        }
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Delete every row. Returns the number of rows removed.
    pub fn clear(&mut self) -> Result<usize, StoreError> {
        Ok(self.conn.execute("DELETE FROM fingerprints", [])?)
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        let corrupt = |e: rusqlite::Error| StoreError::Corrupt {
            path: self.display_path(),
            reason: e.to_string(),
        };

        self.conn
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(corrupt)?;
        self.conn.execute(SCHEMA, []).map_err(corrupt)?;

        // An older or foreign table with the same name fails here.
        self.conn
            .prepare(&format!("{} LIMIT 0", SELECT_ROW))
            .map_err(corrupt)?;

        let status: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(corrupt)?;
        if status != "ok" {
            return Err(StoreError::Corrupt {
                path: self.display_path(),
                reason: status,
            });
        }

        Ok(())
    }

    fn display_path(&self) -> String {
        self.db_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| ":memory:".to_string())
    }

    fn remove_files(db_path: &Path) -> Result<(), StoreError> {
        for suffix in ["", "-wal", "-shm"] {
            let mut name = db_path.as_os_str().to_owned();
            name.push(suffix);
            match fs::remove_file(PathBuf::from(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
        Ok(())
    }

    fn decode_row(path: &Path, raw: RawRow) -> Option<ImageFingerprint> {
        let (signature, profile, blur_score, tenengrad, phash, dhash, width, height) = raw;
        let signature = match signature.parse::<MutationSignature>() {
            Ok(signature) => signature,
            Err(e) => {
                log::warn!("Ignoring cache row for {}: {}", path.display(), e);
                return None;
            }
        };

        Some(ImageFingerprint {
            path: path.to_path_buf(),
            signature,
            profile,
            blur_score,
            tenengrad,
            phash: Hash64(phash as u64),
            dhash: Hash64(dhash as u64),
            width,
            height,
        })
    }
}

/// Raw OS bytes, so paths that are not valid UTF-8 keep distinct keys.
fn path_key(path: &Path) -> &[u8] {
    path.as_os_str().as_encoded_bytes()
}

impl FingerprintStore for SqliteStore {
    fn get(&self, path: &Path) -> Result<Option<ImageFingerprint>, StoreError> {
        let mut stmt = self.conn.prepare_cached(SELECT_ROW)?;
        let raw: Option<RawRow> = stmt
            .query_row(params![path_key(path)], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })
            .optional()?;

        Ok(raw.and_then(|raw| Self::decode_row(path, raw)))
    }

    fn put(&mut self, fingerprint: &ImageFingerprint) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR REPLACE INTO fingerprints
             (path, signature, profile, blur_score, tenengrad, phash, dhash, width, height, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        stmt.execute(params![
            path_key(&fingerprint.path),
            fingerprint.signature.to_string(),
            fingerprint.profile,
            fingerprint.blur_score,
            fingerprint.tenengrad,
            fingerprint.phash.0 as i64,
            fingerprint.dhash.0 as i64,
            fingerprint.width,
            fingerprint.height,
            Utc::now().to_rfc3339(),
        ])?;
        Ok(())
    }

    fn invalidate_if_stale(
        &mut self,
        path: &Path,
        current: &MutationSignature,
    ) -> Result<bool, StoreError> {
        let key = path_key(path);
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT signature FROM fingerprints WHERE path = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(signature) if signature != current.to_string() => {
                self.conn
                    .execute("DELETE FROM fingerprints WHERE path = ?1", params![key])?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn purge_missing(&mut self, seen: &HashSet<PathBuf>) -> Result<usize, StoreError> {
        let seen_keys: HashSet<&[u8]> = seen.iter().map(|p| path_key(p)).collect();

        let stored: Vec<Vec<u8>> = {
            let mut stmt = self.conn.prepare("SELECT path FROM fingerprints")?;
            let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let tx = self.conn.transaction()?;
        let mut removed = 0;
        for path in stored.iter().filter(|p| !seen_keys.contains(p.as_slice())) {
            removed += tx.execute("DELETE FROM fingerprints WHERE path = ?1", params![path])?;
        }
        tx.commit()?;

        Ok(removed)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM fingerprints", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
