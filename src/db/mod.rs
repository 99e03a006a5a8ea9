//! SQLite corpus. The sole DB citizen: all reads and writes, schema
//! bootstrap, and FTS consistency live behind `Database`.

pub mod annotations;
pub mod repo;
mod schema;

use anyhow::{bail, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

pub use repo::{CueHit, CueQuery, FtsQueryError, MediaRow, SortOrder};
pub use schema::{SCHEMA, SCHEMA_VERSION};

const BUSY_RETRIES: u32 = 3;
const BUSY_BACKOFF_BASE_MS: u64 = 100;

/// FTS row count diverged from the base table and a rebuild did not fix it.
#[derive(Debug)]
pub struct FtsCorruption(pub String);

impl std::fmt::Display for FtsCorruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FTS index corrupt: {}", self.0)
    }
}

impl std::error::Error for FtsCorruption {}

/// Shared database handle. A single connection guarded by a mutex; writes
/// are short transactions, reads are read-only statements under the same
/// lock.
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Create tables, indexes, the FTS index and its triggers, then verify
    /// the schema version and FTS consistency.
    pub fn initialize(&self) -> Result<()> {
        {
            let conn = self.lock();
            conn.execute_batch(SCHEMA)?;

            let version: Option<i64> = conn
                .query_row("SELECT version FROM schema_meta LIMIT 1", [], |row| {
                    row.get(0)
                })
                .optional()?;
            match version {
                None => {
                    conn.execute(
                        "INSERT INTO schema_meta (version) VALUES (?)",
                        [SCHEMA_VERSION],
                    )?;
                }
                Some(v) if v == SCHEMA_VERSION => {}
                Some(v) => bail!(
                    "database schema version {} does not match expected {}",
                    v,
                    SCHEMA_VERSION
                ),
            }
        }
        self.ensure_fts_consistent()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Compare base-table and FTS row counts; rebuild the index when they
    /// diverge. Returns whether a rebuild happened.
    pub fn ensure_fts_consistent(&self) -> Result<bool> {
        let conn = self.lock();
        let base: i64 = conn.query_row("SELECT COUNT(*) FROM subtitles", [], |row| row.get(0))?;
        let fts: i64 = match conn.query_row("SELECT COUNT(*) FROM subtitles_fts", [], |row| {
            row.get(0)
        }) {
            Ok(n) => n,
            Err(e) => {
                warn!("FTS index unreadable ({}), rebuilding", e);
                -1
            }
        };

        if base == fts {
            return Ok(false);
        }

        warn!(
            "FTS inconsistency detected: {} base rows vs {} indexed, rebuilding",
            base, fts
        );
        conn.execute(
            "INSERT INTO subtitles_fts(subtitles_fts) VALUES('rebuild')",
            [],
        )
        .map_err(|e| FtsCorruption(e.to_string()))?;

        let fts_after: i64 = conn
            .query_row("SELECT COUNT(*) FROM subtitles_fts", [], |row| row.get(0))
            .map_err(|e| FtsCorruption(e.to_string()))?;
        if fts_after != base {
            return Err(FtsCorruption(format!(
                "rebuild left {} indexed rows for {} base rows",
                fts_after, base
            ))
            .into());
        }
        info!("FTS index rebuilt: {} rows", base);
        Ok(true)
    }

    /// Wipe the corpus: all tables truncated, schema reseeded, FTS rebuilt.
    /// Works even when the FTS index itself is corrupt.
    pub fn reset_all(&self) -> Result<()> {
        {
            let conn = self.lock();
            // Triggers go first so base-row deletes cannot touch a possibly
            // corrupt index; the virtual table is dropped outright.
            conn.execute_batch(
                r#"
                DROP TRIGGER IF EXISTS subtitles_ai;
                DROP TRIGGER IF EXISTS subtitles_ad;
                DROP TRIGGER IF EXISTS subtitles_au;
                DROP TABLE IF EXISTS subtitles_fts;
                DELETE FROM subtitles;
                DELETE FROM media_files;
                DELETE FROM bookmarks;
                DELETE FROM tags;
                "#,
            )?;
            conn.execute_batch(SCHEMA)?;
        }
        self.ensure_fts_consistent()?;
        info!("corpus reset complete");
        Ok(())
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tables)
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Run a statement, retrying transient busy/locked outcomes with
/// exponential backoff.
pub(crate) fn with_retry<T>(mut f: impl FnMut() -> rusqlite::Result<T>) -> rusqlite::Result<T> {
    let mut attempt = 0u32;
    loop {
        match f() {
            Err(e) if is_busy(&e) && attempt < BUSY_RETRIES => {
                let delay = BUSY_BACKOFF_BASE_MS * (1 << attempt);
                warn!("database busy, retrying in {} ms", delay);
                std::thread::sleep(Duration::from_millis(delay));
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(&dir.path().join("test.db"), 5000).unwrap();
    db.initialize().unwrap();
    (dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_creates_tables() {
        let (_dir, db) = test_db();
        let tables = db.list_tables().unwrap();
        for expected in ["media_files", "subtitles", "bookmarks", "tags", "schema_meta"] {
            assert!(tables.iter().any(|t| t == expected), "missing {}", expected);
        }
        assert!(tables.iter().any(|t| t == "subtitles_fts"));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (_dir, db) = test_db();
        db.initialize().unwrap();
        db.initialize().unwrap();
    }

    #[test]
    fn test_fts_consistency_detects_trigger_bypass() {
        let (_dir, db) = test_db();
        let media_id = db.upsert_media(Path::new("/m/A.mp4"), 1, 1, "mp4").unwrap();
        let cues: Vec<crate::subtitle::Cue> = (0..100)
            .map(|i| crate::subtitle::Cue {
                start_ms: i * 1000,
                end_ms: i * 1000 + 500,
                text: format!("cue number {}", i),
            })
            .collect();
        db.bulk_insert_subtitles(media_id, None, "en", &cues).unwrap();

        // Delete base rows with triggers disabled to simulate divergence.
        {
            let conn = db.lock();
            conn.execute_batch(
                r#"
                DROP TRIGGER subtitles_ad;
                DELETE FROM subtitles WHERE id IN (SELECT id FROM subtitles LIMIT 10);
                CREATE TRIGGER subtitles_ad AFTER DELETE ON subtitles BEGIN
                    INSERT INTO subtitles_fts(subtitles_fts, rowid, content) VALUES ('delete', old.id, old.content);
                END;
                "#,
            )
            .unwrap();
        }

        let rebuilt = db.ensure_fts_consistent().unwrap();
        assert!(rebuilt);

        let conn = db.lock();
        let base: i64 = conn
            .query_row("SELECT COUNT(*) FROM subtitles", [], |r| r.get(0))
            .unwrap();
        let fts: i64 = conn
            .query_row("SELECT COUNT(*) FROM subtitles_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(base, 90);
        assert_eq!(base, fts);
    }

    #[test]
    fn test_reset_all_empties_everything() {
        let (_dir, db) = test_db();
        let media_id = db.upsert_media(Path::new("/m/A.mp4"), 1, 1, "mp4").unwrap();
        let cues = vec![crate::subtitle::Cue {
            start_ms: 0,
            end_ms: 1000,
            text: "something".into(),
        }];
        db.bulk_insert_subtitles(media_id, None, "en", &cues).unwrap();
        db.toggle_bookmark("/m/A.mp4", 0, true).unwrap();
        db.add_tag("/m/A.mp4", 0, "funny").unwrap();

        db.reset_all().unwrap();

        let conn = db.lock();
        for table in ["media_files", "subtitles", "subtitles_fts", "bookmarks", "tags"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 0, "{} not empty after reset", table);
        }
    }
}
