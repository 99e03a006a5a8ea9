//! Per-cue user annotations: bookmarks and tags keyed by
//! `(media_path, start_ms)`. Written independently of indexing; wiped only
//! by a corpus reset.

use anyhow::Result;
use rusqlite::params;
use std::collections::HashMap;

use super::{with_retry, Database};

/// Bookmark flag and tags for one cue, as returned by the batch lookup.
#[derive(Debug, Clone, Default)]
pub struct CueAnnotations {
    pub bookmarked: bool,
    pub tags: Vec<String>,
}

/// Batch lookups chunk their OR-chains to stay under statement limits.
const BATCH_CHUNK: usize = 100;

impl Database {
    /// Set a cue's bookmark flag. Idempotent: re-setting the current value
    /// changes nothing observable.
    pub fn toggle_bookmark(&self, media_path: &str, start_ms: u64, bookmarked: bool) -> Result<()> {
        let conn = self.lock();
        with_retry(|| {
            conn.execute(
                r#"
                INSERT INTO bookmarks (media_path, start_ms, bookmarked)
                VALUES (?, ?, ?)
                ON CONFLICT(media_path, start_ms) DO UPDATE SET
                    bookmarked = excluded.bookmarked
                "#,
                params![media_path, start_ms as i64, bookmarked as i64],
            )
        })?;
        Ok(())
    }

    pub fn is_bookmarked(&self, media_path: &str, start_ms: u64) -> Result<bool> {
        let conn = self.lock();
        let result = conn.query_row(
            "SELECT bookmarked FROM bookmarks WHERE media_path = ? AND start_ms = ?",
            params![media_path, start_ms as i64],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(v) => Ok(v != 0),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Add a tag to a cue. Adding an existing tag is a no-op.
    pub fn add_tag(&self, media_path: &str, start_ms: u64, tag: &str) -> Result<()> {
        let conn = self.lock();
        with_retry(|| {
            conn.execute(
                "INSERT OR IGNORE INTO tags (media_path, start_ms, tag) VALUES (?, ?, ?)",
                params![media_path, start_ms as i64, tag],
            )
        })?;
        Ok(())
    }

    /// Remove a tag from a cue. Removing an absent tag is a no-op.
    pub fn remove_tag(&self, media_path: &str, start_ms: u64, tag: &str) -> Result<()> {
        let conn = self.lock();
        with_retry(|| {
            conn.execute(
                "DELETE FROM tags WHERE media_path = ? AND start_ms = ? AND tag = ?",
                params![media_path, start_ms as i64, tag],
            )
        })?;
        Ok(())
    }

    pub fn list_tags(&self, media_path: &str, start_ms: u64) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT tag FROM tags WHERE media_path = ? AND start_ms = ? ORDER BY tag",
        )?;
        let tags = stmt
            .query_map(params![media_path, start_ms as i64], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tags)
    }

    /// Batched annotation lookup for a page of search hits. One query per
    /// chunk per table, never per cue.
    pub fn annotations_for(
        &self,
        keys: &[(String, u64)],
    ) -> Result<HashMap<(String, u64), CueAnnotations>> {
        let mut out: HashMap<(String, u64), CueAnnotations> = HashMap::new();
        if keys.is_empty() {
            return Ok(out);
        }
        let conn = self.lock();

        for chunk in keys.chunks(BATCH_CHUNK) {
            let clause = vec!["(media_path = ? AND start_ms = ?)"; chunk.len()].join(" OR ");
            let mut params: Vec<rusqlite::types::Value> = Vec::with_capacity(chunk.len() * 2);
            for (path, start_ms) in chunk {
                params.push(rusqlite::types::Value::Text(path.clone()));
                params.push(rusqlite::types::Value::Integer(*start_ms as i64));
            }

            let sql = format!(
                "SELECT media_path, start_ms, bookmarked FROM bookmarks WHERE {}",
                clause
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows: Vec<(String, i64, i64)> = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            for (path, start_ms, bookmarked) in rows {
                out.entry((path, start_ms as u64)).or_default().bookmarked = bookmarked != 0;
            }

            let sql = format!(
                "SELECT media_path, start_ms, tag FROM tags WHERE {} ORDER BY tag",
                clause
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows: Vec<(String, i64, String)> = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            for (path, start_ms, tag) in rows {
                out.entry((path, start_ms as u64)).or_default().tags.push(tag);
            }
        }

        Ok(out)
    }
}
