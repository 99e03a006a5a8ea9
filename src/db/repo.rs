//! Repository operations over the corpus: media upserts, bulk cue inserts,
//! and the LIKE/FTS search planners.

use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};
use std::path::Path;
use tracing::debug;

use super::{with_retry, Database};
use crate::subtitle::{format_timestamp, Cue};

/// One media row as stored.
#[derive(Debug, Clone)]
pub struct MediaRow {
    pub id: i64,
    pub path: String,
    pub size: i64,
    pub last_modified: i64,
    pub has_subtitle: bool,
    pub extension: String,
}

/// Result sort order. For LIKE queries, relevance means shorter content
/// ranks higher; for FTS it is the engine's bm25 rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Relevance,
    Recent,
    Oldest,
}

/// A planned cue query, shared by both search modes.
#[derive(Debug, Clone, Default)]
pub struct CueQuery {
    pub query: String,
    pub lang: Option<String>,
    /// Media extensions to admit (resolved from a media-kind filter).
    pub extensions: Option<Vec<String>>,
    pub min_start_ms: Option<u64>,
    pub max_start_ms: Option<u64>,
    pub sort: SortOrder,
    pub limit: u32,
    pub offset: u32,
    /// Media ids excluded up front (e.g. files gone from disk).
    pub exclude_media_ids: Vec<i64>,
}

/// One matching cue joined with its media row.
#[derive(Debug, Clone)]
pub struct CueHit {
    pub media_path: String,
    pub extension: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub content: String,
    pub lang: String,
}

/// The FTS engine rejected the query string.
#[derive(Debug)]
pub struct FtsQueryError(pub String);

impl std::fmt::Display for FtsQueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FTS query rejected: {}", self.0)
    }
}

impl std::error::Error for FtsQueryError {}

const HIT_COLUMNS: &str =
    "m.path, m.extension, s.start_ms, s.end_ms, s.content, s.lang";

impl Database {
    // ========================================================================
    // Media operations
    // ========================================================================

    /// Insert or refresh a media row, returning its id.
    pub fn upsert_media(
        &self,
        path: &Path,
        size: i64,
        last_modified: i64,
        extension: &str,
    ) -> Result<i64> {
        let path_str = path.to_string_lossy();
        let conn = self.lock();
        with_retry(|| {
            conn.execute(
                r#"
                INSERT INTO media_files (path, size, last_modified, extension)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(path) DO UPDATE SET
                    size = excluded.size,
                    last_modified = excluded.last_modified,
                    extension = excluded.extension,
                    updated_at = CURRENT_TIMESTAMP
                "#,
                params![path_str.as_ref(), size, last_modified, extension],
            )
        })?;
        let id = conn.query_row(
            "SELECT id FROM media_files WHERE path = ?",
            [path_str.as_ref()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn find_media_by_path(&self, path: &Path) -> Result<Option<MediaRow>> {
        let path_str = path.to_string_lossy();
        let conn = self.lock();
        let result = conn.query_row(
            "SELECT id, path, size, last_modified, has_subtitle, extension
             FROM media_files WHERE path = ?",
            [path_str.as_ref()],
            |row| {
                Ok(MediaRow {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    size: row.get(2)?,
                    last_modified: row.get(3)?,
                    has_subtitle: row.get::<_, i64>(4)? != 0,
                    extension: row.get(5)?,
                })
            },
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of media rows whose file no longer exists on disk.
    pub fn missing_media_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, path FROM media_files")?;
        let rows: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows
            .into_iter()
            .filter(|(_, path)| !Path::new(path).exists())
            .map(|(id, _)| id)
            .collect())
    }

    // ========================================================================
    // Subtitle operations
    // ========================================================================

    /// Insert all cues of one track in a single transaction, replacing any
    /// prior cues for the media. Rolls back entirely if any row fails, so a
    /// track is either fully present or absent. Returns rows inserted.
    pub fn bulk_insert_subtitles(
        &self,
        media_id: i64,
        source_path: Option<&Path>,
        lang: &str,
        cues: &[Cue],
    ) -> Result<usize> {
        let source = source_path.map(|p| p.to_string_lossy().to_string());
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let inserted = {
            tx.execute("DELETE FROM subtitles WHERE media_id = ?", [media_id])?;
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO subtitles (media_id, start_ms, end_ms, start_text, end_text, content, lang, source_path)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;
            let mut inserted = 0usize;
            for cue in cues {
                stmt.execute(params![
                    media_id,
                    cue.start_ms as i64,
                    cue.end_ms as i64,
                    format_timestamp(cue.start_ms),
                    format_timestamp(cue.end_ms),
                    cue.text,
                    lang,
                    source,
                ])?;
                inserted += 1;
            }
            tx.execute(
                "UPDATE media_files SET has_subtitle = ? WHERE id = ?",
                params![(inserted > 0) as i64, media_id],
            )?;
            inserted
        };
        tx.commit()?;
        debug!("inserted {} cues for media {}", inserted, media_id);
        Ok(inserted)
    }

    pub fn count_subtitles_for_media(&self, media_id: i64) -> Result<i64> {
        let conn = self.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM subtitles WHERE media_id = ?",
            [media_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_subtitles(&self) -> Result<i64> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM subtitles", [], |row| row.get(0))?)
    }

    pub fn count_media(&self) -> Result<i64> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM media_files", [], |row| row.get(0))?)
    }

    /// Aggregate corpus statistics for status displays.
    pub fn corpus_stats(&self) -> Result<CorpusStats> {
        let conn = self.lock();
        let media_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM media_files", [], |row| row.get(0))?;
        let with_subtitle: i64 = conn.query_row(
            "SELECT COUNT(*) FROM media_files WHERE has_subtitle = 1",
            [],
            |row| row.get(0),
        )?;
        let cue_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM subtitles", [], |row| row.get(0))?;
        let mut stmt = conn.prepare(
            "SELECT lang, COUNT(*) FROM subtitles GROUP BY lang ORDER BY COUNT(*) DESC",
        )?;
        let languages: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        let db_size_bytes = std::fs::metadata(self.path()).map(|m| m.len()).unwrap_or(0);
        Ok(CorpusStats {
            media_count,
            with_subtitle,
            cue_count,
            languages,
            db_size_bytes,
        })
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Case-insensitive substring search. `%` and `_` in the query match
    /// literally.
    pub fn search_like(&self, q: &CueQuery) -> Result<(u64, Vec<CueHit>)> {
        let pattern = format!("%{}%", escape_like(&q.query));
        let mut where_sql = String::from("s.content LIKE ? ESCAPE '\\'");
        let mut params: Vec<Value> = vec![Value::Text(pattern)];
        push_filters(q, &mut where_sql, &mut params);

        let from = "FROM subtitles s JOIN media_files m ON m.id = s.media_id";
        let order = match q.sort {
            SortOrder::Relevance => "ORDER BY length(s.content) ASC, m.path ASC, s.start_ms ASC",
            SortOrder::Recent => "ORDER BY m.last_modified DESC, m.path ASC, s.start_ms ASC",
            SortOrder::Oldest => "ORDER BY m.last_modified ASC, m.path ASC, s.start_ms ASC",
        };
        self.run_search(from, &where_sql, order, params, q)
            .map_err(Into::into)
    }

    /// Full-text search. The query reaches the MATCH operator as typed,
    /// with unbalanced double quotes closed; an engine parse error surfaces
    /// as [`FtsQueryError`].
    pub fn search_fts(&self, q: &CueQuery) -> Result<(u64, Vec<CueHit>)> {
        let match_query = balance_quotes(&q.query);
        let mut where_sql = String::from("subtitles_fts MATCH ?");
        let mut params: Vec<Value> = vec![Value::Text(match_query)];
        push_filters(q, &mut where_sql, &mut params);

        let from = "FROM subtitles_fts \
                    JOIN subtitles s ON s.id = subtitles_fts.rowid \
                    JOIN media_files m ON m.id = s.media_id";
        let order = match q.sort {
            SortOrder::Relevance => "ORDER BY rank, m.path ASC, s.start_ms ASC",
            SortOrder::Recent => "ORDER BY m.last_modified DESC, m.path ASC, s.start_ms ASC",
            SortOrder::Oldest => "ORDER BY m.last_modified ASC, m.path ASC, s.start_ms ASC",
        };

        self.run_search(from, &where_sql, order, params, q).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("fts5") || msg.contains("MATCH") {
                anyhow::Error::new(FtsQueryError(msg))
            } else {
                e.into()
            }
        })
    }

    fn run_search(
        &self,
        from: &str,
        where_sql: &str,
        order: &str,
        params: Vec<Value>,
        q: &CueQuery,
    ) -> rusqlite::Result<(u64, Vec<CueHit>)> {
        let conn = self.lock();

        let count_sql = format!("SELECT COUNT(*) {} WHERE {}", from, where_sql);
        let total: i64 = conn.query_row(
            &count_sql,
            params_from_iter(params.iter()),
            |row| row.get(0),
        )?;

        let page_sql = format!(
            "SELECT {} {} WHERE {} {} LIMIT ? OFFSET ?",
            HIT_COLUMNS, from, where_sql, order
        );
        let mut page_params = params;
        page_params.push(Value::Integer(q.limit as i64));
        page_params.push(Value::Integer(q.offset as i64));

        let mut stmt = conn.prepare(&page_sql)?;
        let hits = stmt
            .query_map(params_from_iter(page_params.iter()), |row| {
                Ok(CueHit {
                    media_path: row.get(0)?,
                    extension: row.get(1)?,
                    start_ms: row.get::<_, i64>(2)? as u64,
                    end_ms: row.get::<_, i64>(3)? as u64,
                    content: row.get(4)?,
                    lang: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok((total as u64, hits))
    }
}

/// Aggregate corpus statistics.
#[derive(Debug, Clone)]
pub struct CorpusStats {
    pub media_count: i64,
    pub with_subtitle: i64,
    pub cue_count: i64,
    pub languages: Vec<(String, i64)>,
    pub db_size_bytes: u64,
}

fn push_filters(q: &CueQuery, where_sql: &mut String, params: &mut Vec<Value>) {
    if let Some(lang) = &q.lang {
        where_sql.push_str(" AND s.lang = ?");
        params.push(Value::Text(lang.clone()));
    }
    if let Some(extensions) = &q.extensions {
        where_sql.push_str(" AND m.extension IN (");
        for (i, ext) in extensions.iter().enumerate() {
            if i > 0 {
                where_sql.push_str(", ");
            }
            where_sql.push('?');
            params.push(Value::Text(ext.clone()));
        }
        where_sql.push(')');
    }
    if let Some(min) = q.min_start_ms {
        where_sql.push_str(" AND s.start_ms >= ?");
        params.push(Value::Integer(min as i64));
    }
    if let Some(max) = q.max_start_ms {
        where_sql.push_str(" AND s.start_ms <= ?");
        params.push(Value::Integer(max as i64));
    }
    if !q.exclude_media_ids.is_empty() {
        where_sql.push_str(" AND s.media_id NOT IN (");
        for (i, id) in q.exclude_media_ids.iter().enumerate() {
            if i > 0 {
                where_sql.push_str(", ");
            }
            where_sql.push('?');
            params.push(Value::Integer(*id));
        }
        where_sql.push(')');
    }
}

/// Escape SQL LIKE metacharacters so the query matches literally.
fn escape_like(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Close an unbalanced double quote so a half-typed phrase cannot crash the
/// FTS parser; balanced queries pass through untouched.
fn balance_quotes(query: &str) -> String {
    if query.matches('"').count() % 2 == 1 {
        format!("{}\"", query)
    } else {
        query.to_string()
    }
}
