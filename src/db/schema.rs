/// Bumped whenever the table layout changes incompatibly.
pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA: &str = r#"
-- Media files table: one row per physical media asset
CREATE TABLE IF NOT EXISTS media_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL DEFAULT 0,
    last_modified INTEGER NOT NULL DEFAULT 0,
    has_subtitle INTEGER NOT NULL DEFAULT 0,
    extension TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_media_files_path ON media_files(path);

-- Subtitle cues: times are integer milliseconds
CREATE TABLE IF NOT EXISTS subtitles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    media_id INTEGER NOT NULL,
    start_ms INTEGER NOT NULL,
    end_ms INTEGER NOT NULL,
    start_text TEXT NOT NULL,
    end_text TEXT NOT NULL,
    content TEXT NOT NULL,
    lang TEXT NOT NULL DEFAULT 'unknown',
    source_path TEXT,
    FOREIGN KEY (media_id) REFERENCES media_files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_subtitles_media_start ON subtitles(media_id, start_ms);
CREATE INDEX IF NOT EXISTS idx_subtitles_start ON subtitles(start_ms);

-- External-content FTS index over subtitles.content.
-- The base table stays authoritative; the triggers below keep the index in
-- lockstep so count(subtitles) == count(subtitles_fts) at every transaction
-- boundary.
CREATE VIRTUAL TABLE IF NOT EXISTS subtitles_fts USING fts5(
    content,
    content='subtitles',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS subtitles_ai AFTER INSERT ON subtitles BEGIN
    INSERT INTO subtitles_fts(rowid, content) VALUES (new.id, new.content);
END;

CREATE TRIGGER IF NOT EXISTS subtitles_ad AFTER DELETE ON subtitles BEGIN
    INSERT INTO subtitles_fts(subtitles_fts, rowid, content) VALUES ('delete', old.id, old.content);
END;

CREATE TRIGGER IF NOT EXISTS subtitles_au AFTER UPDATE ON subtitles BEGIN
    INSERT INTO subtitles_fts(subtitles_fts, rowid, content) VALUES ('delete', old.id, old.content);
    INSERT INTO subtitles_fts(rowid, content) VALUES (new.id, new.content);
END;

-- Per-cue bookmarks, keyed by (media_path, start_ms)
CREATE TABLE IF NOT EXISTS bookmarks (
    media_path TEXT NOT NULL,
    start_ms INTEGER NOT NULL,
    bookmarked INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (media_path, start_ms)
);

-- Per-cue tags; multiple per cue
CREATE TABLE IF NOT EXISTS tags (
    media_path TEXT NOT NULL,
    start_ms INTEGER NOT NULL,
    tag TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (media_path, start_ms, tag)
);

CREATE INDEX IF NOT EXISTS idx_tags_media_path ON tags(media_path);

-- Schema version bookkeeping
CREATE TABLE IF NOT EXISTS schema_meta (
    version INTEGER NOT NULL
);
"#;
