//! Search service: request/response shaping over the repository's LIKE and
//! FTS planners, with annotation fill and streaming hints for the transport
//! layer.

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::db::{CueQuery, Database, FtsQueryError, SortOrder};

const PER_PAGE_DEFAULT: u32 = 50;
const PER_PAGE_MAX: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Like,
    #[default]
    Fts,
}

impl std::str::FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "like" => Ok(SearchMode::Like),
            "fts" => Ok(SearchMode::Fts),
            other => anyhow::bail!("unknown search mode '{}' (expected like|fts)", other),
        }
    }
}

/// Coarse media classification derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    const VIDEO_EXTENSIONS: &'static [&'static str] = &["mp4", "mkv", "avi", "mov", "m4v", "webm"];
    const AUDIO_EXTENSIONS: &'static [&'static str] = &["mp3", "wav", "flac", "m4a"];

    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        if Self::VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else if Self::AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Audio)
        } else {
            None
        }
    }

    pub fn extensions(&self) -> Vec<String> {
        let list = match self {
            MediaKind::Video => Self::VIDEO_EXTENSIONS,
            MediaKind::Audio => Self::AUDIO_EXTENSIONS,
        };
        list.iter().map(|s| s.to_string()).collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            other => anyhow::bail!("unknown media kind '{}' (expected video|audio)", other),
        }
    }
}

/// Filter on cue start time, both bounds inclusive.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub min_start_ms: Option<u64>,
    pub max_start_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub media_kind: Option<MediaKind>,
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default)]
    pub sort: Sort,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    /// Drop cues whose media file no longer exists on disk.
    #[serde(default)]
    pub media_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sort {
    #[default]
    Relevance,
    Recent,
    Oldest,
}

impl std::str::FromStr for Sort {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relevance" => Ok(Sort::Relevance),
            "recent" => Ok(Sort::Recent),
            "oldest" => Ok(Sort::Oldest),
            other => anyhow::bail!("unknown sort order '{}'", other),
        }
    }
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    PER_PAGE_DEFAULT
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            mode: SearchMode::default(),
            lang: None,
            media_kind: None,
            time_range: TimeRange::default(),
            sort: Sort::default(),
            page: default_page(),
            per_page: default_per_page(),
            media_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtitleHit {
    pub media_path: String,
    pub media_kind: Option<MediaKind>,
    /// URL-safe key the transport layer turns into an absolute media URL.
    pub streaming_hint: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub content: String,
    pub lang: String,
    pub is_bookmarked: bool,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub total: u64,
    pub results: Vec<SubtitleHit>,
    /// Non-fatal notices, e.g. an FTS query that fell back to LIKE.
    pub warning: Option<String>,
}

pub struct SearchService {
    db: Arc<Database>,
}

impl SearchService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        if request.query.trim().is_empty() {
            return Ok(SearchResponse {
                total: 0,
                results: Vec::new(),
                warning: None,
            });
        }

        let per_page = request.per_page.clamp(1, PER_PAGE_MAX);
        let page = request.page.max(1);
        let sort = match request.sort {
            Sort::Relevance => SortOrder::Relevance,
            Sort::Recent => SortOrder::Recent,
            Sort::Oldest => SortOrder::Oldest,
        };

        // Missing media are excluded before paging so page boundaries stay
        // consistent with totals.
        let exclude_media_ids = if request.media_only {
            self.db.missing_media_ids()?
        } else {
            Vec::new()
        };

        let cue_query = CueQuery {
            query: request.query.trim().to_string(),
            lang: request.lang.clone(),
            extensions: request.media_kind.map(|k| k.extensions()),
            min_start_ms: request.time_range.min_start_ms,
            max_start_ms: request.time_range.max_start_ms,
            sort,
            limit: per_page,
            offset: (page - 1) * per_page,
            exclude_media_ids,
        };

        let mut warning = None;
        let (total, hits) = match request.mode {
            SearchMode::Like => self.db.search_like(&cue_query)?,
            SearchMode::Fts => match self.db.search_fts(&cue_query) {
                Ok(result) => result,
                Err(e) if e.downcast_ref::<FtsQueryError>().is_some() => {
                    warn!("FTS query rejected, falling back to substring: {}", e);
                    warning = Some(format!(
                        "full-text query rejected ({}), fell back to substring match",
                        e
                    ));
                    self.db.search_like(&cue_query)?
                }
                Err(e) => return Err(e),
            },
        };

        // One batched annotation lookup for the whole page.
        let keys: Vec<(String, u64)> = hits
            .iter()
            .map(|h| (h.media_path.clone(), h.start_ms))
            .collect();
        let annotations = self.db.annotations_for(&keys)?;

        let results = hits
            .into_iter()
            .map(|hit| {
                let key = (hit.media_path.clone(), hit.start_ms);
                let note = annotations.get(&key);
                SubtitleHit {
                    streaming_hint: streaming_hint(&hit.media_path),
                    media_kind: MediaKind::from_extension(&hit.extension),
                    media_path: hit.media_path,
                    start_ms: hit.start_ms,
                    end_ms: hit.end_ms,
                    content: hit.content,
                    lang: hit.lang,
                    is_bookmarked: note.map(|n| n.bookmarked).unwrap_or(false),
                    tags: note.map(|n| n.tags.clone()).unwrap_or_default(),
                }
            })
            .collect();

        Ok(SearchResponse {
            total,
            results,
            warning,
        })
    }
}

/// Transport-neutral key for a media path: URL-safe base64, no padding.
pub fn streaming_hint(media_path: &str) -> String {
    URL_SAFE_NO_PAD.encode(media_path.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::subtitle::Cue;
    use std::path::Path;

    fn seeded_service() -> (tempfile::TempDir, Arc<Database>, SearchService) {
        let (dir, db) = test_db();
        let db = Arc::new(db);
        let media_id = db
            .upsert_media(Path::new("/media/A.mp4"), 100, 1000, "mp4")
            .unwrap();
        db.bulk_insert_subtitles(
            media_id,
            None,
            "en",
            &[
                Cue { start_ms: 1000, end_ms: 2500, text: "Hello world".into() },
                Cue { start_ms: 3000, end_ms: 4000, text: "hello there".into() },
            ],
        )
        .unwrap();
        let audio_id = db
            .upsert_media(Path::new("/media/B.mp3"), 100, 2000, "mp3")
            .unwrap();
        db.bulk_insert_subtitles(
            audio_id,
            None,
            "en",
            &[Cue { start_ms: 500, end_ms: 900, text: "hello from audio".into() }],
        )
        .unwrap();
        let service = SearchService::new(db.clone());
        (dir, db, service)
    }

    fn request(query: &str, mode: SearchMode) -> SearchRequest {
        SearchRequest {
            query: query.to_string(),
            mode,
            ..SearchRequest::default()
        }
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let (_dir, _db, service) = seeded_service();
        let response = service.search(&request("   ", SearchMode::Like)).unwrap();
        assert_eq!(response.total, 0);
        assert!(response.results.is_empty());
    }

    #[test]
    fn test_like_search_fills_hits() {
        let (_dir, _db, service) = seeded_service();
        let response = service.search(&request("hello", SearchMode::Like)).unwrap();
        assert_eq!(response.total, 3);
        let hit = &response.results[0];
        assert_eq!(hit.media_kind, Some(MediaKind::Video));
        assert_eq!(hit.content, "Hello world");
        assert!(!hit.is_bookmarked);
        assert!(hit.tags.is_empty());
    }

    #[test]
    fn test_fts_and_semantics() {
        let (_dir, _db, service) = seeded_service();
        let response = service
            .search(&request("hello AND world", SearchMode::Fts))
            .unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.results[0].content, "Hello world");
        assert!(response.warning.is_none());
    }

    #[test]
    fn test_fts_error_falls_back_to_like() {
        let (_dir, _db, service) = seeded_service();
        let response = service
            .search(&request("AND AND (", SearchMode::Fts))
            .unwrap();
        // LIKE finds nothing for that literal string, but the request
        // succeeds with a warning instead of erroring.
        assert_eq!(response.total, 0);
        assert!(response.warning.is_some());
    }

    #[test]
    fn test_media_kind_filter() {
        let (_dir, _db, service) = seeded_service();
        let mut req = request("hello", SearchMode::Like);
        req.media_kind = Some(MediaKind::Audio);
        let response = service.search(&req).unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.results[0].media_path, "/media/B.mp3");
    }

    #[test]
    fn test_annotations_filled_from_batch() {
        let (_dir, db, service) = seeded_service();
        db.toggle_bookmark("/media/A.mp4", 1000, true).unwrap();
        db.add_tag("/media/A.mp4", 1000, "favorite").unwrap();

        let response = service.search(&request("Hello world", SearchMode::Like)).unwrap();
        assert_eq!(response.total, 1);
        assert!(response.results[0].is_bookmarked);
        assert_eq!(response.results[0].tags, vec!["favorite"]);
    }

    #[test]
    fn test_per_page_clamped() {
        let (_dir, _db, service) = seeded_service();
        let mut req = request("hello", SearchMode::Like);
        req.per_page = 10_000;
        let response = service.search(&req).unwrap();
        // Clamp applies to the page size, not the total.
        assert_eq!(response.total, 3);

        req.per_page = 0;
        let response = service.search(&req).unwrap();
        assert_eq!(response.results.len(), 1.min(response.total as usize));
    }

    #[test]
    fn test_time_range_filter() {
        let (_dir, _db, service) = seeded_service();
        let mut req = request("hello", SearchMode::Like);
        req.time_range.min_start_ms = Some(1000);
        req.time_range.max_start_ms = Some(2999);
        let response = service.search(&req).unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.results[0].start_ms, 1000);
    }

    #[test]
    fn test_streaming_hint_roundtrip() {
        let hint = streaming_hint("/media/Some Show/Episode 1.mp4");
        assert!(!hint.contains('/'));
        assert!(!hint.contains('+'));
        let decoded = URL_SAFE_NO_PAD.decode(hint.as_bytes()).unwrap();
        assert_eq!(decoded, b"/media/Some Show/Episode 1.mp4");
    }

    #[test]
    fn test_media_only_excludes_missing_files() {
        let (_dir, _db, service) = seeded_service();
        // Seeded paths do not exist on disk, so media_only drops them all.
        let mut req = request("hello", SearchMode::Like);
        req.media_only = true;
        let response = service.search(&req).unwrap();
        assert_eq!(response.total, 0);
    }
}
