//! Filesystem scanner: pairs media files with sibling subtitle tracks.
//!
//! The scanner streams pairs into a bounded channel so enumeration runs
//! concurrently with ingestion; when the workers fall behind, the send
//! blocks and the walk naturally throttles.

use anyhow::Result;
use crossbeam_channel::Sender;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::Config;

/// A media file and its best-match subtitle track, if any.
#[derive(Debug, Clone)]
pub struct MediaPair {
    pub media_path: PathBuf,
    pub subtitle_path: Option<PathBuf>,
}

/// Subdirectory names probed for same-stem subtitle files.
const SUBTITLE_DIRS: &[&str] = &["subs", "subtitles"];

/// Stem suffixes tried after the bare stem, e.g. `Movie.en.srt`.
const LANG_SUFFIXES: &[&str] = &["en", "eng"];

pub struct Scanner {
    config: Config,
}

impl Scanner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Walk the configured root and emit media/subtitle pairs.
    ///
    /// Returns the number of pairs emitted. Emits nothing when `root_dir` is
    /// unset. Stops early when the cancel flag is raised or the receiving
    /// side hangs up.
    pub fn scan(&self, tx: Sender<MediaPair>, cancel: Arc<AtomicBool>) -> Result<usize> {
        let Some(root) = self.config.root_dir.as_ref() else {
            info!("no root_dir configured, nothing to scan");
            return Ok(0);
        };

        info!("scan started: {}", root.display());
        let mut emitted = 0usize;

        // follow_links(true) lets walkdir detect and skip symlink loops.
        for entry in WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if cancel.load(Ordering::SeqCst) {
                debug!("scan cancelled after {} pairs", emitted);
                return Ok(emitted);
            }

            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(ext) = extension_lower(path) else {
                continue;
            };
            if !self.config.media_extensions.iter().any(|e| *e == ext) {
                continue;
            }

            let subtitle_path = self.find_subtitle_for(path);
            let pair = MediaPair {
                media_path: path.to_path_buf(),
                subtitle_path,
            };
            // Blocks when the queue is full; erring means the pool is gone.
            if tx.send(pair).is_err() {
                return Ok(emitted);
            }
            emitted += 1;
        }

        info!("scan finished: {} pairs", emitted);
        Ok(emitted)
    }

    /// Locate a subtitle file for a media path: same stem in the same
    /// directory (optionally with a language suffix), else same stem in a
    /// sibling `subs/` or `subtitles/` folder.
    pub fn find_subtitle_for(&self, media_path: &Path) -> Option<PathBuf> {
        let dir = media_path.parent()?;
        let stem = media_path.file_stem()?.to_string_lossy().to_string();

        if let Some(found) = self.probe_dir(dir, &stem) {
            return Some(found);
        }
        for sub in SUBTITLE_DIRS {
            let candidate_dir = dir.join(sub);
            if candidate_dir.is_dir() {
                if let Some(found) = self.probe_dir(&candidate_dir, &stem) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn probe_dir(&self, dir: &Path, stem: &str) -> Option<PathBuf> {
        for ext in &self.config.subtitle_extensions {
            let candidate = dir.join(format!("{}.{}", stem, ext));
            if candidate.is_file() {
                return Some(candidate);
            }
            for suffix in LANG_SUFFIXES {
                let candidate = dir.join(format!("{}.{}.{}", stem, suffix, ext));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

fn extension_lower(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}
