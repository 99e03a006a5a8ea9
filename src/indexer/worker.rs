//! Ingestion workers: each worker pulls a media/subtitle pair off the
//! bounded queue and runs decode -> parse -> classify -> persist for it,
//! reporting a `WorkerOutcome` back to the controller.

use crossbeam_channel::{Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, error, warn};

use super::Strategy;
use crate::config::Config;
use crate::db::Database;
use crate::encoding::read_subtitle_text;
use crate::language::classify;
use crate::scanner::MediaPair;
use crate::subtitle::parse_track;

/// Per-file soft budget across the whole pipeline. Checked at phase
/// boundaries; an over-budget file is abandoned before insert.
const SOFT_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a pair produced no cues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoSubtitle,
    Unchanged,
    EmptyFile,
    Io(String),
    Decode(String),
    Parse(String),
    LangRejected(String),
    Db(String),
    Timeout,
    Cancelled,
    Panicked,
}

impl SkipReason {
    /// Short tag used in log-ring events.
    pub fn tag(&self) -> &'static str {
        match self {
            SkipReason::NoSubtitle => "NoSubtitle",
            SkipReason::Unchanged => "Unchanged",
            SkipReason::EmptyFile => "EmptyFile",
            SkipReason::Io(_) => "IoError",
            SkipReason::Decode(_) => "DecodeError",
            SkipReason::Parse(_) => "ParseError",
            SkipReason::LangRejected(_) => "LangRejected",
            SkipReason::Db(_) => "DbError",
            SkipReason::Timeout => "Timeout",
            SkipReason::Cancelled => "Cancelled",
            SkipReason::Panicked => "Panicked",
        }
    }

    /// Skips that count as failures rather than expected outcomes.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SkipReason::Io(_)
                | SkipReason::Decode(_)
                | SkipReason::Parse(_)
                | SkipReason::Db(_)
                | SkipReason::Timeout
                | SkipReason::Panicked
        )
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Io(m)
            | SkipReason::Decode(m)
            | SkipReason::Parse(m)
            | SkipReason::Db(m) => write!(f, "{}: {}", self.tag(), m),
            SkipReason::LangRejected(tag) => write!(f, "LangRejected: detected '{}'", tag),
            _ => f.write_str(self.tag()),
        }
    }
}

/// Result of processing one pair.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub media_path: PathBuf,
    pub inserted: usize,
    pub skipped: Option<SkipReason>,
}

/// Counting gate for pause/resume. Workers acquire a pass before starting a
/// file; pausing stops issuing passes and lets in-flight work finish.
pub struct PauseGate {
    paused: Mutex<bool>,
    cv: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn pause(&self) {
        *self.paused.lock().unwrap_or_else(|p| p.into_inner()) = true;
    }

    pub fn resume(&self) {
        *self.paused.lock().unwrap_or_else(|p| p.into_inner()) = false;
        self.cv.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Block until the gate is open.
    pub fn wait_ready(&self) {
        let mut paused = self.paused.lock().unwrap_or_else(|p| p.into_inner());
        while *paused {
            paused = self.cv.wait(paused).unwrap_or_else(|p| p.into_inner());
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the worker pool. Workers exit when the pair channel closes or the
/// cancel flag is raised; the controller learns they are gone when the
/// outcome channel closes.
///
/// A refused thread spawn (resource exhaustion) is returned as an error
/// rather than panicking the controller. Workers already spawned keep their
/// channel clones and drain on their own once the caller cancels and the
/// senders close.
#[allow(clippy::too_many_arguments)]
pub fn spawn_workers(
    count: usize,
    pair_rx: Receiver<MediaPair>,
    outcome_tx: Sender<WorkerOutcome>,
    db: Arc<Database>,
    config: Config,
    strategy: Strategy,
    cancel: Arc<AtomicBool>,
    gate: Arc<PauseGate>,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(count);
    for worker_id in 0..count {
        let pair_rx = pair_rx.clone();
        let outcome_tx = outcome_tx.clone();
        let db = db.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        let gate = gate.clone();
        let handle = std::thread::Builder::new()
            .name(format!("subdex-worker-{}", worker_id))
            .spawn(move || {
                worker_loop(pair_rx, outcome_tx, db, config, strategy, cancel, gate);
                debug!("worker {} exiting", worker_id);
            })?;
        handles.push(handle);
    }
    Ok(handles)
}

fn worker_loop(
    pair_rx: Receiver<MediaPair>,
    outcome_tx: Sender<WorkerOutcome>,
    db: Arc<Database>,
    config: Config,
    strategy: Strategy,
    cancel: Arc<AtomicBool>,
    gate: Arc<PauseGate>,
) {
    loop {
        gate.wait_ready();
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let Ok(pair) = pair_rx.recv() else {
            return;
        };

        let media_path = pair.media_path.clone();
        // A panic in one file must not take the pool down.
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            process_pair(&pair, &db, &config, strategy, &cancel)
        }))
        .unwrap_or_else(|_| {
            error!("worker panicked processing {}", media_path.display());
            WorkerOutcome {
                media_path,
                inserted: 0,
                skipped: Some(SkipReason::Panicked),
            }
        });

        if outcome_tx.send(outcome).is_err() {
            return;
        }
    }
}

/// Run the full pipeline for one pair.
fn process_pair(
    pair: &MediaPair,
    db: &Database,
    config: &Config,
    strategy: Strategy,
    cancel: &AtomicBool,
) -> WorkerOutcome {
    let started = Instant::now();
    let skip = |reason: SkipReason| WorkerOutcome {
        media_path: pair.media_path.clone(),
        inserted: 0,
        skipped: Some(reason),
    };

    let meta = match std::fs::metadata(&pair.media_path) {
        Ok(m) => m,
        Err(e) => return skip(SkipReason::Io(e.to_string())),
    };
    let size = meta.len() as i64;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let extension = pair
        .media_path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if strategy == Strategy::Incremental {
        if let Ok(Some(row)) = db.find_media_by_path(&pair.media_path) {
            if row.size == size
                && row.last_modified == mtime
                && db.count_subtitles_for_media(row.id).unwrap_or(0) > 0
            {
                return skip(SkipReason::Unchanged);
            }
        }
    }

    let media_id = match db.upsert_media(&pair.media_path, size, mtime, &extension) {
        Ok(id) => id,
        Err(e) => return skip(SkipReason::Db(e.to_string())),
    };

    let Some(subtitle_path) = pair.subtitle_path.as_ref() else {
        return skip(SkipReason::NoSubtitle);
    };
    match std::fs::metadata(subtitle_path) {
        Ok(m) if m.len() == 0 => return skip(SkipReason::EmptyFile),
        Ok(_) => {}
        Err(e) => return skip(SkipReason::Io(e.to_string())),
    }

    if cancel.load(Ordering::SeqCst) {
        return skip(SkipReason::Cancelled);
    }

    let decoded = match read_subtitle_text(subtitle_path) {
        Ok(d) => d,
        Err(e) => return skip(SkipReason::Decode(e.to_string())),
    };
    debug!("decoded {} as {}", subtitle_path.display(), decoded.encoding);

    let sub_extension = subtitle_path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let cues = match parse_track(&sub_extension, &decoded.text) {
        Ok(cues) => cues,
        Err(e) => return skip(SkipReason::Parse(e.to_string())),
    };
    if cues.is_empty() {
        return skip(SkipReason::Parse("no usable cues".to_string()));
    }

    let joined: String = cues
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let verdict = classify(&joined, config.min_english_ratio);
    if !verdict.is_english {
        debug!(
            "track rejected: ascii ratio {:.2}, detector '{}' - {}",
            verdict.ascii_ratio,
            verdict.tag,
            subtitle_path.display()
        );
        return skip(SkipReason::LangRejected(verdict.tag));
    }

    if started.elapsed() > SOFT_TIMEOUT {
        warn!(
            "pipeline exceeded {}s for {}, abandoning before insert",
            SOFT_TIMEOUT.as_secs(),
            subtitle_path.display()
        );
        return skip(SkipReason::Timeout);
    }
    // Cancellation checked between parse and insert: work already committed
    // for other files stays committed, this one is simply not inserted.
    if cancel.load(Ordering::SeqCst) {
        return skip(SkipReason::Cancelled);
    }

    match db.bulk_insert_subtitles(media_id, Some(subtitle_path), &verdict.tag, &cues) {
        Ok(inserted) => WorkerOutcome {
            media_path: pair.media_path.clone(),
            inserted,
            skipped: None,
        },
        Err(e) => skip(SkipReason::Db(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    const SRT: &str = "1\n00:00:01,000 --> 00:00:02,500\nHello world\n\n2\n00:00:03,000 --> 00:00:04,000\nGoodbye now\n";

    fn write_pair(dir: &std::path::Path, stem: &str, srt: &str) -> MediaPair {
        let media_path = dir.join(format!("{}.mp4", stem));
        File::create(&media_path).unwrap().write_all(b"x").unwrap();
        let subtitle_path = dir.join(format!("{}.srt", stem));
        std::fs::write(&subtitle_path, srt).unwrap();
        MediaPair {
            media_path,
            subtitle_path: Some(subtitle_path),
        }
    }

    #[test]
    fn test_process_pair_inserts_cues() {
        let dir = tempdir().unwrap();
        let (_db_dir, db) = test_db();
        let pair = write_pair(dir.path(), "A", SRT);

        let outcome = process_pair(
            &pair,
            &db,
            &Config::default(),
            Strategy::Full,
            &AtomicBool::new(false),
        );
        assert!(outcome.skipped.is_none());
        assert_eq!(outcome.inserted, 2);
    }

    #[test]
    fn test_incremental_skips_unchanged() {
        let dir = tempdir().unwrap();
        let (_db_dir, db) = test_db();
        let pair = write_pair(dir.path(), "A", SRT);
        let config = Config::default();
        let cancel = AtomicBool::new(false);

        let first = process_pair(&pair, &db, &config, Strategy::Incremental, &cancel);
        assert_eq!(first.inserted, 2);

        let second = process_pair(&pair, &db, &config, Strategy::Incremental, &cancel);
        assert_eq!(second.skipped, Some(SkipReason::Unchanged));
        assert_eq!(db.count_subtitles().unwrap(), 2);

        // Full strategy reprocesses regardless.
        let third = process_pair(&pair, &db, &config, Strategy::Full, &cancel);
        assert!(third.skipped.is_none());
        assert_eq!(db.count_subtitles().unwrap(), 2);
    }

    #[test]
    fn test_no_subtitle_still_records_media() {
        let dir = tempdir().unwrap();
        let (_db_dir, db) = test_db();
        let media_path = dir.path().join("bare.mkv");
        File::create(&media_path).unwrap();
        let pair = MediaPair {
            media_path: media_path.clone(),
            subtitle_path: None,
        };

        let outcome = process_pair(
            &pair,
            &db,
            &Config::default(),
            Strategy::Full,
            &AtomicBool::new(false),
        );
        assert_eq!(outcome.skipped, Some(SkipReason::NoSubtitle));
        let row = db.find_media_by_path(&media_path).unwrap().unwrap();
        assert!(!row.has_subtitle);
    }

    #[test]
    fn test_korean_track_lang_rejected() {
        let dir = tempdir().unwrap();
        let (_db_dir, db) = test_db();
        let srt = "1\n00:00:01,000 --> 00:00:02,000\n안녕하세요 반갑습니다\n\n2\n00:00:03,000 --> 00:00:04,000\n오늘 날씨가 좋네요\n";
        let pair = write_pair(dir.path(), "K", srt);

        let outcome = process_pair(
            &pair,
            &db,
            &Config::default(),
            Strategy::Full,
            &AtomicBool::new(false),
        );
        match outcome.skipped {
            Some(SkipReason::LangRejected(_)) => {}
            other => panic!("expected LangRejected, got {:?}", other),
        }
        assert_eq!(db.count_subtitles().unwrap(), 0);
    }

    #[test]
    fn test_cancelled_pair_inserts_nothing() {
        let dir = tempdir().unwrap();
        let (_db_dir, db) = test_db();
        let pair = write_pair(dir.path(), "A", SRT);

        let outcome = process_pair(
            &pair,
            &db,
            &Config::default(),
            Strategy::Full,
            &AtomicBool::new(true),
        );
        assert_eq!(outcome.skipped, Some(SkipReason::Cancelled));
        assert_eq!(db.count_subtitles().unwrap(), 0);
    }

    #[test]
    fn test_empty_subtitle_file_skipped() {
        let dir = tempdir().unwrap();
        let (_db_dir, db) = test_db();
        let pair = write_pair(dir.path(), "E", "");

        let outcome = process_pair(
            &pair,
            &db,
            &Config::default(),
            Strategy::Full,
            &AtomicBool::new(false),
        );
        assert_eq!(outcome.skipped, Some(SkipReason::EmptyFile));
    }

    #[test]
    fn test_pause_gate_blocks_and_releases() {
        let gate = Arc::new(PauseGate::new());
        gate.pause();
        assert!(gate.is_paused());

        let gate2 = gate.clone();
        let passed = Arc::new(AtomicBool::new(false));
        let passed2 = passed.clone();
        let handle = std::thread::spawn(move || {
            gate2.wait_ready();
            passed2.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!passed.load(Ordering::SeqCst));

        gate.resume();
        handle.join().unwrap();
        assert!(passed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_worker_pool_drains_queue() {
        let dir = tempdir().unwrap();
        let (_db_dir, db) = test_db();
        let db = Arc::new(db);
        let (pair_tx, pair_rx) = crossbeam_channel::bounded(16);
        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded();

        for i in 0..6 {
            pair_tx.send(write_pair(dir.path(), &format!("m{}", i), SRT)).unwrap();
        }
        drop(pair_tx);

        let handles = spawn_workers(
            3,
            pair_rx,
            outcome_tx,
            db.clone(),
            Config::default(),
            Strategy::Full,
            Arc::new(AtomicBool::new(false)),
            Arc::new(PauseGate::new()),
        )
        .unwrap();

        let outcomes: Vec<WorkerOutcome> = outcome_rx.into_iter().collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.inserted == 2));
        assert_eq!(db.count_subtitles().unwrap(), 12);
    }
}
