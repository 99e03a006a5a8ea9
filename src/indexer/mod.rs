//! Indexing controller: owns the lifecycle state machine, dispatches scanner
//! output to the worker pool, tracks progress, and persists status.
//!
//! ```text
//! idle --start--> scanning --(first pair)--> running
//! running --pause--> paused --resume--> running
//! running --stop--> stopping --(drain)--> stopped
//! running --(queue empty & scanner done)--> completed
//! any --fatal--> failed
//! {stopped,completed,failed} --start--> scanning
//! ```

pub mod status;
pub mod worker;

use anyhow::{bail, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::config::Config;
use crate::db::Database;
use crate::scanner::Scanner;

pub use status::{IndexState, IndexingStatus, StatusHandler};
pub use worker::{PauseGate, SkipReason, WorkerOutcome};

/// Progress tick for the collector loop and the ETA window.
const TICK: Duration = Duration::from_millis(100);
const ETA_WINDOW_SECS: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Re-process every pair regardless of existing rows.
    Full,
    /// Skip pairs whose media row matches the filesystem and already has cues.
    Incremental,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Full => "full",
            Strategy::Incremental => "incremental",
        }
    }
}

pub struct Indexer {
    config: Config,
    db: Arc<Database>,
    status: Arc<StatusHandler>,
    cancel: Arc<AtomicBool>,
    gate: Arc<PauseGate>,
    progress_tx: Sender<IndexingStatus>,
    progress_rx: Receiver<IndexingStatus>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Indexer {
    pub fn new(config: Config, db: Arc<Database>, status: Arc<StatusHandler>) -> Self {
        let (progress_tx, progress_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            db,
            status,
            cancel: Arc::new(AtomicBool::new(false)),
            gate: Arc::new(PauseGate::new()),
            progress_tx,
            progress_rx,
            run_handle: Mutex::new(None),
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> IndexingStatus {
        self.status.snapshot()
    }

    /// Live feed of status snapshots, one per worker outcome.
    pub fn subscribe(&self) -> Receiver<IndexingStatus> {
        self.progress_rx.clone()
    }

    /// Begin an indexing run. Valid only from idle or a terminal state.
    pub fn start(&self, strategy: Strategy) -> Result<()> {
        match self.status.state() {
            IndexState::Idle | IndexState::Stopped | IndexState::Completed | IndexState::Failed => {}
            other => bail!("cannot start indexing while {}", other.as_str()),
        }
        // Reap a finished previous run.
        if let Some(handle) = self.run_handle.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = handle.join();
        }

        self.cancel.store(false, Ordering::SeqCst);
        self.gate.resume();
        self.status.update(|s| {
            s.total_files = 0;
            s.processed_files = 0;
            s.subtitle_count = 0;
            s.skipped_files = 0;
            s.failed_files = 0;
            s.current_path = None;
            s.eta_seconds = None;
            s.error = None;
            s.started_at = Some(chrono::Utc::now().to_rfc3339());
        });
        self.status
            .log("INFO", &format!("indexing started ({})", strategy.as_str()));
        self.status.transition(IndexState::Scanning);

        let handle = {
            let config = self.config.clone();
            let db = self.db.clone();
            let status = self.status.clone();
            let cancel = self.cancel.clone();
            let gate = self.gate.clone();
            let progress_tx = self.progress_tx.clone();
            std::thread::Builder::new()
                .name("subdex-controller".to_string())
                .spawn(move || {
                    run_indexing(config, db, status, cancel, gate, progress_tx, strategy)
                })?
        };
        *self.run_handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        match self.status.state() {
            IndexState::Scanning | IndexState::Running => {
                self.gate.pause();
                self.status.transition(IndexState::Paused);
                Ok(())
            }
            other => bail!("cannot pause while {}", other.as_str()),
        }
    }

    pub fn resume(&self) -> Result<()> {
        match self.status.state() {
            IndexState::Paused => {
                self.gate.resume();
                self.status.transition(IndexState::Running);
                Ok(())
            }
            other => bail!("cannot resume while {}", other.as_str()),
        }
    }

    /// Signal cancellation and let in-flight work drain. Committed tracks
    /// stay committed.
    pub fn stop(&self) -> Result<()> {
        match self.status.state() {
            IndexState::Scanning | IndexState::Running | IndexState::Paused => {
                self.cancel.store(true, Ordering::SeqCst);
                // Paused workers must wake to observe the cancel flag.
                self.gate.resume();
                self.status.transition(IndexState::Stopping);
                Ok(())
            }
            other => bail!("cannot stop while {}", other.as_str()),
        }
    }

    /// Wipe the corpus. Refused while a run is active.
    pub fn reset(&self) -> Result<()> {
        match self.status.state() {
            IndexState::Idle | IndexState::Stopped | IndexState::Completed | IndexState::Failed => {}
            other => bail!("cannot reset while {}", other.as_str()),
        }
        self.db.reset_all()?;
        self.status.update(|s| {
            s.total_files = 0;
            s.processed_files = 0;
            s.subtitle_count = 0;
            s.skipped_files = 0;
            s.failed_files = 0;
            s.current_path = None;
            s.eta_seconds = None;
            s.error = None;
        });
        self.status.log("INFO", "corpus reset");
        self.status.transition(IndexState::Idle);
        Ok(())
    }

    /// Block until the current run finishes.
    pub fn wait(&self) {
        if let Some(handle) = self.run_handle.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = handle.join();
        }
    }
}

/// The run loop: spawns scanner, feeder, and workers, then collects
/// outcomes until the pipeline drains.
fn run_indexing(
    config: Config,
    db: Arc<Database>,
    status: Arc<StatusHandler>,
    cancel: Arc<AtomicBool>,
    gate: Arc<PauseGate>,
    progress_tx: Sender<IndexingStatus>,
    strategy: Strategy,
) {
    let capacity = config.work_queue_capacity;
    let (scan_tx, scan_rx) = crossbeam_channel::bounded(capacity);
    let (pair_tx, pair_rx) = crossbeam_channel::bounded(capacity);
    let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded();

    let discovered = Arc::new(AtomicU64::new(0));
    let fatal: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let scanner_handle = {
        let scanner = Scanner::new(config.clone());
        let cancel = cancel.clone();
        let fatal = fatal.clone();
        std::thread::spawn(move || {
            if let Err(e) = scanner.scan(scan_tx, cancel) {
                error!("scanner failed: {}", e);
                *fatal.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
            }
        })
    };

    // Feeder: counts discovered pairs on their way to the pool so the
    // collector can report totals while the walk is still going.
    let feeder_handle = {
        let discovered = discovered.clone();
        std::thread::spawn(move || {
            for pair in scan_rx.iter() {
                discovered.fetch_add(1, Ordering::SeqCst);
                if pair_tx.send(pair).is_err() {
                    break;
                }
            }
        })
    };

    // A failed pool spawn is a controller-level fatal: raise the cancel
    // flag so the scanner and any partially-spawned workers drain, and let
    // the normal shutdown path below land in `failed`.
    let worker_handles = match worker::spawn_workers(
        config.max_workers,
        pair_rx,
        outcome_tx,
        db.clone(),
        config.clone(),
        strategy,
        cancel.clone(),
        gate,
    ) {
        Ok(handles) => handles,
        Err(e) => {
            error!("failed to spawn worker pool: {}", e);
            *fatal.lock().unwrap_or_else(|p| p.into_inner()) =
                Some(format!("failed to spawn worker pool: {}", e));
            cancel.store(true, Ordering::SeqCst);
            Vec::new()
        }
    };

    let mut rate = 0.0f64;
    let mut last_outcome = Instant::now();
    let mut inserted_total = 0u64;

    loop {
        match outcome_rx.recv_timeout(TICK) {
            Ok(outcome) => {
                if status.state() == IndexState::Scanning {
                    status.transition(IndexState::Running);
                }

                let dt = last_outcome.elapsed().as_secs_f64().max(1e-6);
                last_outcome = Instant::now();
                let alpha = 1.0 - (-dt / ETA_WINDOW_SECS).exp();
                rate = alpha * (1.0 / dt) + (1.0 - alpha) * rate;

                if let Some(reason) = &outcome.skipped {
                    status.log(
                        if reason.is_failure() { "WARNING" } else { "INFO" },
                        &format!("{} - {}", reason, outcome.media_path.display()),
                    );
                }
                inserted_total += outcome.inserted as u64;

                let total = discovered.load(Ordering::SeqCst);
                status.update(|s| {
                    s.total_files = total;
                    s.processed_files += 1;
                    s.current_path = Some(outcome.media_path.display().to_string());
                    s.subtitle_count = inserted_total;
                    if let Some(reason) = &outcome.skipped {
                        s.skipped_files += 1;
                        if reason.is_failure() {
                            s.failed_files += 1;
                        }
                    }
                    let remaining = total.saturating_sub(s.processed_files);
                    s.eta_seconds = if rate > 0.0 && remaining > 0 {
                        Some((remaining as f64 / rate).round() as u64)
                    } else {
                        None
                    };
                });
                let _ = progress_tx.send(status.snapshot());
            }
            Err(RecvTimeoutError::Timeout) => {
                let total = discovered.load(Ordering::SeqCst);
                if total > 0 && status.state() == IndexState::Scanning {
                    status.transition(IndexState::Running);
                }
                status.update(|s| s.total_files = total);
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = scanner_handle.join();
    let _ = feeder_handle.join();
    for handle in worker_handles {
        let _ = handle.join();
    }

    let corpus_count = db.count_subtitles().unwrap_or(0) as u64;
    let fatal_error = fatal.lock().unwrap_or_else(|p| p.into_inner()).take();
    let final_state = if fatal_error.is_some() {
        IndexState::Failed
    } else if cancel.load(Ordering::SeqCst) {
        IndexState::Stopped
    } else {
        IndexState::Completed
    };

    status.update(|s| {
        s.current_path = None;
        s.eta_seconds = None;
        s.subtitle_count = corpus_count;
        s.error = fatal_error;
    });
    status.transition(final_state);
    let _ = progress_tx.send(status.snapshot());
    info!(
        "indexing finished: {} ({} cues in corpus)",
        final_state.as_str(),
        corpus_count
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, CueQuery};
    use std::fs::File;
    use std::io::Write;
    use tempfile::{tempdir, TempDir};

    fn setup(root: &std::path::Path) -> (TempDir, Arc<Database>, Indexer) {
        let (db_dir, db) = test_db();
        let db = Arc::new(db);
        let config = Config {
            root_dir: Some(root.to_path_buf()),
            db_path: db_dir.path().join("test.db"),
            ..Config::default()
        };
        let status = Arc::new(StatusHandler::load(
            db_dir.path().join("indexing_status.json"),
            config.log_ring_size,
        ));
        let indexer = Indexer::new(config, db.clone(), status);
        (db_dir, db, indexer)
    }

    fn write_media(dir: &std::path::Path, stem: &str, srt: Option<&str>) {
        File::create(dir.join(format!("{}.mp4", stem)))
            .unwrap()
            .write_all(b"media bytes")
            .unwrap();
        if let Some(content) = srt {
            std::fs::write(dir.join(format!("{}.srt", stem)), content).unwrap();
        }
    }

    fn run_to_completion(indexer: &Indexer, strategy: Strategy) {
        indexer.start(strategy).unwrap();
        indexer.wait();
    }

    #[test]
    fn test_single_cue_end_to_end() {
        let root = tempdir().unwrap();
        write_media(
            root.path(),
            "A",
            Some("1\n00:00:01,000 --> 00:00:02,500\nHello world\n"),
        );
        let (_db_dir, db, indexer) = setup(root.path());

        run_to_completion(&indexer, Strategy::Full);

        let status = indexer.status();
        assert_eq!(status.state, IndexState::Completed);
        assert_eq!(status.processed_files, 1);
        assert_eq!(status.subtitle_count, 1);

        let (total, hits) = db
            .search_like(&CueQuery {
                query: "hello".into(),
                limit: 50,
                ..CueQuery::default()
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(hits[0].start_ms, 1000);
        assert_eq!(hits[0].end_ms, 2500);
        assert_eq!(hits[0].content, "Hello world");
    }

    #[test]
    fn test_rejected_track_logged_and_not_indexed() {
        let root = tempdir().unwrap();
        write_media(
            root.path(),
            "C",
            Some("1\n00:00:01,000 --> 00:00:02,000\n안녕하세요\n\n2\n00:00:03,000 --> 00:00:04,000\n반갑습니다\n\n3\n00:00:05,000 --> 00:00:06,000\n잘 지내세요\n"),
        );
        let (_db_dir, db, indexer) = setup(root.path());

        run_to_completion(&indexer, Strategy::Full);

        let (total, _) = db
            .search_like(&CueQuery {
                query: "안녕".into(),
                limit: 50,
                ..CueQuery::default()
            })
            .unwrap();
        assert_eq!(total, 0);

        let status = indexer.status();
        assert!(status
            .log_ring
            .iter()
            .any(|line| line.contains("LangRejected")));
    }

    #[test]
    fn test_incremental_runs_are_idempotent() {
        let root = tempdir().unwrap();
        for i in 0..3 {
            write_media(
                root.path(),
                &format!("m{}", i),
                Some("1\n00:00:01,000 --> 00:00:02,000\nSome english dialogue here\n"),
            );
        }
        let (_db_dir, db, indexer) = setup(root.path());

        run_to_completion(&indexer, Strategy::Incremental);
        let first_count = indexer.status().subtitle_count;
        let first_rows = db.count_subtitles().unwrap();

        run_to_completion(&indexer, Strategy::Incremental);
        let second_count = indexer.status().subtitle_count;
        let second_rows = db.count_subtitles().unwrap();

        assert_eq!(first_count, second_count);
        assert_eq!(first_rows, second_rows);
        assert_eq!(first_rows, 3);
        // Second pass skipped everything.
        assert_eq!(indexer.status().skipped_files, 3);
    }

    #[test]
    fn test_start_rejected_while_running() {
        let root = tempdir().unwrap();
        for i in 0..50 {
            write_media(
                root.path(),
                &format!("m{}", i),
                Some("1\n00:00:01,000 --> 00:00:02,000\nPlenty of dialogue to chew on\n"),
            );
        }
        let (_db_dir, _db, indexer) = setup(root.path());

        indexer.start(Strategy::Full).unwrap();
        // A second start while scanning/running must be refused.
        assert!(indexer.start(Strategy::Full).is_err());
        indexer.wait();
        assert_eq!(indexer.status().state, IndexState::Completed);
    }

    #[test]
    fn test_stop_leaves_only_whole_tracks() {
        let root = tempdir().unwrap();
        // A large track plus several small ones; stop mid-run.
        let mut big = String::new();
        for i in 0u64..2000 {
            let start = i * 500;
            big.push_str(&format!(
                "{}\n{} --> {}\nbig track line number {}\n\n",
                i + 1,
                crate::subtitle::format_timestamp(start),
                crate::subtitle::format_timestamp(start + 400),
                i
            ));
        }
        write_media(root.path(), "big", Some(&big));
        for i in 0..20 {
            write_media(
                root.path(),
                &format!("small{}", i),
                Some("1\n00:00:01,000 --> 00:00:02,000\nShort and sweet dialogue\n"),
            );
        }
        let (_db_dir, db, indexer) = setup(root.path());

        indexer.start(Strategy::Full).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        // Stop may race completion on fast machines; either is acceptable.
        let _ = indexer.stop();
        indexer.wait();

        let state = indexer.status().state;
        assert!(state == IndexState::Stopped || state == IndexState::Completed);

        // Every media either has its full track or nothing at all.
        let conn = db.lock();
        let mut stmt = conn
            .prepare("SELECT media_id, COUNT(*) FROM subtitles GROUP BY media_id")
            .unwrap();
        let counts: Vec<(i64, i64)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        for (_media_id, count) in counts {
            // Dedup keeps distinct lines; both tracks have unique text.
            assert!(count == 2000 || count == 1, "partial track: {} cues", count);
        }
    }

    #[test]
    fn test_pause_resume_completes_everything() {
        let root = tempdir().unwrap();
        for i in 0..10 {
            write_media(
                root.path(),
                &format!("m{}", i),
                Some("1\n00:00:01,000 --> 00:00:02,000\nEnough dialogue for a test\n"),
            );
        }
        let (_db_dir, db, indexer) = setup(root.path());

        indexer.start(Strategy::Full).unwrap();
        // Pause may land after completion on fast machines; tolerate both.
        if indexer.pause().is_ok() {
            std::thread::sleep(Duration::from_millis(50));
            let _ = indexer.resume();
        }
        indexer.wait();

        assert_eq!(indexer.status().state, IndexState::Completed);
        assert_eq!(db.count_media().unwrap(), 10);
        assert_eq!(db.count_subtitles().unwrap(), 10);
    }

    #[test]
    fn test_reset_refused_while_active_and_wipes_after() {
        let root = tempdir().unwrap();
        write_media(
            root.path(),
            "A",
            Some("1\n00:00:01,000 --> 00:00:02,000\nHello out there\n"),
        );
        let (_db_dir, db, indexer) = setup(root.path());

        run_to_completion(&indexer, Strategy::Full);
        assert_eq!(db.count_subtitles().unwrap(), 1);

        indexer.reset().unwrap();
        assert_eq!(indexer.status().state, IndexState::Idle);
        assert_eq!(db.count_subtitles().unwrap(), 0);
        assert_eq!(db.count_media().unwrap(), 0);
    }

    #[test]
    fn test_pause_invalid_when_idle() {
        let root = tempdir().unwrap();
        let (_db_dir, _db, indexer) = setup(root.path());
        assert!(indexer.pause().is_err());
        assert!(indexer.resume().is_err());
        assert!(indexer.stop().is_err());
    }
}
