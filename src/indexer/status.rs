//! Persistent indexing status: the process-wide singleton snapshot written
//! to a JSON file next to the database on every transition.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use tracing::{error, warn};

/// Minimum interval between debounced disk writes.
const SAVE_INTERVAL_MS: u128 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Idle,
    Scanning,
    Running,
    Paused,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Idle => "idle",
            IndexState::Scanning => "scanning",
            IndexState::Running => "running",
            IndexState::Paused => "paused",
            IndexState::Stopping => "stopping",
            IndexState::Stopped => "stopped",
            IndexState::Completed => "completed",
            IndexState::Failed => "failed",
        }
    }

    /// States that belong to a live run.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            IndexState::Scanning | IndexState::Running | IndexState::Paused | IndexState::Stopping
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingStatus {
    pub state: IndexState,
    pub total_files: u64,
    pub processed_files: u64,
    pub current_path: Option<String>,
    pub started_at: Option<String>,
    pub last_updated: Option<String>,
    pub subtitle_count: u64,
    pub skipped_files: u64,
    pub failed_files: u64,
    pub eta_seconds: Option<u64>,
    pub error: Option<String>,
    /// Pid of the process that owns an active run; None otherwise.
    pub pid: Option<u32>,
    pub log_ring: VecDeque<String>,
}

impl Default for IndexingStatus {
    fn default() -> Self {
        Self {
            state: IndexState::Idle,
            total_files: 0,
            processed_files: 0,
            current_path: None,
            started_at: None,
            last_updated: None,
            subtitle_count: 0,
            skipped_files: 0,
            failed_files: 0,
            eta_seconds: None,
            error: None,
            pid: None,
            log_ring: VecDeque::new(),
        }
    }
}

/// Owns the mutable status. The controller is the only writer; observers
/// read snapshots.
pub struct StatusHandler {
    path: PathBuf,
    ring_cap: usize,
    status: RwLock<IndexingStatus>,
    last_save: Mutex<Instant>,
}

impl StatusHandler {
    /// Load the persisted status, or start fresh. An active status whose
    /// owning process is gone (a crash) resets to `idle` — indexing never
    /// auto-resumes. An active status with a live owner is kept as-is, so a
    /// second process cannot trample a run in progress; state-machine guards
    /// will refuse conflicting operations against it.
    pub fn load(path: PathBuf, ring_cap: usize) -> Self {
        let mut status = Self::read_snapshot(&path);

        let mut demoted = false;
        if status.state.is_active() && !owner_alive(status.pid) {
            warn!(
                "previous indexing left status '{}' with no live owner, resetting to idle",
                status.state.as_str()
            );
            status.state = IndexState::Idle;
            status.current_path = None;
            status.eta_seconds = None;
            status.pid = None;
            demoted = true;
        }

        let write_initial = demoted || !path.exists();
        let handler = Self {
            path,
            ring_cap,
            status: RwLock::new(status),
            last_save: Mutex::new(Instant::now() - std::time::Duration::from_secs(1)),
        };
        if write_initial {
            handler.save(true);
        }
        handler
    }

    /// Read the persisted status as-is: no crash demotion, nothing written
    /// back. For administrative commands that only peek at a run another
    /// process may own.
    pub fn read_snapshot(path: &Path) -> IndexingStatus {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("status file unreadable ({}), starting fresh", e);
                IndexingStatus::default()
            }),
            Err(_) => IndexingStatus::default(),
        }
    }

    pub fn snapshot(&self) -> IndexingStatus {
        self.status.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn state(&self) -> IndexState {
        self.status.read().unwrap_or_else(|p| p.into_inner()).state
    }

    /// Mutate the in-memory status and persist (debounced).
    pub fn update(&self, f: impl FnOnce(&mut IndexingStatus)) {
        {
            let mut status = self.status.write().unwrap_or_else(|p| p.into_inner());
            f(&mut status);
            status.last_updated = Some(chrono::Utc::now().to_rfc3339());
        }
        self.save(false);
    }

    /// Transition to a new state; transitions always hit disk. Active
    /// states are stamped with this process's pid so peers can tell a live
    /// run from a stale file.
    pub fn transition(&self, state: IndexState) {
        self.log("INFO", &format!("state -> {}", state.as_str()));
        {
            let mut status = self.status.write().unwrap_or_else(|p| p.into_inner());
            status.state = state;
            status.pid = state.is_active().then(std::process::id);
            status.last_updated = Some(chrono::Utc::now().to_rfc3339());
        }
        self.save(true);
    }

    /// Append a structured event line to the bounded log ring.
    pub fn log(&self, level: &str, message: &str) {
        match level {
            "ERROR" => error!("{}", message),
            "WARNING" => warn!("{}", message),
            _ => tracing::info!("{}", message),
        }
        let mut status = self.status.write().unwrap_or_else(|p| p.into_inner());
        let line = format!("{} [{}] {}", chrono::Utc::now().to_rfc3339(), level, message);
        status.log_ring.push_back(line);
        while status.log_ring.len() > self.ring_cap {
            status.log_ring.pop_front();
        }
    }

    /// Persist to disk via write-temp-then-rename. Debounced unless forced.
    pub fn save(&self, force: bool) {
        {
            let mut last = self.last_save.lock().unwrap_or_else(|p| p.into_inner());
            if !force && last.elapsed().as_millis() < SAVE_INTERVAL_MS {
                return;
            }
            *last = Instant::now();
        }
        if let Err(e) = self.write_atomic() {
            error!("failed to persist indexing status: {}", e);
        }
    }

    fn write_atomic(&self) -> Result<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_string_pretty(&snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Whether the process that stamped an active status is still around. Our
/// own pid does not count: finding it means a previous run of this same pid
/// crashed and the file is stale.
fn owner_alive(pid: Option<u32>) -> bool {
    let Some(pid) = pid else {
        return false;
    };
    if pid == std::process::id() {
        return false;
    }
    process_alive(pid)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // No cheap liveness probe here; treat the owner as live and let the
    // state-machine guards refuse conflicting operations.
    true
}
