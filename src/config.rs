use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem root to scan. Unset means the scanner emits nothing.
    #[serde(default)]
    pub root_dir: Option<PathBuf>,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_media_extensions")]
    pub media_extensions: Vec<String>,

    #[serde(default = "default_subtitle_extensions")]
    pub subtitle_extensions: Vec<String>,

    /// Minimum ASCII-letter ratio for a track to be indexed as English.
    #[serde(default = "default_min_english_ratio")]
    pub min_english_ratio: f64,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_work_queue_capacity")]
    pub work_queue_capacity: usize,

    #[serde(default = "default_log_ring_size")]
    pub log_ring_size: usize,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("subdex")
        .join("subdex.db")
}

fn default_media_extensions() -> Vec<String> {
    ["mp4", "mkv", "avi", "mov", "m4v", "webm", "mp3", "wav", "flac", "m4a"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_subtitle_extensions() -> Vec<String> {
    ["srt", "smi", "ass", "ssa"].iter().map(|s| s.to_string()).collect()
}

fn default_min_english_ratio() -> f64 {
    0.6
}

fn default_max_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    cores.min(8)
}

fn default_work_queue_capacity() -> usize {
    256
}

fn default_log_ring_size() -> usize {
    200
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: None,
            db_path: default_db_path(),
            media_extensions: default_media_extensions(),
            subtitle_extensions: default_subtitle_extensions(),
            min_english_ratio: default_min_english_ratio(),
            max_workers: default_max_workers(),
            work_queue_capacity: default_work_queue_capacity(),
            log_ring_size: default_log_ring_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // First run: write a default config so users have a file to edit.
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            bail!("db_path must be set");
        }
        if !(0.0..=1.0).contains(&self.min_english_ratio) {
            bail!(
                "min_english_ratio must be in [0, 1], got {}",
                self.min_english_ratio
            );
        }
        if self.max_workers == 0 {
            bail!("max_workers must be positive");
        }
        if self.work_queue_capacity == 0 {
            bail!("work_queue_capacity must be positive");
        }
        if self.log_ring_size == 0 {
            bail!("log_ring_size must be positive");
        }
        if let Some(root) = &self.root_dir {
            if root.as_os_str().is_empty() {
                bail!("root_dir must not be empty when set");
            }
        }
        Ok(())
    }

    /// The status file sits next to the database.
    pub fn status_file_path(&self) -> PathBuf {
        self.db_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join("indexing_status.json")
    }

    /// Log files go to a `logs/` directory next to the database.
    pub fn log_dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join("logs")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("subdex")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.media_extensions.contains(&"mkv".to_string()));
        assert!(config.subtitle_extensions.contains(&"smi".to_string()));
        assert!(config.max_workers >= 1 && config.max_workers <= 8);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str("root_dir = \"/media\"\n").unwrap();
        assert_eq!(config.root_dir, Some(PathBuf::from("/media")));
        assert_eq!(config.work_queue_capacity, 256);
        assert_eq!(config.min_english_ratio, 0.6);
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let config = Config {
            min_english_ratio: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = Config {
            max_workers: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_status_file_and_logs_adjacent_to_db() {
        let config = Config {
            db_path: PathBuf::from("/var/lib/subdex/subdex.db"),
            ..Config::default()
        };
        assert_eq!(
            config.status_file_path(),
            PathBuf::from("/var/lib/subdex/indexing_status.json")
        );
        assert_eq!(config.log_dir(), PathBuf::from("/var/lib/subdex/logs"));
    }
}
