//! Tunable operating points.
//!
//! Every threshold here was tuned empirically; the defaults reproduce the
//! values the kiosk has been running with. Configuration is read from an
//! optional TOML file, then overridden by `ROLLCALL_*` environment variables.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Signature shortlist cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Thumbnail edge length; signatures have `side²` dimensions.
    pub signature_side: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            signature_side: crate::signature::DEFAULT_SIGNATURE_SIDE,
        }
    }
}

/// Descriptor comparison.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Maximum Euclidean descriptor distance accepted as a match.
    pub distance_threshold: f32,
    /// Number of signature-ranked candidates compared by descriptor.
    pub shortlist_size: usize,
    /// Report `MULTIPLE_FACES` instead of matching the largest face.
    pub reject_multiple_faces: bool,
    /// Keep candidate descriptors for the lifetime of the index entry.
    pub cache_descriptors: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 0.6,
            shortlist_size: 5,
            reject_multiple_faces: true,
            cache_descriptors: true,
        }
    }
}

/// Frame sampling and stability detection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    pub sample_interval_ms: u64,
    /// Signature variance below which a frame counts as empty.
    pub min_presence_variance: f32,
    /// Frame-to-frame similarity below which the subject is moving.
    pub movement_threshold: f32,
    /// Frame-to-frame similarity above which a frame counts toward stability.
    pub stability_threshold: f32,
    /// Similarity that triggers immediately while a subject is entering.
    pub fast_path_threshold: f32,
    /// Stable frames required while entering.
    pub entering_frames: u32,
    /// Stable frames required once steady.
    pub steady_frames: u32,
    /// Quiet period after a hand-off completes.
    pub cooldown_ms: u64,
    /// Fraction of near-black pixels that marks a frame as dark.
    pub dark_threshold: f32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 200,
            min_presence_variance: 1e-5,
            movement_threshold: 0.97,
            stability_threshold: 0.99,
            fast_path_threshold: 0.995,
            entering_frames: 2,
            steady_frames: 4,
            cooldown_ms: 3000,
            dark_threshold: 0.95,
        }
    }
}

/// Attendance sequencing policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttendanceConfig {
    /// Minimum time between two SUCCESS events for the same identity.
    pub min_gap_secs: i64,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self { min_gap_secs: 120 }
    }
}

/// External descriptor oracle process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Program that reads a PNG on stdin and prints face descriptors as JSON.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("rollcall.db"),
        }
    }
}

/// Complete kiosk configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KioskConfig {
    pub index: IndexConfig,
    pub matcher: MatcherConfig,
    pub stability: StabilityConfig,
    pub attendance: AttendanceConfig,
    pub oracle: OracleConfig,
    pub store: StoreConfig,
}

impl KioskConfig {
    /// Load from `ROLLCALL_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Parse a TOML configuration file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Override individual settings from `ROLLCALL_*` environment variables.
    pub fn apply_env(&mut self) {
        env_override("ROLLCALL_DISTANCE_THRESHOLD", &mut self.matcher.distance_threshold);
        env_override("ROLLCALL_SHORTLIST_SIZE", &mut self.matcher.shortlist_size);
        if let Ok(v) = std::env::var("ROLLCALL_REJECT_MULTIPLE_FACES") {
            self.matcher.reject_multiple_faces = v != "0";
        }
        env_override("ROLLCALL_SAMPLE_INTERVAL_MS", &mut self.stability.sample_interval_ms);
        env_override("ROLLCALL_COOLDOWN_MS", &mut self.stability.cooldown_ms);
        env_override("ROLLCALL_MIN_GAP_SECS", &mut self.attendance.min_gap_secs);
        env_override("ROLLCALL_ORACLE_TIMEOUT_SECS", &mut self.oracle.timeout_secs);
        if let Ok(command) = std::env::var("ROLLCALL_ORACLE_COMMAND") {
            self.oracle.command = Some(command);
        }
        if let Ok(path) = std::env::var("ROLLCALL_DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    match std::env::var(key).map(|v| v.parse::<T>()) {
        Ok(Ok(value)) => *slot = value,
        Ok(Err(_)) => tracing::warn!(key, "ignoring unparsable environment override"),
        Err(_) => {}
    }
}
