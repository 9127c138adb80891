use rollcall_core::config::ConfigError;
use rollcall_core::KioskConfig;
use std::path::PathBuf;

/// Daemon configuration: the kiosk settings plus process-level options.
pub struct Config {
    pub kiosk: KioskConfig,
    /// Spool directory written by the external capture process. Live
    /// sampling is disabled when unset; probes can still arrive over D-Bus.
    pub frame_dir: Option<PathBuf>,
    /// How often the spool directory is rescanned for new frames.
    pub frame_poll_ms: u64,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
    /// Start with sampling paused until a Resume call.
    pub start_paused: bool,
}

impl Config {
    /// Load the kiosk config, then `ROLLCALL_*` daemon variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            kiosk: KioskConfig::load()?,
            frame_dir: std::env::var("ROLLCALL_FRAME_DIR").ok().map(PathBuf::from),
            frame_poll_ms: env_u64("ROLLCALL_FRAME_POLL_MS", 50),
            system_bus: env_flag("ROLLCALL_SYSTEM_BUS", false),
            start_paused: env_flag("ROLLCALL_START_PAUSED", false),
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
