//! Configuration system for the `Questline` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/questline/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::sync::resolver::ResolutionStrategy;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    sync: SyncFileConfig,
    queue: QueueFileConfig,
    storage: StorageFileConfig,
    demo: DemoFileConfig,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    interval_secs: Option<u64>,
    tick_ms: Option<u64>,
    timeout_secs: Option<u64>,
    retry_base_secs: Option<u64>,
    retry_max_secs: Option<u64>,
    strategy: Option<ResolutionStrategy>,
    max_sync_errors: Option<usize>,
}

/// `[queue]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct QueueFileConfig {
    max_operations: Option<usize>,
    max_resolution_log: Option<usize>,
    event_buffer: Option<usize>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    data_dir: Option<PathBuf>,
}

/// `[demo]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DemoFileConfig {
    player: Option<String>,
    tasks: Option<usize>,
    offline_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Sync subsystem configuration (used by the manager, engine and scheduler).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Cooldown after a successful sync before the next scheduled one.
    pub sync_interval: Duration,
    /// How often the scheduler checks for due players.
    pub tick_interval: Duration,
    /// How long to wait for a sync response.
    pub sync_timeout: Duration,
    /// First retry delay after a failure.
    pub retry_base: Duration,
    /// Upper bound on the retry delay.
    pub retry_max: Duration,
    /// Operation log capacity per player.
    pub max_operations: usize,
    /// Failed attempts remembered per player.
    pub max_sync_errors: usize,
    /// Resolution audit entries kept per player.
    pub max_resolution_log: usize,
    /// Strategy used by scheduled and manual syncs.
    pub strategy: ResolutionStrategy,
    /// Per-player event channel capacity.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            sync_timeout: Duration::from_secs(10),
            retry_base: Duration::from_secs(2),
            retry_max: Duration::from_secs(300),
            max_operations: 1000,
            max_sync_errors: 10,
            max_resolution_log: 100,
            strategy: ResolutionStrategy::Merge,
            event_buffer: 64,
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sync subsystem settings.
    pub sync: SyncConfig,
    /// Directory holding one state file per player.
    pub data_dir: PathBuf,

    // -- Demo --
    /// Player simulated by the demo.
    pub player: String,
    /// Tasks queued while offline.
    pub tasks: usize,
    /// How long the demo stays offline.
    pub offline: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            data_dir: default_data_dir(),
            player: "player-1".to_string(),
            tasks: 5,
            offline: Duration::from_secs(3),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/questline/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let sync = &file.sync;
        let queue = &file.queue;

        Self {
            sync: SyncConfig {
                sync_interval: sync
                    .interval_secs
                    .map_or(defaults.sync.sync_interval, Duration::from_secs),
                tick_interval: sync
                    .tick_ms
                    .map_or(defaults.sync.tick_interval, Duration::from_millis),
                sync_timeout: sync
                    .timeout_secs
                    .map_or(defaults.sync.sync_timeout, Duration::from_secs),
                retry_base: sync
                    .retry_base_secs
                    .map_or(defaults.sync.retry_base, Duration::from_secs),
                retry_max: sync
                    .retry_max_secs
                    .map_or(defaults.sync.retry_max, Duration::from_secs),
                max_operations: queue
                    .max_operations
                    .unwrap_or(defaults.sync.max_operations),
                max_sync_errors: sync
                    .max_sync_errors
                    .unwrap_or(defaults.sync.max_sync_errors),
                max_resolution_log: queue
                    .max_resolution_log
                    .unwrap_or(defaults.sync.max_resolution_log),
                strategy: cli
                    .strategy
                    .or(sync.strategy)
                    .unwrap_or(defaults.sync.strategy),
                event_buffer: queue.event_buffer.unwrap_or(defaults.sync.event_buffer),
            },
            data_dir: cli
                .data_dir
                .clone()
                .or_else(|| file.storage.data_dir.clone())
                .unwrap_or(defaults.data_dir),
            player: cli
                .player
                .clone()
                .or_else(|| file.demo.player.clone())
                .unwrap_or(defaults.player),
            tasks: cli.tasks.or(file.demo.tasks).unwrap_or(defaults.tasks),
            offline: cli
                .offline_secs
                .or(file.demo.offline_secs)
                .map_or(defaults.offline, Duration::from_secs),
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Offline-first task queue sync demo")]
pub struct CliArgs {
    /// Player id to simulate.
    #[arg(long, env = "QUESTLINE_PLAYER")]
    pub player: Option<String>,

    /// Number of tasks to queue while offline.
    #[arg(long)]
    pub tasks: Option<usize>,

    /// Conflict resolution strategy.
    #[arg(long, value_enum)]
    pub strategy: Option<ResolutionStrategy>,

    /// Seconds to stay offline before reconnecting.
    #[arg(long)]
    pub offline_secs: Option<u64>,

    /// Keep state in memory instead of the data directory.
    #[arg(long)]
    pub ephemeral: bool,

    /// Path to config file (default: `~/.config/questline/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory for persisted queue state.
    #[arg(long, env = "QUESTLINE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "QUESTLINE_LOG")]
    pub log_level: String,

    /// Path to log file (default: stderr).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("questline")
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("questline").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
