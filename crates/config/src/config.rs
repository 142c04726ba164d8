//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// What to do when the host lacks the capabilities of the accelerated engine mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingCapabilitiesPolicy {
    /// Refuse to load and report what is missing
    #[default]
    Fail,
    /// Load the single-threaded engine variant instead
    Degrade,
}

impl MissingCapabilitiesPolicy {
    /// Parse a policy name, accepting the same spelling as the TOML form
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Some(Self::Fail),
            "degrade" => Some(Self::Degrade),
            _ => None,
        }
    }
}

/// Engine-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Primary engine core (path or name of the encoder binary)
    #[serde(default = "default_primary_core")]
    pub primary_core: String,
    /// Fallback engine core, tried when the primary fails or times out
    #[serde(default = "default_fallback_core")]
    pub fallback_core: String,
    /// Upper bound for a single load attempt, in seconds
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
    /// Behaviour when accelerated-mode capabilities are absent
    #[serde(default)]
    pub missing_capabilities: MissingCapabilitiesPolicy,
    /// Encoder thread hint (0 = auto-derive)
    #[serde(default)]
    pub threads: u32,
}

fn default_primary_core() -> String {
    "ffmpeg".to_string()
}

fn default_fallback_core() -> String {
    "/usr/local/bin/ffmpeg".to_string()
}

fn default_load_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            primary_core: default_primary_core(),
            fallback_core: default_fallback_core(),
            load_timeout_secs: default_load_timeout_secs(),
            missing_capabilities: MissingCapabilitiesPolicy::default(),
            threads: 0,
        }
    }
}

/// Metadata probe configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Path or name of the ffprobe binary
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Seconds to wait for the probe before reporting the file unreadable
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: default_ffprobe_path(),
            timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Compression defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionConfig {
    /// Initial target-size ratio in percent (1-100, default 70)
    #[serde(default = "default_ratio")]
    pub default_ratio: u8,
}

fn default_ratio() -> u8 {
    70
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default_ratio: default_ratio(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// Filter directive, e.g. "info" or "vidpress=debug"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file; the terminal UI owns stdout
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> PathBuf {
    env::temp_dir().join("vidpress.log")
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - VIDPRESS_PRIMARY_CORE -> engine.primary_core
    /// - VIDPRESS_FALLBACK_CORE -> engine.fallback_core
    /// - VIDPRESS_LOAD_TIMEOUT_SECS -> engine.load_timeout_secs
    /// - VIDPRESS_MISSING_CAPABILITIES -> engine.missing_capabilities
    /// - VIDPRESS_THREADS -> engine.threads
    /// - VIDPRESS_FFPROBE -> probe.ffprobe_path
    /// - VIDPRESS_PROBE_TIMEOUT_SECS -> probe.timeout_secs
    /// - VIDPRESS_DEFAULT_RATIO -> compression.default_ratio
    /// - VIDPRESS_LOG -> log.level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("VIDPRESS_PRIMARY_CORE") {
            if !val.trim().is_empty() {
                self.engine.primary_core = val;
            }
        }

        if let Ok(val) = env::var("VIDPRESS_FALLBACK_CORE") {
            if !val.trim().is_empty() {
                self.engine.fallback_core = val;
            }
        }

        if let Ok(val) = env::var("VIDPRESS_LOAD_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.engine.load_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("VIDPRESS_MISSING_CAPABILITIES") {
            // Invalid value, keep existing
            if let Some(policy) = MissingCapabilitiesPolicy::parse(&val) {
                self.engine.missing_capabilities = policy;
            }
        }

        if let Ok(val) = env::var("VIDPRESS_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.engine.threads = threads;
            }
        }

        if let Ok(val) = env::var("VIDPRESS_FFPROBE") {
            if !val.trim().is_empty() {
                self.probe.ffprobe_path = val;
            }
        }

        if let Ok(val) = env::var("VIDPRESS_PROBE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.probe.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("VIDPRESS_DEFAULT_RATIO") {
            if let Ok(ratio) = val.parse::<u8>() {
                self.compression.default_ratio = ratio;
            }
        }

        if let Ok(val) = env::var("VIDPRESS_LOG") {
            if !val.trim().is_empty() {
                self.log.level = val;
            }
        }

        self.normalize();
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise start from defaults.
    /// Environment overrides apply in both cases.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Clamp values into their valid ranges
    fn normalize(&mut self) {
        self.compression.default_ratio = self.compression.default_ratio.clamp(1, 100);
        self.engine.load_timeout_secs = self.engine.load_timeout_secs.max(1);
        self.probe.timeout_secs = self.probe.timeout_secs.max(1);
    }
}
