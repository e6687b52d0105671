use anyhow::{anyhow, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use shellexpand;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::repo::RepoId;

/// Main configuration structure for relwatch
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// GitHub polling settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// ntfy push delivery settings
    #[serde(default)]
    pub ntfy: NtfyConfig,

    /// General behavior settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Poll scheduling and failure handling
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Notification retry behavior
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Optional daily website statistics reports
    #[serde(default)]
    pub stats: StatsConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Personal access token. Optional; unauthenticated polling works but
    /// gets a much smaller rate-limit quota.
    pub token: Option<String>,

    /// API base URL (override for GitHub Enterprise)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Repositories to watch, as "owner/name" strings
    #[serde(default)]
    pub repos: Vec<String>,

    /// ntfy topic release notifications are published to
    #[serde(default = "default_release_topic")]
    pub ntfy_topic: String,
}

/// ntfy server configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NtfyConfig {
    /// Server base URL
    #[serde(default = "default_ntfy_base_url")]
    pub base_url: String,

    /// Access token for protected topics
    pub token: Option<String>,
}

/// General behavior configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GeneralConfig {
    /// Poll interval
    #[serde(default = "default_check_interval")]
    pub check_interval: String, // "1h"

    /// Notify the first time a repository is ever observed. Off by default
    /// so adding a repo with years of release history stays quiet.
    #[serde(default)]
    pub notify_on_first_observation: bool,

    /// State database location (defaults to the XDG data directory)
    pub state_path: Option<String>,
}

/// Poll scheduling and failure handling configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MonitorConfig {
    /// Maximum repositories checked in parallel
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Timeout for API requests in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Upper bound of the random delay added before each scheduled check
    #[serde(default = "default_jitter_max")]
    pub jitter_max: String, // "10s"

    /// Consecutive transient failures before a repository's polling degrades
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Hold applied once the failure threshold is reached; doubles per
    /// further failure, capped at one hour
    #[serde(default = "default_failure_backoff")]
    pub failure_backoff: String, // "5m"
}

/// Notification retry configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NotifierConfig {
    /// Delivery attempts per notification before it is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles per attempt
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: String, // "2s"
}

/// Daily Plausible statistics report configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StatsConfig {
    /// Enable the daily report
    #[serde(default)]
    pub enabled: bool,

    /// Plausible instance URL
    #[serde(default = "default_stats_url")]
    pub url: String,

    /// Plausible API key
    pub token: Option<String>,

    /// Site domains to report on
    #[serde(default)]
    pub sites: Vec<String>,

    /// Local time of day after which the daily report is sent
    #[serde(default = "default_report_time")]
    pub report_time: String, // "09:00"

    /// ntfy topic stats reports are published to
    #[serde(default = "default_stats_topic")]
    pub ntfy_topic: String,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_release_topic() -> String {
    "github".to_string()
}
fn default_ntfy_base_url() -> String {
    "https://ntfy.sh".to_string()
}
fn default_check_interval() -> String {
    "1h".to_string()
}
fn default_max_parallel() -> usize {
    4
}
fn default_request_timeout() -> u64 {
    30
}
fn default_jitter_max() -> String {
    "10s".to_string()
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_failure_backoff() -> String {
    "5m".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay() -> String {
    "2s".to_string()
}
fn default_stats_url() -> String {
    "https://plausible.io".to_string()
}
fn default_report_time() -> String {
    "09:00".to_string()
}
fn default_stats_topic() -> String {
    "stats".to_string()
}
fn default_true() -> bool {
    true
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/relwatch.pid", runtime_dir)
    } else {
        "/tmp/relwatch.pid".to_string()
    }
}

fn default_log_file() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/relwatch/daemon.log", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/relwatch/daemon.log", home)
    } else {
        "/tmp/relwatch-daemon.log".to_string()
    }
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: default_api_url(),
            repos: Vec::new(),
            ntfy_topic: default_release_topic(),
        }
    }
}

impl Default for NtfyConfig {
    fn default() -> Self {
        Self {
            base_url: default_ntfy_base_url(),
            token: None,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            notify_on_first_observation: false,
            state_path: None,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            request_timeout: default_request_timeout(),
            jitter_max: default_jitter_max(),
            failure_threshold: default_failure_threshold(),
            failure_backoff: default_failure_backoff(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_delay: default_retry_base_delay(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_stats_url(),
            token: None,
            sites: Vec::new(),
            report_time: default_report_time(),
            ntfy_topic: default_stats_topic(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl GitHubConfig {
    /// Token, treating an empty string the same as unset
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

impl NtfyConfig {
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

impl StatsConfig {
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            // Create default config
            let config = Self::default();

            // Create config directory if it doesn't exist
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            // Save default config
            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("relwatch").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.daemon.pid_file = shellexpand::full(&self.daemon.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        self.daemon.log_file = shellexpand::full(&self.daemon.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        if let Some(state_path) = &self.general.state_path {
            self.general.state_path = Some(
                shellexpand::full(state_path)
                    .context("Failed to expand state_path")?
                    .into_owned(),
            );
        }

        Ok(())
    }

    /// Parse and validate the watched repository list
    pub fn tracked_repos(&self) -> Result<Vec<RepoId>> {
        self.github
            .repos
            .iter()
            .map(|raw| RepoId::parse(raw))
            .collect::<Result<Vec<_>>>()
            .context("Invalid github.repos entry in configuration")
    }

    /// Resolved state database path
    pub fn state_db_path(&self) -> Result<PathBuf> {
        match &self.general.state_path {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => crate::state::default_db_path(),
        }
    }

    pub fn check_interval(&self) -> Result<Duration> {
        parse_duration(&self.general.check_interval)
            .context("Invalid general.check_interval in configuration")
    }

    pub fn jitter_max(&self) -> Result<Duration> {
        parse_duration(&self.monitor.jitter_max)
            .context("Invalid monitor.jitter_max in configuration")
    }

    pub fn failure_backoff(&self) -> Result<Duration> {
        parse_duration(&self.monitor.failure_backoff)
            .context("Invalid monitor.failure_backoff in configuration")
    }

    pub fn retry_base_delay(&self) -> Result<Duration> {
        parse_duration(&self.notifier.retry_base_delay)
            .context("Invalid notifier.retry_base_delay in configuration")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.request_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github: GitHubConfig::default(),
            ntfy: NtfyConfig::default(),
            general: GeneralConfig::default(),
            monitor: MonitorConfig::default(),
            notifier: NotifierConfig::default(),
            stats: StatsConfig::default(),
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Parse a duration string like "90s", "30m", "2h", "1d", or plain seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();

    if s.is_empty() {
        return Err(anyhow!("Empty duration"));
    }

    // Plain number means seconds
    if let Ok(seconds) = s.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let (value_str, unit) = s.split_at(s.len() - 1);
    let value: u64 = value_str
        .parse()
        .map_err(|_| anyhow!("Invalid duration format: {}", s))?;

    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => return Err(anyhow!("Invalid duration unit '{}' (use s, m, h, or d)", unit)),
    };

    Ok(Duration::from_secs(seconds))
}
