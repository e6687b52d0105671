//! Preflight checks for relwatch
//!
//! Backs the `doctor` command: verifies the configuration parses, the state
//! database opens, the GitHub API answers, and the ntfy target looks sane
//! before the daemon is trusted to run unattended.

use chrono::{TimeZone, Utc};

use crate::config::Config;
use crate::github::GitHubClient;
use crate::repo::RepoId;
use crate::state::ReleaseStore;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Configuration file status
    pub config: CheckResult,
    /// State database status
    pub state_db: CheckResult,
    /// GitHub API reachability and quota
    pub github: CheckResult,
    /// ntfy delivery target status
    pub ntfy: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

#[allow(dead_code)]
impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: true,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(config: &Config) -> Self {
        Self {
            config: Self::check_config(config),
            state_db: Self::check_state_db(config),
            github: Self::check_github(config).await,
            ntfy: Self::check_ntfy(config),
        }
    }

    /// Check if all required checks passed (warnings still pass)
    pub fn all_passed(&self) -> bool {
        self.config.passed && self.state_db.passed && self.github.passed && self.ntfy.passed
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        [&self.config, &self.state_db, &self.github, &self.ntfy]
            .into_iter()
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        [&self.config, &self.state_db, &self.github, &self.ntfy]
            .into_iter()
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Validate the configuration values themselves
    fn check_config(config: &Config) -> CheckResult {
        for raw in &config.github.repos {
            if let Err(e) = RepoId::parse(raw) {
                return CheckResult::error_with_details(
                    "Invalid repository in github.repos",
                    format!("{}: {}", raw, e),
                );
            }
        }

        let interval = match config.check_interval() {
            Ok(d) => d,
            Err(e) => {
                return CheckResult::error_with_details("Invalid check interval", format!("{:#}", e))
            }
        };

        if let Err(e) = config
            .jitter_max()
            .and(config.failure_backoff())
            .and(config.retry_base_delay())
        {
            return CheckResult::error_with_details("Invalid duration setting", format!("{:#}", e));
        }

        if config.stats.enabled {
            if let Err(e) = crate::stats::parse_report_time(&config.stats.report_time) {
                return CheckResult::error_with_details("Invalid stats settings", format!("{:#}", e));
            }
        }

        if config.github.repos.is_empty() {
            return CheckResult::warning_with_details(
                "No repositories configured",
                "Add \"owner/name\" entries under github.repos",
            );
        }

        CheckResult::ok_with_details(
            "Configuration valid",
            format!(
                "Watching {} repo(s), polling every {}s",
                config.github.repos.len(),
                interval.as_secs()
            ),
        )
    }

    /// Check that the state database opens and answers queries
    fn check_state_db(config: &Config) -> CheckResult {
        let path = match config.state_db_path() {
            Ok(p) => p,
            Err(e) => {
                return CheckResult::error_with_details(
                    "Cannot resolve state database path",
                    format!("{:#}", e),
                )
            }
        };

        match ReleaseStore::open_at(path.clone()) {
            Ok(store) => match store.all() {
                Ok(rows) => CheckResult::ok_with_details(
                    "State database ready",
                    format!("{} repo(s) recorded at {}", rows.len(), path.display()),
                ),
                Err(e) => CheckResult::error_with_details(
                    "State database query failed",
                    format!("{:#}", e),
                ),
            },
            Err(e) => CheckResult::error_with_details(
                "Cannot open state database",
                format!("{}: {:#}", path.display(), e),
            ),
        }
    }

    /// Probe the GitHub API and report the remaining quota
    async fn check_github(config: &Config) -> CheckResult {
        let client = match GitHubClient::new(config) {
            Ok(c) => c,
            Err(e) => {
                return CheckResult::error_with_details(
                    "Cannot build GitHub client",
                    format!("{:#}", e),
                )
            }
        };

        match client.rate_limit().await {
            Ok(status) if status.remaining == 0 => {
                let reset = Utc
                    .timestamp_opt(status.reset, 0)
                    .single()
                    .map(|t| t.format("%H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                CheckResult::warning_with_details(
                    "GitHub rate limit exhausted",
                    format!("Quota resets at {}", reset),
                )
            }
            Ok(status) => CheckResult::ok_with_details(
                "GitHub API reachable",
                format!("Rate limit: {}/{} remaining", status.remaining, status.limit),
            ),
            Err(e) => CheckResult::error_with_details(
                "GitHub API unreachable",
                format!("{:#}\nCheck network and github.token", e),
            ),
        }
    }

    /// Validate the ntfy target without publishing anything
    fn check_ntfy(config: &Config) -> CheckResult {
        if config.github.ntfy_topic.trim().is_empty() {
            return CheckResult::error_with_details(
                "ntfy topic is empty",
                "Set github.ntfy_topic to the topic notifications should reach",
            );
        }

        match reqwest::Url::parse(&config.ntfy.base_url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                CheckResult::ok_with_details(
                    "ntfy delivery configured",
                    format!(
                        "{}/{}",
                        config.ntfy.base_url.trim_end_matches('/'),
                        config.github.ntfy_topic
                    ),
                )
            }
            Ok(url) => CheckResult::error_with_details(
                "Invalid ntfy URL",
                format!("Unsupported scheme '{}'", url.scheme()),
            ),
            Err(e) => {
                CheckResult::error_with_details("Invalid ntfy URL", format!("{}: {}", config.ntfy.base_url, e))
            }
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("Configuration", &self.config),
            ("State Database", &self.state_db),
            ("GitHub API", &self.github),
            ("ntfy Delivery", &self.ntfy),
        ]
    }
}
