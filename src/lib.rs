//! relwatch - GitHub Release Watcher with Push Notifications
//!
//! relwatch polls GitHub repositories for new releases and pushes a
//! notification through ntfy the moment a tag changes, remembering what it
//! has already announced across restarts.
//!
//! ## Core Features
//!
//! - **Release Polling**: Periodic checks against the GitHub releases API,
//!   with jitter and per-repository failure backoff
//! - **Push Notifications**: ntfy delivery with bounded retries
//! - **Durable State**: SQLite-backed memory of the last announced release
//! - **Daily Stats**: Optional Plausible visitor reports
//! - **Configuration Management**: YAML-based configuration with XDG compliance
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`github`]: GitHub releases API client
//! - [`diff`]: Release comparison against recorded state
//! - [`monitor`]: Poll scheduling and the notification pipeline
//! - [`state`]: Durable per-repository release state

pub mod backoff;
pub mod config;
pub mod daemon;
pub mod diff;
pub mod github;
pub mod health;
pub mod monitor;
pub mod notify;
pub mod repo;
pub mod state;
pub mod stats;

pub use config::Config;
pub use daemon::Daemon;
pub use diff::Evaluation;
pub use github::{FetchError, GitHubClient, Release};
pub use health::HealthCheck;
pub use monitor::{CheckOutcome, CycleSummary, Monitor};
pub use notify::{Notifier, NotifyError};
pub use repo::RepoId;
pub use state::{ReleaseState, ReleaseStore};
pub use stats::StatsReporter;
