//! Monitor - orchestrates release checks across tracked repositories
//!
//! This module coordinates the full check pipeline for each repository:
//! fetch the latest release, compare it against recorded state, deliver a
//! notification when something new appeared, and only then commit the
//! observation. Repositories are checked in parallel under a concurrency
//! cap, with per-repository gating for rate limits and repeated failures.

use crate::backoff::BackoffRegistry;
use crate::config::Config;
use crate::diff::{self, Evaluation};
use crate::github::{FetchError, GitHubClient, Release};
use crate::notify::Notifier;
use crate::repo::RepoId;
use crate::state::ReleaseStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How a single repository check resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Recorded tag still current
    UpToDate,
    /// First successful observation, recorded without notifying
    FirstSeen { tag: String },
    /// New tag found and the notification was delivered
    Notified { tag: String },
    /// New tag found, delivery failed terminally; the tag was recorded
    /// anyway so the release is not re-announced forever
    NotifyDropped { tag: String, reason: String },
    /// Repository has no published releases (or vanished); benign
    NoReleases,
    /// API quota exhausted; polling suspended until the reported reset
    RateLimited { reset_at: DateTime<Utc> },
    /// Transient trouble (network, server error, local state)
    Failed { reason: String },
    /// Terminal error; polling paused until restart or a manual check
    Halted { reason: String },
    /// Check did not run (backoff hold, overlap, shutdown)
    Skipped { reason: String },
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckOutcome::UpToDate => write!(f, "up to date"),
            CheckOutcome::FirstSeen { tag } => write!(f, "first observation recorded ({})", tag),
            CheckOutcome::Notified { tag } => write!(f, "new release {} (notified)", tag),
            CheckOutcome::NotifyDropped { tag, reason } => {
                write!(f, "new release {} (notification dropped: {})", tag, reason)
            }
            CheckOutcome::NoReleases => write!(f, "no published releases"),
            CheckOutcome::RateLimited { reset_at } => {
                write!(f, "rate limited until {}", reset_at.format("%Y-%m-%d %H:%M UTC"))
            }
            CheckOutcome::Failed { reason } => write!(f, "check failed: {}", reason),
            CheckOutcome::Halted { reason } => write!(f, "polling paused: {}", reason),
            CheckOutcome::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

/// Results from one complete poll cycle
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub total: usize,
    pub up_to_date: usize,
    pub first_seen: usize,
    pub notified: usize,
    pub dropped: usize,
    pub no_releases: usize,
    pub rate_limited: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration: Duration,
    pub results: Vec<(RepoId, CheckOutcome)>,
}

impl CycleSummary {
    /// Checks that found a release tag differing from the recorded one
    pub fn new_releases(&self) -> usize {
        self.notified + self.dropped
    }

    /// Anything an operator might want to look at
    pub fn has_problems(&self) -> bool {
        self.dropped > 0 || self.failed > 0
    }
}

/// The release monitor
pub struct Monitor {
    config: Arc<Config>,
    github: GitHubClient,
    notifier: Notifier,
    store: Arc<ReleaseStore>,
    backoff: BackoffRegistry,
    in_flight: Mutex<HashSet<String>>,
    shutting_down: AtomicBool,
    jitter_max: Duration,
}

impl Monitor {
    /// Create a new monitor with the given configuration and state store
    pub fn new(config: Arc<Config>, store: Arc<ReleaseStore>) -> Result<Self> {
        let github = GitHubClient::new(&config)?;
        let notifier = Notifier::new(&config)?;
        let backoff = BackoffRegistry::new(
            config.monitor.failure_threshold,
            config.failure_backoff()?,
        );
        let jitter_max = config.jitter_max()?;

        Ok(Self {
            config,
            github,
            notifier,
            store,
            backoff,
            in_flight: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
            jitter_max,
        })
    }

    /// Run one poll cycle over every tracked repository
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let start_time = Instant::now();

        // Re-read the registry each cycle so the tracked set is evaluated
        // fresh rather than frozen at startup
        let repos = self.config.tracked_repos()?;

        info!("Checking {} repositories for new releases", repos.len());

        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            self.config.monitor.max_parallel.max(1),
        ));
        let mut futures = FuturesUnordered::new();

        for repo in repos {
            let semaphore = semaphore.clone();

            let future = async move {
                // Acquire semaphore permit
                let _permit = semaphore.acquire().await.expect("Semaphore closed");
                let outcome = self.check_repo(&repo).await;
                (repo, outcome)
            };

            futures.push(future);
        }

        // Collect all results
        let mut results = Vec::new();
        while let Some((repo, outcome)) = futures.next().await {
            debug!("Check resolved: {} -> {}", repo, outcome);
            results.push((repo, outcome));
        }

        let summary = compile_summary(results, start_time.elapsed());

        info!(
            "Cycle completed in {:.2}s: {} notified, {} dropped, {} up to date, {} failed, {} skipped",
            summary.duration.as_secs_f64(),
            summary.notified,
            summary.dropped,
            summary.up_to_date,
            summary.failed,
            summary.skipped
        );

        Ok(summary)
    }

    /// Scheduled check: honors shutdown, backoff holds, and startup jitter
    async fn check_repo(&self, repo: &RepoId) -> CheckOutcome {
        if self.is_shutting_down() {
            return CheckOutcome::Skipped {
                reason: "shutdown in progress".to_string(),
            };
        }

        let now = Utc::now();
        if !self.backoff.is_eligible(repo, now) {
            let reason = match self.backoff.hold_for(repo, now) {
                Some(hold) => format!(
                    "{} until {}",
                    hold.reason.as_str(),
                    hold.until.format("%Y-%m-%d %H:%M UTC")
                ),
                None => "backing off".to_string(),
            };
            debug!("Skipping {}: {}", repo, reason);
            return CheckOutcome::Skipped { reason };
        }

        let jitter = jitter_delay(self.jitter_max);
        if !jitter.is_zero() {
            tokio::time::sleep(jitter).await;
        }

        self.check_repo_now(repo).await
    }

    /// Check a repository immediately, bypassing backoff holds and jitter.
    /// Used for manual re-checks. Concurrent checks of the same repository
    /// are collapsed into one.
    pub async fn check_repo_now(&self, repo: &RepoId) -> CheckOutcome {
        let _guard = match InFlightGuard::claim(&self.in_flight, repo) {
            Some(guard) => guard,
            None => {
                debug!("Check already in flight for {}", repo);
                return CheckOutcome::Skipped {
                    reason: "check already in flight".to_string(),
                };
            }
        };

        match self.github.fetch_latest_release(repo).await {
            Ok(release) => self.resolve_release(repo, release).await,
            Err(FetchError::NotFound) => {
                debug!("No published releases for {}", repo);
                self.backoff.clear(repo);
                CheckOutcome::NoReleases
            }
            Err(FetchError::RateLimited { reset_at }) => {
                self.backoff.suspend_until(repo, reset_at);
                CheckOutcome::RateLimited { reset_at }
            }
            Err(FetchError::Transient(reason)) => {
                let now = Utc::now();
                if let Err(e) = self.store.record_failure(repo, now) {
                    warn!("Failed to persist failure count for {}: {:#}", repo, e);
                }
                let failures = self.backoff.record_failure(repo, now);
                if failures >= self.config.monitor.failure_threshold {
                    warn!(
                        "Check failed for {} ({} consecutive, degrading poll rate): {}",
                        repo, failures, reason
                    );
                } else {
                    warn!("Check failed for {}: {}", repo, reason);
                }
                CheckOutcome::Failed { reason }
            }
            Err(FetchError::Terminal(reason)) => {
                self.backoff.pause(repo);
                error!(
                    "Polling paused for {} until restart or manual check: {}",
                    repo, reason
                );
                CheckOutcome::Halted { reason }
            }
        }
    }

    /// Decide what a fetched release means and act on it
    async fn resolve_release(&self, repo: &RepoId, release: Release) -> CheckOutcome {
        let recorded = match self.store.get(repo) {
            Ok(recorded) => recorded,
            Err(e) => {
                error!("State lookup failed for {}: {:#}", repo, e);
                return CheckOutcome::Failed {
                    reason: format!("state lookup failed: {}", e),
                };
            }
        };

        match diff::evaluate(&release, recorded.as_ref()) {
            Evaluation::Unchanged => {
                if let Err(e) = self.store.mark_checked(repo, Utc::now()) {
                    warn!("Failed to record check time for {}: {:#}", repo, e);
                }
                self.backoff.clear(repo);
                debug!("{} is up to date ({})", repo, release.tag_name);
                CheckOutcome::UpToDate
            }
            Evaluation::FirstObservation { tag } => {
                if self.config.general.notify_on_first_observation {
                    info!("First observation for {}: {}", repo, tag);
                    self.notify_and_commit(repo, &release, tag).await
                } else {
                    info!(
                        "First observation for {}: {} (notification suppressed)",
                        repo, tag
                    );
                    if let Err(outcome) = self.commit(repo, &release) {
                        return outcome;
                    }
                    self.backoff.clear(repo);
                    CheckOutcome::FirstSeen { tag }
                }
            }
            Evaluation::NewRelease { tag } => {
                info!("New release for {}: {}", repo, tag);
                self.notify_and_commit(repo, &release, tag).await
            }
        }
    }

    /// Deliver the notification, then record the observation. The commit
    /// happens once delivery has terminally resolved, delivered or dropped:
    /// recording earlier could lose a notification over a crash, recording
    /// never would re-announce the same release every cycle.
    async fn notify_and_commit(
        &self,
        repo: &RepoId,
        release: &Release,
        tag: String,
    ) -> CheckOutcome {
        let delivery = self
            .notifier
            .notify_release(&self.config.github.ntfy_topic, repo, release)
            .await;

        if let Err(outcome) = self.commit(repo, release) {
            return outcome;
        }
        self.backoff.clear(repo);

        match delivery {
            Ok(()) => CheckOutcome::Notified { tag },
            Err(err) => {
                error!("Dropped notification for {} {}: {}", repo, tag, err);
                CheckOutcome::NotifyDropped {
                    tag,
                    reason: err.to_string(),
                }
            }
        }
    }

    fn commit(&self, repo: &RepoId, release: &Release) -> Result<(), CheckOutcome> {
        self.store
            .commit_observation(repo, &release.tag_name, release.published_at, Utc::now())
            .map_err(|e| {
                error!("Failed to commit observation for {}: {:#}", repo, e);
                CheckOutcome::Failed {
                    reason: format!("state commit failed: {}", e),
                }
            })
    }

    /// Stop starting new checks; checks already underway run to completion
    /// so their notify-then-commit sequence is never left half done
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Get configuration for external inspection
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Random delay up to `max`, applied before each scheduled check
fn jitter_delay(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Compile a cycle summary from per-repository outcomes
fn compile_summary(results: Vec<(RepoId, CheckOutcome)>, duration: Duration) -> CycleSummary {
    let mut summary = CycleSummary {
        total: results.len(),
        up_to_date: 0,
        first_seen: 0,
        notified: 0,
        dropped: 0,
        no_releases: 0,
        rate_limited: 0,
        failed: 0,
        skipped: 0,
        duration,
        results: Vec::new(),
    };

    for (_, outcome) in &results {
        match outcome {
            CheckOutcome::UpToDate => summary.up_to_date += 1,
            CheckOutcome::FirstSeen { .. } => summary.first_seen += 1,
            CheckOutcome::Notified { .. } => summary.notified += 1,
            CheckOutcome::NotifyDropped { .. } => summary.dropped += 1,
            CheckOutcome::NoReleases => summary.no_releases += 1,
            CheckOutcome::RateLimited { .. } => summary.rate_limited += 1,
            CheckOutcome::Failed { .. } | CheckOutcome::Halted { .. } => summary.failed += 1,
            CheckOutcome::Skipped { .. } => summary.skipped += 1,
        }
    }

    summary.results = results;
    summary
}

/// Marks a repository as having a check underway; releases the claim on drop
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl<'a> InFlightGuard<'a> {
    fn claim(set: &'a Mutex<HashSet<String>>, repo: &RepoId) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(PoisonError::into_inner);
        if !guard.insert(repo.as_str().to_string()) {
            return None;
        }
        Some(Self {
            set,
            key: repo.as_str().to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
