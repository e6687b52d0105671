//! Per-repository poll gating
//!
//! Keeps track of which repositories should sit out upcoming poll cycles:
//! rate-limited repositories until their reported reset, repeatedly failing
//! ones with exponentially growing holds, and terminally broken ones until
//! an operator steps in. All of this is in-memory; a restart starts fresh,
//! which is the desired behavior for what is effectively a politeness cache.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::repo::RepoId;

/// Longest hold the failure backoff can grow to
const MAX_FAILURE_HOLD: Duration = Duration::from_secs(3600);

/// Why a repository is currently being skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    /// API quota exhausted; waiting for the reported reset
    RateLimited,
    /// Too many consecutive transient failures
    Degraded,
    /// Terminal error; held until restart or a manual check
    Paused,
}

impl HoldReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldReason::RateLimited => "rate limited",
            HoldReason::Degraded => "degraded",
            HoldReason::Paused => "paused",
        }
    }
}

/// An active hold on a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hold {
    pub reason: HoldReason,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Entry {
    consecutive_failures: u32,
    hold: Option<Hold>,
}

/// Tracks per-repository failure counts and holds
pub struct BackoffRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    failure_threshold: u32,
    failure_backoff: Duration,
}

impl BackoffRegistry {
    pub fn new(failure_threshold: u32, failure_backoff: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            failure_backoff,
        }
    }

    /// Whether a repository may be polled at the given instant. Expired
    /// holds are cleared as a side effect.
    pub fn is_eligible(&self, repo: &RepoId, now: DateTime<Utc>) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(repo.as_str()) {
            Some(entry) => match entry.hold {
                Some(hold) if hold.until > now => false,
                Some(_) => {
                    entry.hold = None;
                    true
                }
                None => true,
            },
            None => true,
        }
    }

    /// The active hold for a repository, if any
    pub fn hold_for(&self, repo: &RepoId, now: DateTime<Utc>) -> Option<Hold> {
        let entries = self.lock();
        entries
            .get(repo.as_str())
            .and_then(|entry| entry.hold)
            .filter(|hold| hold.until > now)
    }

    /// Suspend polling until the given instant (rate-limit reset)
    pub fn suspend_until(&self, repo: &RepoId, reset_at: DateTime<Utc>) {
        let mut entries = self.lock();
        let entry = entries.entry(repo.as_str().to_string()).or_default();
        entry.hold = Some(Hold {
            reason: HoldReason::RateLimited,
            until: reset_at,
        });
        debug!("Suspended polling of {} until {}", repo, reset_at);
    }

    /// Count a transient failure. Once the threshold is reached, the
    /// repository is held for failure_backoff, doubling per further failure
    /// up to an hour. Returns the new consecutive failure count.
    pub fn record_failure(&self, repo: &RepoId, now: DateTime<Utc>) -> u32 {
        let mut entries = self.lock();
        let entry = entries.entry(repo.as_str().to_string()).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        if entry.consecutive_failures >= self.failure_threshold {
            let exponent = entry.consecutive_failures - self.failure_threshold;
            let hold_duration = self
                .failure_backoff
                .saturating_mul(2u32.saturating_pow(exponent))
                .min(MAX_FAILURE_HOLD);

            entry.hold = Some(Hold {
                reason: HoldReason::Degraded,
                until: now + chrono_duration(hold_duration),
            });
            debug!(
                "Degraded polling of {} for {:?} after {} consecutive failures",
                repo, hold_duration, entry.consecutive_failures
            );
        }

        entry.consecutive_failures
    }

    /// Stop polling a repository until restart or a manual check
    pub fn pause(&self, repo: &RepoId) {
        let mut entries = self.lock();
        let entry = entries.entry(repo.as_str().to_string()).or_default();
        entry.hold = Some(Hold {
            reason: HoldReason::Paused,
            until: DateTime::<Utc>::MAX_UTC,
        });
    }

    /// Forget failures and holds after a successful check
    pub fn clear(&self, repo: &RepoId) {
        let mut entries = self.lock();
        entries.remove(repo.as_str());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}
