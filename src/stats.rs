//! Daily website statistics reports
//!
//! Optional companion to release monitoring: once a day, after a configured
//! local time, aggregate visitor numbers are pulled from a Plausible
//! instance and pushed to ntfy. The "already reported today" marker lives in
//! the state database so a restart does not produce a second report.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, Timelike};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::notify::Notifier;
use crate::state::ReleaseStore;

/// service_state key holding the date of the last scheduled report
const LAST_REPORT_KEY: &str = "stats.last_report";

/// Aggregate metrics for one site over the current day
#[derive(Debug, Clone)]
pub struct DayStats {
    pub visitors: f64,
    pub pageviews: f64,
    pub bounce_rate: f64,
    pub visit_duration: f64,
}

#[derive(Debug, Deserialize)]
struct AggregateResponse {
    results: AggregateResults,
}

#[derive(Debug, Deserialize)]
struct AggregateResults {
    visitors: Metric,
    pageviews: Metric,
    bounce_rate: Metric,
    visit_duration: Metric,
}

#[derive(Debug, Deserialize)]
struct Metric {
    value: f64,
}

/// Fetches Plausible aggregates and publishes the daily report
pub struct StatsReporter {
    client: Client,
    notifier: Notifier,
    store: Arc<ReleaseStore>,
    config: Arc<Config>,
}

impl StatsReporter {
    pub fn new(config: Arc<Config>, store: Arc<ReleaseStore>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("relwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        let notifier = Notifier::new(&config)?;

        Ok(Self {
            client,
            notifier,
            store,
            config,
        })
    }

    pub fn enabled(&self) -> bool {
        self.config.stats.enabled && !self.config.stats.sites.is_empty()
    }

    /// Scheduled path: send the daily report if the configured time has
    /// passed and nothing was sent today yet
    pub async fn maybe_report(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }

        let (hour, minute) = parse_report_time(&self.config.stats.report_time)?;
        let now = Local::now();
        let last_report = self.store.get_meta(LAST_REPORT_KEY)?;

        if !report_due(hour, minute, &now, last_report.as_deref()) {
            debug!("Daily stats report not due");
            return Ok(());
        }

        info!(
            "Sending daily stats report for {} site(s)",
            self.config.stats.sites.len()
        );
        self.send_reports().await;

        // One scheduled report per day, even if some sites failed; the next
        // attempt is tomorrow
        self.store
            .set_meta(LAST_REPORT_KEY, &now.format("%Y-%m-%d").to_string())?;
        Ok(())
    }

    /// Manual path: send immediately without consuming the daily slot
    pub async fn report_now(&self) -> Result<()> {
        if !self.enabled() {
            return Err(anyhow!(
                "Stats reporting is disabled (set stats.enabled and stats.sites)"
            ));
        }

        info!(
            "Sending stats report for {} site(s) (manual)",
            self.config.stats.sites.len()
        );
        self.send_reports().await;
        Ok(())
    }

    /// Fetch and publish per-site reports; per-site failures are logged and
    /// do not stop the rest
    async fn send_reports(&self) {
        for site in &self.config.stats.sites {
            match self.fetch_site_stats(site).await {
                Ok(stats) => {
                    let title = format!("📈 Daily stats: {}", site);
                    let message = stats_message(site, &stats);
                    if let Err(e) = self
                        .notifier
                        .send(&self.config.stats.ntfy_topic, &title, &message, "stats,website", &[])
                        .await
                    {
                        warn!("Failed to deliver stats report for {}: {}", site, e);
                    }
                }
                Err(e) => {
                    warn!("Failed to fetch stats for {}: {:#}", site, e);
                }
            }
        }
    }

    /// Query today's aggregate metrics for one site
    async fn fetch_site_stats(&self, site: &str) -> Result<DayStats> {
        let url = format!(
            "{}/api/v1/stats/aggregate",
            self.config.stats.url.trim_end_matches('/')
        );

        let mut request = self.client.get(&url).query(&[
            ("site_id", site),
            ("period", "day"),
            ("metrics", "visitors,pageviews,bounce_rate,visit_duration"),
        ]);

        if let Some(token) = self.config.stats.token() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Stats request for {} failed", site))?
            .error_for_status()
            .with_context(|| format!("Plausible API error for {}", site))?;

        let parsed: AggregateResponse = response
            .json()
            .await
            .with_context(|| format!("Malformed stats payload for {}", site))?;

        Ok(DayStats {
            visitors: parsed.results.visitors.value,
            pageviews: parsed.results.pageviews.value,
            bounce_rate: parsed.results.bounce_rate.value,
            visit_duration: parsed.results.visit_duration.value,
        })
    }
}

/// Whether the scheduled daily report should go out now
fn report_due(
    report_hour: u32,
    report_minute: u32,
    now: &DateTime<Local>,
    last_report: Option<&str>,
) -> bool {
    let today = now.format("%Y-%m-%d").to_string();
    if last_report == Some(today.as_str()) {
        return false;
    }

    // Due any time after the configured moment, not only within that exact
    // hour; a long poll interval could otherwise skip right past it
    now.hour() * 60 + now.minute() >= report_hour * 60 + report_minute
}

/// Parse "HH:MM" into hours and minutes
pub(crate) fn parse_report_time(s: &str) -> Result<(u32, u32)> {
    let (hour_str, minute_str) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid stats.report_time '{}': expected HH:MM", s))?;

    let hour: u32 = hour_str
        .parse()
        .map_err(|_| anyhow!("Invalid stats.report_time '{}': bad hour", s))?;
    let minute: u32 = minute_str
        .parse()
        .map_err(|_| anyhow!("Invalid stats.report_time '{}': bad minute", s))?;

    if hour > 23 || minute > 59 {
        return Err(anyhow!("Invalid stats.report_time '{}': out of range", s));
    }

    Ok((hour, minute))
}

/// Message body for a daily stats notification
fn stats_message(site: &str, stats: &DayStats) -> String {
    format!(
        "**Daily stats for {}**\n\n\
         📊 Visitors: {}\n\
         👀 Pageviews: {}\n\
         ↩️ Bounce rate: {}%\n\
         ⏱️ Avg. visit duration: {}s",
        site,
        stats.visitors as i64,
        stats.pageviews as i64,
        stats.bounce_rate,
        stats.visit_duration as i64
    )
}
