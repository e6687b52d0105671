//! Notification delivery via ntfy
//!
//! Publishes messages to an ntfy topic with a small bounded retry budget.
//! Server errors, timeouts, and 429s are retried with exponential backoff;
//! any other 4xx means the request itself is wrong and is not retried.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::github::Release;
use crate::repo::RepoId;

/// ntfy uses this to render a GitHub logo next to release notifications
const GITHUB_ICON_URL: &str = "https://github.githubassets.com/images/modules/logos_page/GitHub-Mark.png";

/// Terminal delivery failure, reported after the retry budget is spent or
/// when retrying cannot help
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification rejected by ntfy: {0}")]
    Rejected(String),

    #[error("notification failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Failure of a single delivery attempt
enum AttemptError {
    Retryable(String),
    Rejected(String),
}

/// ntfy publisher
pub struct Notifier {
    client: Client,
    base_url: String,
    token: Option<String>,
    max_attempts: u32,
    retry_base_delay: Duration,
}

impl Notifier {
    /// Create a new notifier from configuration
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("relwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.ntfy.base_url.trim_end_matches('/').to_string(),
            token: config.ntfy.token().map(|t| t.to_string()),
            max_attempts: config.notifier.max_attempts.max(1),
            retry_base_delay: config.retry_base_delay()?,
        })
    }

    /// Publish a new-release notification
    pub async fn notify_release(
        &self,
        topic: &str,
        repo: &RepoId,
        release: &Release,
    ) -> Result<(), NotifyError> {
        let title = format!("🚀 New release: {}", repo);
        let message = release_message(release);
        let extra = [
            ("Click", release.html_url.as_str()),
            ("Icon", GITHUB_ICON_URL),
        ];

        self.send(topic, &title, &message, "github,release", &extra)
            .await
    }

    /// Publish a message to a topic, retrying transient failures up to the
    /// configured attempt budget
    pub async fn send(
        &self,
        topic: &str,
        title: &str,
        message: &str,
        tags: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<(), NotifyError> {
        let url = format!("{}/{}", self.base_url, topic);
        let headers = self
            .build_headers(title, tags, extra_headers)
            .map_err(|e| NotifyError::Rejected(e.to_string()))?;

        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self.dispatch(&url, headers.clone(), message).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!("Notification delivered to {} on attempt {}", url, attempt);
                    } else {
                        debug!("Notification delivered to {}", url);
                    }
                    return Ok(());
                }
                Err(AttemptError::Rejected(reason)) => {
                    return Err(NotifyError::Rejected(reason));
                }
                Err(AttemptError::Retryable(reason)) => {
                    last_error = reason;
                    if attempt < self.max_attempts {
                        let delay = retry_delay(self.retry_base_delay, attempt);
                        warn!(
                            "Notification attempt {}/{} failed ({}), retrying in {:?}",
                            attempt, self.max_attempts, last_error, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(NotifyError::Exhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }

    /// One delivery attempt
    async fn dispatch(
        &self,
        url: &str,
        headers: HeaderMap,
        message: &str,
    ) -> Result<(), AttemptError> {
        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(message.to_string())
            .send()
            .await
            .map_err(|e| AttemptError::Retryable(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let reason = if body.is_empty() {
            format!("ntfy returned {}", status)
        } else {
            format!("ntfy returned {}: {}", status, body.trim())
        };

        // 429 and server-side trouble are worth another attempt; any other
        // 4xx means the request itself is bad
        if status.is_server_error() || status.as_u16() == 429 {
            Err(AttemptError::Retryable(reason))
        } else {
            Err(AttemptError::Rejected(reason))
        }
    }

    fn build_headers(
        &self,
        title: &str,
        tags: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert("Title", header_value(title)?);
        headers.insert("Tags", header_value(tags)?);
        headers.insert("Priority", HeaderValue::from_static("default"));
        headers.insert("Markdown", HeaderValue::from_static("true"));

        if let Some(token) = &self.token {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                header_value(&format!("Bearer {}", token))?,
            );
        }

        for (name, value) in extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name: {}", name))?;
            headers.insert(name, header_value(value)?);
        }

        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).with_context(|| format!("Invalid header value: {}", value))
}

/// Message body for a release notification
fn release_message(release: &Release) -> String {
    let body = release
        .body
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .unwrap_or("No description provided.");

    format!(
        "**{}** published!\n\n{}\n\n[Download & Changelog]({})",
        release.tag_name, body, release.html_url
    )
}

/// Exponential backoff: base * 2^(attempt - 1)
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{body_string_contains, header, headers, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> Config {
        let mut config = Config::default();
        config.ntfy.base_url = base_url.to_string();
        config.notifier.max_attempts = 3;
        // No waiting between attempts in tests
        config.notifier.retry_base_delay = "0".to_string();
        config.monitor.request_timeout = 5;
        config
    }

    fn test_release(tag: &str) -> Release {
        serde_json::from_value(serde_json::json!({
            "tag_name": tag,
            "html_url": format!("https://github.com/acme/widget/releases/tag/{}", tag),
            "body": "Fixes a crash on startup",
        }))
        .unwrap()
    }

    #[test]
    fn test_retry_delay_doubles() {
        let base = Duration::from_secs(2);
        assert_eq!(retry_delay(base, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(base, 2), Duration::from_secs(4));
        assert_eq!(retry_delay(base, 3), Duration::from_secs(8));
    }

    #[test]
    fn test_release_message_with_body() {
        let message = release_message(&test_release("v1.2.0"));
        assert!(message.starts_with("**v1.2.0** published!"));
        assert!(message.contains("Fixes a crash on startup"));
        assert!(message.contains("[Download & Changelog]("));
    }

    #[test]
    fn test_release_message_without_body() {
        let mut release = test_release("v1.2.0");
        release.body = None;
        assert!(release_message(&release).contains("No description provided."));

        release.body = Some("   ".to_string());
        assert!(release_message(&release).contains("No description provided."));
    }

    #[tokio::test]
    async fn test_send_success() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/github"))
            .and(headers("Tags", vec!["github", "release"]))
            .and(header("Priority", "default"))
            .and(header("Markdown", "true"))
            .and(body_string_contains("v1.2.0"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = Notifier::new(&test_config(&server.uri())).unwrap();
        let repo = RepoId::parse("acme/widget").unwrap();

        notifier
            .notify_release("github", &repo, &test_release("v1.2.0"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_includes_click_and_icon_headers() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/github"))
            .and(header(
                "Click",
                "https://github.com/acme/widget/releases/tag/v1.2.0",
            ))
            .and(header("Icon", GITHUB_ICON_URL))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = Notifier::new(&test_config(&server.uri())).unwrap();
        let repo = RepoId::parse("acme/widget").unwrap();

        notifier
            .notify_release("github", &repo, &test_release("v1.2.0"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_includes_bearer_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/github"))
            .and(header("Authorization", "Bearer tk_secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config(&server.uri());
        config.ntfy.token = Some("tk_secret".to_string());

        let notifier = Notifier::new(&config).unwrap();
        notifier
            .send("github", "title", "message", "github", &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_recovers_after_transient_failures() {
        let server = MockServer::start().await;

        // First two attempts fail, third succeeds
        Mock::given(method("POST"))
            .and(path("/github"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/github"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = Notifier::new(&test_config(&server.uri())).unwrap();
        notifier
            .send("github", "title", "message", "github", &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_exhausts_retry_budget() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/github"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let notifier = Notifier::new(&test_config(&server.uri())).unwrap();
        let err = notifier
            .send("github", "title", "message", "github", &[])
            .await
            .unwrap_err();

        assert_matches!(err, NotifyError::Exhausted { attempts: 3, .. });
    }

    #[tokio::test]
    async fn test_send_does_not_retry_client_errors() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/github"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = Notifier::new(&test_config(&server.uri())).unwrap();
        let err = notifier
            .send("github", "title", "message", "github", &[])
            .await
            .unwrap_err();

        assert_matches!(err, NotifyError::Rejected(reason) => {
            assert!(reason.contains("forbidden"));
        });
    }

    #[tokio::test]
    async fn test_send_retries_429() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/github"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/github"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = Notifier::new(&test_config(&server.uri())).unwrap();
        notifier
            .send("github", "title", "message", "github", &[])
            .await
            .unwrap();
    }
}
