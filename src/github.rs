use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::repo::RepoId;

/// A published release as reported by the GitHub API
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    /// Exact tag string; identity of a release for comparison purposes
    pub tag_name: String,

    /// Human-readable release title, often absent
    #[serde(default)]
    pub name: Option<String>,

    /// Browser URL of the release page
    pub html_url: String,

    /// Release notes (markdown), often absent
    #[serde(default)]
    pub body: Option<String>,

    /// Publication timestamp; null for releases created in odd ways
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl Release {
    /// Display title, falling back to the tag when the release is unnamed
    pub fn title(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.tag_name)
    }
}

/// Why a release fetch did not produce a release
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The repository has no published releases, or does not exist. Both
    /// surface as 404 from the releases endpoint and neither is an error
    /// worth alerting on.
    #[error("repository has no published releases (or does not exist)")]
    NotFound,

    /// API quota exhausted; no point retrying before the reset
    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    /// Network trouble, server errors, malformed payloads. Worth retrying
    /// on the next cycle.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Bad credentials or a denied request. Retrying without operator
    /// intervention cannot help.
    #[error("terminal failure: {0}")]
    Terminal(String),
}

/// GitHub API client for release polling
pub struct GitHubClient {
    client: Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubClient {
    /// Create a new client from configuration
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("relwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        let token = config.github.token().map(|t| t.to_string());

        if let Some(token) = &token {
            if !token.starts_with("ghp_")
                && !token.starts_with("gho_")
                && !token.starts_with("ghs_")
                && !token.starts_with("github_pat_")
            {
                warn!("github.token doesn't look like a GitHub token (expected ghp_/gho_/ghs_/github_pat_ prefix)");
            }
        }

        Ok(Self {
            client,
            api_url: config.github.api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Fetch the latest published release for a repository
    pub async fn fetch_latest_release(&self, repo: &RepoId) -> Result<Release, FetchError> {
        let url = format!("{}/repos/{}/releases/latest", self.api_url, repo);
        debug!("Fetching latest release: GET {}", url);

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github.v3+json");

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            FetchError::Transient(format!("Request to {} failed: {}", url, e))
        })?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            StatusCode::UNAUTHORIZED => Err(FetchError::Terminal(
                "GitHub rejected the configured token (401)".to_string(),
            )),
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                match rate_limit_reset(response.headers()) {
                    Some(reset_at) => {
                        warn!("GitHub rate limit hit for {}, resets at {}", repo, reset_at);
                        Err(FetchError::RateLimited { reset_at })
                    }
                    // A 403 with quota left means access is denied outright
                    None => Err(FetchError::Terminal(format!(
                        "GitHub denied access to {} ({})",
                        repo, status
                    ))),
                }
            }
            s if s.is_server_error() => Err(FetchError::Transient(format!(
                "GitHub API error for {}: {}",
                repo, s
            ))),
            s if s.is_success() => response
                .json::<Release>()
                .await
                .map_err(|e| FetchError::Transient(format!("Malformed release payload: {}", e))),
            s => Err(FetchError::Terminal(format!(
                "Unexpected GitHub API response for {}: {}",
                repo, s
            ))),
        }
    }

    /// Query the authenticated rate-limit quota. Used by the doctor command
    /// as a cheap reachability and credential probe.
    pub async fn rate_limit(&self) -> Result<RateLimitStatus> {
        let url = format!("{}/rate_limit", self.api_url);

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github.v3+json");

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            anyhow::bail!("GitHub rejected the configured token (401)");
        }

        let response = response
            .error_for_status()
            .context("GitHub rate_limit endpoint returned an error")?;

        let parsed: RateLimitResponse = response
            .json()
            .await
            .context("Malformed rate_limit payload")?;

        Ok(parsed.resources.core)
    }
}

/// Core rate-limit quota as reported by /rate_limit
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset: i64,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: RateLimitStatus,
}

/// Work out when a limited caller may try again, from response headers.
///
/// Secondary limits send Retry-After in seconds. Primary quota exhaustion
/// sends x-ratelimit-remaining: 0 plus x-ratelimit-reset as a Unix epoch.
/// A denial with quota still available is not a rate limit at all, so this
/// returns None for it.
fn rate_limit_reset(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    if let Some(seconds) = header_u64(headers, "retry-after") {
        return Some(Utc::now() + chrono::Duration::seconds(seconds as i64));
    }

    let remaining = header_u64(headers, "x-ratelimit-remaining")?;
    if remaining > 0 {
        return None;
    }

    let reset = header_u64(headers, "x-ratelimit-reset")?;
    Utc.timestamp_opt(reset as i64, 0).single()
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(api_url: &str) -> Config {
        let mut config = Config::default();
        config.github.api_url = api_url.to_string();
        config.monitor.request_timeout = 5;
        config
    }

    fn release_json() -> serde_json::Value {
        json!({
            "tag_name": "v1.2.0",
            "name": "Widget 1.2.0",
            "html_url": "https://github.com/acme/widget/releases/tag/v1.2.0",
            "body": "Bug fixes and improvements",
            "published_at": "2024-03-01T12:00:00Z"
        })
    }

    #[test]
    fn test_release_title_falls_back_to_tag() {
        let release: Release = serde_json::from_value(json!({
            "tag_name": "v0.1.0",
            "html_url": "https://github.com/acme/widget/releases/tag/v0.1.0"
        }))
        .unwrap();

        assert_eq!(release.title(), "v0.1.0");
        assert!(release.body.is_none());
        assert!(release.published_at.is_none());
    }

    #[test]
    fn test_release_deserialization() {
        let release: Release = serde_json::from_value(release_json()).unwrap();
        assert_eq!(release.tag_name, "v1.2.0");
        assert_eq!(release.title(), "Widget 1.2.0");
        assert!(release.published_at.is_some());
    }

    #[test]
    fn test_rate_limit_reset_from_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("120"));

        let reset = rate_limit_reset(&headers).unwrap();
        let delta = reset - Utc::now();
        assert!(delta.num_seconds() > 100 && delta.num_seconds() <= 120);
    }

    #[test]
    fn test_rate_limit_reset_from_quota_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1893456000"));

        let reset = rate_limit_reset(&headers).unwrap();
        assert_eq!(reset.timestamp(), 1893456000);
    }

    #[test]
    fn test_rate_limit_reset_none_when_quota_left() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4999"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1893456000"));

        assert!(rate_limit_reset(&headers).is_none());
    }

    #[test]
    fn test_rate_limit_reset_none_without_headers() {
        assert!(rate_limit_reset(&HeaderMap::new()).is_none());
    }

    #[tokio::test]
    async fn test_fetch_latest_release_success() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/widget/releases/latest"))
            .and(header("Accept", "application/vnd.github.v3+json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_json()))
            .expect(1)
            .mount(&server)
            .await;

        let client = GitHubClient::new(&test_config(&server.uri())).unwrap();
        let repo = RepoId::parse("acme/widget").unwrap();

        let release = client.fetch_latest_release(&repo).await.unwrap();
        assert_eq!(release.tag_name, "v1.2.0");
    }

    #[tokio::test]
    async fn test_fetch_sends_bearer_token() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/widget/releases/latest"))
            .and(header("Authorization", "Bearer ghp_testtoken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_json()))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config(&server.uri());
        config.github.token = Some("ghp_testtoken".to_string());

        let client = GitHubClient::new(&config).unwrap();
        let repo = RepoId::parse("acme/widget").unwrap();

        client.fetch_latest_release(&repo).await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_404_is_not_found() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/widget/releases/latest"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = GitHubClient::new(&test_config(&server.uri())).unwrap();
        let repo = RepoId::parse("acme/widget").unwrap();

        let err = client.fetch_latest_release(&repo).await.unwrap_err();
        assert_matches!(err, FetchError::NotFound);
    }

    #[tokio::test]
    async fn test_fetch_403_with_exhausted_quota_is_rate_limited() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/widget/releases/latest"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("x-ratelimit-reset", "1893456000"),
            )
            .mount(&server)
            .await;

        let client = GitHubClient::new(&test_config(&server.uri())).unwrap();
        let repo = RepoId::parse("acme/widget").unwrap();

        let err = client.fetch_latest_release(&repo).await.unwrap_err();
        assert_matches!(err, FetchError::RateLimited { reset_at } => {
            assert_eq!(reset_at.timestamp(), 1893456000);
        });
    }

    #[tokio::test]
    async fn test_fetch_403_without_headers_is_terminal() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/widget/releases/latest"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = GitHubClient::new(&test_config(&server.uri())).unwrap();
        let repo = RepoId::parse("acme/widget").unwrap();

        let err = client.fetch_latest_release(&repo).await.unwrap_err();
        assert_matches!(err, FetchError::Terminal(_));
    }

    #[tokio::test]
    async fn test_fetch_401_is_terminal() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/widget/releases/latest"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = GitHubClient::new(&test_config(&server.uri())).unwrap();
        let repo = RepoId::parse("acme/widget").unwrap();

        let err = client.fetch_latest_release(&repo).await.unwrap_err();
        assert_matches!(err, FetchError::Terminal(_));
    }

    #[tokio::test]
    async fn test_fetch_500_is_transient() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/widget/releases/latest"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = GitHubClient::new(&test_config(&server.uri())).unwrap();
        let repo = RepoId::parse("acme/widget").unwrap();

        let err = client.fetch_latest_release(&repo).await.unwrap_err();
        assert_matches!(err, FetchError::Transient(_));
    }

    #[tokio::test]
    async fn test_fetch_malformed_payload_is_transient() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/widget/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = GitHubClient::new(&test_config(&server.uri())).unwrap();
        let repo = RepoId::parse("acme/widget").unwrap();

        let err = client.fetch_latest_release(&repo).await.unwrap_err();
        assert_matches!(err, FetchError::Transient(_));
    }

    #[tokio::test]
    async fn test_rate_limit_probe() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rate_limit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resources": {
                    "core": { "limit": 5000, "remaining": 4987, "reset": 1893456000 }
                }
            })))
            .mount(&server)
            .await;

        let client = GitHubClient::new(&test_config(&server.uri())).unwrap();
        let status = client.rate_limit().await.unwrap();

        assert_eq!(status.limit, 5000);
        assert_eq!(status.remaining, 4987);
    }
}
