//! Repository identifiers
//!
//! Tracked repositories are addressed by their GitHub `owner/name` string.
//! The configuration stores them as plain strings; [`RepoId`] is the validated
//! form the rest of the crate works with.

use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;

/// A validated `owner/name` repository identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoId {
    full: String,
}

impl RepoId {
    /// Parse and validate an `owner/name` string.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();

        let (owner, name) = trimmed.split_once('/').ok_or_else(|| {
            anyhow!(
                "Invalid repository id '{}': expected 'owner/name'",
                input
            )
        })?;

        if !is_valid_owner(owner) {
            return Err(anyhow!(
                "Invalid repository id '{}': bad owner segment '{}'",
                input,
                owner
            ));
        }

        if !is_valid_name(name) {
            return Err(anyhow!(
                "Invalid repository id '{}': bad name segment '{}'",
                input,
                name
            ));
        }

        Ok(Self {
            full: format!("{}/{}", owner, name),
        })
    }

    /// The full `owner/name` form.
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Owner (user or organization) segment.
    pub fn owner(&self) -> &str {
        self.full.split('/').next().unwrap_or(&self.full)
    }

    /// Repository name segment.
    pub fn name(&self) -> &str {
        self.full.split('/').nth(1).unwrap_or(&self.full)
    }

    /// Browser URL for the repository.
    pub fn url(&self) -> String {
        format!("https://github.com/{}", self.full)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for RepoId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// GitHub user and organization names: alphanumerics and hyphens, starting
/// with an alphanumeric.
fn is_valid_owner(owner: &str) -> bool {
    regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*$")
        .map(|re| re.is_match(owner))
        .unwrap_or(false)
}

/// Repository names additionally allow dots and underscores (".github" is a
/// legal repository name).
fn is_valid_name(name: &str) -> bool {
    regex::Regex::new(r"^[A-Za-z0-9._][A-Za-z0-9._-]*$")
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_id() {
        let repo = RepoId::parse("acme/widget").unwrap();
        assert_eq!(repo.as_str(), "acme/widget");
        assert_eq!(repo.owner(), "acme");
        assert_eq!(repo.name(), "widget");
        assert_eq!(repo.url(), "https://github.com/acme/widget");
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let repo = RepoId::parse("  acme/widget \n").unwrap();
        assert_eq!(repo.as_str(), "acme/widget");
    }

    #[test]
    fn test_parse_allows_dots_and_underscores_in_name() {
        assert!(RepoId::parse("acme/.github").is_ok());
        assert!(RepoId::parse("acme/my_tool.rs").is_ok());
        assert!(RepoId::parse("rust-lang/rust").is_ok());
    }

    #[test]
    fn test_parse_rejects_missing_slash() {
        assert!(RepoId::parse("acme").is_err());
        assert!(RepoId::parse("").is_err());
    }

    #[test]
    fn test_parse_rejects_extra_segments() {
        assert!(RepoId::parse("acme/widget/extra").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_segments() {
        assert!(RepoId::parse("/widget").is_err());
        assert!(RepoId::parse("acme/").is_err());
    }

    #[test]
    fn test_parse_rejects_underscore_in_owner() {
        assert!(RepoId::parse("bad_owner/widget").is_err());
    }

    #[test]
    fn test_from_str_round_trip() {
        let repo: RepoId = "acme/widget".parse().unwrap();
        assert_eq!(repo.to_string(), "acme/widget");
    }
}
