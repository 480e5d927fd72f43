// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release hosting lookups.
//!
//! Upstream projects publish prebuilt packages as release assets. Only the
//! latest release of a project is ever looked at, and only its asset names
//! and download URLs matter.

use serde::Deserialize;
use std::cell::OnceCell;
use tracing::{debug, instrument};

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("nixboot/", env!("CARGO_PKG_VERSION"));

/// Published release of a project.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// Downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

/// Layer of indirection for release lookups and downloads.
pub trait ReleaseSource {
    /// Lookup latest release of `owner/repo`.
    ///
    /// # Errors
    ///
    /// - Return [`ReleaseError`] if lookup fails.
    fn latest(&self, repo: &str) -> Result<Release>;

    /// Download file at url into memory.
    ///
    /// # Errors
    ///
    /// - Return [`ReleaseError`] if download fails.
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Release lookups through the GitHub REST API.
///
/// The HTTP client is only set up on first request, so runs that never
/// look up a release never depend on it.
#[derive(Debug, Clone)]
pub struct GithubReleases {
    client: OnceCell<reqwest::blocking::Client>,
    api_root: String,
}

impl GithubReleases {
    /// Construct new GitHub release source.
    pub fn new() -> Self {
        Self {
            client: OnceCell::new(),
            api_root: GITHUB_API.to_string(),
        }
    }

    /// HTTP client shared by every request.
    ///
    /// # Errors
    ///
    /// - Return [`ReleaseError::Http`] if HTTP client cannot be set up.
    pub fn client(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }

        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .build()?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl Default for GithubReleases {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseSource for GithubReleases {
    #[instrument(skip(self), level = "debug")]
    fn latest(&self, repo: &str) -> Result<Release> {
        let url = format!("{}/repos/{repo}/releases/latest", self.api_root);
        let response = self
            .client()?
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ReleaseError::Status {
                url,
                status: status.to_string(),
                body,
            });
        }

        let release: Release = response.json()?;
        debug!("latest release of {repo} is {}", release.tag_name);

        Ok(release)
    }

    #[instrument(skip(self), level = "debug")]
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client()?.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ReleaseError::Status {
                url: url.to_string(),
                status: status.to_string(),
                body,
            });
        }

        Ok(response.bytes()?.to_vec())
    }
}

/// Release lookup error types.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// Server answered with an error status.
    #[error("request to {url} failed: HTTP {status} {body}")]
    Status {
        url: String,
        status: String,
        body: String,
    },

    /// Request could not be performed.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Friendly result alias :3
pub type Result<T, E = ReleaseError> = std::result::Result<T, E>;
