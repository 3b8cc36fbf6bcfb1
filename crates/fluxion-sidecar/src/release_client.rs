// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Release catalog client (GitHub-compatible releases API)

use crate::error::{Result, SidecarError};
use crate::release::{DownloadProgress, Platform, ReleaseAsset, ReleaseMetadata, select_asset};
use crate::release_source::ReleaseSource;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("fluxion-sidecar/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const API_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
/// Upper bound for pre-allocating the download buffer from announced sizes
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Client for one release catalog
#[derive(Debug, Clone)]
pub struct ReleaseClient {
    client: reqwest::Client,
    source: ReleaseSource,
    api_base: String,
    platform: Platform,
    token: Option<String>,
}

impl ReleaseClient {
    pub fn new(source: ReleaseSource) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SidecarError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: source.api_base_url(),
            source,
            platform: Platform::current(),
            token: None,
        })
    }

    /// Override the API base URL (mirrors, tests)
    pub fn with_api_base_url(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Set authentication token for private repos
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Score assets for another platform than the running one
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn source(&self) -> &ReleaseSource {
        &self.source
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    fn releases_url(&self) -> String {
        self.source.api_releases_url(&self.api_base)
    }

    /// Get the latest release
    pub async fn fetch_latest(&self) -> Result<ReleaseMetadata> {
        let url = format!("{}/latest", self.releases_url());
        self.get_json(&url, &[]).await
    }

    /// Get one page of releases, newest first
    pub async fn fetch_page(&self, page: u32, per_page: u32) -> Result<Vec<ReleaseMetadata>> {
        let url = self.releases_url();
        let query = [("page", page.to_string()), ("per_page", per_page.to_string())];
        self.get_json(&url, &query).await
    }

    /// Get a specific release by tag
    pub async fn fetch_by_tag(&self, tag: &str) -> Result<ReleaseMetadata> {
        let url = format!("{}/tags/{tag}", self.releases_url());
        self.get_json(&url, &[]).await
    }

    /// Best asset of `release` for this client's platform
    pub fn select_asset<'a>(&self, release: &'a ReleaseMetadata) -> Option<&'a ReleaseAsset> {
        select_asset(release, self.platform)
    }

    /// Download an asset into memory, reporting progress after every chunk
    pub async fn download<F>(&self, asset: &ReleaseAsset, mut on_progress: F) -> Result<Vec<u8>>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        debug!(asset = %asset.name, url = %asset.browser_download_url, "Downloading asset");

        let mut request = self
            .client
            .get(&asset.browser_download_url)
            .header(ACCEPT, "application/octet-stream")
            .timeout(DOWNLOAD_TIMEOUT);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SidecarError::Network(format!("Download request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SidecarError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let total_bytes = response
            .content_length()
            .filter(|len| *len > 0)
            .unwrap_or(asset.size);
        let capacity = usize::try_from(total_bytes.min(MAX_PREALLOC)).unwrap_or(0);
        let mut data = Vec::with_capacity(capacity);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| SidecarError::Network(format!("Download interrupted: {e}")))?;
            data.extend_from_slice(&chunk);
            on_progress(DownloadProgress {
                bytes_written: u64::try_from(data.len()).unwrap_or(u64::MAX),
                total_bytes,
            });
        }

        debug!(asset = %asset.name, bytes = data.len(), "Download complete");
        Ok(data)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        debug!("GET {url}");

        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "application/vnd.github+json")
            .timeout(API_TIMEOUT);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SidecarError::Network(format!("Request failed: {e}")))?;

        if let Some(remaining) = response.headers().get("x-ratelimit-remaining")
            && let Ok(remaining_str) = remaining.to_str()
            && let Ok(remaining_int) = remaining_str.parse::<u32>()
            && remaining_int < 10
        {
            warn!("Release API rate limit low: {remaining_int} remaining");
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SidecarError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SidecarError::Network(format!("Failed to read response: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| SidecarError::Decoding(e.to_string()))
    }
}
