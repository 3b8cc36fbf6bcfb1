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

//! Release catalog identity (owner / repository / host)

use serde::{Deserialize, Serialize};

const DEFAULT_HOST: &str = "github.com";

/// Identifies a release catalog. The host is stored without scheme or
/// trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ReleaseSourceRepr")]
pub struct ReleaseSource {
    pub owner: String,
    pub name: String,
    pub host: String,
}

#[derive(Deserialize)]
struct ReleaseSourceRepr {
    owner: String,
    name: String,
    #[serde(default = "default_host")]
    host: String,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

impl From<ReleaseSourceRepr> for ReleaseSource {
    fn from(repr: ReleaseSourceRepr) -> Self {
        Self::with_host(repr.owner, repr.name, &repr.host)
    }
}

impl ReleaseSource {
    /// Source hosted on github.com
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_host(owner, name, DEFAULT_HOST)
    }

    pub fn with_host(owner: impl Into<String>, name: impl Into<String>, host: &str) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            host: normalize_host(host),
        }
    }

    /// The upstream CLIProxyAPI releases
    pub fn official() -> Self {
        Self::new("router-for-me", "CLIProxyAPI")
    }

    /// Human-facing releases page
    pub fn releases_page_url(&self) -> String {
        format!("https://{}/{}/{}/releases", self.host, self.owner, self.name)
    }

    /// API base URL derived from the host (`https://api.<host>`)
    pub fn api_base_url(&self) -> String {
        format!("https://api.{}", self.host)
    }

    /// `{api_base}/repos/{owner}/{name}/releases`
    pub fn api_releases_url(&self, api_base: &str) -> String {
        format!(
            "{}/repos/{}/{}/releases",
            api_base.trim_end_matches('/'),
            self.owner,
            self.name
        )
    }
}

impl Default for ReleaseSource {
    fn default() -> Self {
        Self::official()
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    host.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_official_source() {
        let source = ReleaseSource::official();
        assert_eq!(source.owner, "router-for-me");
        assert_eq!(source.name, "CLIProxyAPI");
        assert_eq!(source.host, "github.com");
        assert_eq!(
            source.releases_page_url(),
            "https://github.com/router-for-me/CLIProxyAPI/releases"
        );
        assert_eq!(source.api_base_url(), "https://api.github.com");
    }

    #[test]
    fn test_host_normalization() {
        for raw in ["https://ghe.example.com/", "http://ghe.example.com", "ghe.example.com/"] {
            let source = ReleaseSource::with_host("o", "r", raw);
            assert_eq!(source.host, "ghe.example.com");
        }
    }

    #[test]
    fn test_api_releases_url() {
        let source = ReleaseSource::new("o", "r");
        assert_eq!(
            source.api_releases_url("http://127.0.0.1:1234/"),
            "http://127.0.0.1:1234/repos/o/r/releases"
        );
    }

    #[test]
    fn test_deserialize_normalizes_host() {
        let source: ReleaseSource =
            serde_json::from_str(r#"{"owner":"o","name":"r","host":"https://git.example/"}"#)
                .unwrap();
        assert_eq!(source.host, "git.example");

        let source: ReleaseSource = serde_json::from_str(r#"{"owner":"o","name":"r"}"#).unwrap();
        assert_eq!(source.host, "github.com");
    }
}
