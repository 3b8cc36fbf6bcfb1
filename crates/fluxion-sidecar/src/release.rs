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

//! Release metadata and platform-aware asset selection

use serde::{Deserialize, Serialize};
use std::fmt;

/// GitHub release asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    /// Asset name (e.g., "CLIProxyAPI_6.1.2_darwin_arm64.tar.gz")
    pub name: String,
    /// Download URL
    pub browser_download_url: String,
    /// Asset size in bytes
    #[serde(default)]
    pub size: u64,
}

/// GitHub release information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMetadata {
    /// Tag name (e.g., "v6.1.2")
    pub tag_name: String,
    /// Release name
    #[serde(default)]
    pub name: Option<String>,
    /// Release notes, may embed `sha256:<hex>`
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseMetadata {
    pub fn from_tag(tag: impl Into<String>) -> Self {
        Self {
            tag_name: tag.into(),
            name: None,
            body: None,
            published_at: None,
            prerelease: false,
            assets: Vec::new(),
        }
    }

    /// Version without the 'v' prefix
    pub fn version(&self) -> &str {
        self.tag_name.strip_prefix('v').unwrap_or(&self.tag_name)
    }
}

/// Snapshot of a running download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub bytes_written: u64,
    /// Zero when the server did not announce a size
    pub total_bytes: u64,
}

impl DownloadProgress {
    pub fn fraction_completed(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let fraction = self.bytes_written as f64 / self.total_bytes as f64;
        fraction.min(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    MacOs,
    Linux,
    Windows,
}

impl Os {
    const ALL: [Self; 3] = [Self::MacOs, Self::Linux, Self::Windows];

    /// Name fragments that mark an asset as built for this OS
    fn markers(self) -> &'static [&'static str] {
        match self {
            Self::MacOs => &["macos", "darwin", "mac", "osx"],
            Self::Linux => &["linux"],
            Self::Windows => &["windows", "win32", "win64"],
        }
    }

    /// Fragments strong enough to exclude an asset when they name another OS.
    /// Looser than [`Os::markers`] would reject names such as "machine".
    fn exclusion_markers(self) -> &'static [&'static str] {
        match self {
            Self::MacOs => &["macos", "darwin", "osx"],
            Self::Linux | Self::Windows => self.markers(),
        }
    }

    /// Canonical marker used when naming assets
    pub fn primary_marker(self) -> &'static str {
        self.markers()[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Aarch64,
    X86_64,
}

impl Arch {
    fn markers(self) -> &'static [&'static str] {
        match self {
            Self::Aarch64 => &["arm64", "aarch64"],
            Self::X86_64 => &["x86_64", "amd64", "x64"],
        }
    }

    fn other(self) -> Self {
        match self {
            Self::Aarch64 => Self::X86_64,
            Self::X86_64 => Self::Aarch64,
        }
    }

    pub fn primary_marker(self) -> &'static str {
        self.markers()[0]
    }
}

/// Target platform used to score release assets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: Os,
    /// `None` on architectures no release ships for
    pub arch: Option<Arch>,
}

impl Platform {
    pub fn new(os: Os, arch: Arch) -> Self {
        Self {
            os,
            arch: Some(arch),
        }
    }

    /// Platform of the running process
    pub fn current() -> Self {
        let os = if cfg!(target_os = "macos") {
            Os::MacOs
        } else if cfg!(target_os = "windows") {
            Os::Windows
        } else {
            Os::Linux
        };
        let arch = if cfg!(target_arch = "aarch64") {
            Some(Arch::Aarch64)
        } else if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else {
            None
        };
        Self { os, arch }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arch = self.arch.map_or("unknown", Arch::primary_marker);
        write!(f, "{}/{}", self.os.primary_marker(), arch)
    }
}

fn is_supported_asset(name: &str, platform: Platform) -> bool {
    let mut competing = Os::ALL
        .into_iter()
        .filter(|os| *os != platform.os)
        .flat_map(Os::exclusion_markers);
    if competing.any(|marker| name.contains(marker)) {
        return false;
    }

    // Raw binaries are often uploaded without any extension
    name.ends_with(".zip")
        || name.ends_with(".tar.gz")
        || name.ends_with(".tgz")
        || !name.contains('.')
}

fn asset_score(name: &str, platform: Platform) -> i32 {
    let mut score = 0;

    if platform.os.markers().iter().any(|m| name.contains(m)) {
        score += 100;
    }
    if name.contains("universal") {
        score += 60;
    }
    if let Some(arch) = platform.arch {
        if arch.markers().iter().any(|m| name.contains(m)) {
            score += 50;
        }
        if arch.other().markers().iter().any(|m| name.contains(m)) {
            score -= 40;
        }
    }

    if name.ends_with(".zip") {
        score += 10;
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        score += 5;
    }

    score
}

/// Pick the best installation asset for `platform`.
///
/// Names carrying another OS marker or an unsupported extension are dropped;
/// the rest are scored and the first highest-scoring asset wins.
pub fn select_asset(release: &ReleaseMetadata, platform: Platform) -> Option<&ReleaseAsset> {
    let mut best: Option<(&ReleaseAsset, i32)> = None;

    for asset in &release.assets {
        let name = asset.name.to_lowercase();
        if !is_supported_asset(&name, platform) {
            continue;
        }
        let score = asset_score(&name, platform);
        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((asset, score));
        }
    }

    best.map(|(asset, _)| asset)
}
