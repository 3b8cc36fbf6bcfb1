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

//! Configuration module for the sidecar host

use crate::error::{Result, SidecarError};
use crate::log_buffer::DEFAULT_LOG_CAPACITY;
use crate::release_source::ReleaseSource;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_BINARY_NAME: &str = "CLIProxyAPI";

fn default_true() -> bool {
    true
}

fn default_3600() -> u64 {
    3600
}

fn default_8317() -> u16 {
    8317
}

fn default_3() -> usize {
    3
}

fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

fn default_binary_name() -> String {
    DEFAULT_BINARY_NAME.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarConfig {
    /// Port passed to the managed binary as `--port`
    #[serde(default = "default_8317")]
    pub port: u16,

    /// Config file passed as `--config` (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,

    /// Release catalog to install from
    #[serde(default)]
    pub release_source: ReleaseSource,

    /// Custom API base URL for testing (overrides the catalog's API host)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,

    /// Token for private catalogs (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,

    /// Version store location, defaults to the platform data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,

    /// File name of the managed executable inside each version directory
    #[serde(default = "default_binary_name")]
    pub binary_name: String,

    /// Versions kept by cleanup besides the active one
    #[serde(default = "default_3")]
    pub keep_latest: usize,

    /// Captured output lines kept in memory
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Install new releases automatically while running
    #[serde(default)]
    pub auto_update: bool,

    /// How often to check for updates (seconds)
    #[serde(default = "default_3600")]
    pub check_interval_secs: u64,

    /// Restart a running process after a new version is activated
    #[serde(default = "default_true")]
    pub restart_on_update: bool,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            port: 8317,
            config_path: None,
            release_source: ReleaseSource::default(),
            api_base_url: None,
            github_token: None,
            base_dir: None,
            binary_name: default_binary_name(),
            keep_latest: 3,
            log_capacity: DEFAULT_LOG_CAPACITY,
            auto_update: false,
            check_interval_secs: 3600,
            restart_on_update: true,
        }
    }
}

impl SidecarConfig {
    /// Explicit `base_dir`, or `<data dir>/fluxion/sidecar`
    pub fn resolved_base_dir(&self) -> Result<PathBuf> {
        if let Some(ref base_dir) = self.base_dir {
            return Ok(base_dir.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join("fluxion").join("sidecar"))
            .ok_or_else(|| SidecarError::Config("No platform data directory available".into()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(SidecarError::InvalidPort(0));
        }
        let name = self.binary_name.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(SidecarError::Config(format!("Invalid binary name: {name:?}")));
        }
        if self.check_interval_secs == 0 {
            return Err(SidecarError::Config(
                "check_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Read the config at `path`, creating it with defaults when missing
pub fn load_config(path: &Path) -> Result<SidecarConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: SidecarConfig = serde_json::from_str(&content)
            .map_err(|e| SidecarError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    } else {
        // Create with defaults
        let config = SidecarConfig::default();
        save_config(path, &config)?;
        Ok(config)
    }
}

pub fn save_config(path: &Path, config: &SidecarConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(config)?;

    // Atomic write
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;

    Ok(())
}
