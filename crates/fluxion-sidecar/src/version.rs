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

//! Version normalisation and comparison
//!
//! Normalised versions name installed directories (`v<version>`), so
//! [`normalize_version`] is the only gate between user or network input and the
//! filesystem.

use crate::error::{Result, SidecarError};

/// Prefix of every installed version directory
pub const VERSION_DIR_PREFIX: char = 'v';

/// Strip an optional leading `v` and validate the remaining characters.
///
/// Only `[A-Za-z0-9._-]` is allowed; path separators and `..` are rejected.
pub fn normalize_version(value: &str) -> Result<String> {
    let trimmed = value.trim();
    let version = trimmed.strip_prefix(VERSION_DIR_PREFIX).unwrap_or(trimmed);

    if version.is_empty()
        || version.contains('/')
        || version.contains('\\')
        || version.contains("..")
    {
        return Err(SidecarError::InvalidVersion(value.to_string()));
    }

    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    if !version.chars().all(allowed) {
        return Err(SidecarError::InvalidVersion(value.to_string()));
    }

    Ok(version.to_string())
}

/// Directory name for a normalised version
pub fn version_dir_name(version: &str) -> String {
    format!("{VERSION_DIR_PREFIX}{version}")
}

/// Extract the version from a release tag (strips leading "v")
pub fn version_from_tag(tag: &str) -> &str {
    tag.trim_start_matches('v').trim_start_matches('V')
}

/// Parse semver-like version strings (e.g., "6.1.2", "v6.1.2")
pub fn parse_version(s: &str) -> Result<(u32, u32, u32)> {
    let s = version_from_tag(s.trim());
    let parts: Vec<&str> = s.split('.').collect();

    let [major, minor, patch] = parts.as_slice() else {
        return Err(SidecarError::InvalidVersion(format!("{s}: expected X.Y.Z")));
    };

    let parse = |part: &str| {
        part.parse::<u32>()
            .map_err(|_| SidecarError::InvalidVersion(format!("{s}: bad component {part}")))
    };

    Ok((parse(*major)?, parse(*minor)?, parse(*patch)?))
}

/// Returns true if `remote` is newer than `local`
pub fn is_newer(local: &str, remote: &str) -> Result<bool> {
    Ok(parse_version(remote)? > parse_version(local)?)
}

/// Whether `remote` should be offered as an update over `local`.
///
/// Falls back to plain inequality when either side is not `X.Y.Z`.
pub fn is_update(local: Option<&str>, remote: &str) -> bool {
    let Some(local) = local else {
        return true;
    };
    match is_newer(local, remote) {
        Ok(newer) => newer,
        Err(_) => version_from_tag(local) != version_from_tag(remote),
    }
}
