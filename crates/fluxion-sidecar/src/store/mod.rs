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

//! Versioned install directory for the managed binary.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/v<version>/<binary_name>
//! <base>/current -> v<version>
//! ```
//!
//! Directory and pointer names are the whole persisted state. All mutating
//! operations take the store's writer lock for their full read-then-act
//! sequence; reads (`list_installed`, `current_version`) never block.

pub mod archive;

use crate::checksum;
use crate::error::{Result, SidecarError};
use crate::version::{VERSION_DIR_PREFIX, normalize_version, version_dir_name};
use archive::ArchiveFormat;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the active-version pointer
pub const CURRENT_LINK: &str = "current";

const BINARY_MODE: u32 = 0o755;

/// One `v<version>` directory in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledVersion {
    /// Normalised version (without the directory prefix)
    pub version: String,
    pub path: PathBuf,
    /// Directory creation time, or modification time where unsupported
    pub installed_at: Option<DateTime<Utc>>,
}

/// Outcome of [`VersionStore::cleanup`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// Versions whose removal failed; the reason is logged
    pub failed: Vec<String>,
}

#[derive(Debug)]
pub struct VersionStore {
    base_dir: PathBuf,
    binary_name: String,
    write_lock: Mutex<()>,
}

fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.is_dir())
}

impl VersionStore {
    pub fn new(base_dir: impl Into<PathBuf>, binary_name: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            binary_name: binary_name.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    /// Where `version`'s binary lives once installed
    pub fn binary_path(&self, version: &str) -> Result<PathBuf> {
        let version = normalize_version(version)?;
        Ok(self
            .base_dir
            .join(version_dir_name(&version))
            .join(&self.binary_name))
    }

    /// Binary of the active version, if it is an executable file
    pub fn current_binary_path(&self) -> Option<PathBuf> {
        let version = self.current_version()?;
        let path = self.binary_path(&version).ok()?;
        let metadata = fs::metadata(&path).ok()?;
        (metadata.is_file() && metadata.permissions().mode() & 0o111 != 0).then_some(path)
    }

    /// Verify, unpack and store a payload as `v<version>/<binary_name>`.
    ///
    /// `data` may be a zip archive, a gzip tarball or the raw executable.
    /// A non-empty `expected_checksum` is checked before anything touches
    /// the filesystem.
    pub fn install(
        &self,
        version: &str,
        data: &[u8],
        expected_checksum: Option<&str>,
    ) -> Result<InstalledVersion> {
        let version = normalize_version(version)?;

        if let Some(expected) = expected_checksum.map(checksum::normalize_expected)
            && !expected.is_empty()
            && !checksum::verify(data, &expected)
        {
            return Err(SidecarError::ChecksumMismatch {
                expected,
                actual: checksum::sha256_hex(data),
            });
        }

        let _guard = self.write_lock.lock();

        let staging = tempfile::Builder::new()
            .prefix("fluxion-sidecar-staging-")
            .tempdir()?;
        let source = self.stage_payload(data, staging.path())?;
        debug!(version = %version, source = %source.display(), "Payload staged");

        let binary = self.place_binary(&version, &source)?;
        info!(version = %version, path = %binary.display(), "Installed version");

        let path = self.base_dir.join(version_dir_name(&version));
        let installed_at = fs::metadata(&path)
            .ok()
            .and_then(|m| m.created().or_else(|_| m.modified()).ok())
            .map(DateTime::<Utc>::from);

        Ok(InstalledVersion {
            version,
            path,
            installed_at,
        })
    }

    /// Unpack `data` inside `staging` and return the resolved executable.
    fn stage_payload(&self, data: &[u8], staging: &Path) -> Result<PathBuf> {
        let format = archive::detect_format(data);

        if format == ArchiveFormat::Raw {
            if data.is_empty() {
                return Err(SidecarError::UnsupportedArchive("empty payload".to_string()));
            }
            let path = staging.join(&self.binary_name);
            fs::write(&path, data)?;
            return Ok(path);
        }

        let archive_path = staging.join("payload");
        fs::write(&archive_path, data)?;
        archive::validate(format, &archive_path)?;

        let root = staging.join("extracted");
        fs::create_dir(&root)?;
        archive::extract(format, &archive_path, &root)?;
        archive::verify_tree(&root)?;

        archive::locate_binary(&root, &self.binary_name)
    }

    /// Copy the staged binary into its version directory.
    ///
    /// A version directory created here is removed again on failure.
    fn place_binary(&self, version: &str, source: &Path) -> Result<PathBuf> {
        fs::create_dir_all(&self.base_dir)?;

        let version_dir = self.base_dir.join(version_dir_name(version));
        let created = match fs::symlink_metadata(&version_dir) {
            Ok(metadata) if metadata.is_dir() => false,
            Ok(_) => {
                return Err(SidecarError::Io(io::Error::other(format!(
                    "{} exists and is not a directory",
                    version_dir.display()
                ))));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&version_dir)?;
                true
            }
            Err(e) => return Err(e.into()),
        };

        let result = self.copy_binary(source, &version_dir);
        if result.is_err()
            && created
            && let Err(e) = fs::remove_dir_all(&version_dir)
        {
            warn!(path = %version_dir.display(), "Failed to remove partial install: {e}");
        }
        result
    }

    fn copy_binary(&self, source: &Path, version_dir: &Path) -> Result<PathBuf> {
        let target = version_dir.join(&self.binary_name);
        let partial = version_dir.join(format!(".{}.partial", self.binary_name));

        let copied = fs::copy(source, &partial)
            .and_then(|_| fs::set_permissions(&partial, fs::Permissions::from_mode(BINARY_MODE)))
            .and_then(|()| fs::rename(&partial, &target));
        if let Err(e) = copied {
            let _ = fs::remove_file(&partial);
            return Err(e.into());
        }

        sign_adhoc(&target);
        Ok(target)
    }

    /// Point `current` at an installed version.
    ///
    /// The new link is created under a temporary name and renamed over the
    /// old pointer, so `current` is never missing.
    pub fn activate(&self, version: &str) -> Result<()> {
        let version = normalize_version(version)?;
        let _guard = self.write_lock.lock();

        let dir_name = version_dir_name(&version);
        if !is_real_dir(&self.base_dir.join(&dir_name)) {
            return Err(SidecarError::VersionNotInstalled(version));
        }

        let pointer = self.base_dir.join(CURRENT_LINK);
        let staged = self
            .base_dir
            .join(format!(".{CURRENT_LINK}.{}.tmp", std::process::id()));
        let _ = fs::remove_file(&staged);

        std::os::unix::fs::symlink(&dir_name, &staged)?;
        if let Err(e) = fs::rename(&staged, &pointer) {
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }

        info!(version = %version, "Activated version");
        Ok(())
    }

    /// Remove an installed version other than the active one
    pub fn delete(&self, version: &str) -> Result<()> {
        let version = normalize_version(version)?;
        let _guard = self.write_lock.lock();

        if self.current_version().as_deref() == Some(version.as_str()) {
            return Err(SidecarError::CannotDeleteCurrent(version));
        }

        let version_dir = self.base_dir.join(version_dir_name(&version));
        if !is_real_dir(&version_dir) {
            return Err(SidecarError::VersionNotInstalled(version));
        }

        fs::remove_dir_all(&version_dir)?;
        info!(version = %version, "Deleted version");
        Ok(())
    }

    /// Installed versions, newest first.
    ///
    /// A missing base directory yields an empty list.
    pub fn list_installed(&self) -> Result<Vec<InstalledVersion>> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name == CURRENT_LINK {
                continue;
            }
            let Some(version) = parse_dir_name(&name) else {
                continue;
            };
            // DirEntry::file_type does not follow symlinks
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let installed_at = entry
                .metadata()
                .ok()
                .and_then(|m| m.created().or_else(|_| m.modified()).ok())
                .map(DateTime::<Utc>::from);

            versions.push(InstalledVersion {
                version,
                path: entry.path(),
                installed_at,
            });
        }

        sort_newest_first(&mut versions);
        Ok(versions)
    }

    /// Version the `current` pointer designates.
    ///
    /// Absent, dangling or malformed pointers all read as `None`.
    pub fn current_version(&self) -> Option<String> {
        let target = fs::read_link(self.base_dir.join(CURRENT_LINK)).ok()?;
        let version = parse_dir_name(target.file_name()?.to_str()?)?;

        let resolved = self.base_dir.join(&target);
        let parent = fs::canonicalize(resolved.parent()?).ok()?;
        if parent != fs::canonicalize(&self.base_dir).ok()? {
            return None;
        }

        is_real_dir(&resolved).then_some(version)
    }

    /// Delete every version outside {active} ∪ {`keep_latest` newest}.
    ///
    /// Best effort: failures are logged and reported, never raised.
    pub fn cleanup(&self, keep_latest: usize) -> CleanupReport {
        let _guard = self.write_lock.lock();
        let mut report = CleanupReport::default();

        let installed = match self.list_installed() {
            Ok(installed) => installed,
            Err(e) => {
                warn!("Cleanup skipped, cannot list versions: {e}");
                return report;
            }
        };

        let current = self.current_version();
        let keep: HashSet<&str> = installed
            .iter()
            .take(keep_latest)
            .map(|v| v.version.as_str())
            .chain(current.as_deref())
            .collect();

        for entry in installed.iter().filter(|v| !keep.contains(v.version.as_str())) {
            match fs::remove_dir_all(&entry.path) {
                Ok(()) => {
                    info!(version = %entry.version, "Removed old version");
                    report.removed.push(entry.version.clone());
                }
                Err(e) => {
                    warn!(version = %entry.version, "Failed to remove old version: {e}");
                    report.failed.push(entry.version.clone());
                }
            }
        }

        report
    }
}

/// `v1.2.3` -> `1.2.3`; anything that does not round-trip is not ours
fn parse_dir_name(name: &str) -> Option<String> {
    let raw = name.strip_prefix(VERSION_DIR_PREFIX)?;
    let version = normalize_version(raw).ok()?;
    (version == raw).then_some(version)
}

/// Newest install time first; equal or unknown times fall back to the
/// version string, descending.
fn sort_newest_first(versions: &mut [InstalledVersion]) {
    versions.sort_by(|a, b| match (a.installed_at, b.installed_at) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| b.version.cmp(&a.version)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.version.cmp(&a.version),
    });
}

#[cfg(target_os = "macos")]
fn sign_adhoc(path: &Path) {
    let output = std::process::Command::new("codesign")
        .args(["--force", "--sign", "-"])
        .arg(path)
        .output();

    match output {
        Ok(output) if output.status.success() => {
            debug!(path = %path.display(), "Ad-hoc signed binary");
        }
        Ok(output) => {
            let err = SidecarError::CommandFailed {
                tool: "codesign".to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            };
            warn!(path = %path.display(), "Ad-hoc signing failed: {err}");
        }
        Err(e) => warn!(path = %path.display(), "Could not run codesign: {e}"),
    }
}

#[cfg(not(target_os = "macos"))]
fn sign_adhoc(_path: &Path) {}
