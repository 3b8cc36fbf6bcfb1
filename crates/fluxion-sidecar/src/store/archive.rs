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

//! Archive inspection, extraction and payload lookup.
//!
//! Every archive goes through three independent gates: a table-of-contents
//! pass ([`validate`]) before anything is written, extraction into an isolated
//! root ([`extract`]), and a walk of the extracted tree ([`verify_tree`]).

use crate::error::{Result, SidecarError};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use tracing::debug;
use zip::ZipArchive;

const S_IFMT: u32 = 0o170_000;
const S_IFREG: u32 = 0o100_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFLNK: u32 = 0o120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    /// Not an archive; the payload is the executable itself
    Raw,
}

/// Detect the payload format from its leading magic bytes
pub fn detect_format(data: &[u8]) -> ArchiveFormat {
    if data.starts_with(b"PK") {
        ArchiveFormat::Zip
    } else if data.starts_with(&[0x1f, 0x8b]) {
        ArchiveFormat::TarGz
    } else {
        ArchiveFormat::Raw
    }
}

fn corrupt(e: impl std::fmt::Display) -> SidecarError {
    SidecarError::CorruptArchive(e.to_string())
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Reject absolute paths, drive prefixes and `..` segments in an entry name
pub fn check_entry_path(name: &str) -> Result<()> {
    let normalized = name.replace('\\', "/");
    let mut relative = normalized.as_str();
    while let Some(rest) = relative.strip_prefix("./") {
        relative = rest;
    }

    let unsafe_path = normalized.is_empty()
        || relative.starts_with('/')
        || has_drive_prefix(relative)
        || relative.split('/').any(|segment| segment == "..");

    if unsafe_path {
        return Err(SidecarError::UnsafeArchiveEntry(name.to_string()));
    }
    Ok(())
}

/// Scan the archive's entries without extracting anything.
pub fn validate(format: ArchiveFormat, archive_path: &Path) -> Result<()> {
    match format {
        ArchiveFormat::Zip => validate_zip(archive_path),
        ArchiveFormat::TarGz => validate_tar(archive_path),
        ArchiveFormat::Raw => Ok(()),
    }
}

fn validate_tar(archive_path: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive_path)?));
    let mut count = 0usize;

    for entry in archive.entries().map_err(corrupt)? {
        let entry = entry.map_err(corrupt)?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous | EntryType::Directory => {}
            EntryType::XGlobalHeader => continue,
            EntryType::Symlink | EntryType::Link => {
                return Err(SidecarError::SymlinkEntry(name));
            }
            other => {
                return Err(SidecarError::UnsafeArchiveEntry(format!(
                    "{name} (entry type {other:?})"
                )));
            }
        }

        check_entry_path(&name)?;
        count += 1;
    }

    debug!(entries = count, "tar archive validated");
    Ok(())
}

fn validate_zip(archive_path: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(File::open(archive_path)?).map_err(corrupt)?;

    for index in 0..archive.len() {
        let file = archive.by_index_raw(index).map_err(corrupt)?;
        let name = file.name().to_string();

        if let Some(mode) = file.unix_mode() {
            match mode & S_IFMT {
                S_IFLNK => return Err(SidecarError::SymlinkEntry(name)),
                0 | S_IFREG | S_IFDIR => {}
                other => {
                    return Err(SidecarError::UnsafeArchiveEntry(format!(
                        "{name} (mode {other:o})"
                    )));
                }
            }
        }

        check_entry_path(&name)?;
    }

    debug!(entries = archive.len(), "zip archive validated");
    Ok(())
}

/// Extract a validated archive below `root`.
pub fn extract(format: ArchiveFormat, archive_path: &Path, root: &Path) -> Result<()> {
    match format {
        ArchiveFormat::Zip => extract_zip(archive_path, root),
        ArchiveFormat::TarGz => extract_tar(archive_path, root),
        ArchiveFormat::Raw => Ok(()),
    }
}

fn extract_tar(archive_path: &Path, root: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive_path)?));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        if entry.header().entry_type() == EntryType::XGlobalHeader {
            continue;
        }

        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if !entry.unpack_in(root).map_err(corrupt)? {
            return Err(SidecarError::UnsafeArchiveEntry(name));
        }
    }
    Ok(())
}

fn extract_zip(archive_path: &Path, root: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(File::open(archive_path)?).map_err(corrupt)?;

    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(corrupt)?;
        let Some(out_path) = file.enclosed_name().map(|p| root.join(p)) else {
            return Err(SidecarError::UnsafeArchiveEntry(file.name().to_string()));
        };

        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out_file = File::create(&out_path)?;
        io::copy(&mut file, &mut out_file).map_err(corrupt)?;

        if let Some(mode) = file.unix_mode() {
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))?;
        }
    }
    Ok(())
}

/// Walk the extracted tree: every path must stay lexically under `root`
/// and nothing may be a symlink or special file.
pub fn verify_tree(root: &Path) -> Result<()> {
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let display = path.display().to_string();

            let relative = path
                .strip_prefix(root)
                .map_err(|_| SidecarError::UnsafeArchiveEntry(display.clone()))?;
            if !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            {
                return Err(SidecarError::UnsafeArchiveEntry(display));
            }

            let metadata = fs::symlink_metadata(&path)?;
            let file_type = metadata.file_type();
            if file_type.is_symlink() {
                return Err(SidecarError::SymlinkEntry(relative.display().to_string()));
            }
            if file_type.is_dir() {
                pending.push(path);
            } else if !file_type.is_file() {
                return Err(SidecarError::UnsafeArchiveEntry(
                    relative.display().to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || name == "__MACOSX"
}

fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_name().to_str().is_none_or(is_ignored) {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Find the payload executable in an extracted tree.
///
/// A file named `binary_name` wins outright, whatever its mode. Otherwise
/// exactly one executable file must exist.
pub fn locate_binary(root: &Path, binary_name: &str) -> Result<PathBuf> {
    let files = collect_files(root)?;

    // Shallowest canonical match first
    if let Some(canonical) = files
        .iter()
        .filter(|p| p.file_name().is_some_and(|n| n == binary_name))
        .min_by_key(|p| p.components().count())
    {
        return Ok(canonical.clone());
    }

    let mut executables: Vec<&PathBuf> = files.iter().filter(|p| is_executable(p)).collect();
    match executables.len() {
        0 => Err(SidecarError::BinaryNotFound),
        1 => Ok(executables.remove(0).clone()),
        _ => Err(SidecarError::AmbiguousBinary {
            candidates: executables
                .iter()
                .map(|p| p.strip_prefix(root).unwrap_or(p).display().to_string())
                .collect(),
        }),
    }
}
