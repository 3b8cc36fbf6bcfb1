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

//! Error types for the sidecar crate

use thiserror::Error;

/// Coarse classification of [`SidecarError`], used by callers that only care
/// about the category of a failure (UI banners, exit codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    IntegrityFailure,
    UnsafeArchive,
    FormatUnsupported,
    BinaryResolution,
    StateConflict,
    ToolFailure,
    Network,
    Http,
    Decoding,
    Io,
}

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("invalid version: {0:?}")]
    InvalidVersion(String),

    #[error("invalid port: {0}")]
    InvalidPort(u32),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("archive contains unsafe entry: {0}")]
    UnsafeArchiveEntry(String),

    #[error("archive contains symbolic link: {0}")]
    SymlinkEntry(String),

    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("no executable found in archive")]
    BinaryNotFound,

    #[error("multiple executables found, cannot pick one: {}", candidates.join(", "))]
    AmbiguousBinary { candidates: Vec<String> },

    #[error("version not installed: {0}")]
    VersionNotInstalled(String),

    #[error("cannot delete the active version: {0}")]
    CannotDeleteCurrent(String),

    #[error("{tool} exited with {exit_code}: {stderr}")]
    CommandFailed {
        tool: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("release API returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to decode release API response: {0}")]
    Decoding(String),

    #[error("no release asset suitable for {0}")]
    NoSuitableAsset(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SidecarError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidVersion(_) | Self::InvalidPort(_) | Self::Config(_) => {
                ErrorKind::InvalidInput
            }
            Self::ChecksumMismatch { .. } => ErrorKind::IntegrityFailure,
            Self::UnsafeArchiveEntry(_) | Self::SymlinkEntry(_) => ErrorKind::UnsafeArchive,
            Self::UnsupportedArchive(_) | Self::CorruptArchive(_) | Self::NoSuitableAsset(_) => {
                ErrorKind::FormatUnsupported
            }
            Self::BinaryNotFound | Self::AmbiguousBinary { .. } => ErrorKind::BinaryResolution,
            Self::VersionNotInstalled(_) | Self::CannotDeleteCurrent(_) => {
                ErrorKind::StateConflict
            }
            Self::CommandFailed { .. } => ErrorKind::ToolFailure,
            Self::Network(_) => ErrorKind::Network,
            Self::Http { .. } => ErrorKind::Http,
            Self::Decoding(_) => ErrorKind::Decoding,
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, SidecarError>;
