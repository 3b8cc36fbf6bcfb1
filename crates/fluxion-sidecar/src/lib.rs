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

//! FluxION Sidecar - release manager and supervisor for an external proxy binary
//!
//! Discovers releases of the managed binary, installs them into a versioned
//! store with archive safety checks, switches the active version atomically
//! and runs the active binary as a supervised child process.

pub mod checksum;
pub mod config;
pub mod error;
pub mod log_buffer;
pub mod orchestrator;
pub mod release;
pub mod release_client;
pub mod release_source;
pub mod store;
pub mod supervisor;
pub mod version;

pub use config::{SidecarConfig, load_config, save_config};
pub use error::{ErrorKind, Result, SidecarError};
pub use log_buffer::LogBuffer;
pub use orchestrator::{LaunchSettings, ManagerState, Orchestrator};
pub use release::{DownloadProgress, Platform, ReleaseAsset, ReleaseMetadata};
pub use release_client::ReleaseClient;
pub use release_source::ReleaseSource;
pub use store::{CleanupReport, InstalledVersion, VersionStore};
pub use supervisor::{ProcessSupervisor, RunState, StopTier, SupervisorTimings};
pub use version::{is_newer, normalize_version, parse_version, version_from_tag};
