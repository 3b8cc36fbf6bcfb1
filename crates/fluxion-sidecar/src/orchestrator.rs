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

//! Update workflows over the release client, version store and supervisor.
//!
//! Failures never escape as errors: they are logged, stored in
//! [`ManagerState::last_error`] and reported as `false`/`None`.

use crate::error::{Result, SidecarError};
use crate::release::{DownloadProgress, ReleaseMetadata};
use crate::release_client::ReleaseClient;
use crate::store::{CleanupReport, InstalledVersion, VersionStore};
use crate::supervisor::ProcessSupervisor;
use crate::version::{is_update, normalize_version};
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Observable snapshot of the manager
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerState {
    pub latest_release: Option<ReleaseMetadata>,
    pub installed: Vec<InstalledVersion>,
    pub current_version: Option<String>,
    pub checking: bool,
    pub installing: bool,
    pub progress: Option<DownloadProgress>,
    pub last_error: Option<String>,
}

impl ManagerState {
    /// Latest known release is newer than the active version
    pub fn update_available(&self) -> bool {
        self.latest_release
            .as_ref()
            .is_some_and(|release| is_update(self.current_version.as_deref(), release.version()))
    }
}

/// How the managed binary is launched after a restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSettings {
    pub port: u16,
    pub config_path: Option<PathBuf>,
}

static CHECKSUM_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)sha256:\s*([a-f0-9]{64})").ok());

/// First `sha256:<64 hex>` found in release notes
pub fn extract_checksum(body: Option<&str>) -> Option<String> {
    let body = body.filter(|b| !b.is_empty())?;
    CHECKSUM_RE
        .as_ref()?
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

struct InstallGuard<'a>(&'a AtomicBool);

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct Orchestrator {
    client: ReleaseClient,
    store: Arc<VersionStore>,
    state: watch::Sender<ManagerState>,
    install_in_flight: AtomicBool,
}

impl Orchestrator {
    pub fn new(client: ReleaseClient, store: Arc<VersionStore>) -> Self {
        let (state, _) = watch::channel(ManagerState::default());
        Self {
            client,
            store,
            state,
            install_in_flight: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &ReleaseClient {
        &self.client
    }

    pub fn store(&self) -> &Arc<VersionStore> {
        &self.store
    }

    pub fn state(&self) -> ManagerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    /// Run a store operation on the blocking pool
    async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&VersionStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| SidecarError::Io(std::io::Error::other(format!("store task failed: {e}"))))?
    }

    fn record_error(&self, operation: &str, err: &SidecarError) {
        error!("{operation} failed: {err}");
        let message = err.to_string();
        self.state.send_modify(|s| s.last_error = Some(message));
    }

    fn clear_error(&self) {
        let _ = self.state.send_if_modified(|s| s.last_error.take().is_some());
    }

    /// Reload installed versions and the active pointer
    pub async fn refresh(&self) -> bool {
        let snapshot = self
            .with_store(|store| Ok((store.list_installed()?, store.current_version())))
            .await;

        match snapshot {
            Ok((installed, current_version)) => {
                self.state.send_modify(|s| {
                    s.installed = installed;
                    s.current_version = current_version;
                });
                true
            }
            Err(e) => {
                self.record_error("Refresh", &e);
                false
            }
        }
    }

    /// Fetch the latest release into the state
    pub async fn check_for_update(&self) -> Option<ReleaseMetadata> {
        self.clear_error();
        self.state.send_modify(|s| s.checking = true);

        let result = self.client.fetch_latest().await;
        self.state.send_modify(|s| s.checking = false);

        match result {
            Ok(release) => {
                info!(tag = %release.tag_name, "Latest release");
                self.state
                    .send_modify(|s| s.latest_release = Some(release.clone()));
                Some(release)
            }
            Err(e) => {
                self.record_error("Update check", &e);
                None
            }
        }
    }

    /// One page of the catalog; empty on failure
    pub async fn list_releases(&self, page: u32, per_page: u32) -> Vec<ReleaseMetadata> {
        self.clear_error();
        match self.client.fetch_page(page, per_page).await {
            Ok(releases) => releases,
            Err(e) => {
                self.record_error("Listing releases", &e);
                Vec::new()
            }
        }
    }

    /// Download, verify, install and activate `release`.
    ///
    /// Returns `false` when another install is in flight or on failure.
    pub async fn install(&self, release: &ReleaseMetadata) -> bool {
        if self
            .install_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(tag = %release.tag_name, "Install already in progress, ignoring");
            return false;
        }
        let _guard = InstallGuard(&self.install_in_flight);

        self.state.send_modify(|s| {
            s.installing = true;
            s.progress = None;
            s.last_error = None;
        });

        let result = self.try_install(release).await;

        self.state.send_modify(|s| {
            s.installing = false;
            s.progress = None;
        });

        match result {
            Ok(version) => {
                info!(version = %version, "Install complete");
                self.refresh().await;
                true
            }
            Err(e) => {
                self.record_error("Install", &e);
                self.refresh().await;
                false
            }
        }
    }

    async fn try_install(&self, release: &ReleaseMetadata) -> Result<String> {
        let version = normalize_version(release.version())?;
        let asset = self
            .client
            .select_asset(release)
            .ok_or_else(|| SidecarError::NoSuitableAsset(self.client.platform().to_string()))?;
        info!(version = %version, asset = %asset.name, "Installing release");

        let data = self
            .client
            .download(asset, |progress| {
                self.state.send_modify(|s| s.progress = Some(progress));
            })
            .await?;

        let checksum = extract_checksum(release.body.as_deref());
        if checksum.is_none() {
            warn!(version = %version, "Release notes carry no sha256, skipping verification");
        }

        let target = version.clone();
        self.with_store(move |store| {
            store.install(&target, &data, checksum.as_deref())?;
            store.activate(&target)
        })
        .await?;

        Ok(version)
    }

    /// Check the catalog and install the latest release when it is newer
    /// than the active version. Returns whether something was installed.
    pub async fn install_latest(&self) -> bool {
        let Some(release) = self.check_for_update().await else {
            return false;
        };

        // The cached state may predate the store's current pointer
        if !self.refresh().await {
            return false;
        }
        if !self.state.borrow().update_available() {
            info!(tag = %release.tag_name, "Already up to date");
            return false;
        }

        self.install(&release).await
    }

    pub async fn activate(&self, version: &str) -> bool {
        self.clear_error();
        let target = version.to_string();
        let result = self.with_store(move |store| store.activate(&target)).await;
        self.finish("Activate", result).await
    }

    pub async fn delete(&self, version: &str) -> bool {
        self.clear_error();
        let target = version.to_string();
        let result = self.with_store(move |store| store.delete(&target)).await;
        self.finish("Delete", result).await
    }

    /// Best-effort removal of old versions
    pub async fn cleanup(&self, keep_latest: usize) -> CleanupReport {
        self.clear_error();
        let result = self
            .with_store(move |store| Ok(store.cleanup(keep_latest)))
            .await;
        self.refresh().await;

        match result {
            Ok(report) => {
                if !report.failed.is_empty() {
                    warn!(failed = ?report.failed, "Some versions could not be removed");
                }
                report
            }
            Err(e) => {
                self.record_error("Cleanup", &e);
                CleanupReport::default()
            }
        }
    }

    async fn finish(&self, operation: &str, result: Result<()>) -> bool {
        let ok = match result {
            Ok(()) => true,
            Err(e) => {
                self.record_error(operation, &e);
                false
            }
        };
        self.refresh().await;
        ok
    }

    /// `install`, then restart a running process against the newly active
    /// binary. The process keeps serving during the download and is left
    /// alone when nothing was installed.
    pub async fn install_and_restart(
        &self,
        release: &ReleaseMetadata,
        supervisor: &ProcessSupervisor,
        launch: &LaunchSettings,
    ) -> bool {
        let was_running = supervisor.is_running();
        let installed = self.install(release).await;
        if installed && was_running {
            self.restart_active(supervisor, launch).await;
        }
        installed
    }

    /// `activate`, with the same restart handling as
    /// [`Self::install_and_restart`]
    pub async fn activate_and_restart(
        &self,
        version: &str,
        supervisor: &ProcessSupervisor,
        launch: &LaunchSettings,
    ) -> bool {
        let was_running = supervisor.is_running();
        let activated = self.activate(version).await;
        if activated && was_running {
            self.restart_active(supervisor, launch).await;
        }
        activated
    }

    async fn restart_active(&self, supervisor: &ProcessSupervisor, launch: &LaunchSettings) {
        let binary = self
            .with_store(|store| Ok(store.current_binary_path()))
            .await
            .ok()
            .flatten();
        let Some(binary) = binary else {
            warn!("No active binary to restart");
            return;
        };

        let state = supervisor
            .restart(&binary, launch.port, launch.config_path.as_deref())
            .await;
        info!(state = %state, "Restarted against the active binary");
    }
}
