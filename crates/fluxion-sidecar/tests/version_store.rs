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

mod common;

use common::{BINARY_NAME, script, tar_gz, tar_gz_raw_name, tar_gz_with_symlink, zip, zip_with_symlink};
use fluxion_sidecar::checksum::sha256_hex;
use fluxion_sidecar::store::CURRENT_LINK;
use fluxion_sidecar::{ErrorKind, SidecarError, VersionStore};
use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn new_store(dir: &TempDir) -> VersionStore {
    VersionStore::new(dir.path().join("store"), BINARY_NAME)
}

fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

fn installed_names(store: &VersionStore) -> Vec<String> {
    let mut names: Vec<String> = store
        .list_installed()
        .unwrap()
        .into_iter()
        .map(|v| v.version)
        .collect();
    names.sort();
    names
}

/// Install versions in order, spaced so their timestamps differ
fn install_all(store: &VersionStore, versions: &[&str]) {
    for version in versions {
        store
            .install(version, &script(&format!("echo {version}")), None)
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_install_raw_binary() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let payload = script("echo raw");

    let installed = store.install("v1.2.3", &payload, None).unwrap();
    assert_eq!(installed.version, "1.2.3");
    assert_eq!(installed.path, dir.path().join("store/v1.2.3"));

    let binary = dir.path().join("store/v1.2.3").join(BINARY_NAME);
    assert_eq!(fs::read(&binary).unwrap(), payload);
    assert_eq!(mode_of(&binary), 0o755);
    assert_eq!(store.binary_path("1.2.3").unwrap(), binary);
}

#[test]
fn test_prefixed_and_plain_versions_share_directory() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);

    store.install("1.2.3", &script("echo a"), None).unwrap();
    store.install("v1.2.3", &script("echo b"), None).unwrap();

    assert_eq!(installed_names(&store), vec!["1.2.3"]);
    let binary = store.binary_path("v1.2.3").unwrap();
    assert_eq!(fs::read(binary).unwrap(), script("echo b"));
}

#[test]
fn test_install_tar_gz_prefers_canonical_name() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let proxy = script("echo proxy");
    let helper = script("echo helper");

    let archive = tar_gz(&[
        ("CLIProxyAPI_6.1.2_linux_amd64/README.md", b"docs", 0o644),
        ("CLIProxyAPI_6.1.2_linux_amd64/helper", &helper, 0o755),
        ("CLIProxyAPI_6.1.2_linux_amd64/CLIProxyAPI", &proxy, 0o644),
    ]);
    store.install("6.1.2", &archive, None).unwrap();

    let binary = store.binary_path("6.1.2").unwrap();
    assert_eq!(fs::read(&binary).unwrap(), proxy);
    assert_eq!(mode_of(&binary), 0o755);
}

#[test]
fn test_install_zip_single_executable() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let proxy = script("echo zipped");

    let archive = zip(&[
        ("LICENSE", b"MIT", 0o644),
        ("bin/cli-proxy-api", &proxy, 0o755),
    ]);
    store.install("6.0.0", &archive, None).unwrap();

    let binary = store.binary_path("6.0.0").unwrap();
    assert_eq!(fs::read(&binary).unwrap(), proxy);
    assert_eq!(mode_of(&binary), 0o755);
}

#[test]
fn test_checksum_mismatch_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let payload = script("echo raw");
    let wrong = "0".repeat(64);

    let err = store.install("1.0.0", &payload, Some(&wrong)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
    match err {
        SidecarError::ChecksumMismatch { expected, actual } => {
            assert_eq!(expected, wrong);
            assert_eq!(actual, sha256_hex(&payload));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!store.base_dir().exists());
}

#[test]
fn test_checksum_match_accepts_prefixed_uppercase() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let payload = script("echo raw");
    let expected = format!("  SHA256:{}\n", sha256_hex(&payload).to_uppercase());

    store.install("1.0.0", &payload, Some(&expected)).unwrap();
    // Blank checksums are not enforced
    store.install("1.0.1", &payload, Some("  ")).unwrap();
    assert_eq!(installed_names(&store), vec!["1.0.0", "1.0.1"]);
}

#[test]
fn test_traversal_entries_rejected() {
    let outside = "sidecar-traversal-probe";
    for name in [
        format!("../{outside}"),
        format!("bin/../../{outside}"),
        format!("/tmp/{outside}"),
    ] {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let archive = tar_gz_raw_name(&name, &script("echo evil"));

        let err = store.install("1.0.0", &archive, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsafeArchive, "entry {name}");
        assert!(!store.base_dir().join("v1.0.0").exists());
        assert!(!dir.path().join(outside).exists());
    }
}

#[test]
fn test_zip_traversal_rejected() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let archive = zip(&[("../../evil", b"#!/bin/sh\n", 0o755)]);

    let err = store.install("1.0.0", &archive, None).unwrap_err();
    assert!(matches!(err, SidecarError::UnsafeArchiveEntry(_)));
    assert!(!store.base_dir().join("v1.0.0").exists());
}

#[test]
fn test_symlink_entries_rejected() {
    for archive in [
        tar_gz_with_symlink("escape", "/etc/passwd"),
        zip_with_symlink("escape", "/etc/passwd"),
    ] {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        let err = store.install("1.0.0", &archive, None).unwrap_err();
        assert!(matches!(err, SidecarError::SymlinkEntry(_)), "{err:?}");
        assert!(!store.base_dir().join("v1.0.0").exists());
    }
}

#[test]
fn test_binary_resolution_failures() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);

    let none = tar_gz(&[("README.md", b"docs", 0o644)]);
    assert!(matches!(
        store.install("1.0.0", &none, None),
        Err(SidecarError::BinaryNotFound)
    ));

    let a = script("echo a");
    let b = script("echo b");
    let many = zip(&[("tool-a", &a, 0o755), ("tool-b", &b, 0o755)]);
    match store.install("1.0.0", &many, None) {
        Err(SidecarError::AmbiguousBinary { candidates }) => {
            assert_eq!(candidates, vec!["tool-a", "tool-b"]);
        }
        other => panic!("unexpected result: {other:?}"),
    }

    assert!(store.list_installed().unwrap().is_empty());
}

#[test]
fn test_bad_payloads() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);

    let err = store.install("1.0.0", b"PK\x03\x04garbage", None).unwrap_err();
    assert!(matches!(err, SidecarError::CorruptArchive(_)));

    let err = store.install("1.0.0", b"", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FormatUnsupported);

    assert!(!store.base_dir().join("v1.0.0").exists());
}

#[test]
fn test_invalid_versions_rejected() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);

    for version in ["", "v", "../1.0.0", "1/2", "1\\2", "1.0..2", "1.0 beta"] {
        let err = store.install(version, &script("echo"), None).unwrap_err();
        assert!(matches!(err, SidecarError::InvalidVersion(_)), "{version:?}");
    }
    assert!(!store.base_dir().exists());
}

#[test]
fn test_activate_and_switch() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    install_all(&store, &["1.0.0", "2.0.0"]);

    assert_eq!(store.current_version(), None);
    assert_eq!(store.current_binary_path(), None);

    store.activate("v1.0.0").unwrap();
    assert_eq!(store.current_version().as_deref(), Some("1.0.0"));

    store.activate("2.0.0").unwrap();
    assert_eq!(store.current_version().as_deref(), Some("2.0.0"));
    assert_eq!(
        store.current_binary_path(),
        Some(store.binary_path("2.0.0").unwrap())
    );

    let pointer = store.base_dir().join(CURRENT_LINK);
    assert_eq!(fs::read_link(&pointer).unwrap(), Path::new("v2.0.0"));

    let leftovers: Vec<_> = fs::read_dir(store.base_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .filter(|n| n.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn test_activate_missing_version() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    install_all(&store, &["1.0.0"]);
    store.activate("1.0.0").unwrap();

    let err = store.activate("9.9.9").unwrap_err();
    assert!(matches!(err, SidecarError::VersionNotInstalled(_)));
    assert_eq!(store.current_version().as_deref(), Some("1.0.0"));
}

#[test]
fn test_delete_rules() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    install_all(&store, &["1.0.0", "2.0.0"]);
    store.activate("2.0.0").unwrap();

    let err = store.delete("v2.0.0").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);
    assert!(matches!(err, SidecarError::CannotDeleteCurrent(_)));
    assert!(store.base_dir().join("v2.0.0").is_dir());
    assert_eq!(store.current_version().as_deref(), Some("2.0.0"));

    assert!(matches!(
        store.delete("3.0.0"),
        Err(SidecarError::VersionNotInstalled(_))
    ));

    store.delete("1.0.0").unwrap();
    assert_eq!(installed_names(&store), vec!["2.0.0"]);
}

#[test]
fn test_malformed_pointers_read_as_none() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    install_all(&store, &["1.0.0"]);
    let pointer = store.base_dir().join(CURRENT_LINK);

    // Dangling
    symlink("v9.9.9", &pointer).unwrap();
    assert_eq!(store.current_version(), None);
    fs::remove_file(&pointer).unwrap();

    // Outside the base directory
    let elsewhere = dir.path().join("elsewhere/v1.0.0");
    fs::create_dir_all(&elsewhere).unwrap();
    symlink(&elsewhere, &pointer).unwrap();
    assert_eq!(store.current_version(), None);
    fs::remove_file(&pointer).unwrap();

    // Not a version directory name
    fs::create_dir(store.base_dir().join("other")).unwrap();
    symlink("other", &pointer).unwrap();
    assert_eq!(store.current_version(), None);
    fs::remove_file(&pointer).unwrap();

    // Absolute link into the store is fine
    symlink(store.base_dir().join("v1.0.0"), &pointer).unwrap();
    assert_eq!(store.current_version().as_deref(), Some("1.0.0"));
}

#[test]
fn test_list_skips_foreign_entries() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    install_all(&store, &["1.0.0", "1.1.0"]);
    store.activate("1.1.0").unwrap();

    let base = store.base_dir();
    fs::create_dir(base.join("notes")).unwrap();
    fs::write(base.join("v3.0.0"), b"not a dir").unwrap();
    let target = dir.path().join("linked");
    fs::create_dir(&target).unwrap();
    symlink(&target, base.join("v4.0.0")).unwrap();

    let listed: Vec<String> = store
        .list_installed()
        .unwrap()
        .into_iter()
        .map(|v| v.version)
        .collect();
    assert_eq!(listed, vec!["1.1.0", "1.0.0"]);
}

#[test]
fn test_list_missing_base_dir_is_empty() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    assert!(store.list_installed().unwrap().is_empty());
    assert_eq!(store.current_version(), None);
    assert!(store.cleanup(1).removed.is_empty());
}

#[test]
fn test_cleanup_keeps_newest_when_active() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    install_all(&store, &["1.0.0", "2.0.0", "3.0.0"]);
    store.activate("3.0.0").unwrap();

    let report = store.cleanup(1);
    let mut removed = report.removed.clone();
    removed.sort();
    assert_eq!(removed, vec!["1.0.0", "2.0.0"]);
    assert!(report.failed.is_empty());
    assert_eq!(installed_names(&store), vec!["3.0.0"]);
}

#[test]
fn test_cleanup_keeps_active_and_newest() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    install_all(&store, &["1.0.0", "2.0.0", "3.0.0"]);
    store.activate("1.0.0").unwrap();

    let report = store.cleanup(1);
    assert_eq!(report.removed, vec!["2.0.0"]);
    assert_eq!(installed_names(&store), vec!["1.0.0", "3.0.0"]);
    assert_eq!(store.current_version().as_deref(), Some("1.0.0"));
}

#[test]
fn test_concurrent_writers_keep_pointer_consistent() {
    const VERSIONS: [&str; 4] = ["1.0.0", "1.1.0", "1.2.0", "1.3.0"];

    let dir = TempDir::new().unwrap();
    let store = Arc::new(new_store(&dir));
    install_all(&store, &["1.0.0"]);
    store.activate("1.0.0").unwrap();

    let workers: Vec<_> = (0..8usize)
        .map(|worker| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for round in 0..12usize {
                    let version = VERSIONS[(worker + round) % VERSIONS.len()];
                    match (worker * 3 + round) % 4 {
                        0 => {
                            let _ = store.install(version, &script(&format!("echo {version}")), None);
                        }
                        1 => {
                            let _ = store.activate(version);
                        }
                        2 => {
                            let _ = store.delete(version);
                        }
                        _ => {
                            let _ = store.cleanup(2);
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let current = store.current_version().expect("pointer survives");
    let installed = installed_names(&store);
    assert!(installed.contains(&current), "{current} not in {installed:?}");
    assert!(store.current_binary_path().is_some());

    let base = store.base_dir();
    for entry in fs::read_dir(base).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().into_owned();
        assert!(!name.ends_with(".tmp"), "stale pointer {name}");
    }
    for version in &installed {
        let version_dir = base.join(format!("v{version}"));
        for entry in fs::read_dir(&version_dir).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().into_owned();
            assert!(!name.ends_with(".partial"), "leftover {name} in {version}");
        }
    }
}
