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

//! SHA256 checksum helpers for downloaded archives

use sha2::{Digest, Sha256};

/// Lowercase hex SHA256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Verify `data` against an expected digest such as `"SHA256: ABCD..."`.
///
/// An expected value that is empty after normalisation never matches.
pub fn verify(data: &[u8], expected: &str) -> bool {
    let expected = normalize_expected(expected);
    if expected.is_empty() {
        return false;
    }
    sha256_hex(data) == expected
}

/// Trim, lowercase and strip an optional `sha256:` prefix
pub fn normalize_expected(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    lowered
        .strip_prefix("sha256:")
        .unwrap_or(&lowered)
        .trim()
        .to_string()
}
