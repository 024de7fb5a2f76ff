use std::fs;
use std::io::{self, Read};
use std::path::Path;

use log::{debug, error};
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::error::{ComponentError, ComponentResult};

/// Digest algorithm implied by a published checksum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumKind {
    Md5,
    Sha256,
}

impl ChecksumKind {
    /// 32 hex digits is MD5, 64 is SHA-256; anything else cannot be verified.
    pub fn for_digest(expected: &str) -> Option<Self> {
        let expected = expected.trim();
        if !expected.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match expected.len() {
            32 => Some(ChecksumKind::Md5),
            64 => Some(ChecksumKind::Sha256),
            _ => None,
        }
    }
}

fn hash_file<D: Digest>(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = D::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// Hex digest of `path` using the algorithm implied by the expected checksum.
pub fn file_checksum(path: &Path, expected: &str) -> ComponentResult<String> {
    let context = || format!("failed to hash {}", path.display());
    match ChecksumKind::for_digest(expected) {
        Some(ChecksumKind::Md5) => {
            hash_file::<Md5>(path).map_err(|e| ComponentError::io(context(), e))
        }
        Some(ChecksumKind::Sha256) => {
            hash_file::<Sha256>(path).map_err(|e| ComponentError::io(context(), e))
        }
        None => Err(ComponentError::InvalidManifest {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            reason: unverifiable_reason(expected),
        }),
    }
}

pub(crate) fn unverifiable_reason(expected: &str) -> String {
    format!("checksum {expected:?} is neither an MD5 nor a SHA-256 hex digest")
}

/// Compare a file against its published checksum, ignoring hex case.
pub fn verify_checksum(path: &Path, expected: &str) -> ComponentResult<()> {
    let expected = expected.trim().to_lowercase();
    let actual = file_checksum(path, &expected)?;
    if actual != expected {
        error!(
            "checksum: {} looks corrupted (source {expected}, downloaded {actual})",
            path.display()
        );
        return Err(ComponentError::ChecksumMismatch {
            file: path.display().to_string(),
            expected,
            actual,
        });
    }
    debug!("checksum: {} verified", path.display());
    Ok(())
}
