use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while fetching, extracting or removing a component.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("Download failed! Check your internet connection ({0})")]
    Network(String),

    #[error(
        "Download failed due to a TLS error; your system may have a wrong date/time or wrong certificates ({0})"
    )]
    Tls(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("{url} answered with HTTP status {status}")]
    BadStatus { url: String, status: u16 },

    #[error("archive {archive} is corrupted: {reason}")]
    CorruptArchive { archive: String, reason: String },

    #[error("unsupported archive format for {0}")]
    UnsupportedArchive(String),

    #[error("downloaded file {file} looks corrupted: expected checksum {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("unknown component category: {0}")]
    UnknownCategory(String),

    #[error("component in use and cannot be removed: {0}")]
    AlreadyInUse(String),

    #[error("component already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("no manifest found for component {0}")]
    ManifestNotFound(String),

    #[error("invalid manifest for {name}: {reason}")]
    InvalidManifest { name: String, reason: String },

    #[error("component not installed: {0}")]
    NotInstalled(String),

    #[error("post-install step failed: {0}")]
    PostInstall(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ComponentError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Failures of the download stage, as opposed to extraction or bookkeeping.
    pub fn is_download_failure(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Tls(_)
                | Self::BadStatus { .. }
                | Self::ChecksumMismatch { .. }
                | Self::Cancelled
        )
    }
}

pub type ComponentResult<T> = Result<T, ComponentError>;
