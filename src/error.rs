//! Error types shared by the batch pipeline.
//!
//! Per-item resolver failures are carried as [`ResolveError`] and aggregated
//! into the batch result; only [`Error`] ever reaches the HTTP layer, where it
//! collapses into one of two public messages.

use std::{io, path::PathBuf, time::Duration};

use axum::http::{StatusCode, header::InvalidHeaderValue};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Message returned for every malformed or empty batch request.
pub const NO_URLS_MESSAGE: &str = "No URLs provided";
/// Message returned for every failure after validation succeeded.
pub const DOWNLOAD_FAILED_MESSAGE: &str = "Download failed";

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid batch request: {0}")]
    InvalidRequest(String),

    #[error("workspace error at {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("entry name {0:?} would escape the workspace")]
    InvalidEntryName(String),

    #[error("no asset could be produced ({failed} item(s) failed)")]
    NoAssets { failed: usize },

    #[error("resolver error: {0}")]
    Resolver(#[from] ResolveError),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid header value: {0}")]
    Header(#[from] InvalidHeaderValue),

    #[error("archive production cancelled")]
    Cancelled,
}

impl Error {
    pub fn workspace(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Workspace {
            path: path.into(),
            source,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The only text a client ever sees. Details stay in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => NO_URLS_MESSAGE,
            _ => DOWNLOAD_FAILED_MESSAGE,
        }
    }
}

/// Failure of a single resolver call. The pipeline never branches on the
/// variant; it is kept for logging.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("could not run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("resolver exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("resolver call timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("could not parse resolver metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),

    #[error("resolver reported success but {} is missing", .0.display())]
    MissingOutput(PathBuf),

    #[error("resolver unavailable: {0}")]
    Unavailable(String),
}

impl ResolveError {
    /// Keeps the last few stderr lines; yt-dlp prints the useful error last.
    pub fn failed(status: impl ToString, stderr: &[u8]) -> Self {
        let text = String::from_utf8_lossy(stderr);
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let tail = lines[lines.len().saturating_sub(3)..].join(" | ");
        Self::Failed {
            status: status.to_string(),
            stderr: tail,
        }
    }
}
