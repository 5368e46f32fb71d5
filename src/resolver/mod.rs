//! The external capability that turns a source reference into metadata and a
//! media file on disk.

use std::path::Path;

use async_trait::async_trait;

use crate::error::ResolveError;
use crate::model::{AssetInfo, Quality};

pub mod ytdlp;

pub use ytdlp::{YtDlpConfig, YtDlpResolver};

/// Shared across requests through `Arc<dyn AssetResolver>`; implementations
/// must tolerate concurrent calls.
#[async_trait]
pub trait AssetResolver: Send + Sync {
    /// Display metadata for `source`.
    async fn info(&self, source: &str) -> Result<AssetInfo, ResolveError>;

    /// Extracts audio in `format` (e.g. `mp3`) and writes it to exactly
    /// `output`.
    async fn download_audio(
        &self,
        source: &str,
        format: &str,
        output: &Path,
    ) -> Result<(), ResolveError>;

    /// Downloads video at `quality` as mp4 and writes it to exactly `output`.
    async fn download_video(
        &self,
        source: &str,
        quality: Quality,
        output: &Path,
    ) -> Result<(), ResolveError>;
}
