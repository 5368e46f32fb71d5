//! Request and result types that flow through the batch pipeline.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, ResolveError};
use crate::sanitize::PLACEHOLDER_TITLE;

/// JSON body accepted by `POST /download`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
}

/// Requested output category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    #[default]
    Video,
}

impl MediaKind {
    /// Anything other than `audio` falls back to video.
    pub fn from_label(label: Option<&str>) -> Self {
        match label.map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("audio") => Self::Audio,
            _ => Self::Video,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Audio => "mp3",
            Self::Video => "mp4",
        }
    }
}

/// Quality hint for video downloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Quality {
    #[default]
    Highest,
    Lowest,
    MaxHeight(u32),
}

impl Quality {
    /// Accepts `highest`, `lowest` and `<n>p` (e.g. `720p`). Unknown hints
    /// resolve to `Highest`.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(value) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
            return Self::Highest;
        };
        let lower = value.to_ascii_lowercase();
        match lower.as_str() {
            "highest" | "best" => Self::Highest,
            "lowest" | "worst" => Self::Lowest,
            other => other
                .strip_suffix('p')
                .and_then(|digits| digits.parse::<u32>().ok())
                .filter(|height| *height > 0)
                .map(Self::MaxHeight)
                .unwrap_or(Self::Highest),
        }
    }

    /// yt-dlp `--format` selector for this hint.
    pub fn format_selector(self) -> String {
        match self {
            Self::Highest => "bestvideo*+bestaudio/best".to_owned(),
            Self::Lowest => "worstvideo*+worstaudio/worst".to_owned(),
            Self::MaxHeight(h) => {
                format!("bestvideo*[height<={h}]+bestaudio/best[height<={h}]/best")
            }
        }
    }
}

/// Validated, immutable batch input.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    sources: Vec<String>,
    kind: MediaKind,
    quality: Quality,
}

impl BatchRequest {
    pub fn new(sources: Vec<String>, kind: MediaKind, quality: Quality) -> Result<Self, Error> {
        let sources: Vec<String> = sources
            .into_iter()
            .map(|source| source.trim().to_owned())
            .filter(|source| !source.is_empty())
            .collect();
        if sources.is_empty() {
            return Err(Error::InvalidRequest("batch contains no source references".into()));
        }
        Ok(Self {
            sources,
            kind,
            quality,
        })
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl TryFrom<DownloadRequest> for BatchRequest {
    type Error = Error;

    fn try_from(request: DownloadRequest) -> Result<Self, Self::Error> {
        Self::new(
            request.urls,
            MediaKind::from_label(request.kind.as_deref()),
            Quality::parse(request.quality.as_deref()),
        )
    }
}

/// Display metadata returned by the resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetInfo {
    pub title: Option<String>,
}

impl AssetInfo {
    pub fn display_title(&self) -> String {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(PLACEHOLDER_TITLE)
            .to_owned()
    }
}

/// One file produced inside the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub index: usize,
    pub source: String,
    pub title: String,
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Metadata,
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub index: usize,
    pub source: String,
    pub stage: FailureStage,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(index: usize, source: &str, stage: FailureStage, reason: impl ToString) -> Self {
        Self {
            index,
            source: source.to_owned(),
            stage,
            reason: reason.to_string(),
        }
    }

    pub fn from_resolve(index: usize, source: &str, stage: FailureStage, err: &ResolveError) -> Self {
        Self::new(index, source, stage, err)
    }
}

/// Outcome of a batch: produced assets and per-item failures, both in input
/// order.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    assets: Vec<ResolvedAsset>,
    failures: Vec<ItemFailure>,
}

impl BatchResult {
    pub fn new(mut assets: Vec<ResolvedAsset>, mut failures: Vec<ItemFailure>) -> Self {
        assets.sort_by_key(|asset| asset.index);
        failures.sort_by_key(|failure| failure.index);
        Self { assets, failures }
    }

    pub fn assets(&self) -> &[ResolvedAsset] {
        &self.assets
    }

    pub fn failures(&self) -> &[ItemFailure] {
        &self.failures
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_request_rejects_empty_and_blank_lists() {
        assert!(BatchRequest::new(Vec::new(), MediaKind::Video, Quality::Highest).is_err());
        let blanks = vec!["  ".to_string(), String::new()];
        assert!(BatchRequest::new(blanks, MediaKind::Audio, Quality::Highest).is_err());
    }

    #[test]
    fn batch_request_trims_and_keeps_order() {
        let batch = BatchRequest::new(
            vec![" b ".into(), "".into(), "a".into()],
            MediaKind::Video,
            Quality::Highest,
        )
        .unwrap();
        assert_eq!(batch.sources(), ["b".to_string(), "a".to_string()]);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn download_request_defaults_to_video_highest() {
        let request: DownloadRequest =
            serde_json::from_str(r#"{"urls":["https://example.com/v"]}"#).unwrap();
        let batch = BatchRequest::try_from(request).unwrap();
        assert_eq!(batch.kind(), MediaKind::Video);
        assert_eq!(batch.quality(), Quality::Highest);
    }

    #[test]
    fn download_request_rejects_non_list_urls() {
        let parsed = serde_json::from_str::<DownloadRequest>(r#"{"urls":"https://x"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn media_kind_labels() {
        assert_eq!(MediaKind::from_label(Some("audio")), MediaKind::Audio);
        assert_eq!(MediaKind::from_label(Some("AUDIO ")), MediaKind::Audio);
        assert_eq!(MediaKind::from_label(Some("gif")), MediaKind::Video);
        assert_eq!(MediaKind::from_label(None), MediaKind::Video);
        assert_eq!(MediaKind::Audio.extension(), "mp3");
        assert_eq!(MediaKind::Video.extension(), "mp4");
    }

    #[test]
    fn quality_parsing_and_selectors() {
        assert_eq!(Quality::parse(None), Quality::Highest);
        assert_eq!(Quality::parse(Some("lowest")), Quality::Lowest);
        assert_eq!(Quality::parse(Some("720p")), Quality::MaxHeight(720));
        assert_eq!(Quality::parse(Some("0p")), Quality::Highest);
        assert_eq!(Quality::parse(Some("ultra")), Quality::Highest);
        assert_eq!(
            Quality::MaxHeight(480).format_selector(),
            "bestvideo*[height<=480]+bestaudio/best[height<=480]/best"
        );
    }

    #[test]
    fn display_title_falls_back_to_placeholder() {
        assert_eq!(AssetInfo::default().display_title(), PLACEHOLDER_TITLE);
        let blank = AssetInfo {
            title: Some("   ".into()),
        };
        assert_eq!(blank.display_title(), PLACEHOLDER_TITLE);
    }

    #[test]
    fn batch_result_sorts_by_index() {
        let asset = |index: usize| ResolvedAsset {
            index,
            source: format!("s{index}"),
            title: format!("t{index}"),
            file_name: format!("t{index}.mp3"),
            path: PathBuf::from(format!("/tmp/t{index}.mp3")),
            size: 1,
        };
        let result = BatchResult::new(vec![asset(2), asset(0)], Vec::new());
        let order: Vec<usize> = result.assets().iter().map(|a| a.index).collect();
        assert_eq!(order, vec![0, 2]);
    }
}
