//! Resolves and downloads every source reference of a batch into its
//! workspace.
//!
//! Items run through a bounded fan-out in two passes: metadata for every item,
//! then downloads for the items whose metadata resolved. File names are
//! claimed between the passes, in input order, so collision suffixes do not
//! depend on which call finished first. A failing item is recorded and the
//! rest of the batch carries on.

use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::error::ResolveError;
use crate::model::{
    AssetInfo, BatchRequest, BatchResult, FailureStage, ItemFailure, MediaKind, Quality,
    ResolvedAsset,
};
use crate::resolver::AssetResolver;
use crate::sanitize::{EntryNames, sanitize_title};
use crate::workspace::Workspace;

pub const DEFAULT_CONCURRENCY: usize = 3;

/// An item whose metadata resolved and whose target file is known.
struct PlannedItem {
    index: usize,
    source: String,
    title: String,
    file_name: String,
    path: PathBuf,
}

pub struct FetchOrchestrator {
    resolver: Arc<dyn AssetResolver>,
    concurrency: usize,
    call_timeout: Duration,
}

impl FetchOrchestrator {
    pub fn new(resolver: Arc<dyn AssetResolver>, concurrency: usize, call_timeout: Duration) -> Self {
        Self {
            resolver,
            concurrency: concurrency.max(1),
            call_timeout,
        }
    }

    pub async fn run(&self, batch: &BatchRequest, workspace: &Workspace) -> BatchResult {
        let kind = batch.kind();
        let quality = batch.quality();
        let mut failures = Vec::new();

        let mut lookups: Vec<(usize, Result<AssetInfo, ResolveError>)> =
            stream::iter(batch.sources().to_vec().into_iter().enumerate())
                .map(|(index, source)| async move {
                    (index, self.bounded(self.resolver.info(&source)).await)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
        lookups.sort_by_key(|(index, _)| *index);

        let mut names = EntryNames::default();
        let mut planned = Vec::new();
        for (index, lookup) in lookups {
            let source = batch.sources()[index].clone();
            let info = match lookup {
                Ok(info) => info,
                Err(err) => {
                    warn!(index, %source, error = %err, "metadata lookup failed; skipping item");
                    failures.push(ItemFailure::from_resolve(
                        index,
                        &source,
                        FailureStage::Metadata,
                        &err,
                    ));
                    continue;
                }
            };

            let title = info.display_title();
            let file_name = names.claim(&sanitize_title(&title), kind.extension());
            match workspace.target_path(&file_name) {
                Ok(path) => planned.push(PlannedItem {
                    index,
                    source,
                    title,
                    file_name,
                    path,
                }),
                Err(err) => {
                    warn!(index, %source, error = %err, "rejected target file name");
                    failures.push(ItemFailure::new(index, &source, FailureStage::Download, err));
                }
            }
        }

        let downloads: Vec<Result<ResolvedAsset, ItemFailure>> = stream::iter(planned)
            .map(|item| self.fetch(item, kind, quality))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut assets = Vec::new();
        for outcome in downloads {
            match outcome {
                Ok(asset) => assets.push(asset),
                Err(failure) => failures.push(failure),
            }
        }

        let result = BatchResult::new(assets, failures);
        info!(
            workspace = %workspace.path().display(),
            requested = batch.len(),
            resolved = result.assets().len(),
            failed = result.failures().len(),
            "batch resolution finished"
        );
        result
    }

    async fn fetch(
        &self,
        item: PlannedItem,
        kind: MediaKind,
        quality: Quality,
    ) -> Result<ResolvedAsset, ItemFailure> {
        let PlannedItem {
            index,
            source,
            title,
            file_name,
            path,
        } = item;

        debug!(index, %source, file = %file_name, "downloading item");
        let downloaded = match kind {
            MediaKind::Audio => {
                self.bounded(self.resolver.download_audio(&source, kind.extension(), &path))
                    .await
            }
            MediaKind::Video => {
                self.bounded(self.resolver.download_video(&source, quality, &path))
                    .await
            }
        };

        let outcome = match downloaded {
            Ok(()) => tokio::fs::metadata(&path)
                .await
                .map(|metadata| metadata.len())
                .map_err(|_| ResolveError::MissingOutput(path.clone())),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(size) => Ok(ResolvedAsset {
                index,
                source,
                title,
                file_name,
                path,
                size,
            }),
            Err(err) => {
                warn!(index, %source, error = %err, "download failed");
                if let Err(remove_err) = tokio::fs::remove_file(&path).await
                    && remove_err.kind() != std::io::ErrorKind::NotFound
                {
                    debug!(path = %path.display(), error = %remove_err, "could not remove partial output");
                }
                Err(ItemFailure::from_resolve(
                    index,
                    &source,
                    FailureStage::Download,
                    &err,
                ))
            }
        }
    }

    /// Turns a hung resolver call into a per-item failure. Dropping the call
    /// kills the underlying process.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ResolveError>>,
    ) -> Result<T, ResolveError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::TimedOut(self.call_timeout)),
        }
    }
}
