//! Turns a [`Package`] into an HTTP response whose body reports back to the
//! cleanup scheduler.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::{Body, Bytes},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::{
    Stream, StreamExt, future,
    stream::{self, BoxStream},
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, warn};

use crate::cleanup::{ReleaseTrigger, StreamOutcome};
use crate::error::Result;
use crate::packager::{ArchiveStream, ByteSource, Package};
use crate::sanitize::content_disposition;

/// Builds the success response. Headers are final once this returns; any
/// later failure can only cut the body short.
pub fn emit(package: Package, trigger: ReleaseTrigger) -> Result<Response> {
    let content_type = HeaderValue::from_static(package.content_type);
    let disposition = HeaderValue::from_str(&content_disposition(&package.filename))?;

    let (inner, cancel) = match package.source {
        ByteSource::File(file) => (ReaderStream::new(file).boxed(), None),
        ByteSource::Archive(ArchiveStream {
            reader,
            task,
            cancel,
            ..
        }) => {
            // Reader EOF only means the pipe closed; the producer's result
            // decides whether the archive is complete.
            let outcome = stream::once(async move {
                match task.await {
                    Ok(Ok(_)) => None,
                    Ok(Err(err)) => Some(Err(io::Error::other(err))),
                    Err(err) => Some(Err(io::Error::other(err))),
                }
            })
            .filter_map(future::ready);
            (ReaderStream::new(reader).chain(outcome).boxed(), Some(cancel))
        }
    };

    let body = TrackedStream {
        inner,
        trigger: Some(trigger),
        cancel,
        sent: 0,
    };

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    if let Some(length) = package.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(response)
}

/// Body stream that tells the cleanup scheduler how delivery ended.
struct TrackedStream {
    inner: BoxStream<'static, io::Result<Bytes>>,
    trigger: Option<ReleaseTrigger>,
    cancel: Option<CancellationToken>,
    sent: u64,
}

impl TrackedStream {
    fn finish(&mut self, outcome: StreamOutcome) {
        if outcome != StreamOutcome::Completed
            && let Some(cancel) = &self.cancel
        {
            cancel.cancel();
        }
        if let Some(trigger) = self.trigger.take() {
            debug!(bytes = self.sent, %outcome, "response body finished");
            trigger.stream_finished(outcome);
        }
    }
}

impl Stream for TrackedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(trigger) = this.trigger.as_mut() {
            trigger.stream_started();
        }

        let polled = this.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => this.sent += chunk.len() as u64,
            Poll::Ready(Some(Err(err))) => {
                warn!(bytes = this.sent, error = %err, "response body failed");
                this.finish(StreamOutcome::Failed);
            }
            Poll::Ready(None) => this.finish(StreamOutcome::Completed),
            Poll::Pending => {}
        }
        polled
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        if self.trigger.is_some() {
            self.finish(StreamOutcome::Aborted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupScheduler;
    use crate::model::{BatchResult, ResolvedAsset};
    use crate::packager::Packager;
    use crate::workspace::{Workspace, WorkspaceManager};
    use anyhow::Result;
    use std::{fs, time::Duration};
    use tempfile::tempdir;

    fn write_asset(workspace: &Workspace, index: usize, name: &str, bytes: &[u8]) -> ResolvedAsset {
        let path = workspace.target_path(name).unwrap();
        fs::write(&path, bytes).unwrap();
        ResolvedAsset {
            index,
            source: format!("src-{index}"),
            title: name.to_owned(),
            file_name: name.to_owned(),
            path,
            size: bytes.len() as u64,
        }
    }

    async fn wait_until_gone(workspace: &Workspace) {
        for _ in 0..200 {
            if !workspace.path().exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workspace {} was not released", workspace.path().display());
    }

    #[tokio::test]
    async fn raw_response_carries_headers_and_releases_after_body() -> Result<()> {
        let root = tempdir()?;
        let scheduler = CleanupScheduler::default();
        let pending = scheduler.track(WorkspaceManager::new(root.path()).allocate()?);
        let workspace = pending.workspace().clone();
        let result = BatchResult::new(
            vec![write_asset(&workspace, 0, "Song One.mp3", b"song-bytes")],
            Vec::new(),
        );

        let mut package = Packager::default().package(&result).await?;
        let trigger = pending.schedule_release(package.take_producer_signal());
        let response = emit(package, trigger)?;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"Song One.mp3\""
        );
        assert_eq!(headers[header::CONTENT_LENGTH], "10");
        assert!(workspace.path().exists());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(&body[..], b"song-bytes");
        wait_until_gone(&workspace).await;
        Ok(())
    }

    #[tokio::test]
    async fn unread_response_releases_when_dropped() -> Result<()> {
        let root = tempdir()?;
        let scheduler = CleanupScheduler::default();
        let pending = scheduler.track(WorkspaceManager::new(root.path()).allocate()?);
        let workspace = pending.workspace().clone();
        let payload = vec![7u8; 512 * 1024];
        let result = BatchResult::new(
            vec![
                write_asset(&workspace, 0, "a.mp4", &payload),
                write_asset(&workspace, 1, "b.mp4", &payload),
            ],
            Vec::new(),
        );

        let mut package = Packager::new(0)
            .with_pipe_capacity(4096)
            .package(&result)
            .await?;
        let trigger = pending.schedule_release(package.take_producer_signal());
        let response = emit(package, trigger)?;
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());

        drop(response);
        wait_until_gone(&workspace).await;
        Ok(())
    }

    #[tokio::test]
    async fn producer_failure_surfaces_as_body_error() -> Result<()> {
        let root = tempdir()?;
        let scheduler = CleanupScheduler::default();
        let pending = scheduler.track(WorkspaceManager::new(root.path()).allocate()?);
        let workspace = pending.workspace().clone();
        let first = write_asset(&workspace, 0, "a.mp3", b"aaaa");
        let mut missing = write_asset(&workspace, 1, "b.mp3", b"bbbb");
        missing.path = workspace.path().join("vanished.mp3");
        let result = BatchResult::new(vec![first, missing], Vec::new());

        let mut package = Packager::default().package(&result).await?;
        let trigger = pending.schedule_release(package.take_producer_signal());
        let response = emit(package, trigger)?;

        assert!(axum::body::to_bytes(response.into_body(), usize::MAX).await.is_err());
        wait_until_gone(&workspace).await;
        Ok(())
    }
}
