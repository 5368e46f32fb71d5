//! HTTP surface: `POST /download`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cleanup::CleanupScheduler;
use crate::config::ServiceConfig;
use crate::error::Error;
use crate::model::{BatchRequest, DownloadRequest};
use crate::orchestrator::FetchOrchestrator;
use crate::packager::Packager;
use crate::resolver::AssetResolver;
use crate::streamer;
use crate::workspace::WorkspaceManager;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = err.status_code();
        if status.is_server_error() {
            error!(error = %err, "batch request failed");
        } else {
            warn!(error = %err, "rejected batch request");
        }
        Self {
            status,
            message: err.public_message(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    workspaces: WorkspaceManager,
    orchestrator: Arc<FetchOrchestrator>,
    packager: Packager,
    cleanup: CleanupScheduler,
}

impl AppState {
    pub fn new(
        workspaces: WorkspaceManager,
        orchestrator: FetchOrchestrator,
        packager: Packager,
        cleanup: CleanupScheduler,
    ) -> Self {
        Self {
            workspaces,
            orchestrator: Arc::new(orchestrator),
            packager,
            cleanup,
        }
    }

    pub fn from_config(config: &ServiceConfig, resolver: Arc<dyn AssetResolver>) -> Self {
        Self::new(
            WorkspaceManager::new(&config.workspace_root),
            FetchOrchestrator::new(resolver, config.fetch_concurrency, config.resolver_timeout),
            Packager::new(config.compression_level),
            CleanupScheduler::new(config.cleanup_delay),
        )
    }

    pub fn cleanup(&self) -> &CleanupScheduler {
        &self.cleanup
    }

    /// Resolve, package and start streaming one batch. The workspace is
    /// released here on failure, otherwise once the response body ends.
    async fn run_batch(&self, batch: BatchRequest) -> Result<Response, Error> {
        let pending = self.cleanup.track(self.workspaces.allocate()?);
        info!(
            workspace = %pending.workspace().path().display(),
            items = batch.len(),
            kind = ?batch.kind(),
            "batch accepted"
        );

        let result = self.orchestrator.run(&batch, pending.workspace()).await;
        let mut package = match self.packager.package(&result).await {
            Ok(package) => package,
            Err(err) => {
                pending.release_now().await;
                return Err(err);
            }
        };

        info!(
            framing = ?package.framing,
            filename = %package.filename,
            failed = result.failures().len(),
            "streaming batch"
        );
        let trigger = pending.schedule_release(package.take_producer_signal());
        streamer::emit(package, trigger)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/download", post(download))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload.map_err(|rejection| Error::InvalidRequest(rejection.body_text()))?;
    let batch = BatchRequest::try_from(request)?;
    Ok(state.run_batch(batch).await?)
}
