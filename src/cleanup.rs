//! Releases batch workspaces once their response is no longer reading from
//! them.
//!
//! Every workspace is tracked from allocation until release. The normal path
//! is callback driven: the response stream reports how it ended and the
//! directory goes away right after (and after the archive producer, if any,
//! has let go of its files). A fixed delay after streaming started is kept as
//! a fallback for streams that never report back.

use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::oneshot, time::sleep};
use tracing::{debug, info, warn};

use crate::workspace::Workspace;

pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_secs(3600);

/// How a response stream ended, or why the workspace was released anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed,
    Aborted,
    FallbackElapsed,
}

impl fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::FallbackElapsed => "fallback delay elapsed",
        };
        f.write_str(label)
    }
}

type Registry = Arc<Mutex<HashMap<PathBuf, Workspace>>>;

#[derive(Debug, Clone)]
pub struct CleanupScheduler {
    fallback_delay: Duration,
    pending: Registry,
}

impl Default for CleanupScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_DELAY)
    }
}

impl CleanupScheduler {
    pub fn new(fallback_delay: Duration) -> Self {
        Self {
            fallback_delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers `workspace`; it stays registered until released.
    pub fn track(&self, workspace: Workspace) -> PendingRelease {
        self.pending
            .lock()
            .insert(workspace.path().to_path_buf(), workspace.clone());
        PendingRelease {
            workspace,
            scheduler: self.clone(),
            armed: true,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Releases every workspace still registered. Used on graceful shutdown.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<Workspace> = self.pending.lock().drain().map(|(_, ws)| ws).collect();
        let count = drained.len();
        for workspace in drained {
            if let Err(err) = workspace.release().await {
                warn!(workspace = %workspace.path().display(), error = %err, "could not release workspace at shutdown");
            }
        }
        if count > 0 {
            info!(count, "released pending workspaces at shutdown");
        }
        count
    }

    fn forget(&self, workspace: &Workspace) {
        self.pending.lock().remove(workspace.path());
    }

    async fn release(&self, workspace: &Workspace, reason: StreamOutcome) {
        self.forget(workspace);
        match workspace.release().await {
            Ok(()) => info!(workspace = %workspace.path().display(), %reason, "workspace released"),
            Err(err) => warn!(
                workspace = %workspace.path().display(),
                %reason,
                error = %err,
                "could not release workspace"
            ),
        }
    }

    fn release_blocking(&self, workspace: &Workspace, reason: StreamOutcome) {
        self.forget(workspace);
        if let Err(err) = workspace.release_blocking() {
            warn!(workspace = %workspace.path().display(), %reason, error = %err, "could not release workspace");
        }
    }
}

/// A tracked workspace that has not been handed to a response yet.
///
/// Dropping it releases the workspace in the background, which covers
/// requests abandoned while their batch is still resolving.
#[derive(Debug)]
pub struct PendingRelease {
    workspace: Workspace,
    scheduler: CleanupScheduler,
    armed: bool,
}

impl PendingRelease {
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Releases immediately, for failures before any byte was sent.
    pub async fn release_now(mut self) {
        self.armed = false;
        self.scheduler
            .release(&self.workspace, StreamOutcome::Failed)
            .await;
    }

    /// Hands the workspace over to the response. The release runs when the
    /// returned trigger reports an outcome (or is dropped), after
    /// `producer_done` resolves. Must be called inside a Tokio runtime.
    pub fn schedule_release(mut self, producer_done: Option<oneshot::Receiver<()>>) -> ReleaseTrigger {
        self.armed = false;
        let (started_tx, started_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();
        let workspace = self.workspace.clone();
        let scheduler = self.scheduler.clone();
        let delay = scheduler.fallback_delay;

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                outcome = finished_rx => outcome.unwrap_or(StreamOutcome::Aborted),
                _ = async {
                    let _ = started_rx.await;
                    sleep(delay).await;
                } => StreamOutcome::FallbackElapsed,
            };

            if outcome != StreamOutcome::FallbackElapsed
                && let Some(done) = producer_done
            {
                let _ = done.await;
            }
            debug!(workspace = %workspace.path().display(), %outcome, "response finished");
            scheduler.release(&workspace, outcome).await;
        });

        ReleaseTrigger {
            started: Some(started_tx),
            finished: Some(finished_tx),
        }
    }
}

impl Drop for PendingRelease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let workspace = self.workspace.clone();
        let scheduler = self.scheduler.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    scheduler.release(&workspace, StreamOutcome::Aborted).await;
                });
            }
            Err(_) => scheduler.release_blocking(&workspace, StreamOutcome::Aborted),
        }
    }
}

/// Handle held by the response stream. Dropping it without a report counts
/// as an aborted stream.
#[derive(Debug)]
pub struct ReleaseTrigger {
    started: Option<oneshot::Sender<()>>,
    finished: Option<oneshot::Sender<StreamOutcome>>,
}

impl ReleaseTrigger {
    /// Starts the fallback timer. Only the first call has an effect.
    pub fn stream_started(&mut self) {
        if let Some(started) = self.started.take() {
            let _ = started.send(());
        }
    }

    pub fn stream_finished(mut self, outcome: StreamOutcome) {
        if let Some(finished) = self.finished.take() {
            let _ = finished.send(outcome);
        }
    }
}
