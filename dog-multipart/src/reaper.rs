use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::{
    DefaultUploadCoordinator, MultipartError, MultipartResult, UploadCoordinator, UploadId,
    UploadRecord,
};

impl DefaultUploadCoordinator {
    pub(crate) async fn release(&self, upload_id: &UploadId) -> MultipartResult<()> {
        let record = self
            .uploads
            .get(upload_id)
            .await
            .map_err(|e| e.with_context(format!("cannot get upload id {:?}", upload_id.as_str())))?;
        match record {
            Some(record) => self.remove_upload(&record).await,
            None => Ok(()),
        }
    }

    /// Remove every upload that expired before `now`.
    ///
    /// A failure to remove one upload does not stop the others; all such
    /// failures are reported together once every candidate was tried.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> MultipartResult<usize> {
        let expired = self
            .uploads
            .expired(now)
            .await
            .map_err(|e| e.with_context("cannot list expired uploads"))?;

        let mut removed = 0;
        let mut failures = Vec::new();
        for record in &expired {
            match self.remove_upload(record).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(upload_id = %record.id, "cannot remove expired upload: {}", err);
                    failures.push(format!("{}: {}", record.id, err));
                }
            }
        }

        if !failures.is_empty() {
            return Err(MultipartError::Cleanup {
                failed: failures.len(),
                message: failures.join("; "),
            });
        }
        if removed > 0 {
            info!("removed {} expired uploads", removed);
        }
        Ok(removed)
    }

    async fn remove_upload(&self, record: &UploadRecord) -> MultipartResult<()> {
        if record.is_finished() {
            // The parts are the content of the finished object now.
            self.uploads
                .remove(&record.id)
                .await
                .map_err(|e| e.with_context("cannot remove upload record"))?;
            debug!(upload_id = %record.id, "released finished upload");
            return Ok(());
        }

        let removed = self
            .uploads
            .remove_if_unfinished(&record.id)
            .await
            .map_err(|e| e.with_context("cannot remove upload record"))?;
        let Some(removed) = removed else {
            warn!(upload_id = %record.id, "upload finalized concurrently, keeping its parts");
            return self
                .uploads
                .remove(&record.id)
                .await
                .map_err(|e| e.with_context("cannot remove upload record"));
        };

        let mut failures = Vec::new();
        for (index, part) in removed.parts.iter().enumerate() {
            if part.is_none() {
                continue;
            }
            let name = self.part_key(&removed.id, index as u32);
            match self.blobs.remove(&name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    error!(blob = %name, "cannot remove part, leaving it as garbage: {}", err);
                    failures.push(name);
                }
            }
        }
        if !failures.is_empty() {
            return Err(MultipartError::Cleanup {
                failed: failures.len(),
                message: format!("cannot remove parts {}", failures.join(", ")),
            });
        }
        info!(upload_id = %removed.id, "removed unfinished upload");
        Ok(())
    }
}

/// Background task that periodically sweeps expired uploads
pub struct UploadReaper {
    coordinator: Arc<dyn UploadCoordinator>,
    interval: Duration,
}

impl UploadReaper {
    /// Create a new reaper running every 60 seconds
    pub fn new(coordinator: Arc<dyn UploadCoordinator>) -> Self {
        Self {
            coordinator,
            interval: Duration::from_secs(60),
        }
    }

    /// Create reaper with custom interval
    pub fn with_interval(coordinator: Arc<dyn UploadCoordinator>, interval: Duration) -> Self {
        Self { coordinator, interval }
    }

    /// Create a reaper using the coordinator's configured interval
    pub fn for_coordinator(coordinator: Arc<DefaultUploadCoordinator>) -> Self {
        let interval = coordinator.config().reaper_interval;
        Self::with_interval(coordinator, interval)
    }

    /// Start the reaper loop; never returns
    pub async fn start(self) {
        let mut ticker = interval(self.interval);
        info!("Starting upload reaper with interval: {:?}", self.interval);
        loop {
            ticker.tick().await;
            self.log_cycle().await;
        }
    }

    /// Run the reaper on its own task until the handle is shut down
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            info!("Starting upload reaper with interval: {:?}", self.interval);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => self.log_cycle().await,
                }
            }
            debug!("upload reaper stopped");
        });
        ReaperHandle {
            shutdown_tx,
            join_handle,
        }
    }

    /// Run one reaper cycle
    pub async fn reap_once(&self) -> MultipartResult<usize> {
        self.coordinator.sweep_expired().await
    }

    async fn log_cycle(&self) {
        match self.reap_once().await {
            Ok(0) => debug!("No expired uploads found"),
            Ok(count) => info!("Reaped {} expired uploads", count),
            Err(e) => warn!("Error during upload reaping: {}", e),
        }
    }
}

/// Handle to a spawned [`UploadReaper`]
pub struct ReaperHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for the current cycle to finish
    pub async fn shutdown(self) -> MultipartResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| MultipartError::backend("reaper task failed", e))
    }
}
