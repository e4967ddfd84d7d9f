use crate::domain::Updater;
use common::domain::{DomainResult, EdgeDeviceRepository, EventRecorder, Metrics, Notification};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// One reconciliation pass of a notification against the device store.
///
/// Shared by all handlers; retry and queueing decisions stay with the caller.
pub struct HeartbeatReconciler {
    device_repository: Arc<dyn EdgeDeviceRepository>,
    updater: Updater,
    metrics: Arc<dyn Metrics>,
}

impl HeartbeatReconciler {
    pub fn new(
        device_repository: Arc<dyn EdgeDeviceRepository>,
        recorder: Arc<dyn EventRecorder>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        let updater = Updater::new(device_repository.clone(), recorder, metrics.clone());
        Self {
            device_repository,
            updater,
            metrics,
        }
    }

    /// Read the device, emit events on the first attempt, patch the status
    /// unless the heartbeat is stale, then merge labels.
    ///
    /// Events go out right after a successful read so a later failure cannot
    /// lose them; retries never re-emit.
    #[instrument(
        skip(self, notification),
        fields(
            device_id = %notification.device_id,
            namespace = %notification.namespace,
            retry = notification.retry
        )
    )]
    pub async fn reconcile(&self, notification: &Notification) -> DomainResult<()> {
        let started = Instant::now();
        let heartbeat = &notification.heartbeat;

        let device = self
            .device_repository
            .read(&notification.device_id, &notification.namespace)
            .await?;

        if notification.is_first_attempt() && !heartbeat.events.is_empty() {
            debug!(events = heartbeat.events.len(), "emitting device events");
            self.updater.process_events(&device, &heartbeat.events);
        }

        let device = match self.updater.update_status(&device, heartbeat).await? {
            Some(stored) => stored,
            None => device,
        };

        self.updater.update_labels(&device, heartbeat).await?;

        self.metrics
            .record_edge_device_presence(&notification.namespace, &notification.device_id);
        self.metrics
            .set_process_heartbeat_time(started.elapsed().as_millis() as u64);

        debug!("heartbeat reconciled");
        Ok(())
    }
}
