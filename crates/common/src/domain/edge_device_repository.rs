use crate::domain::device_store::DeviceStore;
use crate::domain::edge_device::{DeviceKey, EdgeDevice, EdgeDeviceStatus, Labels};
use crate::domain::result::{DomainError, DomainResult};
use crate::metrics::record_label_conflict_retry;
use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Total attempts for a label update, the first one included
const LABEL_UPDATE_ATTEMPTS: u32 = 4;

/// Linear backoff step between label update attempts
const LABEL_UPDATE_BACKOFF_STEP: Duration = Duration::from_millis(50);

/// Read and patch operations on versioned device records
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait EdgeDeviceRepository: Send + Sync {
    /// Read the current record; `DomainError::DeviceNotFound` when it no longer exists
    async fn read(&self, name: &str, namespace: &str) -> DomainResult<EdgeDevice>;

    /// Replace the status of the record the snapshot was read from
    async fn patch_status(
        &self,
        device: &EdgeDevice,
        status: EdgeDeviceStatus,
    ) -> DomainResult<EdgeDevice>;

    /// Merge-patch `old` into `new`, conditioned on the version of `old`
    async fn patch(&self, old: &EdgeDevice, new: &EdgeDevice) -> DomainResult<EdgeDevice>;

    /// Merge labels into the record, retrying on concurrent writes
    async fn update_labels(&self, device: &EdgeDevice, labels: &Labels) -> DomainResult<()>;
}

/// Repository over a `DeviceStore` with optimistic-concurrency label merging
pub struct StoreEdgeDeviceRepository {
    store: Arc<dyn DeviceStore>,
}

impl StoreEdgeDeviceRepository {
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self { store }
    }

    /// Merge `labels` into the snapshot and patch it; no write if nothing changes
    async fn merge_labels(&self, device: &EdgeDevice, labels: &Labels) -> DomainResult<()> {
        let mut merged = device.labels.clone();
        merged.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        if merged == device.labels {
            debug!(device = %device.key(), "labels already up to date");
            return Ok(());
        }

        let mut updated = device.clone();
        updated.labels = merged;
        self.patch(device, &updated).await?;
        Ok(())
    }
}

#[async_trait]
impl EdgeDeviceRepository for StoreEdgeDeviceRepository {
    async fn read(&self, name: &str, namespace: &str) -> DomainResult<EdgeDevice> {
        let key = DeviceKey::new(namespace, name);
        self.store
            .get(&key)
            .await?
            .ok_or_else(|| DomainError::DeviceNotFound(key.to_string()))
    }

    async fn patch_status(
        &self,
        device: &EdgeDevice,
        status: EdgeDeviceStatus,
    ) -> DomainResult<EdgeDevice> {
        let mut updated = device.clone();
        updated.status = status;
        self.store.update_status(updated).await
    }

    async fn patch(&self, old: &EdgeDevice, new: &EdgeDevice) -> DomainResult<EdgeDevice> {
        if old.key() != new.key() {
            return Err(DomainError::RepositoryError(anyhow!(
                "cannot patch {} from snapshot of {}",
                new.key(),
                old.key()
            )));
        }

        let mut updated = new.clone();
        updated.resource_version = old.resource_version;
        self.store.update(updated).await
    }

    #[instrument(skip(self, device, labels), fields(device = %device.key(), label_count = labels.len()))]
    async fn update_labels(&self, device: &EdgeDevice, labels: &Labels) -> DomainResult<()> {
        let mut result = self.merge_labels(device, labels).await;

        // The record can be written concurrently; re-read and merge again
        for attempt in 1..LABEL_UPDATE_ATTEMPTS {
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            debug!(attempt, error = %err, "label update failed, retrying");
            record_label_conflict_retry();
            tokio::time::sleep(LABEL_UPDATE_BACKOFF_STEP * attempt).await;

            result = match self.read(&device.name, &device.namespace).await {
                Ok(fresh) => self.merge_labels(&fresh, labels).await,
                Err(read_err) => Err(read_err),
            };
        }

        if let Err(err) = &result {
            warn!(error = %err, "label update did not converge");
        }
        result
    }
}
