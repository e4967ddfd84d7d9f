use crate::domain::edge_device::{DeviceKey, EdgeDevice};
use crate::domain::result::DomainResult;
use async_trait::async_trait;

/// Client for the shared, versioned object store holding device records.
///
/// Every write is conditioned on the `resource_version` of the record passed
/// in and fails with `DomainError::Conflict` when the stored record has moved
/// on. Successful writes return the stored record with its new version.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Get a device record, `None` if it does not exist
    async fn get(&self, key: &DeviceKey) -> DomainResult<Option<EdgeDevice>>;

    /// Create a device record (registration flow)
    async fn create(&self, device: EdgeDevice) -> DomainResult<EdgeDevice>;

    /// Write metadata (labels) of a device record
    async fn update(&self, device: EdgeDevice) -> DomainResult<EdgeDevice>;

    /// Write the status subresource of a device record
    async fn update_status(&self, device: EdgeDevice) -> DomainResult<EdgeDevice>;

    /// Delete a device record (deregistration flow)
    async fn delete(&self, key: &DeviceKey) -> DomainResult<()>;
}
