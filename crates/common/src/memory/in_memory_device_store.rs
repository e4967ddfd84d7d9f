use crate::domain::{DeviceKey, DeviceStore, DomainError, DomainResult, EdgeDevice};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory implementation of DeviceStore with per-record versions.
///
/// Writes must carry the version of the record they were computed from;
/// a stale version is rejected with `DomainError::Conflict`.
pub struct InMemoryDeviceStore {
    devices: Arc<RwLock<HashMap<DeviceKey, EdgeDevice>>>,
    writes: AtomicU64,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of successful update/update_status writes
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn count(&self) -> usize {
        self.devices.read().await.len()
    }

    async fn write_with<F>(&self, device: &EdgeDevice, apply: F) -> DomainResult<EdgeDevice>
    where
        F: FnOnce(&mut EdgeDevice),
    {
        let key = device.key();
        let mut devices = self.devices.write().await;
        let stored = devices
            .get_mut(&key)
            .ok_or_else(|| DomainError::DeviceNotFound(key.to_string()))?;

        if stored.resource_version != device.resource_version {
            return Err(DomainError::Conflict {
                device: key.to_string(),
                expected: device.resource_version,
                actual: stored.resource_version,
            });
        }

        apply(stored);
        stored.resource_version += 1;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }
}

impl Default for InMemoryDeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceStore for InMemoryDeviceStore {
    async fn get(&self, key: &DeviceKey) -> DomainResult<Option<EdgeDevice>> {
        let devices = self.devices.read().await;
        Ok(devices.get(key).cloned())
    }

    async fn create(&self, mut device: EdgeDevice) -> DomainResult<EdgeDevice> {
        let key = device.key();
        let mut devices = self.devices.write().await;
        if devices.contains_key(&key) {
            return Err(DomainError::DeviceAlreadyExists(key.to_string()));
        }
        device.resource_version = 1;
        devices.insert(key, device.clone());
        Ok(device)
    }

    async fn update(&self, device: EdgeDevice) -> DomainResult<EdgeDevice> {
        let labels = device.labels.clone();
        self.write_with(&device, |stored| stored.labels = labels)
            .await
    }

    async fn update_status(&self, device: EdgeDevice) -> DomainResult<EdgeDevice> {
        let status = device.status.clone();
        self.write_with(&device, |stored| stored.status = status)
            .await
    }

    async fn delete(&self, key: &DeviceKey) -> DomainResult<()> {
        let mut devices = self.devices.write().await;
        devices
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| DomainError::DeviceNotFound(key.to_string()))
    }
}
