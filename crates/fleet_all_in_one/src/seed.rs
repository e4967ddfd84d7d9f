use common::domain::{DeviceKey, DeviceStore, DomainError, EdgeDevice, Metrics};
use tracing::{debug, info, warn};

/// Register the configured devices with the store.
///
/// Devices that already exist are left untouched. Returns how many were created.
pub async fn seed_devices(
    store: &dyn DeviceStore,
    metrics: &dyn Metrics,
    keys: &[DeviceKey],
) -> usize {
    let mut created = 0;

    for key in keys {
        match store
            .create(EdgeDevice::new(key.namespace.clone(), key.name.clone()))
            .await
        {
            Ok(device) => {
                metrics.register_device_counter(&device.namespace, &device.name);
                metrics.inc_edge_device_successful_registration();
                debug!(device = %key, "registered device");
                created += 1;
            }
            Err(DomainError::DeviceAlreadyExists(_)) => {
                debug!(device = %key, "device already registered");
            }
            Err(err) => {
                metrics.inc_edge_device_failed_registration();
                warn!(device = %key, error = %err, "failed to register device");
            }
        }
    }

    info!(created, requested = keys.len(), "seeded devices");
    created
}
