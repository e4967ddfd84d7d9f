/// Metrics emitted by the device control plane.
///
/// Calls are pure side effects and must never influence reconciliation.
/// Durations are in milliseconds.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait Metrics: Send + Sync {
    fn inc_edge_device_successful_registration(&self);

    fn inc_edge_device_failed_registration(&self);

    fn inc_edge_device_unregistration(&self);

    /// Count one heartbeat for the device, registering its counter if needed
    fn record_edge_device_presence(&self, namespace: &str, name: &str);

    fn register_device_counter(&self, namespace: &str, name: &str);

    fn remove_device_counter(&self, namespace: &str, name: &str);

    fn set_patch_edge_device_status_time(&self, duration_ms: u64);

    fn set_patch_edge_device_time(&self, duration_ms: u64);

    fn set_process_heartbeat_time(&self, duration_ms: u64);
}
