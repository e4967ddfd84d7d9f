//! Fleet control plane metrics.
//!
//! Names mirror the metric families operators already scrape. Recording goes
//! through the `metrics` facade, so nothing is exported until a recorder
//! (e.g. the Prometheus exporter) is installed.

use crate::domain::{DeviceKey, Metrics};
use metrics::{counter, describe_counter, describe_gauge, gauge, Counter};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

// ============================================================================
// Metric Names
// ============================================================================

pub const EDGE_DEVICE_SUCCESSFUL_REGISTRATION: &str =
    "fleet_edge_devices_successful_registration";

pub const EDGE_DEVICE_FAILED_REGISTRATION: &str = "fleet_edge_devices_failed_registration";

pub const EDGE_DEVICE_UNREGISTRATION: &str = "fleet_edge_devices_unregistration";

/// Per-device heartbeat counter, labelled by device namespace and id.
pub const EDGE_DEVICE_HEARTBEAT: &str = "fleet_edge_devices_heartbeat";

pub const PATCH_EDGE_DEVICE_STATUS_DURATION: &str =
    "fleet_edge_devices_patch_status_duration_milliseconds";

pub const PATCH_EDGE_DEVICE_DURATION: &str = "fleet_edge_devices_patch_duration_milliseconds";

pub const PROCESS_HEARTBEAT_DURATION: &str = "fleet_process_heartbeat_duration_milliseconds";

/// Label update attempts that had to re-read the device after a failed write.
pub const LABEL_CONFLICT_RETRY: &str = "fleet_device_label_conflict_retries_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all metric descriptions.
///
/// Call once at startup after installing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(
        EDGE_DEVICE_SUCCESSFUL_REGISTRATION,
        "Number of successful registration EdgeDevices"
    );
    describe_counter!(
        EDGE_DEVICE_FAILED_REGISTRATION,
        "Number of failed registration EdgeDevices"
    );
    describe_counter!(
        EDGE_DEVICE_UNREGISTRATION,
        "Number of unregistered EdgeDevices"
    );
    describe_counter!(EDGE_DEVICE_HEARTBEAT, "Heartbeats received per EdgeDevice");
    describe_gauge!(
        PATCH_EDGE_DEVICE_STATUS_DURATION,
        "Time in millis to patch EdgeDevices status"
    );
    describe_gauge!(PATCH_EDGE_DEVICE_DURATION, "Time in millis to patch EdgeDevice");
    describe_gauge!(PROCESS_HEARTBEAT_DURATION, "Time in millis to process a heartbeat");
    describe_counter!(
        LABEL_CONFLICT_RETRY,
        "Label updates retried after a concurrent write"
    );
}

/// Records a label update retry caused by a failed write.
pub fn record_label_conflict_retry() {
    counter!(LABEL_CONFLICT_RETRY).increment(1);
}

// ============================================================================
// Metrics implementation
// ============================================================================

/// `Metrics` backed by the `metrics` facade.
///
/// Per-device heartbeat counters are tracked by device key so their lifecycle
/// follows device creation and deletion.
#[derive(Default)]
pub struct PrometheusMetrics {
    devices: Mutex<HashMap<DeviceKey, Counter>>,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of devices with a registered heartbeat counter
    pub fn registered_devices(&self) -> usize {
        self.lock_devices().len()
    }

    fn lock_devices(&self) -> MutexGuard<'_, HashMap<DeviceKey, Counter>> {
        // A poisoned map still holds valid handles
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn device_counter(&self, namespace: &str, name: &str) -> Counter {
        let key = DeviceKey::new(namespace, name);
        self.lock_devices()
            .entry(key)
            .or_insert_with(|| {
                counter!(
                    EDGE_DEVICE_HEARTBEAT,
                    "deviceNamespace" => namespace.to_string(),
                    "deviceID" => name.to_string()
                )
            })
            .clone()
    }
}

impl Metrics for PrometheusMetrics {
    fn inc_edge_device_successful_registration(&self) {
        counter!(EDGE_DEVICE_SUCCESSFUL_REGISTRATION).increment(1);
    }

    fn inc_edge_device_failed_registration(&self) {
        counter!(EDGE_DEVICE_FAILED_REGISTRATION).increment(1);
    }

    fn inc_edge_device_unregistration(&self) {
        counter!(EDGE_DEVICE_UNREGISTRATION).increment(1);
    }

    fn record_edge_device_presence(&self, namespace: &str, name: &str) {
        self.device_counter(namespace, name).increment(1);
    }

    fn register_device_counter(&self, namespace: &str, name: &str) {
        self.device_counter(namespace, name);
    }

    fn remove_device_counter(&self, namespace: &str, name: &str) {
        let key = DeviceKey::new(namespace, name);
        if let Some(counter) = self.lock_devices().remove(&key) {
            counter.absolute(0);
        }
    }

    fn set_patch_edge_device_status_time(&self, duration_ms: u64) {
        gauge!(PATCH_EDGE_DEVICE_STATUS_DURATION).set(duration_ms as f64);
    }

    fn set_patch_edge_device_time(&self, duration_ms: u64) {
        gauge!(PATCH_EDGE_DEVICE_DURATION).set(duration_ms as f64);
    }

    fn set_process_heartbeat_time(&self, duration_ms: u64) {
        gauge!(PROCESS_HEARTBEAT_DURATION).set(duration_ms as f64);
    }
}
