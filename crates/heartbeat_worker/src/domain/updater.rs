use common::domain::{
    DeviceEvent, DomainResult, EdgeDevice, EdgeDeviceRepository, EdgeDeviceStatus, EventRecorder,
    Heartbeat, Labels, Metrics,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const LABEL_PREFIX: &str = "device.fleet.io";

/// Decides what a heartbeat changes on a device record and applies it
pub struct Updater {
    device_repository: Arc<dyn EdgeDeviceRepository>,
    recorder: Arc<dyn EventRecorder>,
    metrics: Arc<dyn Metrics>,
}

impl Updater {
    pub fn new(
        device_repository: Arc<dyn EdgeDeviceRepository>,
        recorder: Arc<dyn EventRecorder>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            device_repository,
            recorder,
            metrics,
        }
    }

    /// A heartbeat is stale unless it is strictly newer than the last one seen
    pub fn is_stale(device: &EdgeDevice, heartbeat: &Heartbeat) -> bool {
        match device.status.last_seen_time {
            Some(last_seen) => heartbeat.time <= last_seen,
            None => false,
        }
    }

    /// Patch the device status from the heartbeat.
    ///
    /// Returns the stored record when the status was written, `None` when the
    /// heartbeat was stale and discarded.
    pub async fn update_status(
        &self,
        device: &EdgeDevice,
        heartbeat: &Heartbeat,
    ) -> DomainResult<Option<EdgeDevice>> {
        if Self::is_stale(device, heartbeat) {
            debug!(
                device = %device.key(),
                heartbeat_time = %heartbeat.time,
                last_seen_time = ?device.status.last_seen_time,
                "heartbeat outdated, status not updated"
            );
            return Ok(None);
        }

        let started = Instant::now();
        let stored = self
            .device_repository
            .patch_status(device, status_from_heartbeat(heartbeat))
            .await?;
        self.metrics
            .set_patch_edge_device_status_time(elapsed_ms(started));

        Ok(Some(stored))
    }

    /// Merge the labels carried by the heartbeat into the device record
    pub async fn update_labels(&self, device: &EdgeDevice, heartbeat: &Heartbeat) -> DomainResult<()> {
        let labels = heartbeat_labels(heartbeat);
        if labels.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        self.device_repository
            .update_labels(device, &labels)
            .await?;
        self.metrics.set_patch_edge_device_time(elapsed_ms(started));

        Ok(())
    }

    /// Project device-reported events onto the device record.
    ///
    /// Not idempotent: call once per notification, never on a retry.
    pub fn process_events(&self, device: &EdgeDevice, events: &[DeviceEvent]) {
        for event in events {
            self.recorder
                .emit(device, event.kind, &event.reason, &event.message);
        }
    }
}

fn status_from_heartbeat(heartbeat: &Heartbeat) -> EdgeDeviceStatus {
    EdgeDeviceStatus {
        last_seen_time: Some(heartbeat.time),
        phase: heartbeat.status.phase.clone(),
        version: heartbeat.status.version.clone(),
        workloads: heartbeat.status.workloads.clone(),
        hardware: heartbeat.status.hardware.clone(),
    }
}

/// Labels derived from reported hardware, overridden by labels the device
/// reports explicitly
pub fn heartbeat_labels(heartbeat: &Heartbeat) -> Labels {
    let mut labels = Labels::new();

    if let Some(hardware) = &heartbeat.status.hardware {
        let facts = [
            ("cpu-architecture", &hardware.cpu_architecture),
            ("cpu-model", &hardware.cpu_model),
            ("system-manufacturer", &hardware.system_manufacturer),
            ("system-product", &hardware.system_product),
            ("system-serial", &hardware.system_serial),
        ];
        for (name, value) in facts {
            if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                labels.insert(format!("{LABEL_PREFIX}/{name}"), value.to_string());
            }
        }
    }

    labels.extend(
        heartbeat
            .status
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    labels
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use common::domain::{
        DomainError, EventKind, HardwareInfo, HeartbeatStatus, MockEdgeDeviceRepository,
        MockEventRecorder, MockMetrics,
    };

    fn device_seen_at(last_seen: Option<chrono::DateTime<Utc>>) -> EdgeDevice {
        let mut device = EdgeDevice::new("fleet", "dev-1");
        device.resource_version = 4;
        device.status.last_seen_time = last_seen;
        device
    }

    fn heartbeat_at(time: chrono::DateTime<Utc>) -> Heartbeat {
        Heartbeat {
            time,
            status: HeartbeatStatus {
                phase: "up".to_string(),
                ..Default::default()
            },
            events: vec![],
        }
    }

    fn updater(
        repository: MockEdgeDeviceRepository,
        recorder: MockEventRecorder,
        metrics: MockMetrics,
    ) -> Updater {
        Updater::new(Arc::new(repository), Arc::new(recorder), Arc::new(metrics))
    }

    #[test]
    fn test_is_stale() {
        let t0 = Utc::now();
        let device = device_seen_at(Some(t0));

        assert!(Updater::is_stale(&device, &heartbeat_at(t0 - Duration::seconds(1))));
        assert!(Updater::is_stale(&device, &heartbeat_at(t0)));
        assert!(!Updater::is_stale(&device, &heartbeat_at(t0 + Duration::seconds(1))));
        assert!(!Updater::is_stale(&device_seen_at(None), &heartbeat_at(t0)));
    }

    #[tokio::test]
    async fn test_update_status_discards_stale_heartbeat() {
        // No repository or metrics expectations: a stale heartbeat writes nothing
        let updater = updater(
            MockEdgeDeviceRepository::new(),
            MockEventRecorder::new(),
            MockMetrics::new(),
        );
        let t0 = Utc::now();

        let result = updater
            .update_status(&device_seen_at(Some(t0)), &heartbeat_at(t0 - Duration::seconds(1)))
            .await;

        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_update_status_patches_and_records_duration() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(1);

        let mut repository = MockEdgeDeviceRepository::new();
        repository
            .expect_patch_status()
            .withf(move |device: &EdgeDevice, status: &EdgeDeviceStatus| {
                device.resource_version == 4
                    && status.last_seen_time == Some(t1)
                    && status.phase == "up"
            })
            .times(1)
            .returning(|device, status| {
                let mut stored = device.clone();
                stored.status = status;
                stored.resource_version += 1;
                Ok(stored)
            });

        let mut metrics = MockMetrics::new();
        metrics
            .expect_set_patch_edge_device_status_time()
            .times(1)
            .return_const(());

        let updater = updater(repository, MockEventRecorder::new(), metrics);
        let stored = updater
            .update_status(&device_seen_at(Some(t0)), &heartbeat_at(t1))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.status.last_seen_time, Some(t1));
        assert_eq!(stored.resource_version, 5);
    }

    #[tokio::test]
    async fn test_update_status_surfaces_repository_error() {
        let mut repository = MockEdgeDeviceRepository::new();
        repository
            .expect_patch_status()
            .times(1)
            .returning(|_, _| {
                Err(DomainError::Conflict {
                    device: "fleet/dev-1".to_string(),
                    expected: 4,
                    actual: 5,
                })
            });

        // Duration is only recorded on success
        let updater = updater(repository, MockEventRecorder::new(), MockMetrics::new());
        let result = updater
            .update_status(&device_seen_at(None), &heartbeat_at(Utc::now()))
            .await;

        assert!(matches!(result, Err(DomainError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_update_labels_without_labels_is_noop() {
        let updater = updater(
            MockEdgeDeviceRepository::new(),
            MockEventRecorder::new(),
            MockMetrics::new(),
        );

        let result = updater
            .update_labels(&device_seen_at(None), &heartbeat_at(Utc::now()))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_update_labels_submits_reported_and_hardware_labels() {
        let mut repository = MockEdgeDeviceRepository::new();
        repository
            .expect_update_labels()
            .withf(|_device: &EdgeDevice, labels: &Labels| {
                labels.get("zone").map(String::as_str) == Some("us-east")
                    && labels.get("device.fleet.io/cpu-architecture").map(String::as_str)
                        == Some("aarch64")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut metrics = MockMetrics::new();
        metrics
            .expect_set_patch_edge_device_time()
            .times(1)
            .return_const(());

        let mut heartbeat = heartbeat_at(Utc::now());
        heartbeat
            .status
            .labels
            .insert("zone".to_string(), "us-east".to_string());
        heartbeat.status.hardware = Some(HardwareInfo {
            cpu_architecture: Some("aarch64".to_string()),
            ..Default::default()
        });

        let updater = updater(repository, MockEventRecorder::new(), metrics);
        let result = updater
            .update_labels(&device_seen_at(None), &heartbeat)
            .await;

        assert!(result.is_ok());
    }

    #[test]
    fn test_process_events_emits_one_event_per_device_event() {
        let mut recorder = MockEventRecorder::new();
        let mut seq = mockall::Sequence::new();
        recorder
            .expect_emit()
            .withf(|device: &EdgeDevice, kind: &EventKind, reason: &str, _message: &str| {
                device.name == "dev-1" && *kind == EventKind::Warning && reason == "Failed"
            })
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        recorder
            .expect_emit()
            .withf(|_device: &EdgeDevice, kind: &EventKind, reason: &str, _message: &str| {
                *kind == EventKind::Normal && reason == "Started"
            })
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let updater = updater(MockEdgeDeviceRepository::new(), recorder, MockMetrics::new());
        let events = vec![
            DeviceEvent {
                kind: EventKind::Warning,
                reason: "Failed".to_string(),
                message: "workload nginx crashed".to_string(),
            },
            DeviceEvent {
                kind: EventKind::Normal,
                reason: "Started".to_string(),
                message: "workload nginx started".to_string(),
            },
        ];

        updater.process_events(&device_seen_at(None), &events);
    }

    #[test]
    fn test_heartbeat_labels_reported_labels_win() {
        let mut heartbeat = heartbeat_at(Utc::now());
        heartbeat.status.hardware = Some(HardwareInfo {
            cpu_model: Some("  ".to_string()),
            system_serial: Some("SN-42".to_string()),
            ..Default::default()
        });
        heartbeat.status.labels.insert(
            "device.fleet.io/system-serial".to_string(),
            "override".to_string(),
        );

        let labels = heartbeat_labels(&heartbeat);

        assert_eq!(labels.len(), 1);
        assert_eq!(
            labels.get("device.fleet.io/system-serial").map(String::as_str),
            Some("override")
        );
    }
}
