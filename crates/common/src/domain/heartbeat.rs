use crate::domain::edge_device::{DeviceKey, HardwareInfo, Labels, WorkloadStatus};
use crate::domain::result::{DomainError, DomainResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Periodic status report sent by an edge device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub status: HeartbeatStatus,
    #[serde(default)]
    pub events: Vec<DeviceEvent>,
}

/// Device-reported status payload carried by a heartbeat
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStatus {
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub workloads: Vec<WorkloadStatus>,
    #[serde(default)]
    pub hardware: Option<HardwareInfo>,
    #[serde(default)]
    pub labels: Labels,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Normal,
    Warning,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Normal => write!(f, "Normal"),
            EventKind::Warning => write!(f, "Warning"),
        }
    }
}

/// Event reported by the device agent, projected 1:1 into the cluster event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

/// Unit of work wrapping one heartbeat plus its delivery metadata.
///
/// `retry` starts at 0 and is incremented by a handler on every re-attempt.
/// Device events are only projected while `retry == 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub device_id: String,
    pub namespace: String,
    pub heartbeat: Heartbeat,
    pub retry: u32,
}

impl Notification {
    pub fn new(
        device_id: impl Into<String>,
        namespace: impl Into<String>,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            namespace: namespace.into(),
            heartbeat,
            retry: 0,
        }
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.namespace.clone(), self.device_id.clone())
    }

    pub fn is_first_attempt(&self) -> bool {
        self.retry == 0
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.device_id.trim().is_empty() {
            return Err(DomainError::InvalidNotification(
                "device id is empty".to_string(),
            ));
        }
        if self.namespace.trim().is_empty() {
            return Err(DomainError::InvalidNotification(format!(
                "namespace is empty for device {}",
                self.device_id
            )));
        }
        Ok(())
    }
}
