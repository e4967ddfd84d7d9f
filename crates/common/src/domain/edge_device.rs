use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type Labels = BTreeMap<String, String>;

/// Identity of a device record in the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub namespace: String,
    pub name: String,
}

impl DeviceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Authoritative per-device record as held by the object store.
///
/// `resource_version` is the version token of this snapshot. Writes made from
/// a snapshot are rejected by the store once the record has moved on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDevice {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub status: EdgeDeviceStatus,
    #[serde(default)]
    pub resource_version: u64,
}

impl EdgeDevice {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.namespace.clone(), self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDeviceStatus {
    #[serde(default)]
    pub last_seen_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub workloads: Vec<WorkloadStatus>,
    #[serde(default)]
    pub hardware: Option<HardwareInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Hardware facts reported by the device agent
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareInfo {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub cpu_architecture: Option<String>,
    #[serde(default)]
    pub cpu_model: Option<String>,
    #[serde(default)]
    pub system_manufacturer: Option<String>,
    #[serde(default)]
    pub system_product: Option<String>,
    #[serde(default)]
    pub system_serial: Option<String>,
}
