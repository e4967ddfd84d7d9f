use crate::domain::{EdgeDevice, EventKind, EventRecorder};
use tracing::{info, warn};

/// Projects device events into the structured log stream under the
/// `device_events` target, one record per event.
#[derive(Debug, Default, Clone)]
pub struct TracingEventRecorder;

impl TracingEventRecorder {
    pub fn new() -> Self {
        Self
    }
}

impl EventRecorder for TracingEventRecorder {
    fn emit(&self, subject: &EdgeDevice, kind: EventKind, reason: &str, message: &str) {
        match kind {
            EventKind::Normal => info!(
                target: "device_events",
                device_id = %subject.name,
                namespace = %subject.namespace,
                kind = %kind,
                reason,
                message,
                "device event"
            ),
            EventKind::Warning => warn!(
                target: "device_events",
                device_id = %subject.name,
                namespace = %subject.namespace,
                kind = %kind,
                reason,
                message,
                "device event"
            ),
        }
    }
}
