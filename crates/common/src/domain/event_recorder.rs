use crate::domain::edge_device::EdgeDevice;
use crate::domain::heartbeat::EventKind;

/// Sink for cluster-visible events tied to a device record.
///
/// Fire-and-forget: callers never depend on delivery.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait EventRecorder: Send + Sync {
    fn emit(&self, subject: &EdgeDevice, kind: EventKind, reason: &str, message: &str);
}
