pub mod domain;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod telemetry;

pub use domain::*;
pub use events::*;
pub use memory::*;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockDeviceStore;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockEdgeDeviceRepository;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockEventRecorder;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockMetrics;
