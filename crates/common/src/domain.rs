mod device_metrics;
mod device_store;
mod edge_device;
mod edge_device_repository;
mod event_recorder;
mod heartbeat;
mod result;

pub use device_metrics::*;
pub use device_store::*;
pub use edge_device::*;
pub use edge_device_repository::*;
pub use event_recorder::*;
pub use heartbeat::*;
pub use result::*;
