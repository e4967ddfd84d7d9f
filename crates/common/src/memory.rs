mod in_memory_device_store;

pub use in_memory_device_store::*;
