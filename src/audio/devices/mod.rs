// Audio devices module - default device identity and change monitoring
//
// - registry: default device lookup, enumeration and Bluetooth classification
// - monitor: debounced default-device change publisher (native + polling sources)

pub mod monitor;
pub mod registry;

pub use monitor::{DeviceChangePublisher, DeviceMonitorConfig, DeviceMonitorStats};
pub use registry::{classify_bluetooth, DeviceRegistry};
