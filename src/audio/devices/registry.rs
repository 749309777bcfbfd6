// Default device lookup and Bluetooth classification
//
// The registry is the only place that turns raw backend records into `DeviceInfo`
// snapshots. It keeps a cache of every snapshot it has produced so that later lookups by
// id (e.g. "is the device this stream runs on Bluetooth?") work without another
// enumeration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::audio::error::HardwareError;
use crate::audio::hardware::AudioHardware;
use crate::audio::types::{DeviceInfo, DeviceTransport, Direction, RawDevice};

/// Name fragments that identify Bluetooth devices when the backend cannot say
const BLUETOOTH_NAME_HINTS: &[&str] = &[
    "bluetooth",
    "airpods",
    "beats",
    "hands-free",
    "handsfree",
    "headset (",
    "buds",
    "bose",
    "jabra",
    "sony wh-",
    "sony wf-",
    "bt ",
    "a2dp",
    "hfp",
];

/// Whether a raw device is Bluetooth-attached
pub fn classify_bluetooth(raw: &RawDevice) -> bool {
    match raw.transport {
        DeviceTransport::Bluetooth => true,
        DeviceTransport::Usb | DeviceTransport::BuiltIn | DeviceTransport::Virtual => false,
        DeviceTransport::Unknown => name_suggests_bluetooth(&raw.name),
    }
}

fn name_suggests_bluetooth(name: &str) -> bool {
    let lowered = name.to_lowercase();
    BLUETOOTH_NAME_HINTS.iter().any(|hint| lowered.contains(hint))
}

/// Device identity service over an `AudioHardware` backend
pub struct DeviceRegistry {
    hardware: Arc<dyn AudioHardware>,
    devices_cache: Mutex<HashMap<(Direction, String), DeviceInfo>>,
}

impl DeviceRegistry {
    pub fn new(hardware: Arc<dyn AudioHardware>) -> Self {
        Self {
            hardware,
            devices_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn hardware(&self) -> &Arc<dyn AudioHardware> {
        &self.hardware
    }

    fn snapshot(&self, direction: Direction, raw: &RawDevice) -> DeviceInfo {
        let info = DeviceInfo {
            id: raw.id.clone(),
            name: raw.name.clone(),
            direction,
            is_bluetooth: classify_bluetooth(raw),
        };
        if let Ok(mut cache) = self.devices_cache.lock() {
            cache.insert((direction, info.id.clone()), info.clone());
        }
        info
    }

    /// Current OS default device for a direction
    pub fn current_default(&self, direction: Direction) -> Result<Option<DeviceInfo>, HardwareError> {
        let raw = self.hardware.default_device(direction)?;
        let info = raw.map(|raw| self.snapshot(direction, &raw));
        crate::device_debug!("Default {} device: {:?}", direction, info);
        Ok(info)
    }

    /// All devices currently present for a direction
    pub fn enumerate(&self, direction: Direction) -> Result<Vec<DeviceInfo>, HardwareError> {
        let raws = self.hardware.devices(direction)?;
        Ok(raws.iter().map(|raw| self.snapshot(direction, raw)).collect())
    }

    /// Whether `device_id` is currently present.
    ///
    /// Enumeration failures count as "present" so that a flaky enumeration never blocks
    /// a switch; the open itself will fail if the device is really gone.
    pub fn is_present(&self, direction: Direction, device_id: &str) -> bool {
        match self.enumerate(direction) {
            Ok(devices) => devices.iter().any(|d| d.id == device_id),
            Err(e) => {
                warn!("⚠️ Could not enumerate {} devices ({}), assuming '{}' is present", direction, e, device_id);
                true
            }
        }
    }

    /// Previously seen snapshot for a device id
    pub fn cached(&self, direction: Direction, device_id: &str) -> Option<DeviceInfo> {
        self.devices_cache
            .lock()
            .ok()?
            .get(&(direction, device_id.to_string()))
            .cloned()
    }

    /// Bluetooth classification by id, falling back to the id as a name hint
    pub fn is_bluetooth(&self, direction: Direction, device_id: &str) -> bool {
        match self.cached(direction, device_id) {
            Some(info) => info.is_bluetooth,
            None => name_suggests_bluetooth(device_id),
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self.devices_cache.lock().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("DeviceRegistry")
            .field("hardware", &"AudioHardware")
            .field("cached_devices", &cached)
            .finish()
    }
}
