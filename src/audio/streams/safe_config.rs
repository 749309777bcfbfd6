// Last known-good stream configuration per device

use std::collections::HashMap;
use std::sync::Mutex;

use crate::audio::types::{Direction, StreamConfig};

#[derive(Debug, Default)]
pub struct SafeConfigCache {
    configs: Mutex<HashMap<(Direction, String), StreamConfig>>,
}

impl SafeConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `config` as the last config that opened on its device
    pub fn record(&self, config: &StreamConfig) {
        if let Ok(mut configs) = self.configs.lock() {
            configs.insert((config.direction, config.device_id.clone()), config.clone());
        }
    }

    pub fn get(&self, direction: Direction, device_id: &str) -> Option<StreamConfig> {
        self.configs
            .lock()
            .ok()?
            .get(&(direction, device_id.to_string()))
            .cloned()
    }

    /// Cached config for the same device, only when it differs from `requested`
    pub fn fallback_for(&self, requested: &StreamConfig) -> Option<StreamConfig> {
        self.get(requested.direction, &requested.device_id)
            .filter(|safe| safe != requested)
    }
}
