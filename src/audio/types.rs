use serde::{Deserialize, Serialize};
use std::fmt;

/// Audio path a device or stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Microphone capture
    Input,
    /// Speech playback
    Output,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Input, Direction::Output];

    /// Stable slot index for per-direction arrays
    pub fn index(self) -> usize {
        match self {
            Direction::Input => 0,
            Direction::Output => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a device is attached, as far as the backend can tell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTransport {
    Bluetooth,
    Usb,
    BuiltIn,
    Virtual,
    Unknown,
}

/// Raw device record as reported by an `AudioHardware` backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    pub id: String,
    pub name: String,
    pub transport: DeviceTransport,
}

impl RawDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, transport: DeviceTransport) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transport,
        }
    }
}

/// Immutable snapshot of a default device.
///
/// Replaced wholesale on change; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub direction: Direction,
    pub is_bluetooth: bool,
}

impl DeviceInfo {
    /// Identity comparison used by change detection (name changes alone are not a switch)
    pub fn same_device(&self, other: &DeviceInfo) -> bool {
        self.id == other.id && self.direction == other.direction
    }
}

/// Hardware stream parameters.
///
/// Bluetooth devices get neither `block_size` nor `latency`; the hardware negotiates
/// both itself and rejects explicit values on several platforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub direction: Direction,
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u32>,
    /// Suggested latency in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    pub device_id: String,
}

impl StreamConfig {
    pub fn new(direction: Direction, device_id: impl Into<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            direction,
            sample_rate,
            channels,
            block_size: None,
            latency: None,
            device_id: device_id.into(),
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn with_latency(mut self, latency: f64) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Strip the fields Bluetooth hardware refuses
    pub fn for_bluetooth(mut self) -> Self {
        self.block_size = None;
        self.latency = None;
        self
    }

    /// Same stream shape pointed at another device
    pub fn retarget(&self, device: &DeviceInfo) -> Self {
        let retargeted = Self {
            device_id: device.id.clone(),
            ..self.clone()
        };
        if device.is_bluetooth {
            retargeted.for_bluetooth()
        } else {
            retargeted
        }
    }
}

/// Backend identifier of one open hardware stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Opaque handle to an open hardware stream.
///
/// Not `Clone`: only the holder can close or switch the stream.
#[derive(Debug, PartialEq)]
pub struct StreamHandle {
    pub(crate) id: StreamId,
    pub(crate) config: StreamConfig,
    pub(crate) is_bluetooth: bool,
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.config.direction
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn is_bluetooth(&self) -> bool {
        self.is_bluetooth
    }
}

/// Identifier shared by playback and recording sessions
pub type SessionId = String;

/// Fresh random session identifier
pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}
