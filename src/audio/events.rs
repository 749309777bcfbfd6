use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{DeviceInfo, Direction, SessionId};

pub const TOPIC_DEFAULT_INPUT_CHANGED: &str = "device.default_input_changed";
pub const TOPIC_DEFAULT_OUTPUT_CHANGED: &str = "device.default_output_changed";
pub const TOPIC_MONITORING_STARTED: &str = "device.monitoring_started";
pub const TOPIC_MONITORING_STOPPED: &str = "device.monitoring_stopped";
pub const TOPIC_PLAYBACK_COMPLETED: &str = "playback.completed";
pub const TOPIC_MICROPHONE_CLOSED: &str = "microphone.closed";

/// Which signal source observed a device change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    Native,
    Polling,
}

impl ChangeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeSource::Native => "native",
            ChangeSource::Polling => "polling",
        }
    }
}

/// Default device changed for one direction (debounced)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceChangedEvent {
    pub direction: Direction,
    pub device_name: String,
    pub device_id: String,
    pub is_bluetooth: bool,
    pub source: ChangeSource,
    pub old_device_name: Option<String>,
    pub old_device_id: Option<String>,
}

impl DeviceChangedEvent {
    pub fn new(device: &DeviceInfo, old: Option<&DeviceInfo>, source: ChangeSource) -> Self {
        Self {
            direction: device.direction,
            device_name: device.name.clone(),
            device_id: device.id.clone(),
            is_bluetooth: device.is_bluetooth,
            source,
            old_device_name: old.map(|d| d.name.clone()),
            old_device_id: old.map(|d| d.id.clone()),
        }
    }

    /// Snapshot of the new device carried by this event
    pub fn device(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.device_id.clone(),
            name: self.device_name.clone(),
            direction: self.direction,
            is_bluetooth: self.is_bluetooth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringStartedEvent {
    pub source: ChangeSource,
    pub monitor_input: bool,
    pub monitor_output: bool,
}

/// Terminal event of a playback session.
///
/// `pattern` names how the end was detected (`buffer_drained` or `watchdog_timeout`),
/// `source` names the signal that triggered the final evaluation, and `finished` is false
/// when the session was force-completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackCompletedEvent {
    pub session_id: SessionId,
    pub pattern: String,
    pub source: String,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicrophoneClosedEvent {
    pub session_id: SessionId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "data")]
pub enum AudioEventKind {
    #[serde(rename = "device.default_input_changed")]
    DefaultInputChanged(DeviceChangedEvent),
    #[serde(rename = "device.default_output_changed")]
    DefaultOutputChanged(DeviceChangedEvent),
    #[serde(rename = "device.monitoring_started")]
    MonitoringStarted(MonitoringStartedEvent),
    #[serde(rename = "device.monitoring_stopped")]
    MonitoringStopped,
    #[serde(rename = "playback.completed")]
    PlaybackCompleted(PlaybackCompletedEvent),
    #[serde(rename = "microphone.closed")]
    MicrophoneClosed(MicrophoneClosedEvent),
}

impl AudioEventKind {
    /// Direction-specific changed topic for a device change
    pub fn device_changed(event: DeviceChangedEvent) -> Self {
        match event.direction {
            Direction::Input => AudioEventKind::DefaultInputChanged(event),
            Direction::Output => AudioEventKind::DefaultOutputChanged(event),
        }
    }
}

/// Event published on the audio bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioEvent {
    #[serde(flatten)]
    pub kind: AudioEventKind,
    pub emitted_at: DateTime<Utc>,
}

impl AudioEvent {
    pub fn new(kind: AudioEventKind) -> Self {
        Self {
            kind,
            emitted_at: Utc::now(),
        }
    }

    pub fn device_changed(event: DeviceChangedEvent) -> Self {
        Self::new(AudioEventKind::device_changed(event))
    }

    pub fn topic(&self) -> &'static str {
        match &self.kind {
            AudioEventKind::DefaultInputChanged(_) => TOPIC_DEFAULT_INPUT_CHANGED,
            AudioEventKind::DefaultOutputChanged(_) => TOPIC_DEFAULT_OUTPUT_CHANGED,
            AudioEventKind::MonitoringStarted(_) => TOPIC_MONITORING_STARTED,
            AudioEventKind::MonitoringStopped => TOPIC_MONITORING_STOPPED,
            AudioEventKind::PlaybackCompleted(_) => TOPIC_PLAYBACK_COMPLETED,
            AudioEventKind::MicrophoneClosed(_) => TOPIC_MICROPHONE_CLOSED,
        }
    }

    /// Device change payload, if this is a changed event
    pub fn as_device_change(&self) -> Option<&DeviceChangedEvent> {
        match &self.kind {
            AudioEventKind::DefaultInputChanged(e) | AudioEventKind::DefaultOutputChanged(e) => Some(e),
            _ => None,
        }
    }
}

/// Fan-out bus for coordinator events
#[derive(Debug, Clone)]
pub struct AudioEventBus {
    sender: broadcast::Sender<AudioEvent>,
}

impl AudioEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; having no subscribers is fine
    pub fn publish(&self, kind: AudioEventKind) {
        let event = AudioEvent::new(kind);
        let topic = event.topic();
        match self.sender.send(event) {
            Ok(receivers) => debug!("📣 Published {} to {} subscriber(s)", topic, receivers),
            Err(_) => debug!("📣 Published {} with no subscribers", topic),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for AudioEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
