// Audio module - device and stream lifecycle coordination
//
// - types: device snapshots, stream configs and handles
// - error: hardware, stream and configuration errors
// - events: event bus and the published payloads
// - timers: keyed cancellable delayed tasks (debounce, watchdogs)
// - hardware: the `AudioHardware` seam (cpal, CoreAudio notifications, fake)
// - devices: device registry and debounced default-device change publisher
// - streams: per-direction stream lifecycle manager
// - playback: playback session completion detection and drain
// - recording: recording active guard
// - integration: auto-switching managed streams on device changes

pub mod devices;
pub mod error;
pub mod events;
pub mod hardware;
pub mod integration;
pub mod playback;
pub mod recording;
pub mod streams;
pub mod timers;
pub mod types;

pub use devices::{DeviceChangePublisher, DeviceMonitorConfig, DeviceMonitorStats, DeviceRegistry};
pub use error::{ConfigError, HardwareError, StreamError};
pub use events::{AudioEvent, AudioEventBus, AudioEventKind, ChangeSource, DeviceChangedEvent};
pub use hardware::{AudioHardware, CpalHardware, FakeHardware, InputSink, OutputRenderer};
pub use integration::AutoSwitchService;
pub use playback::{
    spawn_playback_worker, CompletionStatus, PlaybackChunk, PlaybackConfig, PlaybackDrain,
    PlaybackSessionCompletionDetector, PlaybackSignalSender, WatchdogPolicy,
};
pub use recording::{RecordingActiveGuard, RecordingGuardConfig};
pub use streams::{StreamLifecycleConfig, StreamLifecycleManager, StreamOpened, StreamSwitched};
pub use timers::KeyedTimers;
pub use types::{DeviceInfo, Direction, StreamConfig, StreamHandle, StreamId};
