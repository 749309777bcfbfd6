pub mod audio;
pub mod config;
pub mod log;

// Re-export the coordinator surface for embedding and tests
pub use audio::{
    AudioEvent, AudioEventBus, AudioEventKind, AudioHardware, AutoSwitchService, DeviceChangePublisher, DeviceInfo,
    DeviceRegistry, Direction, PlaybackSessionCompletionDetector, RecordingActiveGuard, StreamConfig, StreamError,
    StreamLifecycleManager,
};
pub use config::CoordinatorConfig;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use audio::hardware::{CpalHardware, InputSink};
use audio::playback::{spawn_playback_worker, PlaybackDrain};
use audio::recording::{InMemoryMicState, InputLevelMeter, RecordingGate};
use audio::types::{new_session_id, SessionId};

pub const REASON_SHUTDOWN: &str = "shutdown";

/// Everything `run` wires together
pub struct Coordinator {
    pub bus: AudioEventBus,
    pub registry: Arc<DeviceRegistry>,
    pub publisher: DeviceChangePublisher,
    pub manager: Arc<StreamLifecycleManager>,
    pub auto_switch: Arc<AutoSwitchService>,
    pub detector: PlaybackSessionCompletionDetector,
    pub mic: Arc<InMemoryMicState>,
    pub recording: RecordingActiveGuard,
}

impl Coordinator {
    pub fn new(hardware: Arc<dyn AudioHardware>, config: &CoordinatorConfig) -> Self {
        let bus = AudioEventBus::new(config.event_bus_capacity);
        let registry = Arc::new(DeviceRegistry::new(hardware));
        let publisher = DeviceChangePublisher::new(registry.clone(), bus.clone(), Some(config.monitor.clone()));
        let manager = Arc::new(StreamLifecycleManager::new(registry.clone(), Some(config.streams.clone())));
        let auto_switch = Arc::new(AutoSwitchService::new(manager.clone()));
        let detector = PlaybackSessionCompletionDetector::new(bus.clone(), Some(config.playback.clone()));
        let mic = Arc::new(InMemoryMicState::default());
        let recording = RecordingActiveGuard::new(
            mic.clone(),
            auto_switch.clone(),
            bus.clone(),
            Some(config.recording.clone()),
        );

        Self {
            bus,
            registry,
            publisher,
            manager,
            auto_switch,
            detector,
            mic,
            recording,
        }
    }

    /// Input sink for the capture callback; only forwards while a recording is active
    pub fn input_gate(&self, sink: Arc<dyn InputSink>) -> RecordingGate {
        self.recording.callback_gate(sink)
    }

    /// Open the managed input stream on `device` and begin a recording session on it
    pub async fn start_recording(&self, device: &DeviceInfo) -> anyhow::Result<SessionId> {
        let stream = StreamConfig::new(Direction::Input, device.id.clone(), 16_000, 1);
        self.auto_switch
            .open(stream, None)
            .await
            .with_context(|| format!("Failed to open input on '{}'", device.name))?;

        let session_id = new_session_id();
        if !self.recording.begin(&session_id) {
            self.auto_switch.close(Direction::Input).await;
            anyhow::bail!("Another recording session is still active");
        }
        Ok(session_id)
    }

    /// Follow device changes and begin monitoring both directions
    pub fn start(&self) -> bool {
        self.auto_switch.start(&self.bus);
        self.publisher.start_monitoring(true, true)
    }

    pub async fn shutdown(&self) {
        self.publisher.stop_monitoring();
        self.auto_switch.stop();
        self.recording.force_cleanup(Some(REASON_SHUTDOWN)).await;
        for direction in Direction::ALL {
            self.auto_switch.close(direction).await;
        }
    }
}

async fn log_events(mut receiver: broadcast::Receiver<AudioEvent>) {
    loop {
        match receiver.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!("📣 {}", json),
                Err(e) => warn!("⚠️ Could not serialize {} event: {}", event.topic(), e),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => warn!("⚠️ Event log skipped {} event(s)", missed),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_until_interrupted(config: CoordinatorConfig) -> anyhow::Result<()> {
    let hardware = Arc::new(CpalHardware::new()?);
    let coordinator = Coordinator::new(hardware.clone(), &config);

    let (signals, _worker) = spawn_playback_worker(coordinator.detector.clone());
    hardware.set_output_renderer(Some(Arc::new(PlaybackDrain::new(coordinator.detector.clone(), signals))));

    let meter = Arc::new(InputLevelMeter::new());
    hardware.set_input_sink(Some(Arc::new(coordinator.input_gate(meter.clone()))));

    tokio::spawn(log_events(coordinator.bus.subscribe()));

    match coordinator.registry.current_default(Direction::Output) {
        Ok(Some(device)) => {
            let stream = StreamConfig::new(Direction::Output, device.id.clone(), 24_000, 1);
            if let Err(e) = coordinator.auto_switch.open(stream, None).await {
                error!("❌ Could not open output on '{}': {}", device.name, e);
            }
        }
        Ok(None) => warn!("⚠️ No default output device"),
        Err(e) => warn!("⚠️ Default output lookup failed: {}", e),
    }

    if config.capture_on_start {
        match coordinator.registry.current_default(Direction::Input) {
            Ok(Some(device)) => match coordinator.start_recording(&device).await {
                Ok(session_id) => info!("🎙️ Capturing from '{}' as session {}", device.name, session_id),
                Err(e) => error!("❌ {:#}", e),
            },
            Ok(None) => warn!("⚠️ No default input device"),
            Err(e) => warn!("⚠️ Default input lookup failed: {}", e),
        }
    }

    if !coordinator.start() {
        warn!("⚠️ Device monitoring did not start");
    }

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!(
        "👋 Shutting down ({} input samples, peak {:.3})",
        meter.samples_seen(),
        meter.take_peak()
    );
    coordinator.shutdown().await;
    Ok(())
}

/// Load configuration, start the coordinator on the real audio host and run until Ctrl-C
pub fn run() -> anyhow::Result<()> {
    let config = CoordinatorConfig::load_default()?;
    log::init_logging(&config.logging.directive);
    if config.logging.audio_debug {
        log::set_audio_debug(true);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;
    runtime.block_on(run_until_interrupted(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::hardware::FakeHardware;
    use crate::audio::types::{DeviceTransport, RawDevice};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_follows_default_output() {
        let hw = Arc::new(FakeHardware::new());
        hw.set_native_available(true);
        hw.set_default(
            Direction::Output,
            Some(RawDevice::new("speakers", "Built-in Speakers", DeviceTransport::BuiltIn)),
        );
        hw.set_default(Direction::Input, Some(RawDevice::new("mic", "USB Mic", DeviceTransport::Usb)));

        let coordinator = Coordinator::new(hw.clone(), &CoordinatorConfig::default());
        coordinator
            .auto_switch
            .open(StreamConfig::new(Direction::Output, "speakers", 24_000, 1), None)
            .await
            .unwrap();
        assert!(coordinator.start());

        hw.set_default(
            Direction::Output,
            Some(RawDevice::new("airpods", "AirPods Pro", DeviceTransport::Bluetooth)),
        );
        hw.emit_native_change(Direction::Output);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            coordinator.auto_switch.current_device(Direction::Output).await.as_deref(),
            Some("airpods")
        );
        assert_eq!(hw.max_concurrent_active(Direction::Output), 1);

        coordinator.shutdown().await;
        assert_eq!(hw.active_streams(Direction::Output), 0);
        assert!(!coordinator.publisher.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_gates_input_until_shutdown() {
        use crate::audio::recording::{InputLevelMeter, MicState, MicStateMachine};

        let hw = Arc::new(FakeHardware::new());
        hw.set_default(Direction::Input, Some(RawDevice::new("mic", "USB Mic", DeviceTransport::Usb)));
        let coordinator = Coordinator::new(hw.clone(), &CoordinatorConfig::default());
        let meter = Arc::new(InputLevelMeter::new());
        let gate = coordinator.input_gate(meter.clone());

        gate.on_input(&[0.5; 8]);
        assert_eq!(meter.samples_seen(), 0);

        let device = coordinator.registry.current_default(Direction::Input).unwrap().unwrap();
        let session_id = coordinator.start_recording(&device).await.unwrap();
        assert_eq!(coordinator.recording.current_session(), Some(session_id));
        assert_eq!(coordinator.mic.state(), MicState::Recording);
        assert_eq!(hw.active_streams(Direction::Input), 1);

        gate.on_input(&[0.5; 8]);
        assert_eq!(meter.samples_seen(), 8);

        // A second session cannot start on top of the first
        assert!(coordinator.start_recording(&device).await.is_err());
        assert_eq!(hw.max_concurrent_active(Direction::Input), 1);
        assert_eq!(hw.active_streams(Direction::Input), 1);

        let mut events = coordinator.bus.subscribe();
        coordinator.shutdown().await;
        gate.on_input(&[0.5; 8]);
        assert_eq!(meter.samples_seen(), 8);
        assert_eq!(coordinator.mic.state(), MicState::Idle);
        assert_eq!(hw.active_streams(Direction::Input), 0);

        let closed = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e.kind {
                AudioEventKind::MicrophoneClosed(closed) => Some(closed.reason),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(closed, vec![REASON_SHUTDOWN.to_string()]);
    }
}
