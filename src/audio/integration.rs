// Automatic device following
//
// Holds the stream handles the application opened through it and, on every debounced
// default-device change, moves the affected direction onto the new device.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use colored::*;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::StreamError;
use super::events::{AudioEventBus, DeviceChangedEvent};
use super::recording::CaptureControl;
use super::streams::{StreamLifecycleManager, StreamOpened, StreamSwitched};
use super::types::{Direction, StreamConfig, StreamHandle, StreamId};

struct AutoSwitchInner {
    manager: Arc<StreamLifecycleManager>,
    handles: Mutex<[Option<StreamHandle>; 2]>,
}

pub struct AutoSwitchService {
    inner: Arc<AutoSwitchInner>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl AutoSwitchService {
    pub fn new(manager: Arc<StreamLifecycleManager>) -> Self {
        Self {
            inner: Arc::new(AutoSwitchInner {
                manager,
                handles: Mutex::new([None, None]),
            }),
            task: StdMutex::new(None),
        }
    }

    /// Open a managed stream; it will follow default-device changes from now on
    pub async fn open(&self, config: StreamConfig, max_retries: Option<u32>) -> Result<StreamId, StreamError> {
        let direction = config.direction;
        let mut handles = self.inner.handles.lock().await;
        let StreamOpened { handle, attempts, .. } = self.inner.manager.create_stream(config, max_retries).await?;
        let id = handle.id();
        debug!("📌 Managing {} {} (opened after {} attempt(s))", direction, id, attempts);
        handles[direction.index()] = Some(handle);
        Ok(id)
    }

    /// Close the managed stream of `direction`; false if there was none or close was unconfirmed
    pub async fn close(&self, direction: Direction) -> bool {
        let mut handles = self.inner.handles.lock().await;
        match handles[direction.index()].take() {
            Some(handle) => {
                let is_bluetooth = handle.is_bluetooth();
                self.inner.manager.close_stream(handle, is_bluetooth).await
            }
            None => false,
        }
    }

    /// Device the managed stream of `direction` currently runs on
    pub async fn current_device(&self, direction: Direction) -> Option<String> {
        self.inner.handles.lock().await[direction.index()]
            .as_ref()
            .map(|h| h.device_id().to_string())
    }

    pub async fn current_stream(&self, direction: Direction) -> Option<StreamId> {
        self.inner.handles.lock().await[direction.index()].as_ref().map(|h| h.id())
    }

    /// Apply one change event; `None` when nothing had to move
    pub async fn handle_change(&self, change: &DeviceChangedEvent) -> Option<Result<StreamSwitched, StreamError>> {
        self.inner.handle_change(change).await
    }

    /// Follow changes published on `bus` until `stop`
    pub fn start(&self, bus: &AudioEventBus) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            warn!("⚠️ Auto-switch already running");
            return;
        }
        let inner = self.inner.clone();
        let receiver = bus.subscribe();
        *task = Some(tokio::spawn(async move { inner.run(receiver).await }));
        info!("🔀 Auto-switch following default device changes");
    }

    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
                info!("🔀 Auto-switch stopped");
            }
        }
    }
}

impl Drop for AutoSwitchService {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AutoSwitchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running = self.task.lock().map(|t| t.is_some()).unwrap_or(false);
        f.debug_struct("AutoSwitchService").field("running", &running).finish()
    }
}

impl AutoSwitchInner {
    async fn run(self: Arc<Self>, mut receiver: broadcast::Receiver<super::events::AudioEvent>) {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Some(change) = event.as_device_change() {
                        self.handle_change(change).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("⚠️ Auto-switch lagged behind by {} event(s)", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_change(&self, change: &DeviceChangedEvent) -> Option<Result<StreamSwitched, StreamError>> {
        let direction = change.direction;
        let mut handles = self.handles.lock().await;
        let slot = &mut handles[direction.index()];
        let handle = slot.as_mut()?;

        if handle.device_id() == change.device_id {
            debug!("🔀 {} already on '{}'", direction, change.device_id);
            return None;
        }

        let target = handle.config().retarget(&change.device());
        let result = self.manager.switch_device(handle, target, None).await;

        match &result {
            Ok(switched) => info!(
                "🔀 {}: {} moved '{}' -> '{}' ({} attempt(s))",
                "AUTO_SWITCH".green(),
                direction,
                switched.previous.device_id,
                change.device_id,
                switched.attempts
            ),
            Err(StreamError::DeviceNotPresent { device_id, .. }) => warn!(
                "⚠️ {}: '{}' vanished before the switch, staying on '{}'",
                "AUTO_SWITCH".yellow(),
                device_id,
                handle.device_id()
            ),
            Err(StreamError::SwitchFailed { restored: true, .. }) => warn!(
                "⚠️ {}: {} switch failed, restored '{}': {}",
                "AUTO_SWITCH".yellow(),
                direction,
                handle.device_id(),
                result.as_ref().err().map(|e| e.to_string()).unwrap_or_default()
            ),
            Err(e) => {
                error!(
                    "❌ {}: {} lost its stream: {} (attempts: {:?}, code: {:?})",
                    "AUTO_SWITCH".red(),
                    direction,
                    e,
                    e.attempts(),
                    e.last_error().map(|err| err.code)
                );
                *slot = None;
            }
        }
        Some(result)
    }
}

/// Stopping capture closes the managed input stream
#[async_trait]
impl CaptureControl for AutoSwitchService {
    async fn stop_capture(&self, session_id: &str) -> anyhow::Result<()> {
        if self.current_stream(Direction::Input).await.is_none() {
            debug!("🎙️ No managed input stream to stop for {}", session_id);
            return Ok(());
        }
        if self.close(Direction::Input).await {
            Ok(())
        } else {
            Err(anyhow::anyhow!("input stream close was not confirmed for session {}", session_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::devices::DeviceRegistry;
    use crate::audio::error::HardwareError;
    use crate::audio::events::ChangeSource;
    use crate::audio::hardware::FakeHardware;
    use crate::audio::types::{DeviceInfo, DeviceTransport, RawDevice};

    fn setup() -> (Arc<FakeHardware>, AutoSwitchService) {
        let hw = Arc::new(FakeHardware::new());
        hw.set_default(
            Direction::Output,
            Some(RawDevice::new("speakers", "Built-in Speakers", DeviceTransport::BuiltIn)),
        );
        hw.add_device(Direction::Output, RawDevice::new("airpods", "AirPods Pro", DeviceTransport::Bluetooth));
        let registry = Arc::new(DeviceRegistry::new(hw.clone()));
        let manager = Arc::new(StreamLifecycleManager::new(registry, None));
        (hw, AutoSwitchService::new(manager))
    }

    fn change_to(id: &str, bluetooth: bool) -> DeviceChangedEvent {
        let device = DeviceInfo {
            id: id.to_string(),
            name: id.to_string(),
            direction: Direction::Output,
            is_bluetooth: bluetooth,
        };
        DeviceChangedEvent::new(&device, None, ChangeSource::Native)
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_moves_managed_stream_and_drops_bt_buffer_hints() {
        let (hw, service) = setup();
        let config = StreamConfig::new(Direction::Output, "speakers", 24_000, 1)
            .with_block_size(256)
            .with_latency(0.02);
        service.open(config, None).await.unwrap();

        let result = service.handle_change(&change_to("airpods", true)).await.unwrap();
        assert!(result.is_ok());
        assert_eq!(service.current_device(Direction::Output).await.as_deref(), Some("airpods"));

        let id = service.current_stream(Direction::Output).await.unwrap();
        let opened = hw.stream_config(id).unwrap();
        assert_eq!(opened.block_size, None);
        assert_eq!(opened.latency, None);
        assert_eq!(hw.max_concurrent_active(Direction::Output), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_without_managed_stream_is_ignored() {
        let (_hw, service) = setup();
        assert!(service.handle_change(&change_to("airpods", true)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_switch_without_restore_forgets_stream() {
        let (hw, service) = setup();
        service
            .open(StreamConfig::new(Direction::Output, "speakers", 24_000, 1), None)
            .await
            .unwrap();
        hw.fail_always("airpods", HardwareError::device_unavailable("connecting"));
        hw.fail_always("speakers", HardwareError::device_unavailable("gone too"));

        let result = service.handle_change(&change_to("airpods", true)).await.unwrap();
        assert!(matches!(result, Err(StreamError::SwitchFailed { restored: false, .. })));
        assert!(service.current_stream(Direction::Output).await.is_none());
        assert_eq!(hw.active_streams(Direction::Output), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_bus_events() {
        let (_hw, service) = setup();
        let bus = AudioEventBus::new(16);
        service
            .open(StreamConfig::new(Direction::Output, "speakers", 24_000, 1), None)
            .await
            .unwrap();
        service.start(&bus);

        bus.publish(crate::audio::events::AudioEventKind::device_changed(change_to("airpods", true)));
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;

        assert_eq!(service.current_device(Direction::Output).await.as_deref(), Some("airpods"));
        service.stop();
    }
}
