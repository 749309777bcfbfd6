use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::registry::DeviceRegistry;
use crate::audio::events::{AudioEventBus, AudioEventKind, ChangeSource, DeviceChangedEvent, MonitoringStartedEvent};
use crate::audio::hardware::NativeSubscription;
use crate::audio::timers::KeyedTimers;
use crate::audio::types::{DeviceInfo, Direction};

/// Polling interval bounds; configured values are clamped into this range
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceMonitorConfig {
    /// Polling interval when no native source is available
    pub poll_interval_ms: u64,

    /// Quiet period a direction must see before a change is published
    pub debounce_ms: u64,

    /// Keep a slow safety-net poll running next to the native source
    pub poll_alongside_native: bool,
}

impl Default for DeviceMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            debounce_ms: 300,
            poll_alongside_native: true,
        }
    }
}

impl DeviceMonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceMonitorStats {
    #[serde(with = "instant_optional_serde")]
    pub monitoring_started_at: Option<Instant>,
    pub native_observations: u64,
    pub polling_observations: u64,
    pub polling_cycles: u64,
    pub polling_errors: u64,
    pub changes_published: u64,
    pub changes_suppressed: u64,
    #[serde(with = "instant_optional_serde")]
    pub last_change_at: Option<Instant>,
}

impl Default for DeviceMonitorStats {
    fn default() -> Self {
        Self {
            monitoring_started_at: None,
            native_observations: 0,
            polling_observations: 0,
            polling_cycles: 0,
            polling_errors: 0,
            changes_published: 0,
            changes_suppressed: 0,
            last_change_at: None,
        }
    }
}

mod instant_optional_serde {
    use serde::{Serialize, Serializer};
    use std::time::SystemTime;
    use tokio::time::Instant;

    pub fn serialize<S>(instant_opt: &Option<Instant>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match instant_opt {
            Some(instant) => {
                let elapsed = instant.elapsed();
                let system_time = SystemTime::now() - elapsed;
                let timestamp = system_time
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                Some(timestamp).serialize(serializer)
            }
            None => None::<u64>.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingChange {
    device: DeviceInfo,
    source: ChangeSource,
}

#[derive(Debug, Default)]
struct PublisherState {
    running: bool,
    /// Bumped on every start/stop; tasks and timers from an older epoch are no-ops
    epoch: u64,
    monitored: [bool; 2],
    native_active: bool,
    last_published: [Option<DeviceInfo>; 2],
    last_observed: [Option<DeviceInfo>; 2],
    pending: [Option<PendingChange>; 2],
    polling_running: bool,
    tasks: Vec<JoinHandle<()>>,
}

struct PublisherShared {
    registry: Arc<DeviceRegistry>,
    bus: AudioEventBus,
    config: DeviceMonitorConfig,
    state: Mutex<PublisherState>,
    debounce: KeyedTimers<Direction>,
    stats: Mutex<DeviceMonitorStats>,
}

/// Debounced default-device change publisher.
///
/// A native OS subscription and a polling loop both feed `observe`, which funnels into a
/// single per-direction debounce timer. Only the device seen last in a quiet window is
/// compared against what was published before, so bursts of intermediate states during a
/// Bluetooth reconnect collapse into at most one event.
pub struct DeviceChangePublisher {
    shared: Arc<PublisherShared>,
}

impl DeviceChangePublisher {
    pub fn new(registry: Arc<DeviceRegistry>, bus: AudioEventBus, config: Option<DeviceMonitorConfig>) -> Self {
        Self {
            shared: Arc::new(PublisherShared {
                registry,
                bus,
                config: config.unwrap_or_default(),
                state: Mutex::new(PublisherState::default()),
                debounce: KeyedTimers::new(),
                stats: Mutex::new(DeviceMonitorStats::default()),
            }),
        }
    }

    /// Start monitoring the requested directions.
    ///
    /// Returns false if monitoring is already running or nothing was requested. The
    /// native source is tried exactly once here; if it cannot be registered the publisher
    /// polls for the rest of the session.
    pub fn start_monitoring(&self, monitor_input: bool, monitor_output: bool) -> bool {
        self.shared.start(monitor_input, monitor_output)
    }

    /// Stop monitoring; pending debounced changes are discarded
    pub fn stop_monitoring(&self) {
        self.shared.stop();
    }

    pub fn get_current_input_device(&self) -> Option<DeviceInfo> {
        self.shared.current_device(Direction::Input)
    }

    pub fn get_current_output_device(&self) -> Option<DeviceInfo> {
        self.shared.current_device(Direction::Output)
    }

    /// Whether the native subscription is what currently drives monitoring
    pub fn is_native_source_available(&self) -> bool {
        self.shared.lock_state().native_active
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock_state().running
    }

    /// Feed an observation from an external source into the reconciliation path.
    ///
    /// Polling observations equal to the last observed device are dropped; native
    /// observations always restart the debounce window.
    pub fn ingest(&self, direction: Direction, observed: Option<DeviceInfo>, source: ChangeSource) {
        let epoch = self.shared.lock_state().epoch;
        self.shared.observe(direction, observed, source, epoch);
    }

    pub fn get_stats(&self) -> DeviceMonitorStats {
        self.shared.lock_stats().clone()
    }
}

impl Drop for DeviceChangePublisher {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        state.running = false;
        state.epoch += 1;
        for task in state.tasks.drain(..) {
            task.abort();
        }
        self.shared.debounce.cancel_all();
    }
}

impl std::fmt::Debug for DeviceChangePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("DeviceChangePublisher")
            .field("running", &state.running)
            .field("native_active", &state.native_active)
            .field("config", &self.shared.config)
            .finish()
    }
}

impl PublisherShared {
    fn lock_state(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_stats(&self) -> MutexGuard<'_, DeviceMonitorStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start(self: &Arc<Self>, monitor_input: bool, monitor_output: bool) -> bool {
        if !monitor_input && !monitor_output {
            warn!("⚠️ start_monitoring called with no direction to monitor");
            return false;
        }

        let mut state = self.lock_state();
        if state.running {
            warn!("⚠️ Device monitoring already started");
            return false;
        }

        info!("🔍 Starting device change monitoring (input: {}, output: {})", monitor_input, monitor_output);

        state.running = true;
        state.epoch += 1;
        state.monitored = [monitor_input, monitor_output];
        state.pending = [None, None];
        state.last_published = [None, None];
        state.last_observed = [None, None];

        for direction in Direction::ALL {
            if !state.monitored[direction.index()] {
                continue;
            }
            match self.registry.current_default(direction) {
                Ok(device) => {
                    debug!("🎧 Initial default {} device: {:?}", direction, device.as_ref().map(|d| &d.name));
                    state.last_published[direction.index()] = device.clone();
                    state.last_observed[direction.index()] = device;
                }
                Err(e) => warn!("⚠️ Could not read initial default {} device: {}", direction, e),
            }
        }

        *self.lock_stats() = DeviceMonitorStats {
            monitoring_started_at: Some(Instant::now()),
            ..DeviceMonitorStats::default()
        };

        let epoch = state.epoch;
        let source = match self.registry.hardware().subscribe_default_changes() {
            Ok(subscription) => {
                state.native_active = true;
                let shared = Arc::clone(self);
                state
                    .tasks
                    .push(tokio::spawn(async move { shared.native_loop(subscription, epoch).await }));
                if self.config.poll_alongside_native {
                    self.spawn_polling(&mut state, MAX_POLL_INTERVAL);
                }
                ChangeSource::Native
            }
            Err(e) => {
                info!("ℹ️ Native device notifications unavailable ({}), falling back to polling", e);
                state.native_active = false;
                self.spawn_polling(&mut state, self.config.poll_interval());
                ChangeSource::Polling
            }
        };

        self.bus.publish(AudioEventKind::MonitoringStarted(MonitoringStartedEvent {
            source,
            monitor_input,
            monitor_output,
        }));

        info!("✅ Device change monitoring started ({})", source.as_str());
        true
    }

    fn stop(&self) {
        let mut state = self.lock_state();
        if !state.running {
            return;
        }

        state.running = false;
        state.epoch += 1;
        state.native_active = false;
        state.polling_running = false;
        state.pending = [None, None];
        for task in state.tasks.drain(..) {
            task.abort();
        }
        self.debounce.cancel_all();

        self.bus.publish(AudioEventKind::MonitoringStopped);
        info!("🛑 Device change monitoring stopped");
    }

    fn current_device(&self, direction: Direction) -> Option<DeviceInfo> {
        {
            let state = self.lock_state();
            if state.running && state.monitored[direction.index()] {
                return state.last_published[direction.index()].clone();
            }
        }
        self.registry.current_default(direction).ok().flatten()
    }

    fn spawn_polling(self: &Arc<Self>, state: &mut PublisherState, period: Duration) {
        if state.polling_running {
            return;
        }
        state.polling_running = true;
        let shared = Arc::clone(self);
        let epoch = state.epoch;
        state
            .tasks
            .push(tokio::spawn(async move { shared.polling_loop(period, epoch).await }));
        debug!("🔄 Polling default devices every {:?}", period);
    }

    async fn native_loop(self: Arc<Self>, mut subscription: NativeSubscription, epoch: u64) {
        while let Some(direction) = subscription.recv().await {
            if !self.is_current(epoch) {
                return;
            }
            crate::device_debug!("🔔 Native default {} device notification", direction);
            match self.registry.current_default(direction) {
                Ok(observed) => self.observe(direction, observed, ChangeSource::Native, epoch),
                Err(e) => warn!("⚠️ Failed to read default {} device after notification: {}", direction, e),
            }
        }

        // The native source went away mid-session; keep going on polling only
        let mut state = self.lock_state();
        if state.epoch == epoch && state.running {
            warn!("⚠️ Native device notifications ended, continuing with polling");
            state.native_active = false;
            let period = self.config.poll_interval();
            self.spawn_polling(&mut state, period);
        }
    }

    async fn polling_loop(self: Arc<Self>, period: Duration, epoch: u64) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately; the initial state was read at start
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !self.is_current(epoch) {
                break;
            }
            self.poll_once(epoch);
        }
    }

    fn poll_once(self: &Arc<Self>, epoch: u64) {
        let monitored = self.lock_state().monitored;
        self.lock_stats().polling_cycles += 1;

        for direction in Direction::ALL {
            if !monitored[direction.index()] {
                continue;
            }
            match self.registry.current_default(direction) {
                Ok(observed) => self.observe(direction, observed, ChangeSource::Polling, epoch),
                Err(e) => {
                    self.lock_stats().polling_errors += 1;
                    debug!("⚠️ Polling default {} device failed: {}", direction, e);
                }
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        let state = self.lock_state();
        state.running && state.epoch == epoch
    }

    /// Single entry point for both sources
    fn observe(self: &Arc<Self>, direction: Direction, observed: Option<DeviceInfo>, source: ChangeSource, epoch: u64) {
        let slot = direction.index();
        let mut state = self.lock_state();
        if !state.running || state.epoch != epoch || !state.monitored[slot] {
            return;
        }

        if source == ChangeSource::Polling {
            let unchanged = match (&state.last_observed[slot], &observed) {
                (Some(previous), Some(current)) => previous.same_device(current),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                return;
            }
        }
        state.last_observed[slot] = observed.clone();

        let Some(device) = observed else {
            debug!("🔌 No default {} device right now", direction);
            return;
        };

        {
            let mut stats = self.lock_stats();
            match source {
                ChangeSource::Native => stats.native_observations += 1,
                ChangeSource::Polling => stats.polling_observations += 1,
            }
        }

        crate::device_debug!("🔁 {} observed default {} device '{}'", source.as_str(), direction, device.name);
        state.pending[slot] = Some(PendingChange { device, source });

        let shared = Arc::clone(self);
        self.debounce.schedule(direction, self.config.debounce(), move |_| async move {
            shared.flush_pending(direction, epoch);
        });
    }

    /// Debounce window elapsed for `direction`
    fn flush_pending(&self, direction: Direction, epoch: u64) {
        let slot = direction.index();
        let mut state = self.lock_state();
        if !state.running || state.epoch != epoch {
            return;
        }
        let Some(pending) = state.pending[slot].take() else {
            return;
        };

        let changed = match &state.last_published[slot] {
            Some(previous) => !previous.same_device(&pending.device),
            None => true,
        };
        if !changed {
            self.lock_stats().changes_suppressed += 1;
            debug!("↩️ Default {} device settled back on '{}', nothing to publish", direction, pending.device.name);
            return;
        }

        let old = state.last_published[slot].replace(pending.device.clone());
        let event = DeviceChangedEvent::new(&pending.device, old.as_ref(), pending.source);

        info!(
            "🎧 Default {} device changed: '{}' -> '{}' (bluetooth: {}, source: {})",
            direction,
            old.as_ref().map(|d| d.name.as_str()).unwrap_or("<none>"),
            pending.device.name,
            pending.device.is_bluetooth,
            pending.source.as_str()
        );

        {
            let mut stats = self.lock_stats();
            stats.changes_published += 1;
            stats.last_change_at = Some(Instant::now());
        }

        // Published under the state lock so it can never interleave with a stop
        self.bus.publish(AudioEventKind::device_changed(event));
    }
}
