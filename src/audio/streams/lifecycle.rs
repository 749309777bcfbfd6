// Stream lifecycle management
//
// Owns the single live hardware stream of each direction. Create, close and switch for
// one direction run under that direction's async mutex, and a new stream is only opened
// once the hardware has confirmed the previous one inactive.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use colored::*;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard as AsyncMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::safe_config::SafeConfigCache;
use crate::audio::devices::DeviceRegistry;
use crate::audio::error::{HardwareError, StreamError, DEFAULT_TRANSIENT_CODES};
use crate::audio::hardware::AudioHardware;
use crate::audio::types::{Direction, StreamConfig, StreamHandle, StreamId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamLifecycleConfig {
    /// Settle delay after closing a Bluetooth stream
    pub bt_settle_ms: u64,
    /// Settle delay after closing a wired stream
    pub wired_settle_ms: u64,
    /// First retry delay; doubled per attempt
    pub backoff_base_ms: u64,
    /// Extra backoff factor for Bluetooth targets
    pub bt_backoff_multiplier: f64,
    /// Open attempts before giving up (the safe-config retry comes on top)
    pub max_retries: u32,
    pub close_confirm_timeout_ms: u64,
    pub close_poll_interval_ms: u64,
    /// Hardware error codes treated as transient
    pub transient_error_codes: Vec<i32>,
}

impl Default for StreamLifecycleConfig {
    fn default() -> Self {
        Self {
            bt_settle_ms: 2_500,
            wired_settle_ms: 300,
            backoff_base_ms: 500,
            bt_backoff_multiplier: 2.0,
            max_retries: 3,
            close_confirm_timeout_ms: 2_000,
            close_poll_interval_ms: 20,
            transient_error_codes: DEFAULT_TRANSIENT_CODES.to_vec(),
        }
    }
}

impl StreamLifecycleConfig {
    pub fn settle_delay(&self, is_bluetooth: bool) -> Duration {
        if is_bluetooth {
            Duration::from_millis(self.bt_settle_ms)
        } else {
            Duration::from_millis(self.wired_settle_ms)
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    ///
    /// Transient failures back off exponentially (`base * 2^(attempt-1)`, scaled by the
    /// Bluetooth multiplier); other failures are retried after the flat base delay.
    pub fn backoff(&self, attempt: u32, is_bluetooth: bool, transient: bool) -> Duration {
        let base = Duration::from_millis(self.backoff_base_ms);
        if !transient {
            return base;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let mut delay = base.saturating_mul(1u32 << exponent);
        if is_bluetooth {
            delay = delay.mul_f64(self.bt_backoff_multiplier.max(1.0));
        }
        delay
    }

    pub fn close_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.close_confirm_timeout_ms)
    }

    pub fn close_poll_interval(&self) -> Duration {
        Duration::from_millis(self.close_poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamMetrics {
    pub opens_attempted: u64,
    pub opens_succeeded: u64,
    pub opens_failed: u64,
    pub transient_failures: u64,
    pub safe_config_fallbacks: u64,
    pub closes_confirmed: u64,
    pub closes_unconfirmed: u64,
    pub switches_completed: u64,
    pub switches_failed: u64,
    pub restores: u64,
}

/// Successful open, with the retry history that led to it
#[derive(Debug)]
pub struct StreamOpened {
    pub handle: StreamHandle,
    pub attempts: u32,
    /// Last error seen before the successful attempt
    pub last_error: Option<HardwareError>,
    pub used_safe_config: bool,
}

/// Successful switch; the caller's handle now refers to the new stream
#[derive(Debug)]
pub struct StreamSwitched {
    pub previous: StreamConfig,
    pub attempts: u32,
    pub last_error: Option<HardwareError>,
    pub used_safe_config: bool,
}

#[derive(Debug, Clone)]
struct ActiveStream {
    id: StreamId,
    config: StreamConfig,
    is_bluetooth: bool,
    /// Close was requested but never confirmed; nobody holds a handle to it anymore
    orphaned: bool,
}

#[derive(Debug, Default)]
struct DirectionSlot {
    active: Option<ActiveStream>,
}

struct OpenOutcome {
    id: StreamId,
    config: StreamConfig,
    is_bluetooth: bool,
    attempts: u32,
    last_error: Option<HardwareError>,
    used_safe_config: bool,
}

impl OpenOutcome {
    fn handle(&self) -> StreamHandle {
        StreamHandle {
            id: self.id,
            config: self.config.clone(),
            is_bluetooth: self.is_bluetooth,
        }
    }
}

/// Owner of the per-direction hardware streams
pub struct StreamLifecycleManager {
    hardware: Arc<dyn AudioHardware>,
    registry: Arc<DeviceRegistry>,
    config: StreamLifecycleConfig,
    slots: [Mutex<DirectionSlot>; 2],
    safe_configs: SafeConfigCache,
    metrics: StdMutex<StreamMetrics>,
}

impl StreamLifecycleManager {
    pub fn new(registry: Arc<DeviceRegistry>, config: Option<StreamLifecycleConfig>) -> Self {
        Self {
            hardware: registry.hardware().clone(),
            registry,
            config: config.unwrap_or_default(),
            slots: [Mutex::new(DirectionSlot::default()), Mutex::new(DirectionSlot::default())],
            safe_configs: SafeConfigCache::new(),
            metrics: StdMutex::new(StreamMetrics::default()),
        }
    }

    pub fn config(&self) -> &StreamLifecycleConfig {
        &self.config
    }

    fn metrics_mut(&self) -> MutexGuard<'_, StreamMetrics> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn metrics(&self) -> StreamMetrics {
        self.metrics_mut().clone()
    }

    /// Last config known to open on `device_id`
    pub fn safe_config(&self, direction: Direction, device_id: &str) -> Option<StreamConfig> {
        self.safe_configs.get(direction, device_id)
    }

    /// Stream currently owned for `direction`, if any
    pub async fn active_stream(&self, direction: Direction) -> Option<StreamId> {
        self.slots[direction.index()].lock().await.active.as_ref().map(|a| a.id)
    }

    fn is_bluetooth_target(&self, config: &StreamConfig) -> bool {
        self.registry.is_bluetooth(config.direction, &config.device_id)
    }

    /// Open a stream for `config.direction`.
    ///
    /// Fails with `DirectionOccupied` while another live stream owns the direction.
    pub async fn create_stream(
        &self,
        config: StreamConfig,
        max_retries: Option<u32>,
    ) -> Result<StreamOpened, StreamError> {
        let direction = config.direction;
        let mut slot = self.slots[direction.index()].lock().await;

        self.reclaim_slot(&mut slot, direction).await?;

        let outcome = self.open_with_retries(&config, max_retries).await?;
        let handle = outcome.handle();
        Self::install(&mut slot, &outcome);
        info!(
            "✅ Opened {} {} on '{}' (attempts: {}, safe config: {})",
            direction, outcome.id, outcome.config.device_id, outcome.attempts, outcome.used_safe_config
        );

        Ok(StreamOpened {
            handle,
            attempts: outcome.attempts,
            last_error: outcome.last_error,
            used_safe_config: outcome.used_safe_config,
        })
    }

    /// Close the stream behind `handle`.
    ///
    /// Returns true once the hardware confirmed the stream inactive. The settle delay runs
    /// before the direction is released to the next caller.
    pub async fn close_stream(&self, handle: StreamHandle, is_bluetooth: bool) -> bool {
        let direction = handle.direction();
        let mut slot = self.slots[direction.index()].lock().await;

        match slot.active.as_ref() {
            Some(active) if active.id == handle.id => {}
            _ => {
                warn!("⚠️ close_stream: {}", StreamError::StaleHandle { direction, stream: handle.id });
                return false;
            }
        }

        self.close_locked(&mut slot, direction, handle.id, is_bluetooth).await
    }

    /// Move `handle`'s direction onto `new_config`.
    ///
    /// The target must be present before anything is touched; otherwise the current stream
    /// is kept and `DeviceNotPresent` is returned. The current stream is then closed and
    /// confirmed inactive before the new one opens. If every open attempt fails, one
    /// restore of the previous config is attempted; when it works `handle` refers to the
    /// restored stream, otherwise it is left dangling and the direction has no stream.
    pub async fn switch_device(
        &self,
        handle: &mut StreamHandle,
        new_config: StreamConfig,
        max_retries: Option<u32>,
    ) -> Result<StreamSwitched, StreamError> {
        let direction = handle.direction();
        if new_config.direction != direction {
            return Err(StreamError::System(anyhow::anyhow!(
                "cannot switch a {} stream to a {} config",
                direction,
                new_config.direction
            )));
        }

        let mut slot = self.slots[direction.index()].lock().await;
        match slot.active.as_ref() {
            Some(active) if active.id == handle.id => {}
            _ => {
                return Err(StreamError::StaleHandle {
                    direction,
                    stream: handle.id,
                })
            }
        }

        if !self.registry.is_present(direction, &new_config.device_id) {
            warn!(
                "⚠️ {}: '{}' is not present, keeping {} on '{}'",
                "SWITCH_PREFLIGHT".yellow(),
                new_config.device_id,
                handle.id,
                handle.device_id()
            );
            return Err(StreamError::DeviceNotPresent {
                direction,
                device_id: new_config.device_id,
            });
        }

        info!(
            "🔄 Switching {} from '{}' to '{}'",
            direction,
            handle.device_id(),
            new_config.device_id
        );

        let previous = handle.config().clone();
        let old_is_bluetooth = handle.is_bluetooth();
        if !self.close_locked(&mut slot, direction, handle.id, old_is_bluetooth).await {
            self.metrics_mut().switches_failed += 1;
            return Err(StreamError::CloseUnconfirmed {
                direction,
                stream: handle.id,
                waited_ms: self.config.close_confirm_timeout_ms,
            });
        }

        match self.open_with_retries(&new_config, max_retries).await {
            Ok(outcome) => {
                *handle = outcome.handle();
                Self::install(&mut slot, &outcome);
                self.metrics_mut().switches_completed += 1;
                info!(
                    "✅ Switched {} to '{}' as {} after {} attempt(s)",
                    direction, outcome.config.device_id, outcome.id, outcome.attempts
                );
                Ok(StreamSwitched {
                    previous,
                    attempts: outcome.attempts,
                    last_error: outcome.last_error,
                    used_safe_config: outcome.used_safe_config,
                })
            }
            Err(err) => {
                self.metrics_mut().switches_failed += 1;
                let attempts = err.attempts().unwrap_or(0);
                let last_error = err
                    .last_error()
                    .cloned()
                    .unwrap_or_else(|| HardwareError::other(err.to_string()));

                error!(
                    "❌ {}: '{}' failed after {} attempt(s) (code {}): {}",
                    "SWITCH_FAILED".red(),
                    new_config.device_id,
                    attempts,
                    last_error.code,
                    last_error.message
                );

                let restored = match self.hardware.open_stream(&previous) {
                    Ok(id) => {
                        let outcome = OpenOutcome {
                            id,
                            config: previous.clone(),
                            is_bluetooth: old_is_bluetooth,
                            attempts: 1,
                            last_error: None,
                            used_safe_config: false,
                        };
                        *handle = outcome.handle();
                        Self::install(&mut slot, &outcome);
                        self.metrics_mut().restores += 1;
                        info!("↩️ Restored {} on '{}' as {}", direction, previous.device_id, id);
                        true
                    }
                    Err(restore_err) => {
                        error!(
                            "❌ {}: could not restore '{}' (code {}): {}",
                            "RESTORE_FAILED".red(),
                            previous.device_id,
                            restore_err.code,
                            restore_err.message
                        );
                        false
                    }
                };

                Err(StreamError::SwitchFailed {
                    device_id: new_config.device_id,
                    attempts,
                    last_error,
                    restored,
                })
            }
        }
    }

    fn install(slot: &mut AsyncMutexGuard<'_, DirectionSlot>, outcome: &OpenOutcome) {
        slot.active = Some(ActiveStream {
            id: outcome.id,
            config: outcome.config.clone(),
            is_bluetooth: outcome.is_bluetooth,
            orphaned: false,
        });
    }

    /// Make sure the direction is free before opening
    async fn reclaim_slot(
        &self,
        slot: &mut AsyncMutexGuard<'_, DirectionSlot>,
        direction: Direction,
    ) -> Result<(), StreamError> {
        let Some(active) = slot.active.clone() else {
            return Ok(());
        };

        if !self.hardware.is_stream_active(active.id) {
            debug!("🧹 {} {} already inactive, releasing slot", direction, active.id);
            slot.active = None;
            return Ok(());
        }

        if !active.orphaned {
            return Err(StreamError::DirectionOccupied {
                direction,
                active: active.id,
            });
        }

        warn!("⚠️ Retrying close of unconfirmed {} {} on '{}'", direction, active.id, active.config.device_id);
        if self.close_locked(slot, direction, active.id, active.is_bluetooth).await {
            Ok(())
        } else {
            Err(StreamError::CloseUnconfirmed {
                direction,
                stream: active.id,
                waited_ms: self.config.close_confirm_timeout_ms,
            })
        }
    }

    /// Poll until the hardware reports `stream` inactive or the timeout passes
    async fn await_inactive(&self, stream: StreamId) -> bool {
        let deadline = Instant::now() + self.config.close_confirm_timeout();
        loop {
            if !self.hardware.is_stream_active(stream) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.close_poll_interval()).await;
        }
    }

    async fn close_locked(
        &self,
        slot: &mut AsyncMutexGuard<'_, DirectionSlot>,
        direction: Direction,
        stream: StreamId,
        is_bluetooth: bool,
    ) -> bool {
        debug!("⏹️ Closing {} {}", direction, stream);
        if let Err(e) = self.hardware.request_stop(stream) {
            warn!("⚠️ Stop request for {} failed (code {}): {}", stream, e.code, e.message);
        }

        let mut confirmed = self.await_inactive(stream).await;
        if !confirmed {
            warn!(
                "⚠️ {}: {} still active after {} ms, aborting",
                "CLOSE_TIMEOUT".yellow(),
                stream,
                self.config.close_confirm_timeout_ms
            );
            self.hardware.abort_stream(stream);
            confirmed = !self.hardware.is_stream_active(stream);
        }

        if confirmed {
            slot.active = None;
            self.metrics_mut().closes_confirmed += 1;
        } else {
            if let Some(active) = slot.active.as_mut() {
                active.orphaned = true;
            }
            self.metrics_mut().closes_unconfirmed += 1;
            error!(
                "❌ {}: {} on {} could not be confirmed inactive",
                "CLOSE_UNCONFIRMED".red(),
                stream,
                direction
            );
        }

        // Give the device time to release before anyone opens it again
        tokio::time::sleep(self.config.settle_delay(is_bluetooth)).await;
        confirmed
    }

    async fn open_with_retries(
        &self,
        config: &StreamConfig,
        max_retries: Option<u32>,
    ) -> Result<OpenOutcome, StreamError> {
        let is_bluetooth = self.is_bluetooth_target(config);
        let requested = if is_bluetooth {
            if config.block_size.is_some() || config.latency.is_some() {
                debug!("🎧 Dropping block size and latency for Bluetooth '{}'", config.device_id);
            }
            config.clone().for_bluetooth()
        } else {
            config.clone()
        };
        let config = &requested;
        let max_attempts = max_retries.unwrap_or(self.config.max_retries).max(1);
        let mut last_error: Option<HardwareError> = None;
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            attempts = attempt;
            self.metrics_mut().opens_attempted += 1;

            match self.hardware.open_stream(config) {
                Ok(id) => {
                    self.metrics_mut().opens_succeeded += 1;
                    self.safe_configs.record(config);
                    return Ok(OpenOutcome {
                        id,
                        config: config.clone(),
                        is_bluetooth,
                        attempts,
                        last_error,
                        used_safe_config: false,
                    });
                }
                Err(e) => {
                    let transient = e.is_transient_in(&self.config.transient_error_codes);
                    {
                        let mut metrics = self.metrics_mut();
                        metrics.opens_failed += 1;
                        if transient {
                            metrics.transient_failures += 1;
                        }
                    }
                    warn!(
                        device = %config.device_id,
                        code = e.code,
                        attempt,
                        max_attempts,
                        transient,
                        bluetooth = is_bluetooth,
                        "⚠️ Failed to open {} stream: {}",
                        config.direction,
                        e.message
                    );

                    if attempt < max_attempts {
                        let delay = self.config.backoff(attempt, is_bluetooth, transient);
                        debug!("⏳ Retrying '{}' in {:?}", config.device_id, delay);
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let safe = self
            .safe_configs
            .fallback_for(config)
            .map(|safe| if is_bluetooth { safe.for_bluetooth() } else { safe })
            .filter(|safe| safe != config);
        if let Some(safe) = safe {
            attempts += 1;
            info!("🛟 Retrying '{}' with last known-good config", safe.device_id);
            self.metrics_mut().opens_attempted += 1;
            match self.hardware.open_stream(&safe) {
                Ok(id) => {
                    let mut metrics = self.metrics_mut();
                    metrics.opens_succeeded += 1;
                    metrics.safe_config_fallbacks += 1;
                    return Ok(OpenOutcome {
                        id,
                        config: safe,
                        is_bluetooth,
                        attempts,
                        last_error,
                        used_safe_config: true,
                    });
                }
                Err(e) => {
                    self.metrics_mut().opens_failed += 1;
                    warn!(device = %safe.device_id, code = e.code, "⚠️ Safe config failed too: {}", e.message);
                    last_error = Some(e);
                }
            }
        }

        let last_error = last_error.unwrap_or_else(|| HardwareError::other("no open attempt was made"));
        error!(
            "❌ {}: '{}' after {} attempt(s), last code {}",
            "OPEN_EXHAUSTED".red(),
            config.device_id,
            attempts,
            last_error.code
        );
        Err(StreamError::Exhausted {
            device_id: config.device_id.clone(),
            attempts,
            last_error,
        })
    }
}

impl std::fmt::Debug for StreamLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLifecycleManager")
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::error::{DEVICE_UNAVAILABLE, UNSPECIFIED_HOST_ERROR};
    use crate::audio::hardware::{FakeHardware, HardwareCall, MockAudioHardware};
    use crate::audio::types::{DeviceTransport, RawDevice};

    fn fake_with_devices() -> Arc<FakeHardware> {
        let hw = Arc::new(FakeHardware::new());
        hw.set_default(
            Direction::Output,
            Some(RawDevice::new("speakers", "Built-in Speakers", DeviceTransport::BuiltIn)),
        );
        hw.add_device(
            Direction::Output,
            RawDevice::new("airpods", "AirPods Pro", DeviceTransport::Bluetooth),
        );
        hw.set_default(
            Direction::Input,
            Some(RawDevice::new("mic", "USB Mic", DeviceTransport::Usb)),
        );
        hw
    }

    fn manager(hw: Arc<FakeHardware>) -> StreamLifecycleManager {
        let registry = Arc::new(DeviceRegistry::new(hw));
        registry.enumerate(Direction::Output).unwrap();
        StreamLifecycleManager::new(registry, None)
    }

    fn speakers() -> StreamConfig {
        StreamConfig::new(Direction::Output, "speakers", 24_000, 1)
            .with_block_size(512)
            .with_latency(0.05)
    }

    #[test]
    fn test_backoff_schedule() {
        let config = StreamLifecycleConfig::default();
        assert_eq!(config.backoff(1, false, true), Duration::from_millis(500));
        assert_eq!(config.backoff(2, false, true), Duration::from_millis(1_000));
        assert_eq!(config.backoff(3, false, true), Duration::from_millis(2_000));
        assert_eq!(config.backoff(1, true, true), Duration::from_millis(1_000));
        assert_eq!(config.backoff(2, true, true), Duration::from_millis(2_000));
        assert_eq!(config.backoff(3, true, false), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bluetooth_transient_failures_then_success() {
        let mut hw = MockAudioHardware::new();
        let mut calls = 0;
        hw.expect_open_stream().times(3).returning(move |_| {
            calls += 1;
            if calls < 3 {
                Err(HardwareError::device_unavailable("device busy"))
            } else {
                Ok(StreamId(42))
            }
        });
        let registry = Arc::new(DeviceRegistry::new(Arc::new(hw)));
        let manager = StreamLifecycleManager::new(registry, None);

        let started = Instant::now();
        let opened = manager
            .create_stream(StreamConfig::new(Direction::Output, "AirPods Pro", 24_000, 1), Some(3))
            .await
            .unwrap();

        assert_eq!(opened.attempts, 3);
        assert_eq!(opened.handle.id(), StreamId(42));
        assert!(opened.handle.is_bluetooth());
        assert_eq!(opened.last_error.map(|e| e.code), Some(DEVICE_UNAVAILABLE));
        // 0.5 s * 2 then 1 s * 2 with the Bluetooth multiplier
        assert!(started.elapsed() >= Duration::from_millis(3_000));
        assert_eq!(manager.metrics().transient_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts_and_leaves_direction_empty() {
        let hw = fake_with_devices();
        hw.fail_always("speakers", HardwareError::new(UNSPECIFIED_HOST_ERROR, "format rejected"));
        let manager = manager(hw.clone());

        let err = manager.create_stream(speakers(), Some(2)).await.unwrap_err();
        assert_eq!(err.attempts(), Some(2));
        assert_eq!(err.last_error().map(|e| e.code), Some(UNSPECIFIED_HOST_ERROR));
        assert!(manager.active_stream(Direction::Output).await.is_none());
        assert_eq!(hw.active_streams(Direction::Output), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safe_config_fallback_after_exhaustion() {
        let hw = fake_with_devices();
        let manager = manager(hw.clone());

        let first = manager.create_stream(speakers(), None).await.unwrap();
        assert!(manager.close_stream(first.handle, false).await);

        let aggressive = speakers().with_block_size(64);
        hw.fail_next_opens(
            "speakers",
            vec![
                HardwareError::internal("buffer size rejected"),
                HardwareError::internal("buffer size rejected"),
            ],
        );
        let opened = manager.create_stream(aggressive, Some(2)).await.unwrap();
        assert!(opened.used_safe_config);
        assert_eq!(opened.attempts, 3);
        assert_eq!(opened.handle.config().block_size, Some(512));
        assert_eq!(manager.metrics().safe_config_fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bluetooth_open_drops_block_size_and_latency() {
        let hw = fake_with_devices();
        let manager = manager(hw.clone());

        let requested = StreamConfig::new(Direction::Output, "airpods", 24_000, 1)
            .with_block_size(256)
            .with_latency(0.02);
        let opened = manager.create_stream(requested, None).await.unwrap();

        assert!(opened.handle.is_bluetooth());
        assert_eq!(opened.handle.config().block_size, None);
        assert_eq!(opened.handle.config().latency, None);
        let sent = hw.stream_config(opened.handle.id()).unwrap();
        assert_eq!(sent.block_size, None);
        assert_eq!(sent.latency, None);
        assert_eq!(sent.sample_rate, 24_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_to_bluetooth_drops_block_size_and_latency() {
        let hw = fake_with_devices();
        let manager = manager(hw.clone());

        let mut handle = manager.create_stream(speakers(), None).await.unwrap().handle;
        let target = speakers();
        let target = StreamConfig {
            device_id: "airpods".to_string(),
            ..target
        };
        manager.switch_device(&mut handle, target, None).await.unwrap();

        assert_eq!(handle.device_id(), "airpods");
        let sent = hw.stream_config(handle.id()).unwrap();
        assert_eq!(sent.block_size, None);
        assert_eq!(sent.latency, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_create_is_rejected_while_active() {
        let hw = fake_with_devices();
        let manager = manager(hw.clone());

        let opened = manager.create_stream(speakers(), None).await.unwrap();
        let err = manager.create_stream(speakers(), None).await.unwrap_err();
        assert!(matches!(err, StreamError::DirectionOccupied { direction: Direction::Output, .. }));
        assert_eq!(hw.max_concurrent_active(Direction::Output), 1);

        // Input is independent
        manager
            .create_stream(StreamConfig::new(Direction::Input, "mic", 16_000, 1), None)
            .await
            .unwrap();
        assert_eq!(manager.active_stream(Direction::Output).await, Some(opened.handle.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_confirmation_and_settles() {
        let hw = fake_with_devices();
        hw.set_stop_delay_polls(5);
        let manager = manager(hw.clone());

        let opened = manager.create_stream(speakers(), None).await.unwrap();
        let started = Instant::now();
        assert!(manager.close_stream(opened.handle, false).await);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(hw.active_streams(Direction::Output), 0);
        assert!(manager.active_stream(Direction::Output).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_stream_close_is_unconfirmed_and_blocks_direction() {
        let hw = fake_with_devices();
        let manager = manager(hw.clone());

        let opened = manager.create_stream(speakers(), None).await.unwrap();
        hw.set_stuck_streams(true);
        assert!(!manager.close_stream(opened.handle, false).await);
        assert!(hw.timeline().iter().any(|c| matches!(c, HardwareCall::Abort(_))));

        let err = manager.create_stream(speakers(), Some(1)).await.unwrap_err();
        assert!(matches!(err, StreamError::CloseUnconfirmed { .. }));
        assert_eq!(hw.max_concurrent_active(Direction::Output), 1);

        hw.set_stuck_streams(false);
        assert!(manager.create_stream(speakers(), Some(1)).await.is_ok());
        assert_eq!(hw.max_concurrent_active(Direction::Output), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_closes_before_opening() {
        let hw = fake_with_devices();
        hw.set_stop_delay_polls(3);
        let manager = manager(hw.clone());

        let mut handle = manager.create_stream(speakers(), None).await.unwrap().handle;
        let old_id = handle.id();
        let target = StreamConfig::new(Direction::Output, "airpods", 24_000, 1);
        let switched = manager.switch_device(&mut handle, target, None).await.unwrap();

        assert_eq!(switched.previous.device_id, "speakers");
        assert_eq!(handle.device_id(), "airpods");
        assert!(handle.is_bluetooth());
        assert_eq!(hw.max_concurrent_active(Direction::Output), 1);

        let timeline = hw.timeline();
        let inactive_at = timeline
            .iter()
            .position(|c| *c == HardwareCall::Inactive(old_id))
            .unwrap();
        let open_at = timeline
            .iter()
            .position(|c| matches!(c, HardwareCall::Open { device_id, succeeded: true, .. } if device_id == "airpods"))
            .unwrap();
        assert!(inactive_at < open_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_to_missing_device_keeps_current_stream() {
        let hw = fake_with_devices();
        let manager = manager(hw.clone());

        let mut handle = manager.create_stream(speakers(), None).await.unwrap().handle;
        let id = handle.id();
        let err = manager
            .switch_device(&mut handle, StreamConfig::new(Direction::Output, "ghost", 24_000, 1), None)
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::DeviceNotPresent { .. }));
        assert_eq!(handle.id(), id);
        assert!(hw.is_stream_active(id));
        assert!(!hw.timeline().iter().any(|c| *c == HardwareCall::RequestStop(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_switch_restores_previous_stream() {
        let hw = fake_with_devices();
        let manager = manager(hw.clone());

        let mut handle = manager.create_stream(speakers(), None).await.unwrap().handle;
        hw.fail_always("airpods", HardwareError::device_unavailable("still connecting"));

        let err = manager
            .switch_device(&mut handle, StreamConfig::new(Direction::Output, "airpods", 24_000, 1), Some(2))
            .await
            .unwrap_err();

        match err {
            StreamError::SwitchFailed { attempts, restored, ref last_error, .. } => {
                assert_eq!(attempts, 2);
                assert!(restored);
                assert_eq!(last_error.code, DEVICE_UNAVAILABLE);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(handle.device_id(), "speakers");
        assert_eq!(manager.active_stream(Direction::Output).await, Some(handle.id()));
        assert_eq!(hw.max_concurrent_active(Direction::Output), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_handle_is_rejected() {
        let hw = fake_with_devices();
        let manager = manager(hw.clone());

        let mut handle = manager.create_stream(speakers(), None).await.unwrap().handle;
        let stale = StreamHandle {
            id: StreamId(999),
            config: speakers(),
            is_bluetooth: false,
        };
        assert!(!manager.close_stream(stale, false).await);

        handle.id = StreamId(1000);
        let err = manager.switch_device(&mut handle, speakers(), None).await.unwrap_err();
        assert!(matches!(err, StreamError::StaleHandle { .. }));
    }
}
