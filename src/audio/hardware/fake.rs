// Scriptable in-memory hardware backend
//
// Used by the test suites. It records every call in a timeline and tracks how many
// streams were simultaneously active per direction, which is how the
// single-stream-per-direction guarantees are checked.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::{AudioHardware, NativeSubscription};
use crate::audio::error::HardwareError;
use crate::audio::types::{Direction, RawDevice, StreamConfig, StreamId};

/// One recorded hardware interaction
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareCall {
    Open {
        direction: Direction,
        device_id: String,
        succeeded: bool,
    },
    RequestStop(StreamId),
    Inactive(StreamId),
    Abort(StreamId),
}

#[derive(Debug)]
struct FakeStream {
    config: StreamConfig,
    active: bool,
    stop_requested: bool,
    polls_until_inactive: u32,
}

#[derive(Debug, Default)]
struct FakeState {
    defaults: [Option<RawDevice>; 2],
    devices: [Vec<RawDevice>; 2],
    default_query_error: Option<HardwareError>,
    native_available: bool,
    native_senders: Vec<mpsc::UnboundedSender<Direction>>,
    scripted_failures: HashMap<String, VecDeque<HardwareError>>,
    permanent_failures: HashMap<String, HardwareError>,
    open_attempts: HashMap<String, u32>,
    stop_polls: u32,
    stuck_streams: bool,
    streams: HashMap<StreamId, FakeStream>,
    max_concurrent: [usize; 2],
    timeline: Vec<HardwareCall>,
}

impl FakeState {
    fn active_count(&self, direction: Direction) -> usize {
        self.streams
            .values()
            .filter(|s| s.active && s.config.direction == direction)
            .count()
    }
}

/// In-memory `AudioHardware`
#[derive(Debug, Default)]
pub struct FakeHardware {
    state: Mutex<FakeState>,
    next_id: AtomicU64,
}

impl FakeHardware {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `device` the default for `direction` (and present in enumeration)
    pub fn set_default(&self, direction: Direction, device: Option<RawDevice>) {
        let mut state = self.state();
        if let Some(ref device) = device {
            let list = &mut state.devices[direction.index()];
            if !list.iter().any(|d| d.id == device.id) {
                list.push(device.clone());
            }
        }
        state.defaults[direction.index()] = device;
    }

    pub fn add_device(&self, direction: Direction, device: RawDevice) {
        let mut state = self.state();
        let list = &mut state.devices[direction.index()];
        if !list.iter().any(|d| d.id == device.id) {
            list.push(device);
        }
    }

    pub fn remove_device(&self, direction: Direction, device_id: &str) {
        let mut state = self.state();
        state.devices[direction.index()].retain(|d| d.id != device_id);
        if state.defaults[direction.index()]
            .as_ref()
            .map_or(false, |d| d.id == device_id)
        {
            state.defaults[direction.index()] = None;
        }
    }

    /// Make default-device queries fail until cleared with `None`
    pub fn set_default_query_error(&self, error: Option<HardwareError>) {
        self.state().default_query_error = error;
    }

    pub fn set_native_available(&self, available: bool) {
        self.state().native_available = available;
    }

    /// Deliver a native change signal to every live subscription
    pub fn emit_native_change(&self, direction: Direction) -> bool {
        let mut state = self.state();
        state.native_senders.retain(|tx| !tx.is_closed());
        let mut delivered = false;
        for tx in &state.native_senders {
            delivered |= tx.send(direction).is_ok();
        }
        delivered
    }

    /// Fail the next opens on `device_id` with these errors, in order
    pub fn fail_next_opens(&self, device_id: &str, errors: Vec<HardwareError>) {
        self.state()
            .scripted_failures
            .entry(device_id.to_string())
            .or_default()
            .extend(errors);
    }

    /// Fail every open on `device_id`
    pub fn fail_always(&self, device_id: &str, error: HardwareError) {
        self.state()
            .permanent_failures
            .insert(device_id.to_string(), error);
    }

    pub fn clear_failures(&self, device_id: &str) {
        let mut state = self.state();
        state.scripted_failures.remove(device_id);
        state.permanent_failures.remove(device_id);
    }

    /// Number of `is_stream_active` polls that still report true after a stop request
    pub fn set_stop_delay_polls(&self, polls: u32) {
        self.state().stop_polls = polls;
    }

    /// Streams ignore stop and abort requests
    pub fn set_stuck_streams(&self, stuck: bool) {
        self.state().stuck_streams = stuck;
    }

    pub fn open_attempts(&self, device_id: &str) -> u32 {
        self.state().open_attempts.get(device_id).copied().unwrap_or(0)
    }

    pub fn active_streams(&self, direction: Direction) -> usize {
        self.state().active_count(direction)
    }

    /// Highest number of simultaneously active streams ever seen for a direction
    pub fn max_concurrent_active(&self, direction: Direction) -> usize {
        self.state().max_concurrent[direction.index()]
    }

    pub fn stream_config(&self, stream: StreamId) -> Option<StreamConfig> {
        self.state().streams.get(&stream).map(|s| s.config.clone())
    }

    pub fn timeline(&self) -> Vec<HardwareCall> {
        self.state().timeline.clone()
    }
}

impl AudioHardware for FakeHardware {
    fn default_device(&self, direction: Direction) -> Result<Option<RawDevice>, HardwareError> {
        let state = self.state();
        if let Some(ref err) = state.default_query_error {
            return Err(err.clone());
        }
        Ok(state.defaults[direction.index()].clone())
    }

    fn devices(&self, direction: Direction) -> Result<Vec<RawDevice>, HardwareError> {
        Ok(self.state().devices[direction.index()].clone())
    }

    fn subscribe_default_changes(&self) -> Result<NativeSubscription, HardwareError> {
        let mut state = self.state();
        if !state.native_available {
            return Err(HardwareError::subscription_unavailable(
                "fake host has native notifications disabled",
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.native_senders.push(tx);
        Ok(NativeSubscription::new(rx, None))
    }

    fn open_stream(&self, config: &StreamConfig) -> Result<StreamId, HardwareError> {
        let mut state = self.state();
        *state.open_attempts.entry(config.device_id.clone()).or_insert(0) += 1;

        let scripted = state
            .scripted_failures
            .get_mut(&config.device_id)
            .and_then(|queue| queue.pop_front());
        let failure = scripted.or_else(|| state.permanent_failures.get(&config.device_id).cloned());

        let present = state.devices[config.direction.index()]
            .iter()
            .any(|d| d.id == config.device_id);
        let failure = failure.or_else(|| {
            (!present).then(|| {
                HardwareError::device_unavailable(format!("no such device '{}'", config.device_id))
            })
        });

        if let Some(err) = failure {
            state.timeline.push(HardwareCall::Open {
                direction: config.direction,
                device_id: config.device_id.clone(),
                succeeded: false,
            });
            return Err(err);
        }

        let id = StreamId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        state.streams.insert(
            id,
            FakeStream {
                config: config.clone(),
                active: true,
                stop_requested: false,
                polls_until_inactive: 0,
            },
        );
        state.timeline.push(HardwareCall::Open {
            direction: config.direction,
            device_id: config.device_id.clone(),
            succeeded: true,
        });

        let slot = config.direction.index();
        let active = state.active_count(config.direction);
        state.max_concurrent[slot] = state.max_concurrent[slot].max(active);
        Ok(id)
    }

    fn request_stop(&self, stream: StreamId) -> Result<(), HardwareError> {
        let mut state = self.state();
        let polls = state.stop_polls;
        state.timeline.push(HardwareCall::RequestStop(stream));
        match state.streams.get_mut(&stream) {
            Some(s) => {
                s.stop_requested = true;
                s.polls_until_inactive = polls;
                Ok(())
            }
            None => Err(HardwareError::other(format!("unknown {}", stream))),
        }
    }

    fn abort_stream(&self, stream: StreamId) {
        let mut state = self.state();
        state.timeline.push(HardwareCall::Abort(stream));
        if state.stuck_streams {
            return;
        }
        if let Some(s) = state.streams.get_mut(&stream) {
            if s.active {
                s.active = false;
                state.timeline.push(HardwareCall::Inactive(stream));
            }
        }
    }

    fn is_stream_active(&self, stream: StreamId) -> bool {
        let mut state = self.state();
        let stuck = state.stuck_streams;
        let Some(s) = state.streams.get_mut(&stream) else {
            return false;
        };
        if !s.active {
            return false;
        }
        if !s.stop_requested || stuck {
            return true;
        }
        if s.polls_until_inactive > 0 {
            s.polls_until_inactive -= 1;
            return true;
        }
        s.active = false;
        state.timeline.push(HardwareCall::Inactive(stream));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::error::DEVICE_UNAVAILABLE;
    use crate::audio::types::DeviceTransport;

    fn speakers() -> RawDevice {
        RawDevice::new("speakers", "Built-in Speakers", DeviceTransport::BuiltIn)
    }

    #[test]
    fn test_scripted_failures_then_success() {
        let hw = FakeHardware::new();
        hw.set_default(Direction::Output, Some(speakers()));
        hw.fail_next_opens("speakers", vec![HardwareError::device_unavailable("busy")]);

        let config = StreamConfig::new(Direction::Output, "speakers", 24_000, 1);
        let err = hw.open_stream(&config).unwrap_err();
        assert_eq!(err.code, DEVICE_UNAVAILABLE);
        assert!(hw.open_stream(&config).is_ok());
        assert_eq!(hw.open_attempts("speakers"), 2);
    }

    #[test]
    fn test_stop_confirms_after_configured_polls() {
        let hw = FakeHardware::new();
        hw.set_default(Direction::Output, Some(speakers()));
        hw.set_stop_delay_polls(2);

        let id = hw
            .open_stream(&StreamConfig::new(Direction::Output, "speakers", 24_000, 1))
            .unwrap();
        hw.request_stop(id).unwrap();
        assert!(hw.is_stream_active(id));
        assert!(hw.is_stream_active(id));
        assert!(!hw.is_stream_active(id));
        assert_eq!(hw.active_streams(Direction::Output), 0);
    }

    #[test]
    fn test_max_concurrent_tracks_overlap() {
        let hw = FakeHardware::new();
        hw.set_default(Direction::Input, Some(RawDevice::new("mic", "Mic", DeviceTransport::Usb)));
        let config = StreamConfig::new(Direction::Input, "mic", 16_000, 1);
        let _a = hw.open_stream(&config).unwrap();
        let _b = hw.open_stream(&config).unwrap();
        assert_eq!(hw.max_concurrent_active(Direction::Input), 2);
    }

    #[tokio::test]
    async fn test_native_subscription_delivery() {
        let hw = FakeHardware::new();
        assert!(hw.subscribe_default_changes().is_err());

        hw.set_native_available(true);
        let mut sub = hw.subscribe_default_changes().unwrap();
        assert!(hw.emit_native_change(Direction::Output));
        assert_eq!(sub.recv().await, Some(Direction::Output));
    }
}
