// Hardware seam for the coordinator
//
// Everything that touches the OS audio stack goes through `AudioHardware`:
// - default device queries and per-direction enumeration
// - the optional native default-device change subscription
// - open / request-stop / abort / query-active per stream
//
// Backends:
// - cpal_backend: real devices through cpal (streams live on an owner thread)
// - fake: scriptable in-memory backend for tests and demos

pub mod cpal_backend;
pub mod fake;

#[cfg(target_os = "macos")]
pub mod coreaudio_notifications;

use tokio::sync::mpsc;

use super::error::HardwareError;
use super::types::{Direction, RawDevice, StreamConfig, StreamId};

pub use cpal_backend::CpalHardware;
pub use fake::{FakeHardware, HardwareCall};

/// Receives captured samples on the hardware callback thread
pub trait InputSink: Send + Sync {
    fn on_input(&self, samples: &[f32]);
}

/// Fills playback buffers on the hardware callback thread
pub trait OutputRenderer: Send + Sync {
    fn render(&self, out: &mut [f32]);
}

/// Live native default-device subscription.
///
/// Each received `Direction` means "the default device for this direction may have
/// changed"; the receiver re-reads the registry to find out what it changed to.
/// Dropping the subscription unregisters it.
pub struct NativeSubscription {
    receiver: mpsc::UnboundedReceiver<Direction>,
    _registration: Option<Box<dyn Send + Sync>>,
}

impl NativeSubscription {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<Direction>,
        registration: Option<Box<dyn Send + Sync>>,
    ) -> Self {
        Self {
            receiver,
            _registration: registration,
        }
    }

    /// Next change signal; `None` once the source has gone away
    pub async fn recv(&mut self) -> Option<Direction> {
        self.receiver.recv().await
    }
}

impl std::fmt::Debug for NativeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeSubscription")
            .field("registered", &self._registration.is_some())
            .finish()
    }
}

/// OS audio primitives used by the coordinator.
///
/// All methods are synchronous and cheap; waiting (stop confirmation, backoff) is done
/// by the callers.
#[cfg_attr(test, mockall::automock)]
pub trait AudioHardware: Send + Sync {
    /// Current default device for a direction, `None` if the host has none
    fn default_device(&self, direction: Direction) -> Result<Option<RawDevice>, HardwareError>;

    /// Devices currently present for a direction
    fn devices(&self, direction: Direction) -> Result<Vec<RawDevice>, HardwareError>;

    /// Register for native default-device change notifications
    fn subscribe_default_changes(&self) -> Result<NativeSubscription, HardwareError>;

    /// Open and start a stream
    fn open_stream(&self, config: &StreamConfig) -> Result<StreamId, HardwareError>;

    /// Ask the hardware to stop a stream; completion is observed via `is_stream_active`
    fn request_stop(&self, stream: StreamId) -> Result<(), HardwareError>;

    /// Tear a stream down without waiting for a clean stop
    fn abort_stream(&self, stream: StreamId);

    fn is_stream_active(&self, stream: StreamId) -> bool;
}
