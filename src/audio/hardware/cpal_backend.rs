// cpal-backed hardware access
//
// cpal streams are not `Send`, so every stream is created, paused and dropped on one
// owner thread. Callers talk to it over a crossbeam command channel and observe stream
// state through per-stream atomic flags, which is what `is_stream_active` reads.
// This code drives real devices and is not exercised by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::{AudioHardware, InputSink, NativeSubscription, OutputRenderer};
use crate::audio::error::{HardwareError, DEVICE_UNAVAILABLE, INTERNAL_HOST_ERROR, UNSPECIFIED_HOST_ERROR};
use crate::audio::types::{DeviceTransport, Direction, RawDevice, StreamConfig, StreamId};

const OPEN_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

type SinkSlot = Arc<RwLock<Option<Arc<dyn InputSink>>>>;
type RendererSlot = Arc<RwLock<Option<Arc<dyn OutputRenderer>>>>;

enum OwnerCommand {
    Open {
        id: StreamId,
        config: StreamConfig,
        active: Arc<AtomicBool>,
        reply: Sender<Result<(), HardwareError>>,
    },
    Stop {
        id: StreamId,
    },
    Shutdown,
}

/// `AudioHardware` over the default cpal host
pub struct CpalHardware {
    commands: Sender<OwnerCommand>,
    flags: Mutex<HashMap<StreamId, Arc<AtomicBool>>>,
    next_id: AtomicU64,
    input_sink: SinkSlot,
    output_renderer: RendererSlot,
}

impl CpalHardware {
    /// Start the stream owner thread
    pub fn new() -> anyhow::Result<Self> {
        let (commands, receiver) = channel::unbounded();
        let input_sink: SinkSlot = Arc::new(RwLock::new(None));
        let output_renderer: RendererSlot = Arc::new(RwLock::new(None));

        let sink = input_sink.clone();
        let renderer = output_renderer.clone();
        std::thread::Builder::new()
            .name("cpal-stream-owner".to_string())
            .spawn(move || stream_owner_loop(receiver, sink, renderer))
            .context("Failed to spawn cpal stream owner thread")?;

        info!("🎧 cpal hardware backend ready (host: {:?})", cpal::default_host().id());

        Ok(Self {
            commands,
            flags: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            input_sink,
            output_renderer,
        })
    }

    /// Where captured input samples go
    pub fn set_input_sink(&self, sink: Option<Arc<dyn InputSink>>) {
        if let Ok(mut slot) = self.input_sink.write() {
            *slot = sink;
        }
    }

    /// What fills output buffers; silence when unset
    pub fn set_output_renderer(&self, renderer: Option<Arc<dyn OutputRenderer>>) {
        if let Ok(mut slot) = self.output_renderer.write() {
            *slot = renderer;
        }
    }

    fn flag(&self, stream: StreamId) -> Option<Arc<AtomicBool>> {
        self.flags.lock().ok()?.get(&stream).cloned()
    }
}

impl Drop for CpalHardware {
    fn drop(&mut self) {
        let _ = self.commands.send(OwnerCommand::Shutdown);
    }
}

impl std::fmt::Debug for CpalHardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalHardware")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

fn raw_device(device: &cpal::Device) -> Option<RawDevice> {
    let name = device.name().ok()?;
    // cpal 0.15 exposes no stable identifier or transport; the name is the identity and
    // the registry classifies Bluetooth from it.
    Some(RawDevice::new(name.clone(), name, DeviceTransport::Unknown))
}

fn find_device(host: &cpal::Host, direction: Direction, device_id: &str) -> Result<cpal::Device, HardwareError> {
    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| HardwareError::internal(format!("device enumeration failed: {}", e)))?;

    for device in devices {
        if device.name().map(|n| n == device_id).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(HardwareError::device_unavailable(format!(
        "{} device '{}' not found",
        direction, device_id
    )))
}

fn map_build_error(err: cpal::BuildStreamError) -> HardwareError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            HardwareError::new(DEVICE_UNAVAILABLE, "device not available")
        }
        cpal::BuildStreamError::BackendSpecific { err } => {
            HardwareError::new(INTERNAL_HOST_ERROR, err.description)
        }
        other => HardwareError::new(UNSPECIFIED_HOST_ERROR, other.to_string()),
    }
}

fn map_play_error(err: cpal::PlayStreamError) -> HardwareError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => {
            HardwareError::new(DEVICE_UNAVAILABLE, "device not available")
        }
        cpal::PlayStreamError::BackendSpecific { err } => {
            HardwareError::new(INTERNAL_HOST_ERROR, err.description)
        }
    }
}

fn build_stream(
    host: &cpal::Host,
    config: &StreamConfig,
    active: Arc<AtomicBool>,
    input_sink: &SinkSlot,
    output_renderer: &RendererSlot,
) -> Result<cpal::Stream, HardwareError> {
    let device = find_device(host, config.direction, &config.device_id)?;
    let cpal_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: config
            .block_size
            .map(cpal::BufferSize::Fixed)
            .unwrap_or(cpal::BufferSize::Default),
    };
    let timeout = config.latency.map(|secs| Duration::from_secs_f64(secs.max(0.0) * 4.0));

    let error_flag = active.clone();
    let device_id = config.device_id.clone();
    let on_error = move |err: cpal::StreamError| {
        error!("❌ cpal stream error on '{}': {}", device_id, err);
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            error_flag.store(false, Ordering::SeqCst);
        }
    };

    let stream = match config.direction {
        Direction::Input => {
            let sink = input_sink.clone();
            device.build_input_stream(
                &cpal_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(slot) = sink.try_read() {
                        if let Some(sink) = slot.as_ref() {
                            sink.on_input(data);
                        }
                    }
                },
                on_error,
                timeout,
            )
        }
        Direction::Output => {
            let renderer = output_renderer.clone();
            device.build_output_stream(
                &cpal_config,
                move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    match renderer.try_read() {
                        Ok(slot) => match slot.as_ref() {
                            Some(renderer) => renderer.render(out),
                            None => out.fill(0.0),
                        },
                        Err(_) => out.fill(0.0),
                    }
                },
                on_error,
                timeout,
            )
        }
    }
    .map_err(map_build_error)?;

    stream.play().map_err(map_play_error)?;
    Ok(stream)
}

fn stream_owner_loop(receiver: Receiver<OwnerCommand>, input_sink: SinkSlot, output_renderer: RendererSlot) {
    let host = cpal::default_host();
    let mut streams: HashMap<StreamId, (cpal::Stream, Arc<AtomicBool>)> = HashMap::new();

    while let Ok(command) = receiver.recv() {
        match command {
            OwnerCommand::Open {
                id,
                config,
                active,
                reply,
            } => {
                let result = build_stream(&host, &config, active.clone(), &input_sink, &output_renderer);
                let result = result.map(|stream| {
                    active.store(true, Ordering::SeqCst);
                    streams.insert(id, (stream, active));
                    debug!("▶️ Started {} on '{}'", id, config.device_id);
                });
                let _ = reply.send(result);
            }
            OwnerCommand::Stop { id } => {
                if let Some((stream, active)) = streams.remove(&id) {
                    if let Err(e) = stream.pause() {
                        warn!("⚠️ Failed to pause {}: {}", id, e);
                    }
                    drop(stream);
                    active.store(false, Ordering::SeqCst);
                    debug!("⏹️ Stopped {}", id);
                }
            }
            OwnerCommand::Shutdown => break,
        }
    }

    for (id, (stream, active)) in streams.drain() {
        let _ = stream.pause();
        drop(stream);
        active.store(false, Ordering::SeqCst);
        debug!("⏹️ Dropped {} on shutdown", id);
    }
}

impl AudioHardware for CpalHardware {
    fn default_device(&self, direction: Direction) -> Result<Option<RawDevice>, HardwareError> {
        let host = cpal::default_host();
        let device = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        Ok(device.as_ref().and_then(raw_device))
    }

    fn devices(&self, direction: Direction) -> Result<Vec<RawDevice>, HardwareError> {
        let host = cpal::default_host();
        let devices = match direction {
            Direction::Input => host.input_devices(),
            Direction::Output => host.output_devices(),
        }
        .map_err(|e| HardwareError::internal(format!("device enumeration failed: {}", e)))?;
        Ok(devices.filter_map(|d| raw_device(&d)).collect())
    }

    fn subscribe_default_changes(&self) -> Result<NativeSubscription, HardwareError> {
        #[cfg(target_os = "macos")]
        {
            super::coreaudio_notifications::subscribe()
        }
        #[cfg(not(target_os = "macos"))]
        {
            Err(HardwareError::subscription_unavailable(
                "no native default-device notifications on this host",
            ))
        }
    }

    fn open_stream(&self, config: &StreamConfig) -> Result<StreamId, HardwareError> {
        let id = StreamId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let active = Arc::new(AtomicBool::new(false));
        let (reply, reply_rx) = channel::bounded(1);

        self.commands
            .send(OwnerCommand::Open {
                id,
                config: config.clone(),
                active: active.clone(),
                reply,
            })
            .map_err(|_| HardwareError::internal("stream owner thread is gone"))?;

        match reply_rx.recv_timeout(OPEN_REPLY_TIMEOUT) {
            Ok(Ok(())) => {
                if let Ok(mut flags) = self.flags.lock() {
                    flags.insert(id, active);
                }
                Ok(id)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // The owner may still finish building it; make sure it does not linger
                let _ = self.commands.send(OwnerCommand::Stop { id });
                Err(HardwareError::internal(format!(
                    "no reply from stream owner within {:?}",
                    OPEN_REPLY_TIMEOUT
                )))
            }
        }
    }

    fn request_stop(&self, stream: StreamId) -> Result<(), HardwareError> {
        self.commands
            .send(OwnerCommand::Stop { id: stream })
            .map_err(|_| HardwareError::internal("stream owner thread is gone"))
    }

    fn abort_stream(&self, stream: StreamId) {
        let _ = self.commands.send(OwnerCommand::Stop { id: stream });
        if let Some(flag) = self.flag(stream) {
            flag.store(false, Ordering::SeqCst);
        }
        if let Ok(mut flags) = self.flags.lock() {
            flags.remove(&stream);
        }
    }

    fn is_stream_active(&self, stream: StreamId) -> bool {
        match self.flag(stream) {
            Some(flag) => {
                let active = flag.load(Ordering::SeqCst);
                if !active {
                    if let Ok(mut flags) = self.flags.lock() {
                        flags.remove(&stream);
                    }
                }
                active
            }
            None => false,
        }
    }
}
