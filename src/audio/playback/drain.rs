// Output renderer that plays queued session chunks
//
// Runs on the hardware callback thread: it never blocks, renders silence on contention,
// and reports fully rendered chunks through the signal worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::completion::{PlaybackChunk, PlaybackSessionCompletionDetector};
use super::worker::PlaybackSignalSender;
use crate::audio::hardware::OutputRenderer;
use crate::audio::types::SessionId;

struct InFlight {
    session_id: SessionId,
    chunk: PlaybackChunk,
    offset: usize,
    cancel_epoch: u64,
}

pub struct PlaybackDrain {
    detector: PlaybackSessionCompletionDetector,
    signals: PlaybackSignalSender,
    current: Mutex<Option<InFlight>>,
    silent_frames: AtomicU64,
}

impl PlaybackDrain {
    pub fn new(detector: PlaybackSessionCompletionDetector, signals: PlaybackSignalSender) -> Self {
        Self {
            detector,
            signals,
            current: Mutex::new(None),
            silent_frames: AtomicU64::new(0),
        }
    }

    /// Samples rendered as silence because nothing was queued or the state was contended
    pub fn silent_samples(&self) -> u64 {
        self.silent_frames.load(Ordering::Relaxed)
    }

    fn next_chunk(&self) -> Option<InFlight> {
        let cancel_epoch = self.detector.cancel_epoch();
        self.detector
            .try_take_next_for_playback()
            .map(|(session_id, chunk)| InFlight {
                session_id,
                chunk,
                offset: 0,
                cancel_epoch,
            })
    }

    /// Whether the in-flight chunk belongs to a session cancelled since it was taken
    fn was_cancelled(&self, in_flight: &mut InFlight) -> bool {
        let epoch = self.detector.cancel_epoch();
        if in_flight.cancel_epoch == epoch {
            return false;
        }
        match self.detector.try_is_live(&in_flight.session_id) {
            Some(true) => {
                in_flight.cancel_epoch = epoch;
                false
            }
            Some(false) => true,
            // Contended; check again next buffer
            None => false,
        }
    }
}

impl OutputRenderer for PlaybackDrain {
    fn render(&self, out: &mut [f32]) {
        let Ok(mut current) = self.current.try_lock() else {
            out.fill(0.0);
            self.silent_frames.fetch_add(out.len() as u64, Ordering::Relaxed);
            return;
        };

        let mut written = 0;
        while written < out.len() {
            if current.is_none() {
                *current = self.next_chunk();
            }
            let Some(in_flight) = current.as_mut() else {
                break;
            };

            if self.was_cancelled(in_flight) {
                *current = None;
                continue;
            }

            let remaining = &in_flight.chunk.samples[in_flight.offset..];
            let count = remaining.len().min(out.len() - written);
            out[written..written + count].copy_from_slice(&remaining[..count]);
            in_flight.offset += count;
            written += count;

            if in_flight.offset >= in_flight.chunk.len() {
                let _ = self.signals.chunk_played(in_flight.session_id.clone());
                *current = None;
            }
        }

        if written < out.len() {
            out[written..].fill(0.0);
            self.silent_frames
                .fetch_add((out.len() - written) as u64, Ordering::Relaxed);
        }
    }
}
