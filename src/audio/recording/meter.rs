// Input level meter
//
// The default consumer behind the recording gate: keeps a running peak and sample count
// with lock-free atomics so the capture callback never blocks.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::audio::hardware::InputSink;

#[derive(Debug, Default)]
pub struct InputLevelMeter {
    /// f32 bits of the highest absolute sample seen since the last `take_peak`
    peak_bits: AtomicU32,
    samples: AtomicU64,
}

impl InputLevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peak(&self) -> f32 {
        f32::from_bits(self.peak_bits.load(Ordering::Relaxed))
    }

    /// Current peak, resetting it for the next window
    pub fn take_peak(&self) -> f32 {
        f32::from_bits(self.peak_bits.swap(0, Ordering::Relaxed))
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

impl InputSink for InputLevelMeter {
    fn on_input(&self, samples: &[f32]) {
        let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        // Non-negative floats order the same as their bit patterns
        self.peak_bits.fetch_max(peak.to_bits(), Ordering::Relaxed);
        self.samples.fetch_add(samples.len() as u64, Ordering::Relaxed);
    }
}
