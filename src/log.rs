use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Global flag to control verbose audio/device debug logging
pub static AUDIO_DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

static LOGGING_INIT: Once = Once::new();

/// Set audio debug logging on/off
pub fn set_audio_debug(enabled: bool) {
    AUDIO_DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
    tracing::info!(
        "🔧 Audio debug logging {}",
        if enabled { "ENABLED" } else { "DISABLED" }
    );
}

/// Check if audio debug logging is enabled
pub fn is_audio_debug_enabled() -> bool {
    AUDIO_DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_directive` when set. Calling this more than once is a
/// no-op, and a subscriber installed by someone else is left alone.
pub fn init_logging(default_directive: &str) {
    LOGGING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

/// Audio debug macro - only logs if audio debug is enabled
#[macro_export]
macro_rules! audio_debug {
    ($($arg:tt)*) => {
        if $crate::log::AUDIO_DEBUG_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
            tracing::debug!($($arg)*);
        }
    };
}

/// Device debug macro - same switch as `audio_debug!`, tagged with the device target
#[macro_export]
macro_rules! device_debug {
    ($($arg:tt)*) => {
        if $crate::log::AUDIO_DEBUG_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
            tracing::debug!(target: "voice_coordinator::devices", $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_audio_debug_toggle() {
        set_audio_debug(true);
        assert!(is_audio_debug_enabled());

        set_audio_debug(false);
        assert!(!is_audio_debug_enabled());
    }

    #[test]
    #[serial]
    fn test_init_logging_is_idempotent() {
        init_logging("info");
        init_logging("debug");
        // Macros must expand cleanly whether or not the switch is on
        crate::audio_debug!("audio debug line {}", 1);
        crate::device_debug!("device debug line {}", 2);
    }
}
