// Recording lifecycle: the active guard that gates the input callback path and owns the
// ordered stop protocol, plus the level meter that consumes gated input.

pub mod guard;
pub mod meter;

pub use guard::{
    CaptureControl, InMemoryMicState, MicState, MicStateMachine, RecordingActiveGuard, RecordingGate,
    RecordingGuardConfig,
};
pub use meter::InputLevelMeter;
