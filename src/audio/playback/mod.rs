// Playback session tracking
//
// - completion: per-session completion detector with watchdogs
// - worker: signal channel that applies callback/producer signals on a Tokio task
// - drain: `OutputRenderer` that plays queued chunks and reports them played

pub mod completion;
pub mod drain;
pub mod worker;

pub use completion::{
    CompletionStatus, PlaybackChunk, PlaybackConfig, PlaybackSessionCompletionDetector, PlaybackStats,
    ProducerProbe, SessionState, WatchdogPolicy,
};
pub use drain::PlaybackDrain;
pub use worker::{spawn_playback_worker, PlaybackSignal, PlaybackSignalSender};
