// Playback signal worker
//
// Hardware callbacks and producer adapters must not touch the detector directly: they
// post `PlaybackSignal`s on an unbounded channel and the worker task applies them in
// arrival order.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::completion::{PlaybackChunk, PlaybackSessionCompletionDetector};
use crate::audio::types::SessionId;

#[derive(Debug, Clone)]
pub enum PlaybackSignal {
    MonitoringStarted { session_id: SessionId },
    ChunkEnqueued { session_id: SessionId, chunk: PlaybackChunk },
    ChunkPlayed { session_id: SessionId },
    ProducerDone { session_id: SessionId },
    Cancelled { session_id: SessionId },
}

/// Cloneable, non-blocking handle for posting playback signals
#[derive(Debug, Clone)]
pub struct PlaybackSignalSender {
    tx: mpsc::UnboundedSender<PlaybackSignal>,
}

impl PlaybackSignalSender {
    /// Post a signal; false once the worker is gone
    pub fn send(&self, signal: PlaybackSignal) -> bool {
        self.tx.send(signal).is_ok()
    }

    pub fn chunk_enqueued(&self, session_id: impl Into<SessionId>, chunk: PlaybackChunk) -> bool {
        self.send(PlaybackSignal::ChunkEnqueued {
            session_id: session_id.into(),
            chunk,
        })
    }

    pub fn chunk_played(&self, session_id: impl Into<SessionId>) -> bool {
        self.send(PlaybackSignal::ChunkPlayed {
            session_id: session_id.into(),
        })
    }

    pub fn producer_done(&self, session_id: impl Into<SessionId>) -> bool {
        self.send(PlaybackSignal::ProducerDone {
            session_id: session_id.into(),
        })
    }

    pub fn cancelled(&self, session_id: impl Into<SessionId>) -> bool {
        self.send(PlaybackSignal::Cancelled {
            session_id: session_id.into(),
        })
    }

    pub fn monitoring_started(&self, session_id: impl Into<SessionId>) -> bool {
        self.send(PlaybackSignal::MonitoringStarted {
            session_id: session_id.into(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn apply(detector: &PlaybackSessionCompletionDetector, signal: PlaybackSignal) {
    match signal {
        PlaybackSignal::MonitoringStarted { session_id } => {
            detector.on_monitoring_started(&session_id);
        }
        PlaybackSignal::ChunkEnqueued { session_id, chunk } => {
            detector.on_chunk_enqueued(&session_id, chunk);
        }
        PlaybackSignal::ChunkPlayed { session_id } => {
            detector.on_chunk_playback_completed(&session_id);
        }
        PlaybackSignal::ProducerDone { session_id } => {
            detector.on_producer_done(&session_id);
        }
        PlaybackSignal::Cancelled { session_id } => {
            detector.on_session_cancelled(&session_id);
        }
    }
}

/// Spawn the worker; it stops when every sender has been dropped
pub fn spawn_playback_worker(detector: PlaybackSessionCompletionDetector) -> (PlaybackSignalSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        info!("🎵 Playback signal worker started");
        while let Some(signal) = rx.recv().await {
            crate::audio_debug!("🎵 Applying {:?}", signal);
            apply(&detector, signal);
        }
        debug!("🎵 Playback signal worker stopped");
    });
    (PlaybackSignalSender { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::events::{AudioEventBus, AudioEventKind};
    use crate::audio::playback::completion::SessionState;

    #[tokio::test]
    async fn test_worker_applies_signals_in_order() {
        let bus = AudioEventBus::new(16);
        let mut rx = bus.subscribe();
        let detector = PlaybackSessionCompletionDetector::new(bus, None);
        let (signals, worker) = spawn_playback_worker(detector.clone());

        assert!(signals.chunk_enqueued("s1", PlaybackChunk::new(vec![0.1; 8])));
        assert!(signals.producer_done("s1"));
        assert!(signals.chunk_played("s1"));

        let event = rx.recv().await.unwrap();
        match event.kind {
            AudioEventKind::PlaybackCompleted(completed) => {
                assert_eq!(completed.session_id, "s1");
                assert!(completed.finished);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(detector.session_state("s1"), Some(SessionState::Completed));

        drop(signals);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_sender_reports_closed_worker() {
        let detector = PlaybackSessionCompletionDetector::new(AudioEventBus::default(), None);
        let (signals, worker) = spawn_playback_worker(detector);
        worker.abort();
        let _ = worker.await;
        assert!(signals.is_closed());
        assert!(!signals.cancelled("s1"));
    }
}
