// Playback session completion detection
//
// A session is complete when it has received audio, the producer said it is done and every
// queued chunk has been played, all observed at the same evaluation. Evaluation happens on every
// chunk-played callback and on producer-done. A per-session watchdog forces an ending if
// the session goes quiet, so a lost callback can never leave a session open forever.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::events::{AudioEventBus, AudioEventKind, PlaybackCompletedEvent};
use crate::audio::timers::KeyedTimers;
use crate::audio::types::SessionId;

pub const PATTERN_BUFFER_DRAINED: &str = "buffer_drained";
pub const PATTERN_WATCHDOG_TIMEOUT: &str = "watchdog_timeout";

pub const TRIGGER_CHUNK_COMPLETED: &str = "chunk_completed";
pub const TRIGGER_PRODUCER_DONE: &str = "producer_done";
pub const TRIGGER_WATCHDOG: &str = "watchdog";

/// What the watchdog does when a session goes quiet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogPolicy {
    /// Force-complete immediately
    ForceComplete,
    /// Ask the producer first; extend while it reports it is still producing
    ReconcileWithProducer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub watchdog_timeout_ms: u64,
    pub watchdog_policy: WatchdogPolicy,
    /// Watchdog extensions granted under `ReconcileWithProducer`
    pub max_reconcile_extensions: u32,
    /// Terminal session ids remembered so late signals are ignored
    pub tombstone_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_ms: 10_000,
            watchdog_policy: WatchdogPolicy::ForceComplete,
            max_reconcile_extensions: 1,
            tombstone_capacity: 256,
        }
    }
}

impl PlaybackConfig {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }
}

/// Upstream view used by `WatchdogPolicy::ReconcileWithProducer`
#[cfg_attr(test, mockall::automock)]
pub trait ProducerProbe: Send + Sync {
    /// Whether the producer is still sending data for `session_id`
    fn is_producing(&self, session_id: &str) -> bool;
}

/// One unit of playback audio
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    pub samples: Arc<[f32]>,
}

impl PlaybackChunk {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl From<Vec<f32>> for PlaybackChunk {
    fn from(samples: Vec<f32>) -> Self {
        Self::new(samples)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    Completed,
    Cancelled,
}

/// Outcome of feeding one signal to the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Session is live and not finished yet
    Pending,
    /// This signal completed the session
    Completed,
    /// Unknown or already-terminal session; nothing happened
    Ignored,
}

impl CompletionStatus {
    pub fn is_last(self) -> bool {
        self == CompletionStatus::Completed
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaybackStats {
    pub sessions_started: u64,
    pub completed_drained: u64,
    pub completed_by_watchdog: u64,
    pub cancelled: u64,
    pub watchdog_extensions: u64,
    pub late_signals_ignored: u64,
}

#[derive(Debug)]
struct PlaybackSession {
    state: SessionState,
    /// FIFO; the front chunk is removed when its playback completes
    queue: VecDeque<PlaybackChunk>,
    /// Leading chunks already handed to the renderer
    dispatched: usize,
    producer_done: bool,
    watchdog_generation: u64,
    extensions: u32,
}

impl PlaybackSession {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            queue: VecDeque::new(),
            dispatched: 0,
            producer_done: false,
            watchdog_generation: 0,
            extensions: 0,
        }
    }
}

#[derive(Debug, Default)]
struct DetectorState {
    sessions: HashMap<SessionId, PlaybackSession>,
    /// Creation order, used to pick what plays next
    order: VecDeque<SessionId>,
    tombstones: VecDeque<(SessionId, SessionState)>,
    stats: PlaybackStats,
}

impl DetectorState {
    fn terminal_state(&self, session_id: &str) -> Option<SessionState> {
        self.tombstones
            .iter()
            .find(|(id, _)| id == session_id)
            .map(|(_, state)| *state)
    }
}

struct DetectorShared {
    config: PlaybackConfig,
    bus: AudioEventBus,
    probe: Option<Arc<dyn ProducerProbe>>,
    state: Mutex<DetectorState>,
    watchdogs: KeyedTimers<SessionId>,
    /// Bumped on every cancellation so the renderer can drop an in-flight chunk
    cancel_epoch: AtomicU64,
}

/// Per-session "playback really finished" detector.
///
/// All methods must be called from within a Tokio runtime; watchdogs are Tokio tasks.
#[derive(Clone)]
pub struct PlaybackSessionCompletionDetector {
    shared: Arc<DetectorShared>,
}

impl PlaybackSessionCompletionDetector {
    pub fn new(bus: AudioEventBus, config: Option<PlaybackConfig>) -> Self {
        Self::with_probe(bus, config, None)
    }

    pub fn with_probe(
        bus: AudioEventBus,
        config: Option<PlaybackConfig>,
        probe: Option<Arc<dyn ProducerProbe>>,
    ) -> Self {
        Self {
            shared: Arc::new(DetectorShared {
                config: config.unwrap_or_default(),
                bus,
                probe,
                state: Mutex::new(DetectorState::default()),
                watchdogs: KeyedTimers::new(),
                cancel_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Start tracking a session before any audio arrives; arms the watchdog
    pub fn on_monitoring_started(&self, session_id: &str) -> CompletionStatus {
        let mut state = self.shared.lock_state();
        if self.shared.reject_terminal(&mut state, session_id) {
            return CompletionStatus::Ignored;
        }
        self.shared.ensure_session(&mut state, session_id);
        self.shared.arm_watchdog(&mut state, session_id);
        CompletionStatus::Pending
    }

    pub fn on_chunk_enqueued(&self, session_id: &str, chunk: PlaybackChunk) -> CompletionStatus {
        let mut state = self.shared.lock_state();
        if self.shared.reject_terminal(&mut state, session_id) {
            return CompletionStatus::Ignored;
        }
        let session = self.shared.ensure_session(&mut state, session_id);
        if session.state == SessionState::Idle {
            session.state = SessionState::Active;
            debug!("▶️ Playback session {} active", session_id);
        }
        session.queue.push_back(chunk);
        crate::audio_debug!("📥 Session {} queued chunk ({} pending)", session_id, session.queue.len());
        self.shared.arm_watchdog(&mut state, session_id);
        CompletionStatus::Pending
    }

    /// The front chunk of `session_id` finished playing
    pub fn on_chunk_playback_completed(&self, session_id: &str) -> CompletionStatus {
        let mut guard = self.shared.lock_state();
        let state = &mut *guard;
        let Some(session) = state.sessions.get_mut(session_id) else {
            state.stats.late_signals_ignored += 1;
            debug!("🔇 Chunk completion for unknown or finished session {}", session_id);
            return CompletionStatus::Ignored;
        };
        if session.queue.pop_front().is_some() {
            session.dispatched = session.dispatched.saturating_sub(1);
        } else {
            warn!("⚠️ Chunk completion for session {} with an empty queue", session_id);
        }
        self.shared.evaluate(state, session_id, TRIGGER_CHUNK_COMPLETED)
    }

    /// The producer will send nothing more for `session_id`
    pub fn on_producer_done(&self, session_id: &str) -> CompletionStatus {
        let mut state = self.shared.lock_state();
        if self.shared.reject_terminal(&mut state, session_id) {
            return CompletionStatus::Ignored;
        }
        let session = self.shared.ensure_session(&mut state, session_id);
        if session.producer_done {
            debug!("🔁 Duplicate producer-done for session {}", session_id);
            return CompletionStatus::Pending;
        }
        session.producer_done = true;
        if session.state == SessionState::Idle {
            // Chunks may still arrive after this; the watchdog covers a session that never gets any
            debug!("⏳ Producer-done for session {} before any audio", session_id);
            self.shared.arm_watchdog(&mut state, session_id);
            return CompletionStatus::Pending;
        }
        self.shared.evaluate(&mut state, session_id, TRIGGER_PRODUCER_DONE)
    }

    /// Drop the session without a completion event.
    ///
    /// Returns false if the session was unknown or already finished.
    pub fn on_session_cancelled(&self, session_id: &str) -> bool {
        let mut state = self.shared.lock_state();
        let Some(session) = state.sessions.remove(session_id) else {
            debug!("🔇 Cancel for unknown or finished session {}", session_id);
            return false;
        };
        state.order.retain(|id| id != session_id);
        self.shared.watchdogs.cancel(&session_id.to_string());
        self.shared.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.bury(&mut state, session_id, SessionState::Cancelled);
        state.stats.cancelled += 1;
        info!(
            "🛑 Playback session {} cancelled, dropped {} buffered chunk(s)",
            session_id,
            session.queue.len()
        );
        true
    }

    /// Next chunk that has not been handed to the renderer yet, oldest session first
    pub fn take_next_for_playback(&self) -> Option<(SessionId, PlaybackChunk)> {
        let mut state = self.shared.lock_state();
        DetectorShared::take_next(&mut state)
    }

    /// Non-blocking variant for hardware callbacks; `None` on contention
    pub fn try_take_next_for_playback(&self) -> Option<(SessionId, PlaybackChunk)> {
        let mut state = self.shared.state.try_lock().ok()?;
        DetectorShared::take_next(&mut state)
    }

    /// Non-blocking liveness check; `None` on contention
    pub fn try_is_live(&self, session_id: &str) -> Option<bool> {
        let state = self.shared.state.try_lock().ok()?;
        Some(state.sessions.contains_key(session_id))
    }

    pub fn cancel_epoch(&self) -> u64 {
        self.shared.cancel_epoch.load(Ordering::SeqCst)
    }

    /// Current state; terminal sessions are reported while remembered
    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        let state = self.shared.lock_state();
        state
            .sessions
            .get(session_id)
            .map(|s| s.state)
            .or_else(|| state.terminal_state(session_id))
    }

    pub fn pending_chunks(&self, session_id: &str) -> usize {
        self.shared
            .lock_state()
            .sessions
            .get(session_id)
            .map_or(0, |s| s.queue.len())
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.shared.lock_state().order.iter().cloned().collect()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.shared.lock_state().stats.clone()
    }
}

impl std::fmt::Debug for PlaybackSessionCompletionDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSessionCompletionDetector")
            .field("config", &self.shared.config)
            .field("sessions", &self.active_sessions().len())
            .finish()
    }
}

impl DetectorShared {
    fn lock_state(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True (and counted) when `session_id` already ended
    fn reject_terminal(&self, state: &mut DetectorState, session_id: &str) -> bool {
        if state.sessions.contains_key(session_id) {
            return false;
        }
        match state.terminal_state(session_id) {
            Some(terminal) => {
                state.stats.late_signals_ignored += 1;
                debug!("🔇 Ignoring late signal for {:?} session {}", terminal, session_id);
                true
            }
            None => false,
        }
    }

    fn ensure_session<'a>(&self, state: &'a mut DetectorState, session_id: &str) -> &'a mut PlaybackSession {
        if !state.sessions.contains_key(session_id) {
            state.order.push_back(session_id.to_string());
            state.stats.sessions_started += 1;
            debug!("🆕 Tracking playback session {}", session_id);
        }
        state
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(PlaybackSession::new)
    }

    fn bury(&self, state: &mut DetectorState, session_id: &str, terminal: SessionState) {
        state.tombstones.push_back((session_id.to_string(), terminal));
        while state.tombstones.len() > self.config.tombstone_capacity.max(1) {
            state.tombstones.pop_front();
        }
    }

    fn take_next(state: &mut DetectorState) -> Option<(SessionId, PlaybackChunk)> {
        let DetectorState { sessions, order, .. } = state;
        for session_id in order.iter() {
            let Some(session) = sessions.get_mut(session_id) else {
                continue;
            };
            if let Some(chunk) = session.queue.get(session.dispatched) {
                let chunk = chunk.clone();
                session.dispatched += 1;
                return Some((session_id.clone(), chunk));
            }
        }
        None
    }

    fn arm_watchdog(self: &Arc<Self>, state: &mut DetectorState, session_id: &str) {
        let shared = Arc::clone(self);
        let key = session_id.to_string();
        let generation = self
            .watchdogs
            .schedule(key.clone(), self.config.watchdog_timeout(), move |generation| async move {
                shared.on_watchdog(&key, generation);
            });
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.watchdog_generation = generation;
        }
    }

    /// The completion check; runs with the state lock held
    fn evaluate(self: &Arc<Self>, state: &mut DetectorState, session_id: &str, trigger: &'static str) -> CompletionStatus {
        let Some(session) = state.sessions.get(session_id) else {
            return CompletionStatus::Ignored;
        };

        let is_last = session.state == SessionState::Active && session.producer_done && session.queue.is_empty();
        if !is_last {
            crate::audio_debug!(
                "⏳ Session {} not finished ({:?}, producer_done: {}, queued: {})",
                session_id,
                session.state,
                session.producer_done,
                session.queue.len()
            );
            self.arm_watchdog(state, session_id);
            return CompletionStatus::Pending;
        }

        self.watchdogs.cancel(&session_id.to_string());
        state.stats.completed_drained += 1;
        self.complete(state, session_id, PATTERN_BUFFER_DRAINED, trigger, true);
        CompletionStatus::Completed
    }

    fn complete(&self, state: &mut DetectorState, session_id: &str, pattern: &str, trigger: &str, finished: bool) {
        // Anything still queued goes with the session
        state.sessions.remove(session_id);
        state.order.retain(|id| id != session_id);
        self.bury(state, session_id, SessionState::Completed);

        if finished {
            info!("✅ Playback session {} completed ({}, via {})", session_id, pattern, trigger);
        } else {
            warn!("⚠️ Playback session {} force-completed ({}, via {})", session_id, pattern, trigger);
        }

        // Emitted under the lock: nothing else can complete this session concurrently
        self.bus.publish(AudioEventKind::PlaybackCompleted(PlaybackCompletedEvent {
            session_id: session_id.to_string(),
            pattern: pattern.to_string(),
            source: trigger.to_string(),
            finished,
        }));
    }

    fn on_watchdog(self: &Arc<Self>, session_id: &str, generation: u64) {
        let mut state = self.lock_state();
        let Some(session) = state.sessions.get_mut(session_id) else {
            return;
        };
        if session.watchdog_generation != generation {
            debug!("⏱️ Stale watchdog for session {} ignored", session_id);
            return;
        }

        if self.config.watchdog_policy == WatchdogPolicy::ReconcileWithProducer
            && session.extensions < self.config.max_reconcile_extensions
            && !session.producer_done
        {
            if let Some(probe) = self.probe.as_ref() {
                if probe.is_producing(session_id) {
                    session.extensions += 1;
                    state.stats.watchdog_extensions += 1;
                    info!("⏱️ Producer still active for session {}, extending watchdog", session_id);
                    self.arm_watchdog(&mut state, session_id);
                    return;
                }
            }
        }

        state.stats.completed_by_watchdog += 1;
        self.complete(&mut state, session_id, PATTERN_WATCHDOG_TIMEOUT, TRIGGER_WATCHDOG, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::events::AudioEvent;
    use proptest::prelude::*;
    use tokio::sync::broadcast;

    fn completions(rx: &mut broadcast::Receiver<AudioEvent>) -> Vec<PlaybackCompletedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AudioEventKind::PlaybackCompleted(completed) = event.kind {
                events.push(completed);
            }
        }
        events
    }

    fn chunk(value: f32) -> PlaybackChunk {
        PlaybackChunk::new(vec![value; 4])
    }

    fn detector() -> (PlaybackSessionCompletionDetector, broadcast::Receiver<AudioEvent>) {
        let bus = AudioEventBus::new(64);
        let rx = bus.subscribe();
        (PlaybackSessionCompletionDetector::new(bus, None), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_chunks_producer_done_after_first() {
        let (detector, mut rx) = detector();
        for v in [1.0, 2.0, 3.0] {
            detector.on_chunk_enqueued("s1", chunk(v));
        }

        assert_eq!(detector.on_chunk_playback_completed("s1"), CompletionStatus::Pending);
        assert_eq!(detector.on_producer_done("s1"), CompletionStatus::Pending);
        assert!(!detector.on_chunk_playback_completed("s1").is_last());
        assert!(detector.on_chunk_playback_completed("s1").is_last());

        let events = completions(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, "s1");
        assert_eq!(events[0].pattern, PATTERN_BUFFER_DRAINED);
        assert_eq!(events[0].source, TRIGGER_CHUNK_COMPLETED);
        assert!(events[0].finished);
        assert_eq!(detector.session_state("s1"), Some(SessionState::Completed));

        // Nothing after completion changes anything
        assert_eq!(detector.on_chunk_playback_completed("s1"), CompletionStatus::Ignored);
        assert_eq!(detector.on_producer_done("s1"), CompletionStatus::Ignored);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(completions(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_done_last_completes_drained_session() {
        let (detector, mut rx) = detector();
        detector.on_chunk_enqueued("s1", chunk(1.0));
        detector.on_chunk_playback_completed("s1");
        assert!(detector.on_producer_done("s1").is_last());

        let events = completions(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, TRIGGER_PRODUCER_DONE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_done_before_first_chunk_waits_for_audio() {
        let (detector, mut rx) = detector();
        assert_eq!(detector.on_producer_done("s1"), CompletionStatus::Pending);
        assert_eq!(detector.session_state("s1"), Some(SessionState::Idle));

        assert_eq!(detector.on_chunk_enqueued("s1", chunk(1.0)), CompletionStatus::Pending);
        assert_eq!(detector.pending_chunks("s1"), 1);
        assert!(completions(&mut rx).is_empty());

        assert!(detector.on_chunk_playback_completed("s1").is_last());
        let events = completions(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pattern, PATTERN_BUFFER_DRAINED);
        assert_eq!(detector.stats().late_signals_ignored, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_done_without_audio_ends_by_watchdog() {
        let (detector, mut rx) = detector();
        detector.on_producer_done("s1");
        // A stray chunk callback on an idle session does not complete it
        assert_eq!(detector.on_chunk_playback_completed("s1"), CompletionStatus::Pending);
        assert!(completions(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        let events = completions(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pattern, PATTERN_WATCHDOG_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_force_completes_idle_session() {
        let (detector, mut rx) = detector();
        detector.on_chunk_enqueued("s1", chunk(1.0));

        tokio::time::sleep(Duration::from_millis(9_900)).await;
        assert!(completions(&mut rx).is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let events = completions(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pattern, PATTERN_WATCHDOG_TIMEOUT);
        assert_eq!(events[0].source, TRIGGER_WATCHDOG);
        assert!(!events[0].finished);
        assert_eq!(detector.stats().completed_by_watchdog, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_restarts_watchdog() {
        let (detector, mut rx) = detector();
        for v in [1.0, 2.0, 3.0] {
            detector.on_chunk_enqueued("s1", chunk(v));
        }
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_secs(8)).await;
            detector.on_chunk_playback_completed("s1");
        }
        assert!(completions(&mut rx).is_empty());
        assert_eq!(detector.session_state("s1"), Some(SessionState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_started_session_times_out_without_audio() {
        let (detector, mut rx) = detector();
        detector.on_monitoring_started("s1");
        assert_eq!(detector.session_state("s1"), Some(SessionState::Idle));

        tokio::time::sleep(Duration::from_secs(11)).await;
        let events = completions(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(!events[0].finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_chunks_without_event() {
        let (detector, mut rx) = detector();
        detector.on_chunk_enqueued("s1", chunk(1.0));
        detector.on_chunk_enqueued("s1", chunk(2.0));

        let epoch = detector.cancel_epoch();
        assert!(detector.on_session_cancelled("s1"));
        assert!(!detector.on_session_cancelled("s1"));
        assert!(detector.cancel_epoch() > epoch);
        assert_eq!(detector.pending_chunks("s1"), 0);
        assert_eq!(detector.session_state("s1"), Some(SessionState::Cancelled));

        // Late signals are ignored, and the watchdog is gone
        assert_eq!(detector.on_chunk_enqueued("s1", chunk(3.0)), CompletionStatus::Ignored);
        assert_eq!(detector.on_producer_done("s1"), CompletionStatus::Ignored);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(completions(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_policy_extends_while_producer_active() {
        let bus = AudioEventBus::new(16);
        let mut rx = bus.subscribe();
        let mut probe = MockProducerProbe::new();
        probe.expect_is_producing().times(1).return_const(true);
        let config = PlaybackConfig {
            watchdog_policy: WatchdogPolicy::ReconcileWithProducer,
            ..Default::default()
        };
        let detector = PlaybackSessionCompletionDetector::with_probe(bus, Some(config), Some(Arc::new(probe)));

        detector.on_chunk_enqueued("s1", chunk(1.0));
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert!(completions(&mut rx).is_empty());

        // One extension only, then forced
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        let events = completions(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pattern, PATTERN_WATCHDOG_TIMEOUT);
        assert_eq!(detector.stats().watchdog_extensions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_next_hands_out_each_chunk_once_in_order() {
        let (detector, _rx) = detector();
        detector.on_chunk_enqueued("a", chunk(1.0));
        detector.on_chunk_enqueued("b", chunk(9.0));
        detector.on_chunk_enqueued("a", chunk(2.0));

        let order: Vec<(SessionId, f32)> = std::iter::from_fn(|| detector.take_next_for_playback())
            .map(|(id, c)| (id, c.samples[0]))
            .collect();
        assert_eq!(
            order,
            vec![("a".to_string(), 1.0), ("a".to_string(), 2.0), ("b".to_string(), 9.0)]
        );

        // Queue keeps the chunks until playback completes
        assert_eq!(detector.pending_chunks("a"), 2);
        detector.on_chunk_playback_completed("a");
        assert_eq!(detector.pending_chunks("a"), 1);
        assert!(detector.take_next_for_playback().is_none());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Played,
        ProducerDone,
    }

    proptest! {
        #[test]
        fn test_any_ordering_completes_exactly_once(chunks in 1usize..6, done_at in 0usize..6) {
            let done_at = done_at.min(chunks);
            let mut steps: Vec<Step> = vec![Step::Played; chunks];
            steps.insert(done_at, Step::ProducerDone);

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();
            runtime.block_on(async {
                let (detector, mut rx) = detector();
                for i in 0..chunks {
                    detector.on_chunk_enqueued("s", chunk(i as f32));
                }

                let mut completed_at = None;
                for (i, step) in steps.iter().enumerate() {
                    let status = match step {
                        Step::Played => detector.on_chunk_playback_completed("s"),
                        Step::ProducerDone => detector.on_producer_done("s"),
                    };
                    if status.is_last() {
                        assert!(completed_at.is_none());
                        completed_at = Some(i);
                    }
                }

                // Completion happens at the last step, when both conditions first hold
                assert_eq!(completed_at, Some(steps.len() - 1));
                assert_eq!(completions(&mut rx).len(), 1);
            });
        }
    }
}
