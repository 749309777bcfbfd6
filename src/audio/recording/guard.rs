// Recording active guard
//
// The atomic `active` flag is the single gate between the input hardware callback and
// whatever consumes captured audio. Stopping always walks the same five steps, in order:
//   1. flip `active` to false
//   2. grace delay so in-flight callbacks observe the flag
//   3. stop the capture hardware (bounded)
//   4. drive the external mic state machine to idle, verify, correct
//   5. publish exactly one microphone.closed
// Steps 4 and 5 sit behind a drop guard and also run when step 3 fails or the stopping
// future is dropped. The session stays in its slot, marked stopping, until step 5 is done,
// so no new session can start while the old one is being torn down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audio::events::{AudioEventBus, AudioEventKind, MicrophoneClosedEvent};
use crate::audio::hardware::InputSink;
use crate::audio::types::SessionId;

pub const REASON_FORCED_CLEANUP: &str = "forced_cleanup";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingGuardConfig {
    pub grace_delay_ms: u64,
    pub hardware_stop_timeout_ms: u64,
}

impl Default for RecordingGuardConfig {
    fn default() -> Self {
        Self {
            grace_delay_ms: 100,
            hardware_stop_timeout_ms: 2_000,
        }
    }
}

impl RecordingGuardConfig {
    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }

    pub fn hardware_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.hardware_stop_timeout_ms)
    }
}

/// States of the external microphone state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicState {
    Idle,
    Listening,
    Recording,
}

/// External microphone state machine the guard keeps in sync
#[cfg_attr(test, mockall::automock)]
pub trait MicStateMachine: Send + Sync {
    fn set_state(&self, state: MicState);
    fn state(&self) -> MicState;
}

/// Plain in-process mic state
#[derive(Debug)]
pub struct InMemoryMicState {
    state: Mutex<MicState>,
}

impl Default for InMemoryMicState {
    fn default() -> Self {
        Self {
            state: Mutex::new(MicState::Idle),
        }
    }
}

impl MicStateMachine for InMemoryMicState {
    fn set_state(&self, state: MicState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn state(&self) -> MicState {
        self.state.lock().map(|s| *s).unwrap_or(MicState::Idle)
    }
}

/// Hardware side of capture
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureControl: Send + Sync {
    async fn stop_capture(&self, session_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct RecordingSession {
    session_id: SessionId,
    started_at: Instant,
    stopping: bool,
}

pub struct RecordingActiveGuard {
    active: Arc<AtomicBool>,
    session: Mutex<Option<RecordingSession>>,
    mic: Arc<dyn MicStateMachine>,
    capture: Arc<dyn CaptureControl>,
    bus: AudioEventBus,
    config: RecordingGuardConfig,
}

/// Runs steps 4 and 5 exactly once, from `run` or on drop
struct StopCleanup<'a> {
    guard: &'a RecordingActiveGuard,
    session_id: SessionId,
    reason: String,
    done: bool,
}

impl StopCleanup<'_> {
    fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.guard.settle_mic_state();
        self.guard.bus.publish(AudioEventKind::MicrophoneClosed(MicrophoneClosedEvent {
            session_id: self.session_id.clone(),
            reason: self.reason.clone(),
        }));
        self.guard.release_session(&self.session_id);
        info!("🎙️ Microphone closed for session {} ({})", self.session_id, self.reason);
    }
}

impl Drop for StopCleanup<'_> {
    fn drop(&mut self) {
        if !self.done {
            warn!("⚠️ Stop of session {} interrupted, running cleanup", self.session_id);
            self.run();
        }
    }
}

impl RecordingActiveGuard {
    pub fn new(
        mic: Arc<dyn MicStateMachine>,
        capture: Arc<dyn CaptureControl>,
        bus: AudioEventBus,
        config: Option<RecordingGuardConfig>,
    ) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
            mic,
            capture,
            bus,
            config: config.unwrap_or_default(),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<RecordingSession>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark `session_id` as recording.
    ///
    /// Returns false when another session is still active or still stopping.
    pub fn begin(&self, session_id: &str) -> bool {
        let mut session = self.lock_session();
        if let Some(current) = session.as_ref() {
            warn!(
                "⚠️ Cannot begin recording {}: session {} is still {}",
                session_id,
                current.session_id,
                if current.stopping { "stopping" } else { "active" }
            );
            return false;
        }
        *session = Some(RecordingSession {
            session_id: session_id.to_string(),
            started_at: Instant::now(),
            stopping: false,
        });
        self.active.store(true, Ordering::SeqCst);
        self.mic.set_state(MicState::Recording);
        info!("🎙️ Recording session {} active", session_id);
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.lock_session().as_ref().map(|s| s.session_id.clone())
    }

    /// True between the start of a stop and its final notification
    pub fn is_stopping(&self) -> bool {
        self.lock_session().as_ref().map_or(false, |s| s.stopping)
    }

    /// Gate for the input callback path; forwards only while the guard is active
    pub fn callback_gate(&self, inner: Arc<dyn InputSink>) -> RecordingGate {
        RecordingGate {
            active: self.active.clone(),
            inner,
            dropped_callbacks: AtomicU64::new(0),
        }
    }

    /// Stop `session_id`.
    ///
    /// Idempotent: only the first call for the active session runs the stop protocol and
    /// returns true; later or mismatched calls return false without side effects.
    pub async fn end(&self, session_id: &str, reason: &str) -> bool {
        let session = {
            let mut current = self.lock_session();
            match current.as_mut() {
                Some(s) if s.session_id == session_id && !s.stopping => {
                    s.stopping = true;
                    Some(s.clone())
                }
                Some(s) => {
                    debug!(
                        "🔇 end({}) ignored, session {} (stopping: {})",
                        session_id, s.session_id, s.stopping
                    );
                    None
                }
                None => None,
            }
        };
        match session {
            Some(session) => {
                self.run_stop(session, reason).await;
                true
            }
            None => false,
        }
    }

    /// Last-resort stop of whatever session is active.
    ///
    /// A session that is already stopping is left to finish its own cleanup.
    pub async fn force_cleanup(&self, reason: Option<&str>) -> bool {
        let session = {
            let mut current = self.lock_session();
            match current.as_mut() {
                Some(s) if s.stopping => {
                    debug!("🔇 force_cleanup ignored, session {} already stopping", s.session_id);
                    return false;
                }
                Some(s) => {
                    s.stopping = true;
                    Some(s.clone())
                }
                None => None,
            }
        };
        match session {
            Some(session) => {
                self.run_stop(session, reason.unwrap_or(REASON_FORCED_CLEANUP)).await;
                true
            }
            None => {
                // Nothing tracked, but the flag and mic state must still agree
                self.active.store(false, Ordering::SeqCst);
                self.settle_mic_state();
                false
            }
        }
    }

    fn release_session(&self, session_id: &str) {
        let mut current = self.lock_session();
        if current.as_ref().map_or(false, |s| s.session_id == session_id) {
            *current = None;
        }
    }

    async fn run_stop(&self, session: RecordingSession, reason: &str) {
        info!(
            "🛑 Stopping recording session {} after {:?} ({})",
            session.session_id,
            session.started_at.elapsed(),
            reason
        );

        // 1
        self.active.store(false, Ordering::SeqCst);

        let mut cleanup = StopCleanup {
            guard: self,
            session_id: session.session_id.clone(),
            reason: reason.to_string(),
            done: false,
        };

        // 2
        tokio::time::sleep(self.config.grace_delay()).await;

        // 3
        match tokio::time::timeout(
            self.config.hardware_stop_timeout(),
            self.capture.stop_capture(&session.session_id),
        )
        .await
        {
            Ok(Ok(())) => debug!("✅ Capture hardware stopped for {}", session.session_id),
            Ok(Err(e)) => error!("❌ Capture stop failed for {}: {:#}", session.session_id, e),
            Err(_) => error!(
                "❌ Capture stop for {} timed out after {} ms",
                session.session_id, self.config.hardware_stop_timeout_ms
            ),
        }

        // 4 + 5
        cleanup.run();
    }

    fn settle_mic_state(&self) {
        self.mic.set_state(MicState::Idle);
        let observed = self.mic.state();
        if observed != MicState::Idle {
            warn!("⚠️ Mic state still {:?} after stop, forcing idle", observed);
            self.mic.set_state(MicState::Idle);
            let corrected = self.mic.state();
            if corrected != MicState::Idle {
                error!("❌ Mic state machine refuses idle (still {:?})", corrected);
            }
        }
    }
}

impl std::fmt::Debug for RecordingActiveGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingActiveGuard")
            .field("active", &self.is_active())
            .field("session", &self.current_session())
            .finish()
    }
}

/// `InputSink` that forwards only while its guard is active
pub struct RecordingGate {
    active: Arc<AtomicBool>,
    inner: Arc<dyn InputSink>,
    dropped_callbacks: AtomicU64,
}

impl RecordingGate {
    /// Callbacks discarded because the guard was inactive
    pub fn dropped_callbacks(&self) -> u64 {
        self.dropped_callbacks.load(Ordering::Relaxed)
    }
}

impl InputSink for RecordingGate {
    fn on_input(&self, samples: &[f32]) {
        if self.active.load(Ordering::SeqCst) {
            self.inner.on_input(samples);
        } else {
            self.dropped_callbacks.fetch_add(1, Ordering::Relaxed);
        }
    }
}
