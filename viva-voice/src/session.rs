// Viva - Turn coordinator
//
// Fuses the transport and the audio pipeline into one conversational
// session. A single event-loop task serializes every state mutation: mic
// frames, server events, timer ticks, and control commands all funnel into
// one `select!`. The audio callback and the receive loop only ever enqueue.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::agent::{AgentContext, AgentError, AgentUpdate, InterviewAgent};
use crate::audio::{AudioError, AudioHost, AudioPipeline};
use crate::meter::SharedLevel;
use crate::protocol::{decode_pcm16_base64, ServerEvent};
use crate::transcript::{contains_closing_phrase, Speaker, Transcript, Utterance};
use crate::transport::{
    CredentialProvider, ProtocolError, RealtimeClient, RealtimeEventSink, TransportConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Paused,
    Ending,
    Ended,
}

impl SessionState {
    /// `Ended` is terminal: applying any transition to it yields `Ended`.
    pub fn apply(self, next: SessionState) -> SessionState {
        if self == SessionState::Ended {
            SessionState::Ended
        } else {
            next
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Ended
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Audio(#[from] AudioError),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Topic-derived interviewer instructions sent with the handshake.
    pub instructions: String,
    pub voice: String,
    pub target_duration: Duration,
    /// Minimum quiet time after the assistant's last audio chunk before the
    /// microphone is trusted again.
    pub bleed_guard: Duration,
    pub update_interval: Duration,
    /// Interview plan snapshot passed through to the agent.
    pub plan: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            voice: "alloy".to_string(),
            target_duration: Duration::from_secs(20 * 60),
            bleed_guard: Duration::from_millis(500),
            update_interval: Duration::from_secs(10),
            plan: None,
        }
    }
}

/// Interviewer instructions for a given topic.
pub fn interview_instructions(topic: &str) -> String {
    format!(
        "You are a warm, curious interviewer helping someone tell the story of \
         \"{topic}\". Ask one question at a time, follow up on concrete details, \
         and keep your speech natural and conversational."
    )
}

/// Events the session reports to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged { state: SessionState },
    /// Open utterance grew; carries the accumulated partial text.
    UtteranceUpdated { speaker: Speaker, text: String },
    UtteranceFinalized { speaker: Speaker, text: String },
    PhaseChanged { phase: String },
    ClosingDetected,
    /// Advisory only; the session decides separately what to do about it.
    AdvisoryError { message: String },
}

pub trait SessionEventSink: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

/// No-op event sink (silent operation).
pub struct NoopEventSink;
impl SessionEventSink for NoopEventSink {
    fn on_event(&self, _event: SessionEvent) {}
}

/// Logging event sink.
pub struct LogEventSink;
impl SessionEventSink for LogEventSink {
    fn on_event(&self, event: SessionEvent) {
        match &event {
            SessionEvent::StateChanged { state } => log::info!("[session] state: {state:?}"),
            SessionEvent::UtteranceUpdated { speaker, text } => {
                log::debug!("[session] {}… '{text}'", speaker.as_str());
            }
            SessionEvent::UtteranceFinalized { speaker, text } => {
                log::info!("[session] {}: '{text}'", speaker.as_str());
            }
            SessionEvent::PhaseChanged { phase } => log::info!("[session] phase: {phase}"),
            SessionEvent::ClosingDetected => log::info!("[session] closing intent detected"),
            SessionEvent::AdvisoryError { message } => log::warn!("[session] error: {message}"),
        }
    }
}

/// Derived mute state for feedback suppression. Not stored: recomputed from
/// these two facts on every captured frame.
#[derive(Debug)]
pub struct MuteGate {
    bleed_guard: Duration,
    assistant_speaking: bool,
    last_assistant_audio: Option<Instant>,
}

impl MuteGate {
    pub fn new(bleed_guard: Duration) -> Self {
        Self {
            bleed_guard,
            assistant_speaking: false,
            last_assistant_audio: None,
        }
    }

    /// Record an inbound assistant audio chunk. Returns true when this chunk
    /// starts a new assistant turn.
    pub fn note_assistant_audio(&mut self, now: Instant) -> bool {
        let turn_started = !self.assistant_speaking;
        self.assistant_speaking = true;
        self.last_assistant_audio = Some(now);
        turn_started
    }

    pub fn note_assistant_done(&mut self) {
        self.assistant_speaking = false;
    }

    /// Muted while the assistant speaks and for the bleed-guard window after
    /// its last chunk. The boundary instant itself is unmuted.
    pub fn is_muted(&self, now: Instant) -> bool {
        if self.assistant_speaking {
            return true;
        }
        match self.last_assistant_audio {
            Some(last) => now.duration_since(last) < self.bleed_guard,
            None => false,
        }
    }
}

/// Wall clock that freezes across pauses.
#[derive(Debug, Default)]
pub struct ElapsedClock {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl ElapsedClock {
    pub fn start(&mut self, now: Instant) {
        self.running_since = Some(now);
    }

    pub fn pause(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += now.duration_since(since);
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + now.duration_since(since),
            None => self.accumulated,
        }
    }
}

/// One-way latch: the first closing match wins, later matches are no-ops.
fn should_shutdown_on_final(closing_detected: &mut bool, text: &str) -> bool {
    if *closing_detected || !contains_closing_phrase(text) {
        return false;
    }
    *closing_detected = true;
    true
}

enum SessionCommand {
    Pause,
    Resume,
    End,
}

enum TransportSignal {
    Event(ServerEvent),
    Closed,
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<TransportSignal>,
}

impl RealtimeEventSink for ChannelSink {
    fn on_event(&self, event: ServerEvent) {
        let _ = self.tx.send(TransportSignal::Event(event));
    }

    fn on_closed(&self) {
        let _ = self.tx.send(TransportSignal::Closed);
    }
}

#[derive(Debug, Clone, Copy)]
enum EndReason {
    Requested,
    ClosingDetected,
}

/// Handle to a running session. Dropping it ends the session.
pub struct VoiceSession {
    state: Arc<Mutex<SessionState>>,
    transcript: Arc<Mutex<Transcript>>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: Option<JoinHandle<()>>,
    level: SharedLevel,
}

impl VoiceSession {
    /// Connect, start capture, and spawn the session event loop.
    pub async fn start(
        options: SessionOptions,
        transport: TransportConfig,
        credentials: Arc<dyn CredentialProvider>,
        host: Arc<dyn AudioHost>,
        agent: Option<Arc<dyn InterviewAgent>>,
        sink: Arc<dyn SessionEventSink>,
    ) -> Result<VoiceSession, SessionError> {
        let state = Arc::new(Mutex::new(SessionState::Idle));
        let transcript = Arc::new(Mutex::new(Transcript::new()));

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let client = RealtimeClient::new(
            transport,
            credentials,
            Arc::new(ChannelSink { tx: signal_tx }),
        );
        let mut pipeline = AudioPipeline::new(host);
        let level = pipeline.level_handle();

        emit_state(&state, sink.as_ref(), SessionState::Connecting);
        if let Err(err) = client.connect(&options.instructions, &options.voice).await {
            emit_state(&state, sink.as_ref(), SessionState::Idle);
            return Err(err.into());
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        if let Err(err) = begin_capture(&mut pipeline, &frame_tx) {
            client.disconnect().await;
            emit_state(&state, sink.as_ref(), SessionState::Idle);
            return Err(err.into());
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();

        let mut clock = ElapsedClock::default();
        clock.start(Instant::now());

        emit_state(&state, sink.as_ref(), SessionState::Active);

        let mute = MuteGate::new(options.bleed_guard);
        let runtime = SessionRuntime {
            options,
            client,
            pipeline,
            agent,
            sink,
            state: state.clone(),
            transcript: transcript.clone(),
            mute,
            clock,
            closing_detected: false,
            notes: String::new(),
            phase: None,
            next_question: None,
            updating: false,
            frame_tx,
            frame_rx,
            signal_rx,
            command_rx,
            agent_tx,
            agent_rx,
        };
        let task = tokio::spawn(runtime.run());

        Ok(VoiceSession {
            state,
            transcript,
            commands: command_tx,
            task: Some(task),
            level,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Snapshot of the transcript so far.
    pub fn transcript(&self) -> Vec<Utterance> {
        self.transcript.lock().entries().to_vec()
    }

    /// Smoothed microphone level in [0, 1].
    pub fn current_level(&self) -> f32 {
        self.level.load()
    }

    pub fn pause(&self) {
        let _ = self.commands.send(SessionCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(SessionCommand::Resume);
    }

    pub fn end(&self) {
        let _ = self.commands.send(SessionCommand::End);
    }

    /// Wait for the session loop to finish. Safe to call again after
    /// cancellation.
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
        }
        self.task = None;
    }
}

fn emit_state(state: &Arc<Mutex<SessionState>>, sink: &dyn SessionEventSink, next: SessionState) {
    let applied = {
        let mut guard = state.lock();
        let applied = guard.apply(next);
        if applied == *guard {
            return;
        }
        *guard = applied;
        applied
    };
    sink.on_event(SessionEvent::StateChanged { state: applied });
}

fn begin_capture(
    pipeline: &mut AudioPipeline,
    frame_tx: &mpsc::UnboundedSender<Vec<u8>>,
) -> Result<(), AudioError> {
    let tx = frame_tx.clone();
    pipeline.start_capture(move |frame| {
        let _ = tx.send(frame);
    })
}

struct SessionRuntime {
    options: SessionOptions,
    client: RealtimeClient,
    pipeline: AudioPipeline,
    agent: Option<Arc<dyn InterviewAgent>>,
    sink: Arc<dyn SessionEventSink>,
    state: Arc<Mutex<SessionState>>,
    transcript: Arc<Mutex<Transcript>>,
    mute: MuteGate,
    clock: ElapsedClock,
    closing_detected: bool,
    notes: String,
    phase: Option<String>,
    next_question: Option<String>,
    updating: bool,
    frame_tx: mpsc::UnboundedSender<Vec<u8>>,
    frame_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    signal_rx: mpsc::UnboundedReceiver<TransportSignal>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    agent_tx: mpsc::UnboundedSender<Result<AgentUpdate, AgentError>>,
    agent_rx: mpsc::UnboundedReceiver<Result<AgentUpdate, AgentError>>,
}

impl SessionRuntime {
    async fn run(mut self) {
        let mut update_tick = tokio::time::interval(self.options.update_interval);
        update_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(SessionCommand::Pause) => self.pause(),
                    Some(SessionCommand::Resume) => self.resume(),
                    Some(SessionCommand::End) | None => {
                        self.shutdown(EndReason::Requested).await;
                        break;
                    }
                },
                Some(frame) = self.frame_rx.recv() => self.forward_frame(frame),
                signal = self.signal_rx.recv() => match signal {
                    Some(TransportSignal::Event(event)) => {
                        if self.handle_server_event(event).await {
                            break;
                        }
                    }
                    Some(TransportSignal::Closed) | None => {
                        self.handle_transport_closed().await;
                        break;
                    }
                },
                _ = update_tick.tick() => self.maybe_begin_update(),
                Some(result) = self.agent_rx.recv() => self.apply_agent_result(result),
            }
        }
        // Breaking out drops the interval with everything else: no timer
        // fires against a torn-down session.
    }

    fn set_state(&self, next: SessionState) {
        emit_state(&self.state, self.sink.as_ref(), next);
    }

    fn current_state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Gate one captured frame on the derived mute state. Muted frames are
    /// dropped, never buffered.
    fn forward_frame(&mut self, frame: Vec<u8>) {
        if self.current_state() != SessionState::Active {
            return;
        }
        if self.mute.is_muted(Instant::now()) {
            return;
        }
        if let Err(err) = self.client.send_audio(&frame) {
            log::debug!("dropping captured frame: {err}");
        }
    }

    /// Returns true when the session ended and the loop should exit.
    async fn handle_server_event(&mut self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::AudioDelta { delta } => {
                let bytes = match decode_pcm16_base64(&delta) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        log::warn!("undecodable audio delta: {err}");
                        return false;
                    }
                };
                if self.mute.note_assistant_audio(Instant::now()) {
                    // New assistant turn: stale mic audio may still sit in
                    // the remote buffer from the tail of the previous mute
                    // window; clear it before it triggers a spurious turn.
                    if let Err(err) = self.client.clear_audio() {
                        log::debug!("clear_audio failed: {err}");
                    }
                }
                if let Err(err) = self.pipeline.playback(&bytes) {
                    log::warn!("playback failed: {err}");
                }
                false
            }
            ServerEvent::AudioDone | ServerEvent::ResponseDone => {
                self.mute.note_assistant_done();
                false
            }
            ServerEvent::AudioTranscriptDelta { delta } | ServerEvent::TextDelta { delta } => {
                let text = {
                    let mut transcript = self.transcript.lock();
                    transcript.append_delta(Speaker::Assistant, &delta);
                    transcript.open_text(Speaker::Assistant).unwrap_or_default()
                };
                self.sink.on_event(SessionEvent::UtteranceUpdated {
                    speaker: Speaker::Assistant,
                    text,
                });
                false
            }
            ServerEvent::AudioTranscriptDone { transcript }
            | ServerEvent::TextDone { text: transcript } => {
                self.finish_assistant_utterance(transcript).await
            }
            ServerEvent::InputTranscriptionCompleted { transcript } => {
                self.transcript.lock().finalize(Speaker::Human, &transcript);
                self.sink.on_event(SessionEvent::UtteranceFinalized {
                    speaker: Speaker::Human,
                    text: transcript,
                });
                false
            }
            ServerEvent::SpeechStarted => {
                log::debug!("speech started");
                false
            }
            ServerEvent::SpeechStopped => {
                log::debug!("speech stopped");
                false
            }
            ServerEvent::Error { error } => {
                // Post-handshake errors are advisory and do not close the
                // connection.
                self.sink.on_event(SessionEvent::AdvisoryError {
                    message: error.to_string(),
                });
                false
            }
            ServerEvent::RateLimitsUpdated { rate_limits } => {
                log::debug!("rate limits updated: {rate_limits}");
                false
            }
            other => {
                log::trace!("ignoring event: {other:?}");
                false
            }
        }
    }

    async fn finish_assistant_utterance(&mut self, text: String) -> bool {
        self.transcript.lock().finalize(Speaker::Assistant, &text);
        self.sink.on_event(SessionEvent::UtteranceFinalized {
            speaker: Speaker::Assistant,
            text: text.clone(),
        });
        if should_shutdown_on_final(&mut self.closing_detected, &text) {
            self.sink.on_event(SessionEvent::ClosingDetected);
            self.shutdown(EndReason::ClosingDetected).await;
            return true;
        }
        false
    }

    async fn handle_transport_closed(&mut self) {
        if self.closing_detected
            || matches!(
                self.current_state(),
                SessionState::Ending | SessionState::Ended
            )
        {
            // Intentional teardown; the close is expected and silent.
            return;
        }
        log::warn!("connection closed unexpectedly");
        self.sink.on_event(SessionEvent::AdvisoryError {
            message: "connection closed unexpectedly".to_string(),
        });
        self.pipeline.stop_capture();
        self.pipeline.stop_playback();
        self.client.disconnect().await;
        self.clock.pause(Instant::now());
        // Demoted, not Ended: the owner decides whether to retry.
        self.set_state(SessionState::Idle);
    }

    async fn shutdown(&mut self, reason: EndReason) {
        if self.current_state() == SessionState::Ended {
            return;
        }
        self.set_state(SessionState::Ending);
        self.pipeline.stop_capture();
        self.pipeline.stop_playback();
        self.client.disconnect().await;
        self.clock.pause(Instant::now());
        self.set_state(SessionState::Ended);
        log::info!("session ended ({reason:?})");
    }

    fn pause(&mut self) {
        if self.current_state() != SessionState::Active {
            return;
        }
        self.pipeline.stop_capture();
        self.clock.pause(Instant::now());
        self.set_state(SessionState::Paused);
    }

    fn resume(&mut self) {
        if self.current_state() != SessionState::Paused {
            return;
        }
        if let Err(err) = begin_capture(&mut self.pipeline, &self.frame_tx) {
            log::error!("failed to restart capture: {err}");
            self.sink.on_event(SessionEvent::AdvisoryError {
                message: format!("resume failed: {err}"),
            });
            return;
        }
        self.clock.resume(Instant::now());
        self.set_state(SessionState::Active);
    }

    /// Kick off one agent call if none is in flight. The call runs on its
    /// own task; results come back through the agent channel so the audio
    /// paths never wait on it.
    fn maybe_begin_update(&mut self) {
        if self.current_state() != SessionState::Active || self.updating {
            return;
        }
        let Some(agent) = self.agent.clone() else {
            return;
        };
        let transcript = {
            let transcript = self.transcript.lock();
            if transcript.is_empty() {
                return;
            }
            transcript.rendered()
        };
        let context = AgentContext {
            transcript,
            notes: self.notes.clone(),
            plan: self.options.plan.clone(),
            elapsed_secs: self.clock.elapsed(Instant::now()).as_secs(),
            target_secs: self.options.target_duration.as_secs(),
        };
        self.updating = true;
        let tx = self.agent_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(agent.refine(context).await);
        });
    }

    fn apply_agent_result(&mut self, result: Result<AgentUpdate, AgentError>) {
        self.updating = false;
        match result {
            Ok(update) => {
                self.notes = update.notes;
                self.next_question = update.next_question;
                if let Some(question) = &self.next_question {
                    log::debug!("suggested next question: {question}");
                }
                if let Some(phase) = update.phase {
                    if self.phase.as_deref() != Some(phase.as_str()) {
                        self.sink.on_event(SessionEvent::PhaseChanged {
                            phase: phase.clone(),
                        });
                    }
                    self.phase = Some(phase);
                }
                if let Some(instructions) = update.instructions {
                    if let Err(err) = self.client.update_instructions(&instructions) {
                        log::warn!("failed to push revised instructions: {err}");
                    }
                }
            }
            Err(err) => {
                // Absorbed: keep the prior instructions, never interrupt the
                // interview.
                log::warn!("periodic update failed, keeping prior instructions: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ended_is_terminal() {
        let ended = SessionState::Ended;
        for next in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Active,
            SessionState::Paused,
            SessionState::Ending,
        ] {
            assert_eq!(ended.apply(next), SessionState::Ended);
        }
        assert!(SessionState::Ended.is_terminal());
        assert!(!SessionState::Active.is_terminal());
    }

    #[test]
    fn mute_gate_tracks_assistant_turns() {
        let base = Instant::now();
        let mut gate = MuteGate::new(Duration::from_millis(500));

        assert!(!gate.is_muted(base));
        assert!(gate.note_assistant_audio(base), "first chunk starts a turn");
        assert!(
            !gate.note_assistant_audio(base + Duration::from_millis(40)),
            "later chunks do not"
        );
        assert!(gate.is_muted(base + Duration::from_millis(100)));

        gate.note_assistant_done();
        // Still inside the bleed-guard window.
        assert!(gate.is_muted(base + Duration::from_millis(400)));
        // The exact boundary is unmuted.
        assert!(!gate.is_muted(base + Duration::from_millis(540)));
    }

    #[test]
    fn mute_gate_boundary_is_exact() {
        let base = Instant::now();
        let guard = Duration::from_millis(500);
        let mut gate = MuteGate::new(guard);
        gate.note_assistant_audio(base);
        gate.note_assistant_done();

        assert!(gate.is_muted(base + guard - Duration::from_nanos(1)));
        assert!(!gate.is_muted(base + guard));
        assert!(!gate.is_muted(base + guard + Duration::from_nanos(1)));
    }

    #[test]
    fn new_turn_flag_reset_by_done() {
        let base = Instant::now();
        let mut gate = MuteGate::new(Duration::from_millis(500));
        assert!(gate.note_assistant_audio(base));
        gate.note_assistant_done();
        // Next chunk is a fresh turn again.
        assert!(gate.note_assistant_audio(base + Duration::from_secs(1)));
    }

    #[test]
    fn elapsed_clock_freezes_while_paused() {
        let base = Instant::now();
        let mut clock = ElapsedClock::default();
        clock.start(base);

        clock.pause(base + Duration::from_secs(10));
        assert_eq!(
            clock.elapsed(base + Duration::from_secs(60)),
            Duration::from_secs(10)
        );

        clock.resume(base + Duration::from_secs(60));
        assert_eq!(
            clock.elapsed(base + Duration::from_secs(65)),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn closing_latch_fires_exactly_once() {
        let mut closing = false;
        assert!(should_shutdown_on_final(
            &mut closing,
            "Well — thank you for sharing your story today."
        ));
        // A second identical utterance afterwards triggers nothing.
        assert!(!should_shutdown_on_final(
            &mut closing,
            "Well — thank you for sharing your story today."
        ));
        assert!(!should_shutdown_on_final(&mut closing, "take care now"));
    }

    #[test]
    fn non_closing_text_leaves_latch_unset() {
        let mut closing = false;
        assert!(!should_shutdown_on_final(
            &mut closing,
            "tell me more about the farm"
        ));
        assert!(!closing);
    }

    #[test]
    fn instructions_mention_the_topic() {
        let instructions = interview_instructions("my grandmother's bakery");
        assert!(instructions.contains("my grandmother's bakery"));
    }
}
