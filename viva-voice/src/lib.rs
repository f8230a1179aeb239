//! Viva Voice - Live spoken interview sessions over a realtime AI service.
//!
//! Provides the wire-protocol client (connect handshake, typed event
//! exchange), the audio pipeline (capture, resample, PCM16 conversion,
//! playback, level metering), and the turn coordinator that fuses the two
//! into a session with anti-feedback muting, transcript accumulation,
//! closing-intent detection, and periodic background instruction updates.

// Core modules
pub mod agent;
pub mod audio;
pub mod meter;
pub mod protocol;
pub mod session;
pub mod transcript;
pub mod transport;

// Re-export main types for convenience
pub use agent::{AgentContext, AgentError, AgentUpdate, InterviewAgent};
pub use audio::{capture_drops, AudioError, AudioFrame, AudioHost, AudioPipeline, CpalHost};
pub use meter::{LevelMeter, SharedLevel};
pub use protocol::{ClientEvent, MaxTokens, ServerEvent, SessionConfig, TurnDetection};
pub use session::{
    interview_instructions, ElapsedClock, LogEventSink, MuteGate, NoopEventSink, SessionError,
    SessionEvent, SessionEventSink, SessionOptions, SessionState, VoiceSession,
};
pub use transcript::{contains_closing_phrase, Speaker, Transcript, Utterance};
pub use transport::{
    ConnectionState, CredentialProvider, EnvCredentials, ProtocolError, RealtimeClient,
    RealtimeEventSink, TransportConfig,
};
