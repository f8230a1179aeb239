// Viva CLI - run a live interview session from the terminal.
//
// Configuration comes from the environment:
//   VIVA_API_KEY          bearer token for the realtime service (required)
//   VIVA_ENDPOINT         websocket endpoint (optional)
//   VIVA_TOPIC            interview topic
//   VIVA_VOICE            assistant voice id
//   VIVA_TARGET_MINUTES   target session length

use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use viva_voice::{
    interview_instructions, AudioHost, CpalHost, EnvCredentials, SessionEvent, SessionEventSink,
    SessionOptions, Speaker, TransportConfig, VoiceSession,
};

/// Prints finalized turns to stdout, everything else to stderr.
struct ConsoleSink;

impl SessionEventSink for ConsoleSink {
    fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { state } => eprintln!("[session] state: {state:?}"),
            SessionEvent::UtteranceUpdated { .. } => {}
            SessionEvent::UtteranceFinalized { speaker, text } => {
                let tag = match speaker {
                    Speaker::Human => "you",
                    Speaker::Assistant => "viva",
                };
                println!("{tag}: {text}");
            }
            SessionEvent::PhaseChanged { phase } => eprintln!("[session] phase: {phase}"),
            SessionEvent::ClosingDetected => eprintln!("[session] closing intent detected"),
            SessionEvent::AdvisoryError { message } => eprintln!("[session] error: {message}"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let topic = env_or("VIVA_TOPIC", "a story from your life");
    let minutes: u64 = env_or("VIVA_TARGET_MINUTES", "20").parse().unwrap_or(20);
    let options = SessionOptions {
        instructions: interview_instructions(&topic),
        voice: env_or("VIVA_VOICE", "alloy"),
        target_duration: Duration::from_secs(minutes * 60),
        ..SessionOptions::default()
    };

    let mut transport = TransportConfig::default();
    if let Ok(endpoint) = env::var("VIVA_ENDPOINT") {
        if !endpoint.trim().is_empty() {
            transport.endpoint = endpoint;
        }
    }

    let host: Arc<dyn AudioHost> = Arc::new(CpalHost);
    eprintln!(
        "[audio] default input: {}",
        host.default_input().unwrap_or_else(|| "none".to_string())
    );
    eprintln!(
        "[audio] default output: {}",
        host.default_output().unwrap_or_else(|| "none".to_string())
    );

    eprintln!("[session] topic: {topic} (target {minutes} min)");
    let mut session = match VoiceSession::start(
        options,
        transport,
        Arc::new(EnvCredentials::default()),
        host,
        None,
        Arc::new(ConsoleSink),
    )
    .await
    {
        Ok(session) => session,
        Err(err) => {
            eprintln!("[session] failed to start: {err}");
            process::exit(1);
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            eprintln!("[session] interrupt received, ending session");
            session.end();
            session.wait().await;
        }
        _ = session.wait() => {}
    }

    let transcript = session.transcript();
    eprintln!(
        "[session] finished with {} utterance(s), state {:?}",
        transcript.len(),
        session.state()
    );
}
