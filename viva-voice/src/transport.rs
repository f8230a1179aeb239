// Viva - Realtime transport client
//
// Owns one bidirectional streaming connection to the conversational service.
// The connect handshake is two-step: wait for `session.created`, push the
// session configuration, wait for `session.updated`. Each wait suspends on a
// one-shot signal resolved by the receive loop. A single receive loop runs
// for the lifetime of the connection; outbound events go through a writer
// task so send operations never block the caller.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{
    decode_inbound, encode_pcm16_base64, ApiErrorBody, ClientEvent, Inbound, ServerEvent,
    SessionConfig,
};

pub const DEFAULT_ENDPOINT: &str = "wss://api.openai.com/v1/realtime?model=gpt-realtime";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("no credential available")]
    NoCredential,
}

/// Supplies the opaque bearer token for the service.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Reads the token from an environment variable.
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new("VIVA_API_KEY")
    }
}

impl CredentialProvider for EnvCredentials {
    fn bearer_token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }
}

/// Receives decoded server events and the transport-level close.
pub trait RealtimeEventSink: Send + Sync {
    fn on_event(&self, event: ServerEvent);
    /// Called once when the connection closes from the server side or a
    /// receive error. Not called on an intentional `disconnect()`.
    fn on_closed(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingSessionCreated,
    ConfiguringSession,
    AwaitingSessionUpdated,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub endpoint: String,
    /// Cap on each handshake wait; a silent server fails `connect` instead
    /// of hanging it.
    pub handshake_timeout: Duration,
    /// Issue `response.create` right after the handshake so the assistant
    /// opens the conversation.
    pub initial_response: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            handshake_timeout: Duration::from_secs(15),
            initial_response: true,
        }
    }
}

type HandshakeTx = oneshot::Sender<Result<(), ProtocolError>>;
type HandshakeRx = oneshot::Receiver<Result<(), ProtocolError>>;

/// One-shot signals the receive loop resolves during the handshake. At most
/// one of each kind is outstanding per connection.
#[derive(Default)]
struct PendingHandshake {
    created: Option<HandshakeTx>,
    updated: Option<HandshakeTx>,
}

impl PendingHandshake {
    fn any(&self) -> bool {
        self.created.is_some() || self.updated.is_some()
    }

    fn fail_all(&mut self, make_err: impl Fn() -> ProtocolError) {
        if let Some(tx) = self.created.take() {
            let _ = tx.send(Err(make_err()));
        }
        if let Some(tx) = self.updated.take() {
            let _ = tx.send(Err(make_err()));
        }
    }
}

pub struct RealtimeClient {
    config: TransportConfig,
    credentials: Arc<dyn CredentialProvider>,
    sink: Arc<dyn RealtimeEventSink>,
    state: Arc<Mutex<ConnectionState>>,
    pending: Arc<Mutex<PendingHandshake>>,
    session_config: Mutex<SessionConfig>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    send_task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    pub fn new(
        config: TransportConfig,
        credentials: Arc<dyn CredentialProvider>,
        sink: Arc<dyn RealtimeEventSink>,
    ) -> Self {
        Self {
            config,
            credentials,
            sink,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            pending: Arc::new(Mutex::new(PendingHandshake::default())),
            session_config: Mutex::new(SessionConfig::default()),
            outbound: Mutex::new(None),
            recv_task: Mutex::new(None),
            send_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Open the socket and run the two-step handshake. Resolves once the
    /// session is configured and the connection is live.
    pub async fn connect(&self, instructions: &str, voice: &str) -> Result<(), ProtocolError> {
        let token = self
            .credentials
            .bearer_token()
            .ok_or(ProtocolError::NoCredential)?;
        self.begin_connecting()?;
        match self.connect_inner(token, instructions, voice).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shutdown_io(ConnectionState::Disconnected).await;
                Err(err)
            }
        }
    }

    async fn connect_inner(
        &self,
        token: String,
        instructions: &str,
        voice: &str,
    ) -> Result<(), ProtocolError> {
        let mut request = self
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| {
                ProtocolError::ConnectionFailed(format!(
                    "bad endpoint {}: {e}",
                    self.config.endpoint
                ))
            })?;
        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ProtocolError::NoCredential)?;
        let headers = request.headers_mut();
        headers.insert("Authorization", auth);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        log::info!("connecting to {}", self.config.endpoint);
        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
        let (ws_tx, ws_rx) = socket.split();

        let (created_rx, updated_rx) = self.arm_handshake()?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(out_tx);
        *self.send_task.lock() = Some(tokio::spawn(write_loop(ws_tx, out_rx)));
        *self.recv_task.lock() = Some(tokio::spawn(receive_loop(
            ws_rx,
            self.sink.clone(),
            self.state.clone(),
            self.pending.clone(),
        )));

        self.set_state(ConnectionState::AwaitingSessionCreated);
        self.await_handshake(created_rx, "session.created").await?;

        self.set_state(ConnectionState::ConfiguringSession);
        let session = {
            let mut config = self.session_config.lock();
            *config = SessionConfig {
                instructions: instructions.to_string(),
                voice: voice.to_string(),
                ..SessionConfig::default()
            };
            config.clone()
        };
        self.send_event(ClientEvent::SessionUpdate { session })?;

        self.set_state(ConnectionState::AwaitingSessionUpdated);
        self.await_handshake(updated_rx, "session.updated").await?;

        self.set_state(ConnectionState::Active);
        log::info!("session configured, connection active");
        if self.config.initial_response {
            self.send_event(ClientEvent::ResponseCreate { response: None })?;
        }
        Ok(())
    }

    fn begin_connecting(&self) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Disconnected | ConnectionState::Closed => {
                *state = ConnectionState::Connecting;
                Ok(())
            }
            ConnectionState::Active | ConnectionState::Closing => Err(
                ProtocolError::ConnectionFailed("already connected".to_string()),
            ),
            _ => Err(ProtocolError::ConnectionFailed(
                "connect already in progress".to_string(),
            )),
        }
    }

    fn arm_handshake(&self) -> Result<(HandshakeRx, HandshakeRx), ProtocolError> {
        let mut pending = self.pending.lock();
        if pending.any() {
            // begin_connecting should make this unreachable
            return Err(ProtocolError::ConnectionFailed(
                "handshake already pending".to_string(),
            ));
        }
        let (created_tx, created_rx) = oneshot::channel();
        let (updated_tx, updated_rx) = oneshot::channel();
        pending.created = Some(created_tx);
        pending.updated = Some(updated_tx);
        Ok((created_rx, updated_rx))
    }

    async fn await_handshake(&self, rx: HandshakeRx, what: &str) -> Result<(), ProtocolError> {
        match tokio::time::timeout(self.config.handshake_timeout, rx).await {
            Err(_) => Err(ProtocolError::ConnectionFailed(format!(
                "timed out waiting for {what}"
            ))),
            Ok(Err(_)) => Err(ProtocolError::ConnectionFailed(format!(
                "connection closed before {what}"
            ))),
            Ok(Ok(result)) => result,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock() = next;
    }

    /// Forward PCM16 mono bytes as a base64 append event.
    pub fn send_audio(&self, pcm16: &[u8]) -> Result<(), ProtocolError> {
        self.ensure_active()?;
        self.send_event(ClientEvent::InputAudioAppend {
            audio: encode_pcm16_base64(pcm16),
        })
    }

    pub fn commit_audio(&self) -> Result<(), ProtocolError> {
        self.ensure_active()?;
        self.send_event(ClientEvent::InputAudioCommit)
    }

    /// Ask the service to discard captured audio still sitting in its buffer.
    pub fn clear_audio(&self) -> Result<(), ProtocolError> {
        self.ensure_active()?;
        self.send_event(ClientEvent::InputAudioClear)
    }

    /// Push revised instructions by re-sending the full session configuration.
    pub fn update_instructions(&self, instructions: &str) -> Result<(), ProtocolError> {
        self.ensure_active()?;
        let session = {
            let mut config = self.session_config.lock();
            config.instructions = instructions.to_string();
            config.clone()
        };
        self.send_event(ClientEvent::SessionUpdate { session })
    }

    pub fn trigger_response(&self) -> Result<(), ProtocolError> {
        self.ensure_active()?;
        self.send_event(ClientEvent::ResponseCreate { response: None })
    }

    pub fn cancel_response(&self) -> Result<(), ProtocolError> {
        self.ensure_active()?;
        self.send_event(ClientEvent::ResponseCancel)
    }

    pub fn create_item(&self, item: serde_json::Value) -> Result<(), ProtocolError> {
        self.ensure_active()?;
        self.send_event(ClientEvent::ConversationItemCreate { item })
    }

    fn ensure_active(&self) -> Result<(), ProtocolError> {
        if *self.state.lock() == ConnectionState::Active {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }

    fn send_event(&self, event: ClientEvent) -> Result<(), ProtocolError> {
        let text = serde_json::to_string(&event)
            .map_err(|e| ProtocolError::InvalidResponse(e.to_string()))?;
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(ProtocolError::NotConnected)?;
        tx.send(Message::Text(text))
            .map_err(|_| ProtocolError::NotConnected)
    }

    /// Cancel the receive loop and close the socket. Idempotent.
    pub async fn disconnect(&self) {
        self.shutdown_io(ConnectionState::Closed).await;
    }

    async fn shutdown_io(&self, final_state: ConnectionState) {
        {
            let mut state = self.state.lock();
            if !matches!(
                *state,
                ConnectionState::Disconnected | ConnectionState::Closed
            ) {
                *state = ConnectionState::Closing;
            }
        }

        // Dropping the outbound sender ends the writer, which sends the
        // close frame on its way out.
        self.outbound.lock().take();
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        let send_task = self.send_task.lock().take();
        if let Some(task) = send_task {
            let _ = tokio::time::timeout(Duration::from_millis(200), task).await;
        }

        self.pending
            .lock()
            .fail_all(|| ProtocolError::ConnectionFailed("disconnected".to_string()));
        *self.state.lock() = final_state;
        log::info!("transport disconnected");
    }
}

async fn write_loop(mut ws_tx: WsSink, mut out_rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = out_rx.recv().await {
        if let Err(err) = ws_tx.send(message).await {
            log::warn!("websocket send failed: {err}");
            break;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
    let _ = ws_tx.close().await;
}

/// Single receive loop per connection: decode, route to handshake signals or
/// the sink, report transport-level close.
async fn receive_loop(
    mut ws_rx: WsStream,
    sink: Arc<dyn RealtimeEventSink>,
    state: Arc<Mutex<ConnectionState>>,
    pending: Arc<Mutex<PendingHandshake>>,
) {
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match decode_inbound(&text) {
                Ok(Inbound::Event(event)) => route_inbound(event, &pending, sink.as_ref()),
                Ok(Inbound::Unknown(kind)) => {
                    log::debug!("dropping unrecognized event type '{kind}'");
                }
                Err(err) => {
                    log::warn!("skipping undecodable event: {err}");
                }
            },
            Ok(Message::Close(frame)) => {
                log::info!("server closed connection: {frame:?}");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                log::warn!("websocket receive error: {err}");
                break;
            }
        }
    }

    *state.lock() = ConnectionState::Closed;
    pending
        .lock()
        .fail_all(|| ProtocolError::ConnectionFailed("connection closed during handshake".to_string()));
    sink.on_closed();
}

/// Dispatch one decoded event. Handshake events resolve their pending
/// signal and are consumed; an error event with a handshake outstanding
/// fails it; everything else is forwarded to the sink.
fn route_inbound(
    event: ServerEvent,
    pending: &Mutex<PendingHandshake>,
    sink: &dyn RealtimeEventSink,
) {
    match &event {
        ServerEvent::SessionCreated { .. } => {
            match pending.lock().created.take() {
                Some(tx) => {
                    let _ = tx.send(Ok(()));
                }
                None => log::error!("session.created received with no handshake outstanding"),
            }
            return;
        }
        ServerEvent::SessionUpdated { .. } => {
            match pending.lock().updated.take() {
                Some(tx) => {
                    let _ = tx.send(Ok(()));
                }
                None => log::error!("session.updated received with no handshake outstanding"),
            }
            return;
        }
        ServerEvent::Error { error } => {
            let mut pending = pending.lock();
            if pending.any() {
                log::warn!("handshake failed with api error: {error}");
                pending.fail_all(|| ProtocolError::Api(format_api_error(error)));
                return;
            }
        }
        _ => {}
    }
    sink.on_event(event);
}

fn format_api_error(body: &ApiErrorBody) -> String {
    body.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ServerEvent>>,
        closed: AtomicBool,
    }

    impl RealtimeEventSink for RecordingSink {
        fn on_event(&self, event: ServerEvent) {
            self.events.lock().push(event);
        }

        fn on_closed(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn event(json: &str) -> ServerEvent {
        match decode_inbound(json).expect("decode") {
            Inbound::Event(event) => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_created_resolves_pending_signal() {
        let pending = Mutex::new(PendingHandshake::default());
        let (tx, rx) = oneshot::channel();
        pending.lock().created = Some(tx);
        let sink = RecordingSink::default();

        route_inbound(event(r#"{"type":"session.created"}"#), &pending, &sink);

        assert!(rx.await.expect("signal resolved").is_ok());
        // Consumed by the handshake, not forwarded.
        assert!(sink.events.lock().is_empty());
        assert!(!pending.lock().any());
    }

    #[tokio::test]
    async fn error_before_session_created_fails_connect() {
        // Scenario: an api error arrives while the first handshake signal is
        // outstanding; the suspended connect resolves with that error.
        let pending = Mutex::new(PendingHandshake::default());
        let (created_tx, created_rx) = oneshot::channel();
        let (updated_tx, updated_rx) = oneshot::channel();
        pending.lock().created = Some(created_tx);
        pending.lock().updated = Some(updated_tx);
        let sink = RecordingSink::default();

        route_inbound(
            event(
                r#"{"type":"error","error":{"message":"bad session config","code":"invalid_request"}}"#,
            ),
            &pending,
            &sink,
        );

        let failure = created_rx.await.expect("signal resolved").unwrap_err();
        match failure {
            ProtocolError::Api(message) => assert!(message.contains("invalid_request")),
            other => panic!("expected api error, got {other:?}"),
        }
        // The second signal fails too; connect never reaches Active.
        assert!(updated_rx.await.expect("signal resolved").is_err());
        assert!(sink.events.lock().is_empty());
    }

    #[test]
    fn post_handshake_errors_are_forwarded_not_fatal() {
        let pending = Mutex::new(PendingHandshake::default());
        let sink = RecordingSink::default();

        route_inbound(
            event(r#"{"type":"error","error":{"message":"rate limited","code":"rate_limit"}}"#),
            &pending,
            &sink,
        );

        let events = sink.events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::Error { .. }));
    }

    #[test]
    fn duplicate_session_created_is_not_forwarded() {
        let pending = Mutex::new(PendingHandshake::default());
        let sink = RecordingSink::default();

        // No handshake outstanding: logged as a programming error, dropped.
        route_inbound(event(r#"{"type":"session.created"}"#), &pending, &sink);
        assert!(sink.events.lock().is_empty());
    }

    #[test]
    fn ordinary_events_reach_the_sink() {
        let pending = Mutex::new(PendingHandshake::default());
        let sink = RecordingSink::default();

        route_inbound(
            event(r#"{"type":"response.audio.delta","delta":"AAA="}"#),
            &pending,
            &sink,
        );
        route_inbound(event(r#"{"type":"response.done"}"#), &pending, &sink);

        let events = sink.events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ServerEvent::AudioDelta { .. }));
        assert!(matches!(events[1], ServerEvent::ResponseDone));
    }

    fn test_client() -> RealtimeClient {
        RealtimeClient::new(
            TransportConfig::default(),
            Arc::new(EnvCredentials::new("VIVA_TEST_UNSET_TOKEN")),
            Arc::new(RecordingSink::default()),
        )
    }

    #[test]
    fn send_operations_require_a_connection() {
        let client = test_client();
        assert!(matches!(
            client.send_audio(&[0, 1]),
            Err(ProtocolError::NotConnected)
        ));
        assert!(matches!(
            client.commit_audio(),
            Err(ProtocolError::NotConnected)
        ));
        assert!(matches!(
            client.clear_audio(),
            Err(ProtocolError::NotConnected)
        ));
        assert!(matches!(
            client.update_instructions("x"),
            Err(ProtocolError::NotConnected)
        ));
        assert!(matches!(
            client.trigger_response(),
            Err(ProtocolError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connect_without_credentials_fails_fast() {
        let client = test_client();
        let result = client.connect("instructions", "alloy").await;
        assert!(matches!(result, Err(ProtocolError::NoCredential)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out_instead_of_hanging() {
        let client = test_client();
        // Keep the sender alive so only the timeout can resolve the wait.
        let (_tx, rx) = oneshot::channel();
        let result = client.await_handshake(rx, "session.created").await;
        match result {
            Err(ProtocolError::ConnectionFailed(message)) => {
                assert!(message.contains("timed out"), "got: {message}")
            }
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_signal_reports_closed_connection() {
        let client = test_client();
        let (tx, rx) = oneshot::channel::<Result<(), ProtocolError>>();
        drop(tx);
        let result = client.await_handshake(rx, "session.updated").await;
        match result {
            Err(ProtocolError::ConnectionFailed(message)) => {
                assert!(message.contains("closed before"), "got: {message}")
            }
            other => panic!("expected closed failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let client = test_client();
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
