//! Text-to-speech over the Socket.IO relay.
//!
//! [`TtsService`] owns a single relay connection. Each speech request is
//! tagged with a fresh request id; replies carrying that id resolve exactly
//! that request, and replies without one fall back to matching the echoed
//! text against the oldest pending request with the same text.

use crate::error::TtsError;
use crate::playback::AudioClip;
use crate::protocol::{
    AudioResponse, EVENT_AUDIO_RESPONSE, EVENT_TEXT_TO_SPEECH, EVENT_TTS_ERROR,
    TextToSpeechRequest, TtsErrorPayload,
};
use crate::socketio::{self, Handshake, Packet};
use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SpeechReply = oneshot::Sender<Result<AudioClip, TtsError>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 64;

/// Bounded reconnection schedule: `min(max_delay, base_delay * 2^attempt)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

enum Command {
    Speak {
        request_id: String,
        text: String,
        reply: SpeechReply,
    },
    Cancel {
        request_id: String,
    },
}

struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    failure: watch::Receiver<Option<TtsError>>,
    task: JoinHandle<()>,
}

pub struct TtsService {
    config: TtsConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    audio_events: broadcast::Sender<AudioResponse>,
    error_events: broadcast::Sender<TtsErrorPayload>,
    connection: Mutex<Option<Connection>>,
}

impl TtsService {
    pub fn new(config: TtsConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (audio_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (error_events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            state: Arc::new(state),
            audio_events,
            error_events,
            connection: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Opens the relay connection, retrying per the reconnect policy.
    ///
    /// Resolves once the relay is connected. If a connection task is already
    /// running, waits on it instead of starting another, so concurrent
    /// callers share one outcome.
    pub async fn connect(&self) -> Result<(), TtsError> {
        let (mut state, failure) = loop {
            let finishing = {
                let mut slot = self.lock_connection();
                match slot.take() {
                    Some(connection)
                        if !connection.task.is_finished()
                            && self.state() != ConnectionState::Disconnected =>
                    {
                        let failure = connection.failure.clone();
                        *slot = Some(connection);
                        break (self.state.subscribe(), failure);
                    }
                    Some(connection) if !connection.task.is_finished() => connection,
                    _ => {
                        let connection = self.spawn_connection();
                        let failure = connection.failure.clone();
                        *slot = Some(connection);
                        break (self.state.subscribe(), failure);
                    }
                }
            };
            // A task that already reported Disconnected is on its way out.
            finishing.shutdown.cancel();
            let _ = finishing.task.await;
        };

        let connected = state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|s| *s == ConnectionState::Connected);
        match connected {
            Ok(true) => Ok(()),
            _ => Err(failure.borrow().clone().unwrap_or(TtsError::Disconnected)),
        }
    }

    fn spawn_connection(&self) -> Connection {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure) = watch::channel(None);
        let shutdown = CancellationToken::new();
        self.state.send_replace(ConnectionState::Connecting);
        let task = tokio::spawn(
            ConnectionTask {
                url: socketio::socket_url(&self.config.url),
                policy: self.config.reconnect,
                state: Arc::clone(&self.state),
                failure: failure_tx,
                audio_events: self.audio_events.clone(),
                error_events: self.error_events.clone(),
                shutdown: shutdown.clone(),
                pending: PendingRequests::default(),
            }
            .run(command_rx),
        );
        Connection {
            commands,
            shutdown,
            failure,
            task,
        }
    }

    /// Closes the connection without reconnecting. Pending requests fail
    /// with [`TtsError::Disconnected`]; a later `connect` starts over.
    pub async fn disconnect(&self) {
        let connection = self.lock_connection().take();
        if let Some(connection) = connection {
            connection.shutdown.cancel();
            if let Err(err) = connection.task.await {
                warn!(error = %err, "speech relay task ended abnormally");
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Sends `text` for synthesis. Fails locally, sending nothing, when the
    /// relay is not connected.
    ///
    /// No timeout is applied; wrap the returned future in
    /// `tokio::time::timeout` to bound the wait. Dropping it unregisters the
    /// request.
    pub fn request_speech(&self, text: impl Into<String>) -> Result<PendingSpeech, TtsError> {
        if self.state() != ConnectionState::Connected {
            return Err(TtsError::NotConnected);
        }
        let commands = self
            .lock_connection()
            .as_ref()
            .map(|c| c.commands.clone())
            .ok_or(TtsError::NotConnected)?;

        let request_id = Uuid::new_v4().to_string();
        let (reply, receiver) = oneshot::channel();
        commands
            .send(Command::Speak {
                request_id: request_id.clone(),
                text: text.into(),
                reply,
            })
            .map_err(|_| TtsError::NotConnected)?;

        Ok(PendingSpeech {
            request_id,
            receiver,
            commands,
            settled: false,
        })
    }

    /// Every `audio-response` event, correlated or not.
    pub fn audio_responses(&self) -> impl Stream<Item = AudioResponse> + Send + use<> {
        BroadcastStream::new(self.audio_events.subscribe())
            .filter_map(|item| async move { item.ok() })
    }

    /// Every `tts-error` event.
    pub fn errors(&self) -> impl Stream<Item = TtsErrorPayload> + Send + use<> {
        BroadcastStream::new(self.error_events.subscribe())
            .filter_map(|item| async move { item.ok() })
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TtsService {
    fn drop(&mut self) {
        if let Some(connection) = self.lock_connection().take() {
            connection.shutdown.cancel();
        }
    }
}

/// A speech request awaiting its `audio-response`.
pub struct PendingSpeech {
    request_id: String,
    receiver: oneshot::Receiver<Result<AudioClip, TtsError>>,
    commands: mpsc::UnboundedSender<Command>,
    settled: bool,
}

impl PendingSpeech {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Stops waiting and removes the request's listener.
    pub fn cancel(self) {}
}

impl Future for PendingSpeech {
    type Output = Result<AudioClip, TtsError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(result) => {
                this.settled = true;
                Poll::Ready(result.unwrap_or(Err(TtsError::Disconnected)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingSpeech {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.commands.send(Command::Cancel {
                request_id: self.request_id.clone(),
            });
        }
    }
}

struct PendingRequest {
    id: String,
    text: String,
    reply: SpeechReply,
}

/// Outstanding requests in the order they were sent.
#[derive(Default)]
struct PendingRequests {
    entries: Vec<PendingRequest>,
}

impl PendingRequests {
    fn insert(&mut self, id: String, text: String, reply: SpeechReply) {
        self.entries.push(PendingRequest { id, text, reply });
    }

    fn remove(&mut self, id: &str) -> Option<SpeechReply> {
        let idx = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(idx).reply)
    }

    /// Finds the request a response answers: by id when the response has
    /// one, otherwise the oldest request with byte-identical text.
    fn take_match(&mut self, request_id: Option<&str>, text: &str) -> Option<SpeechReply> {
        self.entries.retain(|entry| !entry.reply.is_closed());
        match request_id {
            Some(id) => self.remove(id),
            None => {
                let idx = self.entries.iter().position(|entry| entry.text == text)?;
                Some(self.entries.remove(idx).reply)
            }
        }
    }

    fn fail_all(&mut self, err: &TtsError) {
        for entry in self.entries.drain(..) {
            let _ = entry.reply.send(Err(err.clone()));
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

enum SessionEnd {
    Shutdown,
    ServerClosed,
    Dropped(String),
}

struct ConnectionTask {
    url: String,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ConnectionState>>,
    // Why the task gave up, set before it reports Disconnected.
    failure: watch::Sender<Option<TtsError>>,
    audio_events: broadcast::Sender<AudioResponse>,
    error_events: broadcast::Sender<TtsErrorPayload>,
    shutdown: CancellationToken,
    pending: PendingRequests,
}

impl ConnectionTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut reconnecting = false;

        loop {
            let (ws, handshake) = match self.establish(reconnecting).await {
                Ok(Some(open)) => open,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "speech relay unreachable");
                    self.failure.send_replace(Some(err));
                    break;
                }
            };

            self.state.send_replace(ConnectionState::Connected);
            info!(url = %self.url, sid = %handshake.sid, "speech relay connected");

            match self.session(ws, &handshake, &mut commands).await {
                SessionEnd::Shutdown => break,
                SessionEnd::ServerClosed => {
                    info!("speech relay closed the session");
                    break;
                }
                SessionEnd::Dropped(reason) => {
                    warn!(%reason, pending = self.pending.len(), "speech relay connection dropped");
                    self.state.send_replace(ConnectionState::Connecting);
                    self.pending.fail_all(&TtsError::Disconnected);
                    reconnecting = true;
                }
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        self.pending.fail_all(&TtsError::Disconnected);
    }

    // Ok(None) means shutdown was requested while connecting. A reconnect
    // waits out the first delay before its first attempt.
    async fn establish(
        &self,
        reconnecting: bool,
    ) -> Result<Option<(WsStream, Handshake)>, TtsError> {
        let mut last_error = String::new();

        for attempt in 0..=self.policy.max_attempts {
            let retry = if reconnecting {
                Some(attempt)
            } else {
                attempt.checked_sub(1)
            };
            if let Some(retry) = retry {
                let delay = self.policy.delay_for(retry);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying speech relay");
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.state.send_replace(ConnectionState::Connecting);
            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                opened = tokio::time::timeout(HANDSHAKE_TIMEOUT, open_socket(&self.url)) => opened,
            };
            match opened {
                Ok(Ok(open)) => return Ok(Some(open)),
                Ok(Err(err)) => last_error = err,
                Err(_) => last_error = "handshake timed out".to_string(),
            }
        }

        Err(TtsError::ConnectFailed {
            url: self.url.clone(),
            attempts: self.policy.max_attempts.saturating_add(1),
            reason: last_error,
        })
    }

    async fn session(
        &mut self,
        ws: WsStream,
        handshake: &Handshake,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let heartbeat = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
        let deadline = tokio::time::sleep(heartbeat);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = sink.send(text_frame(&Packet::Disconnect)).await;
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                command = commands.recv() => match command {
                    None => return SessionEnd::Shutdown,
                    Some(Command::Speak { request_id, text, reply }) => {
                        let payload = TextToSpeechRequest {
                            text: text.clone(),
                            request_id: Some(request_id.clone()),
                        };
                        let packet = match Packet::event(EVENT_TEXT_TO_SPEECH, payload) {
                            Ok(packet) => packet,
                            Err(err) => {
                                let _ = reply.send(Err(TtsError::Server {
                                    message: "could not encode request".to_string(),
                                    error: err.to_string(),
                                }));
                                continue;
                            }
                        };
                        debug!(%request_id, chars = text.chars().count(), "sending speech request");
                        self.pending.insert(request_id, text, reply);
                        if let Err(err) = sink.send(text_frame(&packet)).await {
                            return SessionEnd::Dropped(err.to_string());
                        }
                    }
                    Some(Command::Cancel { request_id }) => {
                        if self.pending.remove(&request_id).is_some() {
                            debug!(%request_id, "speech request cancelled");
                        }
                    }
                },
                _ = &mut deadline => {
                    return SessionEnd::Dropped("heartbeat timed out".to_string());
                }
                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
                        None => return SessionEnd::Dropped("socket closed".to_string()),
                    };
                    deadline.as_mut().reset(tokio::time::Instant::now() + heartbeat);

                    let text = match message {
                        Message::Text(text) => text,
                        Message::Close(_) => return SessionEnd::Dropped("socket closed".to_string()),
                        _ => continue,
                    };
                    match Packet::decode(text.as_str()) {
                        Ok(Packet::Ping) => {
                            if let Err(err) = sink.send(text_frame(&Packet::Pong)).await {
                                return SessionEnd::Dropped(err.to_string());
                            }
                        }
                        Ok(Packet::Event { name, payload }) => self.dispatch(&name, payload),
                        Ok(Packet::Disconnect) => return SessionEnd::ServerClosed,
                        Ok(Packet::Close) => {
                            return SessionEnd::Dropped("transport closed by server".to_string());
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "skipping malformed relay frame"),
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, name: &str, payload: Value) {
        match name {
            EVENT_AUDIO_RESPONSE => {
                let response: AudioResponse = match serde_json::from_value(payload) {
                    Ok(response) => response,
                    Err(err) => {
                        warn!(error = %err, "skipping malformed audio-response");
                        return;
                    }
                };
                let _ = self.audio_events.send(response.clone());

                let Some(reply) = self
                    .pending
                    .take_match(response.request_id.as_deref(), &response.text)
                else {
                    debug!(request_id = ?response.request_id, "audio-response matched no request");
                    return;
                };
                let clip = AudioClip::from_base64(&response.audio, response.mime_type.as_deref())
                    .map_err(|err| TtsError::InvalidAudio(err.to_string()));
                let _ = reply.send(clip);
            }
            EVENT_TTS_ERROR => {
                let payload: TtsErrorPayload = match serde_json::from_value(payload) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "skipping malformed tts-error");
                        return;
                    }
                };
                warn!(message = %payload.message, error = %payload.error, "speech relay error");
                let _ = self.error_events.send(payload.clone());

                let err = TtsError::Server {
                    message: payload.message,
                    error: payload.error,
                };
                match payload.request_id {
                    Some(id) => {
                        if let Some(reply) = self.pending.remove(&id) {
                            let _ = reply.send(Err(err));
                        }
                    }
                    None => self.pending.fail_all(&err),
                }
            }
            other => debug!(event = other, "ignoring relay event"),
        }
    }
}

async fn open_socket(url: &str) -> Result<(WsStream, Handshake), String> {
    let (mut ws, _) = connect_async(url).await.map_err(|e| e.to_string())?;

    let handshake = loop {
        match next_packet(&mut ws).await? {
            Packet::Open(handshake) => break handshake,
            other => debug!(?other, "ignoring packet before open"),
        }
    };

    ws.send(text_frame(&Packet::Connect(None)))
        .await
        .map_err(|e| e.to_string())?;

    loop {
        match next_packet(&mut ws).await? {
            Packet::Connect(_) => return Ok((ws, handshake)),
            Packet::ConnectError(data) => return Err(format!("connection refused: {data}")),
            Packet::Ping => ws
                .send(text_frame(&Packet::Pong))
                .await
                .map_err(|e| e.to_string())?,
            other => debug!(?other, "ignoring packet before connect"),
        }
    }
}

async fn next_packet(ws: &mut WsStream) -> Result<Packet, String> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return Packet::decode(text.as_str()).map_err(|e| e.to_string());
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err("closed during handshake".to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.to_string()),
        }
    }
}

fn text_frame(packet: &Packet) -> Message {
    Message::Text(packet.encode().into())
}
