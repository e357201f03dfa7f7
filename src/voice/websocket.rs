//! # WebSocket Voice Endpoint Client
//!
//! `VoiceSessionClient` over a WebSocket connection to the AI voice endpoint,
//! one connection per call.
//!
//! ## Wire Protocol:
//! Control messages are JSON text frames tagged by `type`; audio travels as
//! binary frames of raw PCM16 little-endian samples.
//!
//! | Direction | Message | Meaning |
//! |-----------|---------|---------|
//! | → | `session.open` | call context and sample rates |
//! | ← | `session.ready` | session accepted, carries `session_id` |
//! | ← | `session.error` | session rejected or failed, carries `message` |
//! | → | binary | PCM16 @ 16 kHz |
//! | ← | binary | PCM16 @ 24 kHz |
//! | → | `input.end` | caller audio finished |
//! | ← | `output.end` | endpoint finished responding |
//! | → | `session.close` | teardown, followed by a close frame |
//!
//! ## Task Layout:
//! `send` splits the socket. The write half moves into a spawned uplink task
//! that forwards frames and later performs the teardown handshake; the read
//! half becomes the returned response stream. `close` signals the uplink task
//! and waits for it, bounded by the configured close timeout.

use crate::audio::frame::{AudioFrame, ENDPOINT_INPUT_SAMPLE_RATE, ENDPOINT_OUTPUT_SAMPLE_RATE};
use crate::config::EndpointConfig;
use crate::error::SessionError;
use crate::voice::client::{
    CallContext, FrameStream, ResponseStream, VoiceSession, VoiceSessionClient,
};
use async_trait::async_trait;
use futures_util::stream::{self, SplitSink, SplitStream, StreamExt};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type EndpointSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Header carrying the endpoint API key, when one is configured
pub const API_KEY_HEADER: &str = "x-api-key";

/// JSON control frames exchanged with the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "session.open")]
    SessionOpen {
        context: BTreeMap<String, String>,
        input_sample_rate: u32,
        output_sample_rate: u32,
    },

    #[serde(rename = "session.ready")]
    SessionReady { session_id: String },

    #[serde(rename = "session.error")]
    SessionError { message: String },

    #[serde(rename = "input.end")]
    InputEnd,

    #[serde(rename = "output.end")]
    OutputEnd,

    #[serde(rename = "session.close")]
    SessionClose,
}

impl ControlMessage {
    fn to_message(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

/// Connection settings taken from `EndpointConfig`.
#[derive(Debug, Clone)]
struct EndpointSettings {
    url: String,
    api_key: Option<String>,
    connect_timeout: Duration,
    close_timeout: Duration,
}

impl EndpointSettings {
    fn from_config(config: &EndpointConfig) -> Self {
        Self {
            url: config.url.clone(),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            close_timeout: Duration::from_millis(config.close_timeout_ms),
        }
    }

    async fn connect(&self) -> Result<EndpointSocket, SessionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Init(format!("invalid endpoint URL {}: {}", self.url, e)))?;

        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| SessionError::Init(format!("invalid API key header: {}", e)))?;
            request.headers_mut().insert(API_KEY_HEADER, value);
        }

        let (socket, _response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                SessionError::Init(format!(
                    "connecting to {} timed out after {:?}",
                    self.url, self.connect_timeout
                ))
            })?
            .map_err(|e| SessionError::Init(format!("cannot reach {}: {}", self.url, e)))?;

        Ok(socket)
    }
}

/// Connects one WebSocket per call to the configured endpoint.
///
/// Settings can be swapped at runtime with `reconfigure`; each `open` works
/// from the settings current when it starts.
#[derive(Debug)]
pub struct WsVoiceClient {
    settings: RwLock<EndpointSettings>,
}

impl WsVoiceClient {
    pub fn new(config: &EndpointConfig) -> Self {
        Self {
            settings: RwLock::new(EndpointSettings::from_config(config)),
        }
    }

    fn settings(&self) -> EndpointSettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Read control frames until the endpoint accepts or rejects the session.
async fn await_ready(socket: &mut EndpointSocket) -> Result<String, SessionError> {
    while let Some(message) = socket.next().await {
        let message = message.map_err(|e| SessionError::Init(e.to_string()))?;
        match message {
            Message::Text(text) => match serde_json::from_str::<ControlMessage>(text.as_str()) {
                Ok(ControlMessage::SessionReady { session_id }) => return Ok(session_id),
                Ok(ControlMessage::SessionError { message }) => {
                    return Err(SessionError::Init(message))
                }
                Ok(other) => debug!(?other, "ignoring control message before session.ready"),
                Err(e) => {
                    return Err(SessionError::Init(format!("malformed control message: {}", e)))
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    Err(SessionError::Init(
        "endpoint closed the connection before the session was ready".to_string(),
    ))
}

#[async_trait]
impl VoiceSessionClient for WsVoiceClient {
    async fn open(&self, context: &CallContext) -> Result<Box<dyn VoiceSession>, SessionError> {
        let settings = self.settings();
        let mut socket = settings.connect().await?;

        let open = ControlMessage::SessionOpen {
            context: context.to_context_map(),
            input_sample_rate: ENDPOINT_INPUT_SAMPLE_RATE,
            output_sample_rate: ENDPOINT_OUTPUT_SAMPLE_RATE,
        };
        let handshake = async {
            let message = open
                .to_message()
                .map_err(|e| SessionError::Init(e.to_string()))?;
            socket
                .send(message)
                .await
                .map_err(|e| SessionError::Init(e.to_string()))?;
            await_ready(&mut socket).await
        };

        let outcome = tokio::time::timeout(settings.connect_timeout, handshake).await;
        let session_id = match outcome {
            Ok(Ok(session_id)) => session_id,
            Ok(Err(e)) => {
                let _ = socket.close(None).await;
                return Err(e);
            }
            Err(_) => {
                let _ = socket.close(None).await;
                return Err(SessionError::Init(format!(
                    "no session.ready within {:?}",
                    settings.connect_timeout
                )));
            }
        };

        info!(
            call_id = %context.call_id(),
            session_id = %session_id,
            "voice endpoint session opened"
        );

        Ok(Box::new(WsVoiceSession {
            session_id,
            close_timeout: settings.close_timeout,
            state: SessionState::Idle(socket),
        }))
    }

    fn reconfigure(&self, endpoint: &EndpointConfig) {
        *self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = EndpointSettings::from_config(endpoint);
        debug!(url = %endpoint.url, "voice endpoint client reconfigured");
    }
}

enum SessionState {
    /// Opened, `send` not called yet
    Idle(EndpointSocket),
    /// Uplink task owns the write half
    Streaming {
        shutdown: oneshot::Sender<()>,
        uplink: JoinHandle<Result<(), String>>,
    },
    Closed,
}

/// A live endpoint session.
pub struct WsVoiceSession {
    session_id: String,
    close_timeout: Duration,
    state: SessionState,
}

#[async_trait]
impl VoiceSession for WsVoiceSession {
    fn id(&self) -> &str {
        &self.session_id
    }

    fn send(&mut self, frames: FrameStream) -> Result<ResponseStream, SessionError> {
        let socket = match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Idle(socket) => socket,
            other => {
                self.state = other;
                return Err(SessionError::Stream(format!(
                    "session {} is not restartable",
                    self.session_id
                )));
            }
        };

        let (sink, downlink) = socket.split();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let uplink = tokio::spawn(run_uplink(
            sink,
            frames,
            shutdown_rx,
            self.session_id.clone(),
        ));
        self.state = SessionState::Streaming { shutdown, uplink };

        Ok(response_stream(downlink))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Closed => Ok(()),
            SessionState::Idle(mut socket) => {
                let result = async {
                    let message = ControlMessage::SessionClose
                        .to_message()
                        .map_err(|e| e.to_string())?;
                    socket.send(message).await.map_err(|e| e.to_string())?;
                    socket.close(None).await.map_err(|e| e.to_string())
                };
                let outcome = tokio::time::timeout(self.close_timeout, result).await;
                match outcome {
                    Ok(result) => result.map_err(SessionError::Close),
                    Err(_) => Err(SessionError::Close(format!(
                        "teardown timed out after {:?}",
                        self.close_timeout
                    ))),
                }
            }
            SessionState::Streaming { shutdown, mut uplink } => {
                // The uplink may already be gone if the socket failed
                let _ = shutdown.send(());
                match tokio::time::timeout(self.close_timeout, &mut uplink).await {
                    Ok(Ok(Ok(()))) => {
                        debug!(session_id = %self.session_id, "voice endpoint session closed");
                        Ok(())
                    }
                    Ok(Ok(Err(reason))) => Err(SessionError::Close(reason)),
                    Ok(Err(join_error)) => Err(SessionError::Close(join_error.to_string())),
                    Err(_) => {
                        uplink.abort();
                        Err(SessionError::Close(format!(
                            "teardown timed out after {:?}",
                            self.close_timeout
                        )))
                    }
                }
            }
        }
    }
}

/// Forward uplink frames until shut down, then run the teardown handshake.
async fn run_uplink(
    mut sink: SplitSink<EndpointSocket, Message>,
    mut frames: FrameStream,
    mut shutdown: oneshot::Receiver<()>,
    session_id: String,
) -> Result<(), String> {
    let mut input_open = true;
    let mut frames_sent: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            next = frames.next(), if input_open => match next {
                Some(frame) => {
                    sink.send(Message::Binary(frame.into_bytes().into()))
                        .await
                        .map_err(|e| format!("uplink send failed: {}", e))?;
                    frames_sent += 1;
                }
                None => {
                    input_open = false;
                    debug!(session_id = %session_id, frames_sent, "uplink input finished");
                    let end = ControlMessage::InputEnd.to_message().map_err(|e| e.to_string())?;
                    sink.send(end).await.map_err(|e| format!("input.end failed: {}", e))?;
                }
            },
        }
    }

    let close = ControlMessage::SessionClose
        .to_message()
        .map_err(|e| e.to_string())?;
    if let Err(e) = sink.send(close).await {
        warn!(session_id = %session_id, error = %e, "session.close not delivered");
    }
    sink.close().await.map_err(|e| format!("close frame failed: {}", e))
}

/// Adapt the read half into the downlink frame stream.
fn response_stream(downlink: SplitStream<EndpointSocket>) -> ResponseStream {
    stream::unfold(Some(downlink), |state| async move {
        let mut downlink = state?;
        loop {
            match downlink.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let frame = AudioFrame::linear(data.to_vec(), ENDPOINT_OUTPUT_SAMPLE_RATE);
                    return Some((Ok(frame), Some(downlink)));
                }
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ControlMessage>(text.as_str()) {
                        Ok(ControlMessage::OutputEnd) => return None,
                        Ok(ControlMessage::SessionError { message }) => {
                            return Some((Err(SessionError::Stream(message)), None))
                        }
                        Ok(other) => debug!(?other, "ignoring control message mid-stream"),
                        Err(e) => {
                            let error = SessionError::Stream(format!("malformed control message: {}", e));
                            return Some((Err(error), None));
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some((Err(SessionError::Stream(e.to_string())), None)),
            }
        }
    })
    .boxed()
}
