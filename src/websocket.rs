//! # Telephony Media WebSocket Handler
//!
//! The telephony side of the relay. A media gateway connects to
//! `/ws/media?call_id=...&from=...` once per call and streams the caller's
//! audio as raw µ-law; the relayed AI audio comes back on the same socket.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: query parameters identify the call (`call_id` or
//!    `CallSid`, `from` or `From`); any other parameters are passed to the AI
//!    endpoint as opaque metadata
//! 2. **Audio In**: binary messages, raw µ-law @ 8 kHz, any framing
//! 3. **Audio Out**: binary messages, raw µ-law @ 8 kHz, 160 byte chunks
//! 4. **Control**: JSON text messages tagged by `type`
//! 5. **End of call**: a `hangup` message or closing the socket ends input;
//!    the server reports the final `call_status` and closes
//!
//! ## Message Format:
//! - **Client → Server**: `hangup`, `ping`, `pong`
//! - **Server → Client**: `call_status`, `error`, `ping`, `pong`

use crate::audio::buffer::FrameQueue;
use crate::error::AppError;
use crate::relay::cancel::CancelSignal;
use crate::relay::{CallOrchestrator, CallRecord, CallRegistry, CallReport, RelaySettings};
use crate::state::AppState;
use crate::voice::{CallContext, VoiceSessionClient};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// How often the server pings the media gateway
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long without any sign of life before the connection is dropped
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Pending messages the actor will accept before senders have to wait.
/// Outbound audio is awaited chunk by chunk, so a stalled socket backs up
/// into the drop-oldest outbound queue rather than here.
const MAILBOX_CAPACITY: usize = 16;

/// Query keys that identify the call rather than travel as metadata
const CALL_ID_KEYS: [&str; 2] = ["call_id", "CallSid"];
const PHONE_NUMBER_KEYS: [&str; 2] = ["from", "From"];

/// Control messages on the telephony socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TelephonyMessage {
    /// Caller hung up; no more audio will follow
    #[serde(rename = "hangup")]
    Hangup,

    /// Call lifecycle updates from the server
    #[serde(rename = "call_status")]
    CallStatus {
        call_id: String,
        status: String,
        message: Option<String>,
    },

    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        call_id: Option<String>,
    },

    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

/// Build the call context from the connection's query parameters.
pub fn call_context_from_query(query: &HashMap<String, String>) -> CallContext {
    let pick = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| query.get(*key))
            .cloned()
            .unwrap_or_default()
    };

    let mut context = CallContext::new(pick(&CALL_ID_KEYS), pick(&PHONE_NUMBER_KEYS));
    for (key, value) in query {
        let reserved = CALL_ID_KEYS.contains(&key.as_str()) || PHONE_NUMBER_KEYS.contains(&key.as_str());
        if !reserved {
            context = context.with_metadata(key.clone(), value.clone());
        }
    }
    context
}

/// WebSocket actor for one telephony call.
///
/// ## Actor Model:
/// The actor only moves bytes. The call itself runs on a spawned task driven
/// by `CallOrchestrator`; the actor feeds it inbound audio through a bounded
/// channel and receives outbound audio and the final report as actor messages.
pub struct MediaStreamSession {
    call: Arc<CallRecord>,
    registry: Arc<CallRegistry>,
    client: Arc<dyn VoiceSessionClient>,
    settings: RelaySettings,

    /// Sender half of the inbound channel; dropping it means hangup
    inbound: Option<mpsc::Sender<Vec<u8>>>,

    /// Handed to the orchestrator when the actor starts
    pending: Option<(mpsc::Receiver<Vec<u8>>, CancelSignal)>,

    outbound: Arc<FrameQueue>,
    last_heartbeat: Instant,
    finished: bool,
}

impl MediaStreamSession {
    pub fn new(
        call: Arc<CallRecord>,
        signal: CancelSignal,
        state: &AppState,
    ) -> Self {
        let config = state.get_config();
        let (inbound, inbound_rx) = mpsc::channel(config.audio.telephony_queue_frames.max(1));

        Self {
            call,
            registry: state.calls.clone(),
            client: state.voice_client.clone(),
            settings: RelaySettings::from_config(&config),
            inbound: Some(inbound),
            pending: Some((inbound_rx, signal)),
            outbound: Arc::new(FrameQueue::new(config.audio.egress_queue_frames)),
            last_heartbeat: Instant::now(),
            finished: false,
        }
    }

    fn call_id(&self) -> &str {
        self.call.call_id()
    }

    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, message: &TelephonyMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(call_id = %self.call_id(), error = %e, "failed to encode control message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(call_id = %self.call_id(), code, message, "telephony protocol error");
        let error = TelephonyMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
            call_id: Some(self.call_id().to_string()),
        };
        self.send_message(ctx, &error);
    }

    /// Queue inbound audio for ingress, dropping it when ingress is behind.
    fn handle_audio(&mut self, data: &[u8]) {
        let Some(inbound) = &self.inbound else {
            debug!(call_id = %self.call_id(), "audio after hangup ignored");
            return;
        };

        match inbound.try_send(data.to_vec()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.call.record_inbound_dropped();
                debug!(call_id = %self.call_id(), "ingress behind, inbound chunk dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Orchestrator already finished
                self.inbound = None;
            }
        }
    }

    fn hang_up(&mut self) {
        if self.inbound.take().is_some() {
            info!(call_id = %self.call_id(), "caller hung up");
        }
    }

    /// Spawn the orchestrator plus the outbound forwarder on one task, so the
    /// final report is delivered after the last outbound chunk.
    fn start_call(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some((inbound_rx, signal)) = self.pending.take() else {
            return;
        };

        let orchestrator = CallOrchestrator::new(self.client.clone(), self.call.clone(), self.settings.clone());
        let outbound = self.outbound.clone();
        let registry = self.registry.clone();
        let addr = ctx.address();

        tokio::spawn(async move {
            let forward = forward_outbound(outbound.clone(), addr.clone().recipient());
            let (report, ()) = tokio::join!(
                orchestrator.run(ReceiverStream::new(inbound_rx), outbound, signal),
                forward
            );

            registry.remove(&report.call_id);
            addr.do_send(CallFinished(report));
        });
    }
}

/// Deliver queued chunks to the socket actor one at a time.
///
/// Each send waits until the actor has taken the chunk, so while the socket
/// is stalled chunks stay in `outbound` and the drop-oldest policy applies.
/// If the actor is gone the queue is closed, which the orchestrator sees as
/// a hangup.
async fn forward_outbound(outbound: Arc<FrameQueue>, socket: Recipient<OutboundAudio>) {
    let mut chunks = outbound.clone().into_stream();
    while let Some(chunk) = chunks.next().await {
        if let Err(e) = socket.send(OutboundAudio(chunk)).await {
            debug!(error = %e, "telephony socket gone, closing outbound queue");
            outbound.close();
            break;
        }
    }
}

/// µ-law chunk ready for the telephony socket.
#[derive(Message)]
#[rtype(result = "()")]
struct OutboundAudio(Vec<u8>);

/// The orchestrator has finished and the call is terminal.
#[derive(Message)]
#[rtype(result = "()")]
struct CallFinished(CallReport);

impl Actor for MediaStreamSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            call_id = %self.call_id(),
            phone_number = %self.call.context().phone_number(),
            "telephony media stream connected"
        );
        ctx.set_mailbox_capacity(MAILBOX_CAPACITY);

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(call_id = %act.call_id(), "telephony heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            let ping = TelephonyMessage::Ping {
                timestamp: chrono::Utc::now().timestamp_millis() as u64,
            };
            act.send_message(ctx, &ping);
        });

        let connected = TelephonyMessage::CallStatus {
            call_id: self.call_id().to_string(),
            status: "connected".to_string(),
            message: None,
        };
        self.send_message(ctx, &connected);

        self.start_call(ctx);
    }

    /// Socket gone: end input and cancel the call if it is still running.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.hang_up();
        if !self.finished {
            self.call.cancel();
        }
        info!(call_id = %self.call_id(), "telephony media stream disconnected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio(&data);
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<TelephonyMessage>(&text) {
                    Ok(TelephonyMessage::Hangup) => self.hang_up(),
                    Ok(TelephonyMessage::Ping { timestamp }) => {
                        self.send_message(ctx, &TelephonyMessage::Pong { timestamp });
                    }
                    Ok(TelephonyMessage::Pong { .. }) => {}
                    Ok(other) => {
                        warn!(call_id = %self.call_id(), message = ?other, "unexpected control message from client");
                    }
                    Err(err) => self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err)),
                }
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(call_id = %self.call_id(), ?reason, "telephony socket closed by client");
                self.hang_up();
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(call_id = %self.call_id(), "continuation frames are not supported");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(call_id = %self.call_id(), error = %err, "telephony protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundAudio> for MediaStreamSession {
    type Result = ();

    fn handle(&mut self, msg: OutboundAudio, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<CallFinished> for MediaStreamSession {
    type Result = ();

    fn handle(&mut self, msg: CallFinished, ctx: &mut Self::Context) {
        let report = msg.0;
        self.finished = true;
        self.inbound = None;

        if let Some(error) = &report.error {
            let failure = TelephonyMessage::Error {
                code: report.end.as_str().to_string(),
                message: error.to_string(),
                call_id: Some(report.call_id.clone()),
            };
            self.send_message(ctx, &failure);
        }

        let status = TelephonyMessage::CallStatus {
            call_id: report.call_id.clone(),
            status: report.state.as_str().to_string(),
            message: Some(report.end.as_str().to_string()),
        };
        self.send_message(ctx, &status);

        info!(
            call_id = %report.call_id,
            state = report.state.as_str(),
            reason = report.end.as_str(),
            inbound_frames = report.stats.inbound_frames,
            outbound_frames = report.stats.outbound_frames,
            "call finished"
        );

        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Admits the call to the registry first, so a full server answers with a
/// plain 503 instead of accepting a socket it cannot serve.
pub async fn media_websocket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<HashMap<String, String>>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let context = call_context_from_query(&query);
    info!(
        call_id = %context.call_id(),
        peer = ?req.connection_info().peer_addr(),
        "new telephony media connection"
    );

    let (call, signal) = app_state.calls.admit(context).map_err(AppError::from)?;
    let call_id = call.call_id().to_string();
    let session = MediaStreamSession::new(call, signal, &app_state);

    ws::start(session, &req, stream).map_err(|e| {
        // Upgrade refused; the actor never ran
        app_state.calls.remove(&call_id);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::PushOutcome;
    use crate::relay::orchestrator::queue_outbound;
    use crate::state::tests::test_state;
    use crate::voice::client::{CONTEXT_CALL_ID, CONTEXT_PHONE_NUMBER};
    use actix_web::{test as actix_test, App};

    /// Takes audio but never finishes writing it, like a peer that stopped
    /// reading from its socket.
    struct StalledSocket;

    impl Actor for StalledSocket {
        type Context = Context<Self>;
    }

    impl Handler<OutboundAudio> for StalledSocket {
        type Result = ResponseFuture<()>;

        fn handle(&mut self, _msg: OutboundAudio, _ctx: &mut Self::Context) -> Self::Result {
            Box::pin(std::future::pending())
        }
    }

    /// Stops as soon as it starts.
    struct ClosedSocket;

    impl Actor for ClosedSocket {
        type Context = Context<Self>;

        fn started(&mut self, ctx: &mut Self::Context) {
            ctx.stop();
        }
    }

    impl Handler<OutboundAudio> for ClosedSocket {
        type Result = ();

        fn handle(&mut self, _msg: OutboundAudio, _ctx: &mut Self::Context) {}
    }

    #[test]
    fn test_call_context_from_twilio_style_query() {
        let mut query = HashMap::new();
        query.insert("CallSid".to_string(), "CA42".to_string());
        query.insert("From".to_string(), "+15550100".to_string());
        query.insert("campaign".to_string(), "spring".to_string());

        let context = call_context_from_query(&query);
        assert_eq!(context.call_id(), "CA42");
        assert_eq!(context.phone_number(), "+15550100");

        let map = context.to_context_map();
        assert_eq!(map.get("campaign").map(String::as_str), Some("spring"));
        assert!(!map.contains_key("CallSid"));
        assert!(map.contains_key(CONTEXT_CALL_ID) && map.contains_key(CONTEXT_PHONE_NUMBER));
    }

    #[test]
    fn test_call_context_generates_missing_id() {
        let context = call_context_from_query(&HashMap::new());
        assert!(uuid::Uuid::parse_str(context.call_id()).is_ok());
        assert_eq!(context.phone_number(), "");
    }

    #[test]
    fn test_message_serialization() {
        let status = TelephonyMessage::CallStatus {
            call_id: "CA1".to_string(),
            status: "closed".to_string(),
            message: Some("hangup".to_string()),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains(r#""type":"call_status""#));

        let hangup: TelephonyMessage = serde_json::from_str(r#"{"type":"hangup"}"#).unwrap();
        assert_eq!(hangup, TelephonyMessage::Hangup);
    }

    #[actix_web::test]
    async fn test_stalled_socket_drops_oldest_outbound_audio() {
        let state = test_state();
        let (record, _signal) = state.calls.admit(CallContext::new("CA-stall", "")).unwrap();
        let outbound = Arc::new(FrameQueue::new(4));
        let forwarder = tokio::spawn(forward_outbound(outbound.clone(), StalledSocket.start().recipient()));

        for _ in 0..64 {
            assert!(queue_outbound(&record, &outbound, vec![0xFF; 160]));
            tokio::task::yield_now().await;
        }

        // One chunk is stuck in the socket, four wait in the queue
        let stats = record.stats();
        assert_eq!(stats.outbound_frames, 64);
        assert!(stats.outbound_dropped >= 59, "dropped {}", stats.outbound_dropped);
        assert!(!forwarder.is_finished());
        forwarder.abort();
    }

    #[actix_web::test]
    async fn test_gone_socket_closes_outbound_queue() {
        let state = test_state();
        let (record, _signal) = state.calls.admit(CallContext::new("CA-gone", "")).unwrap();
        let outbound = Arc::new(FrameQueue::new(4));
        let socket = ClosedSocket.start().recipient();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let forwarder = tokio::spawn(forward_outbound(outbound.clone(), socket));
        assert_eq!(outbound.push(vec![0xFF; 160]), PushOutcome::Queued);
        tokio::time::timeout(Duration::from_secs(1), forwarder)
            .await
            .unwrap()
            .unwrap();

        assert!(!queue_outbound(&record, &outbound, vec![0xFF; 160]));
    }

    #[actix_web::test]
    async fn test_full_server_rejects_with_503() {
        let state = test_state();
        state.calls.set_max_concurrent_calls(1);
        state.calls.admit(CallContext::new("CA-busy", "+15550100")).unwrap();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/media", web::get().to(media_websocket)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/ws/media?call_id=CA2").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_refused_upgrade_releases_admission() {
        let state = test_state();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/media", web::get().to(media_websocket)),
        )
        .await;

        // No upgrade headers, so the handshake fails
        let req = actix_test::TestRequest::get().uri("/ws/media?call_id=CA3").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_client_error());

        let summary = state.calls.summary();
        assert_eq!(summary.active_calls, 0);
        assert_eq!(summary.total_abandoned, 1);
        assert_eq!(summary.total_closed, 0);
    }
}
