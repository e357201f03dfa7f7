//! # Stream Orchestrator
//!
//! Runs one call from admission to teardown. The orchestrator owns the
//! endpoint session exclusively and drives the call state machine:
//!
//! ```text
//! Init ──open ok──▶ Streaming ──hangup / cancel / endpoint done / error──▶ Closing ──▶ Closed
//!   │
//!   └──open failed──▶ Failed
//! ```
//!
//! ## Task Layout:
//! While streaming, ingress runs on its own spawned task and egress runs on
//! the orchestrator's task, so neither direction can stall the other:
//!
//! - **Ingress**: telephony chunk → `pipeline::ingress` → bounded uplink
//!   channel → session
//! - **Egress**: session response → `pipeline::egress` → 20 ms chunks →
//!   drop-oldest `FrameQueue` → telephony
//!
//! Whichever side finishes first decides how the call ends. The other side is
//! then stopped and awaited before the session is closed, so no task outlives
//! the call. `close` runs exactly once for every opened session.

use crate::audio::buffer::{FrameQueue, PushOutcome};
use crate::audio::pipeline::{self, chunk_audio, DEFAULT_CHUNK_BYTES};
use crate::audio::AudioFrame;
use crate::config::AppConfig;
use crate::error::{CallError, SessionError};
use crate::relay::cancel::{cancel_pair, CancelSignal};
use crate::relay::registry::{CallRecord, CallState, CallStats};
use crate::voice::client::{ResponseStream, VoiceSession, VoiceSessionClient};
use futures_util::stream::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Per-call tuning taken from the application config.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Transcoded frames buffered between ingress and the session
    pub uplink_queue_frames: usize,
    /// Upper bound on session teardown
    pub close_timeout: Duration,
    /// Size of the µ-law chunks queued for telephony
    pub egress_chunk_bytes: usize,
}

impl RelaySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            uplink_queue_frames: config.audio.uplink_queue_frames.max(1),
            close_timeout: Duration::from_millis(config.endpoint.close_timeout_ms),
            egress_chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// How a call came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEnd {
    /// The endpoint refused or could not be reached
    SessionRejected,
    /// Telephony input ran out
    Hangup,
    /// The endpoint finished its output stream
    EndpointFinished,
    /// Cancelled from outside (socket gone, API hang-up, shutdown)
    Cancelled,
    /// A codec or session error
    Error,
}

impl CallEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallEnd::SessionRejected => "session_rejected",
            CallEnd::Hangup => "hangup",
            CallEnd::EndpointFinished => "endpoint_finished",
            CallEnd::Cancelled => "cancelled",
            CallEnd::Error => "error",
        }
    }
}

/// Final outcome of one call.
#[derive(Debug, Clone)]
pub struct CallReport {
    pub call_id: String,
    pub session_id: Option<String>,
    /// Always terminal: `Closed` or `Failed`
    pub state: CallState,
    pub end: CallEnd,
    pub error: Option<CallError>,
    pub stats: CallStats,
}

/// Why one direction of the stream stopped.
enum Finish {
    Ended(CallEnd),
    Error(CallError),
}

/// Drives one call end to end.
pub struct CallOrchestrator {
    client: Arc<dyn VoiceSessionClient>,
    record: Arc<CallRecord>,
    settings: RelaySettings,
}

impl CallOrchestrator {
    pub fn new(
        client: Arc<dyn VoiceSessionClient>,
        record: Arc<CallRecord>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            client,
            record,
            settings,
        }
    }

    fn enter(&self, next: CallState) {
        let previous = self.record.state();
        match self.record.transition(next) {
            Ok(()) => info!(
                call_id = %self.record.call_id(),
                from = previous.as_str(),
                to = next.as_str(),
                "call state changed"
            ),
            Err(e) => error!(call_id = %self.record.call_id(), error = %e, "illegal call transition"),
        }
    }

    fn report(&self, end: CallEnd, error: Option<CallError>) -> CallReport {
        CallReport {
            call_id: self.record.call_id().to_string(),
            session_id: self.record.session_id(),
            state: self.record.state(),
            end,
            error,
            stats: self.record.stats(),
        }
    }

    /// Relay audio for one call until it ends.
    ///
    /// ## Parameters:
    /// - **telephony_in**: raw µ-law chunks from the caller; end of stream means hangup
    /// - **outbound**: queue the telephony side drains; closed when this returns
    /// - **cancel**: external cancellation, observed within one in-flight frame
    ///
    /// Cancellation is not raced against `open`: a session that is being
    /// opened is allowed to finish opening so that it can be closed properly.
    pub async fn run<S>(self, telephony_in: S, outbound: Arc<FrameQueue>, cancel: CancelSignal) -> CallReport
    where
        S: Stream<Item = Vec<u8>> + Send + Unpin + 'static,
    {
        let call_id = self.record.call_id().to_string();
        info!(
            call_id = %call_id,
            phone_number = %self.record.context().phone_number(),
            "opening voice endpoint session"
        );

        let mut session = match self.client.open(self.record.context()).await {
            Ok(session) => session,
            Err(e) => {
                error!(call_id = %call_id, error = %e, "voice endpoint session could not be opened");
                self.record.record_failure(e.to_string());
                self.enter(CallState::Failed);
                outbound.close();
                return self.report(CallEnd::SessionRejected, Some(e.into()));
            }
        };

        self.record.set_session_id(session.id());
        self.enter(CallState::Streaming);

        let finish = self
            .stream(session.as_mut(), telephony_in, &outbound, cancel)
            .await;

        let (end, call_error) = match finish {
            Finish::Ended(end) => {
                info!(call_id = %call_id, reason = end.as_str(), "call stream ended");
                (end, None)
            }
            Finish::Error(e) => {
                error!(call_id = %call_id, error = %e, "call stream failed");
                self.record.record_failure(e.to_string());
                (CallEnd::Error, Some(e))
            }
        };

        self.enter(CallState::Closing);
        self.close_session(session.as_mut()).await;
        self.enter(CallState::Closed);
        outbound.close();

        let report = self.report(end, call_error);
        debug!(call_id = %call_id, stats = ?report.stats, "call finished");
        report
    }

    /// Run both directions until one of them finishes.
    async fn stream<S>(
        &self,
        session: &mut dyn VoiceSession,
        telephony_in: S,
        outbound: &FrameQueue,
        cancel: CancelSignal,
    ) -> Finish
    where
        S: Stream<Item = Vec<u8>> + Send + Unpin + 'static,
    {
        let (uplink_tx, uplink_rx) = mpsc::channel(self.settings.uplink_queue_frames);
        let responses = match session.send(ReceiverStream::new(uplink_rx).boxed()) {
            Ok(responses) => responses,
            Err(e) => return Finish::Error(e.into()),
        };

        let (stop, stop_signal) = cancel_pair();
        let mut ingress = tokio::spawn(run_ingress(
            telephony_in,
            uplink_tx,
            self.record.clone(),
            cancel.clone(),
            stop_signal,
        ));
        let mut ingress_done = false;

        let finish = tokio::select! {
            biased;
            joined = &mut ingress => {
                ingress_done = true;
                match joined {
                    Ok(finish) => finish,
                    Err(e) => Finish::Error(SessionError::Stream(format!("ingress task failed: {}", e)).into()),
                }
            }
            finish = self.pump_egress(responses, outbound, cancel) => finish,
        };

        stop.cancel();
        if !ingress_done {
            if let Err(e) = ingress.await {
                warn!(call_id = %self.record.call_id(), error = %e, "ingress task did not stop cleanly");
            }
        }

        finish
    }

    /// Forward endpoint output to telephony in arrival order.
    async fn pump_egress(
        &self,
        mut responses: ResponseStream,
        outbound: &FrameQueue,
        mut cancel: CancelSignal,
    ) -> Finish {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Finish::Ended(CallEnd::Cancelled),
                next = responses.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Finish::Error(e.into()),
                None => return Finish::Ended(CallEnd::EndpointFinished),
            };

            self.record.record_downlink();
            if frame.is_empty() {
                continue;
            }

            let companded = match pipeline::egress(&frame) {
                Ok(companded) => companded,
                Err(e) => return Finish::Error(e.into()),
            };

            for chunk in chunk_audio(companded.as_bytes(), self.settings.egress_chunk_bytes) {
                // Telephony side is gone; nobody is listening any more
                if !queue_outbound(&self.record, outbound, chunk) {
                    return Finish::Ended(CallEnd::Hangup);
                }
            }
        }
    }

    /// Close the session once. Failures are logged and swallowed.
    async fn close_session(&self, session: &mut dyn VoiceSession) {
        let call_id = self.record.call_id();
        match tokio::time::timeout(self.settings.close_timeout, session.close()).await {
            Ok(Ok(())) => info!(call_id = %call_id, session_id = %session.id(), "voice endpoint session closed"),
            Ok(Err(e)) => warn!(call_id = %call_id, error = %e, "voice endpoint session close failed"),
            Err(_) => warn!(
                call_id = %call_id,
                timeout_ms = self.settings.close_timeout.as_millis() as u64,
                "voice endpoint session close timed out"
            ),
        }
    }
}

/// Transcode telephony input and feed it to the session until told to stop.
/// Hand one telephony chunk to the outbound queue and count it against the
/// call. Returns `false` once the queue has been closed by the consumer.
pub(crate) fn queue_outbound(record: &CallRecord, outbound: &FrameQueue, chunk: Vec<u8>) -> bool {
    let bytes = chunk.len();
    match outbound.push(chunk) {
        PushOutcome::Queued => record.record_outbound(bytes),
        PushOutcome::DroppedOldest => {
            record.record_outbound(bytes);
            record.record_outbound_dropped();
            debug!(call_id = %record.call_id(), "telephony queue full, dropped oldest chunk");
        }
        PushOutcome::Closed => return false,
    }
    true
}

async fn run_ingress<S>(
    mut telephony_in: S,
    uplink: mpsc::Sender<AudioFrame>,
    record: Arc<CallRecord>,
    mut cancel: CancelSignal,
    mut stop: CancelSignal,
) -> Finish
where
    S: Stream<Item = Vec<u8>> + Send + Unpin + 'static,
{
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Finish::Ended(CallEnd::Cancelled),
            _ = stop.cancelled() => return Finish::Ended(CallEnd::Cancelled),
            chunk = telephony_in.next() => chunk,
        };

        let Some(chunk) = chunk else {
            debug!(call_id = %record.call_id(), "telephony input ended");
            return Finish::Ended(CallEnd::Hangup);
        };
        if chunk.is_empty() {
            continue;
        }
        record.record_inbound(chunk.len());

        let frame = match pipeline::ingress(&AudioFrame::companded(chunk)) {
            Ok(frame) => frame,
            Err(e) => return Finish::Error(e.into()),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Finish::Ended(CallEnd::Cancelled),
            _ = stop.cancelled() => return Finish::Ended(CallEnd::Cancelled),
            sent = uplink.send(frame) => {
                if sent.is_err() {
                    let closed = SessionError::Stream("endpoint stopped accepting audio".to_string());
                    return Finish::Error(closed.into());
                }
                record.record_uplink();
            }
        }
    }
}
