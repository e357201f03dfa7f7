//! # Voice Session Client
//!
//! The seam between the relay and the conversational AI endpoint. The relay
//! only ever talks to these two traits, so the endpoint transport can be
//! swapped (the WebSocket client in `voice::websocket`, scripted mocks in
//! tests) without touching the orchestrator.
//!
//! ## Session Lifecycle:
//! 1. **open**: negotiate a session for one call, carrying its context
//! 2. **send**: hand over the uplink frame stream, get the downlink stream back
//! 3. **close**: tear the session down; safe to call more than once
//!
//! ## Rust Concepts:
//! - **#[async_trait]**: async methods on trait objects
//! - **BoxStream**: type-erased, heap-pinned stream that is `Send + 'static`
//! - **Box<dyn VoiceSession>**: the orchestrator owns its session exclusively

use crate::audio::AudioFrame;
use crate::config::EndpointConfig;
use crate::error::SessionError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::collections::BTreeMap;

/// Metadata key carrying the call id in the context map
pub const CONTEXT_CALL_ID: &str = "call_id";

/// Metadata key carrying the originating phone number in the context map
pub const CONTEXT_PHONE_NUMBER: &str = "phone_number";

/// Uplink: PCM16 @ 16 kHz frames going to the endpoint
pub type FrameStream = BoxStream<'static, AudioFrame>;

/// Downlink: PCM16 @ 24 kHz frames coming back, or the error that ended them
pub type ResponseStream = BoxStream<'static, Result<AudioFrame, SessionError>>;

/// Who is on the line.
///
/// Built once when the telephony side accepts a call and never changed after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallContext {
    call_id: String,
    phone_number: String,
    metadata: BTreeMap<String, String>,
}

impl CallContext {
    /// Build a context. An empty call id is replaced with a fresh UUID.
    pub fn new(call_id: impl Into<String>, phone_number: impl Into<String>) -> Self {
        let mut call_id = call_id.into();
        if call_id.trim().is_empty() {
            call_id = uuid::Uuid::new_v4().to_string();
        }

        Self {
            call_id,
            phone_number: phone_number.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach an opaque key/value pair that is passed through to the endpoint.
    ///
    /// The reserved call id and phone number keys cannot be overwritten.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if key != CONTEXT_CALL_ID && key != CONTEXT_PHONE_NUMBER {
            self.metadata.insert(key, value.into());
        }
        self
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn phone_number(&self) -> &str {
        &self.phone_number
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Flatten into the map handed to the endpoint on `open`.
    pub fn to_context_map(&self) -> BTreeMap<String, String> {
        let mut map = self.metadata.clone();
        map.insert(CONTEXT_CALL_ID.to_string(), self.call_id.clone());
        map.insert(CONTEXT_PHONE_NUMBER.to_string(), self.phone_number.clone());
        map
    }
}

/// Factory for endpoint sessions, shared by all calls.
#[async_trait]
pub trait VoiceSessionClient: Send + Sync {
    /// Open one session for one call.
    ///
    /// ## Errors:
    /// `SessionError::Init` when the endpoint is unreachable or rejects the
    /// session. Nothing needs closing in that case.
    async fn open(&self, context: &CallContext) -> Result<Box<dyn VoiceSession>, SessionError>;

    /// Apply new endpoint settings to sessions opened from now on.
    /// Sessions that are already open are not affected.
    fn reconfigure(&self, _endpoint: &EndpointConfig) {}
}

/// One live endpoint session, owned by exactly one call.
#[async_trait]
pub trait VoiceSession: Send {
    /// Endpoint-assigned session id.
    fn id(&self) -> &str;

    /// Start streaming. May be called once per session.
    ///
    /// The returned stream ends after `frames` is exhausted and the endpoint
    /// signals it has nothing more to say. A mid-stream failure is delivered
    /// as a final `Err(SessionError::Stream)` item.
    fn send(&mut self, frames: FrameStream) -> Result<ResponseStream, SessionError>;

    /// Tear the session down.
    ///
    /// Idempotent: closing an already closed session is `Ok(())`.
    async fn close(&mut self) -> Result<(), SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_map_contains_call_identity() {
        let context = CallContext::new("CA123", "+15550100")
            .with_metadata("campaign", "spring")
            .with_metadata(CONTEXT_CALL_ID, "spoofed");

        let map = context.to_context_map();
        assert_eq!(map.get(CONTEXT_CALL_ID).map(String::as_str), Some("CA123"));
        assert_eq!(map.get(CONTEXT_PHONE_NUMBER).map(String::as_str), Some("+15550100"));
        assert_eq!(map.get("campaign").map(String::as_str), Some("spring"));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_missing_call_id_is_generated() {
        let context = CallContext::new("", "+15550100");
        assert!(uuid::Uuid::parse_str(context.call_id()).is_ok());
    }
}
