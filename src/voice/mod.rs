//! # Voice Endpoint Module
//!
//! Client side of the conversational AI voice endpoint.
//!
//! ## Key Components:
//! - **Client**: the `VoiceSessionClient`/`VoiceSession` traits and `CallContext`
//! - **WebSocket**: the production client speaking the endpoint's JSON + binary protocol

pub mod client;
pub mod websocket;

pub use client::{CallContext, VoiceSession, VoiceSessionClient};
pub use websocket::WsVoiceClient;
