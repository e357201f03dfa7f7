//! # Relay Module
//!
//! Call-scoped orchestration between the telephony media path and the AI
//! voice endpoint.
//!
//! ## Key Components:
//! - **Orchestrator**: the per-call state machine running ingress and egress
//! - **Registry**: active calls, admission limits, per-call statistics
//! - **Cancel**: external cancellation handles

pub mod cancel;
pub mod orchestrator;
pub mod registry;

pub use orchestrator::{CallEnd, CallOrchestrator, CallReport, RelaySettings};
pub use registry::{AdmitError, CallRecord, CallRegistry, CallState};
