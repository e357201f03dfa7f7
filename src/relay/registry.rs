//! # Call Registry
//!
//! Tracks every call currently being relayed: its lifecycle state, timestamps
//! and traffic counters. Each call gets a `CallRecord` shared between the
//! registry (for the HTTP API) and the call's orchestrator (which drives the
//! state machine and bumps the counters).
//!
//! ## Call Lifecycle:
//! 1. **Init**: admitted, endpoint session being opened
//! 2. **Streaming**: audio flowing in both directions
//! 3. **Closing**: input ended or a pipeline error occurred, session teardown running
//! 4. **Closed**: session torn down (terminal)
//! 5. **Failed**: session could not be opened (terminal)
//!
//! ## Resource Management:
//! - Enforces the maximum number of concurrent calls
//! - Rejects duplicate call ids
//! - Holds each call's canceller so the API can hang calls up

use crate::relay::cancel::{cancel_pair, CallCanceller, CancelSignal};
use crate::voice::CallContext;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Lifecycle state of one call.
///
/// ## Rust Concepts:
/// - **Copy**: small enum, passed by value everywhere
/// - **#[serde(rename_all)]**: serialized as `"streaming"`, `"closed"`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Init,
    Streaming,
    Closing,
    Closed,
    Failed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Init => "init",
            CallState::Streaming => "streaming",
            CallState::Closing => "closing",
            CallState::Closed => "closed",
            CallState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Closed | CallState::Failed)
    }

    /// Allowed edges of the state machine.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        matches!(
            (self, next),
            (CallState::Init, CallState::Streaming)
                | (CallState::Init, CallState::Failed)
                | (CallState::Streaming, CallState::Closing)
                | (CallState::Streaming, CallState::Failed)
                | (CallState::Closing, CallState::Closed)
        )
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Traffic counters for one call.
#[derive(Debug, Default)]
struct CallCounters {
    inbound_frames: AtomicU64,
    inbound_bytes: AtomicU64,
    inbound_dropped: AtomicU64,
    uplink_frames: AtomicU64,
    downlink_frames: AtomicU64,
    outbound_frames: AtomicU64,
    outbound_bytes: AtomicU64,
    outbound_dropped: AtomicU64,
}

/// Point-in-time copy of a call's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallStats {
    /// µ-law chunks received from telephony
    pub inbound_frames: u64,
    pub inbound_bytes: u64,
    /// Chunks discarded because ingress could not keep up
    pub inbound_dropped: u64,
    /// PCM frames handed to the endpoint session
    pub uplink_frames: u64,
    /// PCM frames received from the endpoint session
    pub downlink_frames: u64,
    /// µ-law chunks queued for telephony
    pub outbound_frames: u64,
    pub outbound_bytes: u64,
    /// Chunks discarded by the drop-oldest egress queue
    pub outbound_dropped: u64,
}

/// One call tracked by the registry.
pub struct CallRecord {
    context: CallContext,
    state: RwLock<CallState>,
    session_id: RwLock<Option<String>>,
    failure: RwLock<Option<String>>,
    created_at: DateTime<Utc>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    ended_at: RwLock<Option<DateTime<Utc>>>,
    counters: CallCounters,
    canceller: CallCanceller,
}

impl CallRecord {
    /// Create a record in `Init` along with the signal its orchestrator watches.
    pub fn new(context: CallContext) -> (Self, CancelSignal) {
        let (canceller, signal) = cancel_pair();
        let record = Self {
            context,
            state: RwLock::new(CallState::Init),
            session_id: RwLock::new(None),
            failure: RwLock::new(None),
            created_at: Utc::now(),
            started_at: RwLock::new(None),
            ended_at: RwLock::new(None),
            counters: CallCounters::default(),
            canceller,
        };
        (record, signal)
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn call_id(&self) -> &str {
        self.context.call_id()
    }

    pub fn state(&self) -> CallState {
        *read(&self.state)
    }

    /// Move to `next`, stamping start/end times.
    ///
    /// ## State Transitions:
    /// Init → Streaming | Failed, Streaming → Closing | Failed, Closing → Closed
    pub fn transition(&self, next: CallState) -> Result<(), String> {
        let mut state = write(&self.state);
        if !state.can_transition_to(next) {
            return Err(format!(
                "Cannot move call {} from {} to {}",
                self.call_id(),
                state.as_str(),
                next.as_str()
            ));
        }
        *state = next;
        drop(state);

        let now = Utc::now();
        if next == CallState::Streaming {
            *write(&self.started_at) = Some(now);
        }
        if next.is_terminal() {
            *write(&self.ended_at) = Some(now);
        }
        Ok(())
    }

    pub fn set_session_id(&self, session_id: impl Into<String>) {
        *write(&self.session_id) = Some(session_id.into());
    }

    pub fn session_id(&self) -> Option<String> {
        read(&self.session_id).clone()
    }

    /// Remember why the call ended early. The first reason wins.
    pub fn record_failure(&self, reason: impl Into<String>) {
        let mut failure = write(&self.failure);
        if failure.is_none() {
            *failure = Some(reason.into());
        }
    }

    pub fn failure(&self) -> Option<String> {
        read(&self.failure).clone()
    }

    /// Ask the call's orchestrator to wind down.
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.canceller.is_cancelled()
    }

    pub fn record_inbound(&self, bytes: usize) {
        self.counters.inbound_frames.fetch_add(1, Ordering::Relaxed);
        self.counters.inbound_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_inbound_dropped(&self) {
        self.counters.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uplink(&self) {
        self.counters.uplink_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downlink(&self) {
        self.counters.downlink_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outbound(&self, bytes: usize) {
        self.counters.outbound_frames.fetch_add(1, Ordering::Relaxed);
        self.counters.outbound_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_outbound_dropped(&self) {
        self.counters.outbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CallStats {
        let c = &self.counters;
        CallStats {
            inbound_frames: c.inbound_frames.load(Ordering::Relaxed),
            inbound_bytes: c.inbound_bytes.load(Ordering::Relaxed),
            inbound_dropped: c.inbound_dropped.load(Ordering::Relaxed),
            uplink_frames: c.uplink_frames.load(Ordering::Relaxed),
            downlink_frames: c.downlink_frames.load(Ordering::Relaxed),
            outbound_frames: c.outbound_frames.load(Ordering::Relaxed),
            outbound_bytes: c.outbound_bytes.load(Ordering::Relaxed),
            outbound_dropped: c.outbound_dropped.load(Ordering::Relaxed),
        }
    }

    /// Seconds from admission to now, or to the end of the call.
    pub fn duration_seconds(&self) -> f64 {
        let end_time = read(&self.ended_at).unwrap_or_else(Utc::now);
        end_time.signed_duration_since(self.created_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.call_id().to_string(),
            phone_number: self.context.phone_number().to_string(),
            session_id: self.session_id(),
            state: self.state(),
            created_at: self.created_at,
            started_at: *read(&self.started_at),
            ended_at: *read(&self.ended_at),
            duration_seconds: self.duration_seconds(),
            failure: self.failure(),
            stats: self.stats(),
        }
    }
}

/// Serializable view of one call for the API.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: String,
    pub phone_number: String,
    pub session_id: Option<String>,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub failure: Option<String>,
    pub stats: CallStats,
}

/// Why a call was not admitted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmitError {
    #[error("Maximum concurrent calls ({limit}) reached")]
    AtCapacity { limit: usize },

    #[error("Call '{0}' is already active")]
    Duplicate(String),
}

/// Totals across the registry's lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub active_calls: usize,
    pub max_concurrent_calls: usize,
    pub total_admitted: u64,
    pub total_rejected: u64,
    pub total_closed: u64,
    pub total_failed: u64,
    /// Removed before reaching a terminal state, e.g. a refused upgrade
    pub total_abandoned: u64,
}

/// Manages all concurrently relayed calls.
///
/// ## Thread Safety:
/// The call map sits behind an `RwLock`; readers (API listings) never block
/// each other. Records are handed out as `Arc`s so orchestrators update them
/// without touching the map.
pub struct CallRegistry {
    calls: RwLock<HashMap<String, Arc<CallRecord>>>,
    max_concurrent_calls: AtomicUsize,
    total_admitted: AtomicU64,
    total_rejected: AtomicU64,
    total_closed: AtomicU64,
    total_failed: AtomicU64,
    total_abandoned: AtomicU64,
}

impl CallRegistry {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            max_concurrent_calls: AtomicUsize::new(max_concurrent_calls),
            total_admitted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            total_closed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_abandoned: AtomicU64::new(0),
        }
    }

    /// Register a new call.
    ///
    /// ## Returns:
    /// - **Ok((record, signal))**: call admitted in `Init`
    /// - **Err(AdmitError)**: over the limit, or the call id is already active
    pub fn admit(&self, context: CallContext) -> Result<(Arc<CallRecord>, CancelSignal), AdmitError> {
        let mut calls = write(&self.calls);

        let limit = self.max_concurrent_calls.load(Ordering::Relaxed);
        if calls.len() >= limit {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(AdmitError::AtCapacity { limit });
        }
        if calls.contains_key(context.call_id()) {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(AdmitError::Duplicate(context.call_id().to_string()));
        }

        let (record, signal) = CallRecord::new(context);
        let record = Arc::new(record);
        calls.insert(record.call_id().to_string(), record.clone());
        self.total_admitted.fetch_add(1, Ordering::Relaxed);

        Ok((record, signal))
    }

    /// Drop a call from the active set.
    ///
    /// Only terminal calls count as closed or failed; anything else was
    /// abandoned before it ran to completion.
    pub fn remove(&self, call_id: &str) -> Option<Arc<CallRecord>> {
        let removed = write(&self.calls).remove(call_id);
        if let Some(record) = &removed {
            let counter = match record.state() {
                CallState::Closed => &self.total_closed,
                CallState::Failed => &self.total_failed,
                _ => &self.total_abandoned,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallRecord>> {
        read(&self.calls).get(call_id).cloned()
    }

    /// Cancel a call by id. Returns false if it is not active.
    pub fn hang_up(&self, call_id: &str) -> bool {
        match self.get(call_id) {
            Some(record) => {
                record.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active call (server shutdown).
    pub fn hang_up_all(&self) -> usize {
        let calls = read(&self.calls);
        for record in calls.values() {
            record.cancel();
        }
        calls.len()
    }

    pub fn active_count(&self) -> usize {
        read(&self.calls).len()
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls.load(Ordering::Relaxed)
    }

    /// Applies to new admissions only; active calls are never evicted.
    pub fn set_max_concurrent_calls(&self, limit: usize) {
        self.max_concurrent_calls.store(limit, Ordering::Relaxed);
    }

    /// Snapshots of all active calls, oldest first.
    pub fn snapshots(&self) -> Vec<CallSnapshot> {
        let mut snapshots: Vec<CallSnapshot> =
            read(&self.calls).values().map(|record| record.snapshot()).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    pub fn summary(&self) -> RegistrySummary {
        RegistrySummary {
            active_calls: self.active_count(),
            max_concurrent_calls: self.max_concurrent_calls(),
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            total_closed: self.total_closed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_abandoned: self.total_abandoned.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(call_id: &str) -> CallContext {
        CallContext::new(call_id, "+15550100")
    }

    #[test]
    fn test_state_machine_edges() {
        let (record, _signal) = CallRecord::new(context("CA1"));
        assert_eq!(record.state(), CallState::Init);
        assert!(record.transition(CallState::Closing).is_err());

        record.transition(CallState::Streaming).unwrap();
        record.transition(CallState::Closing).unwrap();
        record.transition(CallState::Closed).unwrap();
        assert!(record.state().is_terminal());
        assert!(record.snapshot().ended_at.is_some());

        // Terminal states are absorbing
        assert!(record.transition(CallState::Streaming).is_err());
        assert!(record.transition(CallState::Failed).is_err());
    }

    #[test]
    fn test_admission_limits() {
        let registry = CallRegistry::new(2);
        let (first, _signal) = registry.admit(context("CA1")).unwrap();
        assert_eq!(
            registry.admit(context("CA1")).err(),
            Some(AdmitError::Duplicate("CA1".to_string()))
        );
        registry.admit(context("CA2")).unwrap();
        assert_eq!(registry.admit(context("CA3")).err(), Some(AdmitError::AtCapacity { limit: 2 }));

        first.transition(CallState::Streaming).unwrap();
        first.transition(CallState::Closing).unwrap();
        first.transition(CallState::Closed).unwrap();
        registry.remove("CA1");
        assert!(registry.admit(context("CA3")).is_ok());

        let summary = registry.summary();
        assert_eq!(summary.active_calls, 2);
        assert_eq!(summary.total_admitted, 3);
        assert_eq!(summary.total_rejected, 2);
        assert_eq!(summary.total_closed, 1);
    }

    #[test]
    fn test_remove_counts_by_final_state() {
        let registry = CallRegistry::new(4);
        registry.admit(context("CA-init")).unwrap();
        let (failed, _signal) = registry.admit(context("CA-failed")).unwrap();
        failed.transition(CallState::Failed).unwrap();

        registry.remove("CA-init");
        registry.remove("CA-failed");
        assert!(registry.remove("CA-init").is_none());

        let summary = registry.summary();
        assert_eq!(summary.active_calls, 0);
        assert_eq!(summary.total_closed, 0);
        assert_eq!(summary.total_failed, 1);
        assert_eq!(summary.total_abandoned, 1);
    }

    #[tokio::test]
    async fn test_hang_up_signals_orchestrator() {
        let registry = CallRegistry::new(4);
        let (_record, mut signal) = registry.admit(context("CA1")).unwrap();

        assert!(registry.hang_up("CA1"));
        assert!(!registry.hang_up("missing"));
        signal.cancelled().await;
    }

    #[test]
    fn test_failure_reason_first_wins() {
        let (record, _signal) = CallRecord::new(context("CA1"));
        record.record_failure("endpoint unreachable");
        record.record_failure("later");
        assert_eq!(record.failure().as_deref(), Some("endpoint unreachable"));
    }
}
