//! # Egress Frame Queue
//!
//! Bounded hand-off between a call's egress pipeline and the telephony
//! connection that plays the audio out.
//!
//! ## Key Features:
//! - **Bounded**: holds at most `capacity` frames, so a slow telephony socket
//!   can never make memory grow without limit
//! - **Drop-oldest**: when full, the oldest queued frame is discarded to make
//!   room. Live audio that is already late is worth less than fresh audio
//! - **Never blocks the producer**: `push` is synchronous, so egress keeps
//!   draining the endpoint even when telephony stalls
//! - **Closable**: once closed, pushes are refused and the consumer drains the
//!   remaining frames and then sees end of stream
//!
//! ## Thread Safety:
//! State lives behind a `Mutex`; the consumer is woken with a
//! `tokio::sync::Notify`. One producer and one consumer per queue.

use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// What happened to a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame queued with room to spare
    Queued,
    /// Frame queued after discarding the oldest one
    DroppedOldest,
    /// Queue already closed; frame discarded
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
}

/// Bounded drop-oldest queue of encoded audio chunks.
#[derive(Debug)]
pub struct FrameQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                ..QueueState::default()
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// A poisoned lock only means another thread panicked mid-push; the
    /// queue contents are still consistent.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a frame, discarding the oldest one if the queue is full.
    pub fn push(&self, frame: Vec<u8>) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            let mut outcome = PushOutcome::Queued;
            if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                outcome = PushOutcome::DroppedOldest;
            }
            state.frames.push_back(frame);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Refuse further pushes. Frames already queued are still delivered.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Wait for the next frame. `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Consume the queue as a stream of frames ending when it is closed.
    pub fn into_stream(self: Arc<Self>) -> BoxStream<'static, Vec<u8>> {
        stream::unfold(self, |queue| async move {
            let frame = queue.pop().await?;
            Some((frame, queue))
        })
        .boxed()
    }
}
