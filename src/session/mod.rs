//! Per-connection session state.
//!
//! A session owns the outbound message queue for one WebSocket connection,
//! the lazily assigned VAD instance, and the segmentation state used by the
//! frame-level detector variant. The queue is bounded and never blocks the
//! processor: enqueueing into a full queue drops the message with a
//! warning.

pub mod manager;

pub use manager::{PipelineError, SessionManager, SessionManagerStats};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tracing::warn;

use crate::pool::VadInstance;

/// Outbound frames, serialized as JSON text on the transport.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// Sent once after the transport upgrade.
    #[serde(rename = "connection")]
    Connection { session_id: String, message: String },
    /// One recognized utterance; `timestamp` is completion time in
    /// milliseconds since the epoch.
    #[serde(rename = "final")]
    Final { text: String, timestamp: u64 },
    /// A per-frame processing failure. The session stays open.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Utterance assembly state for the frame-level detector variant.
///
/// This lives on the session rather than the pooled detector so pool
/// entries stay stateless across sessions.
#[derive(Debug, Default)]
pub struct SegmentationState {
    pub in_speech: bool,
    pub current: Vec<f32>,
    pub silence_frames: usize,
}

pub struct Session {
    id: String,
    outbound: mpsc::Sender<OutboundMessage>,
    closed: AtomicBool,
    send_errors: AtomicU32,
    last_seen: AtomicI64,
    done: Notify,
    vad: Mutex<Option<Arc<VadInstance>>>,
    segmentation: Mutex<SegmentationState>,
}

impl Session {
    /// Create a session and hand back the receiving end of its outbound
    /// queue for the connection's send loop.
    pub fn new(id: String, send_queue_size: usize) -> (Arc<Self>, mpsc::Receiver<OutboundMessage>) {
        let (outbound, rx) = mpsc::channel(send_queue_size.max(1));
        let session = Arc::new(Self {
            id,
            outbound,
            closed: AtomicBool::new(false),
            send_errors: AtomicU32::new(0),
            last_seen: AtomicI64::new(unix_nanos()),
            done: Notify::new(),
            vad: Mutex::new(None),
            segmentation: Mutex::new(SegmentationState::default()),
        });
        (session, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip the closed flag; returns true for the caller that won the race
    /// and should perform cleanup.
    pub fn mark_closed(&self) -> bool {
        let first = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.done.notify_waiters();
        }
        first
    }

    /// Resolves when the session has been closed.
    pub async fn done(&self) {
        // Created before the flag check so a concurrent close cannot be
        // missed between the check and the await.
        let notified = self.done.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Non-blocking enqueue. Closed sessions reject; a full queue drops the
    /// message with a warning. Returns whether the message was queued.
    pub fn enqueue(&self, message: OutboundMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Session {} send queue is full, dropping message", self.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn touch(&self) {
        self.last_seen.store(unix_nanos(), Ordering::Relaxed);
    }

    pub fn last_seen_nanos(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    /// Increment the consecutive send-error counter, returning the new
    /// value.
    pub fn record_send_error(&self) -> u32 {
        self.send_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_send_errors(&self) {
        self.send_errors.store(0, Ordering::Release);
    }

    /// The assigned VAD instance, if one has been bound.
    pub fn vad_instance(&self) -> Option<Arc<VadInstance>> {
        self.vad.lock().clone()
    }

    /// Bind a VAD instance if none is assigned yet; returns the bound
    /// instance either way. At most one instance is ever held.
    pub(crate) fn bind_vad(&self, instance: Arc<VadInstance>) -> Arc<VadInstance> {
        let mut slot = self.vad.lock();
        match &*slot {
            Some(existing) => Arc::clone(existing),
            None => {
                *slot = Some(Arc::clone(&instance));
                instance
            }
        }
    }

    /// Detach the VAD instance for return to the pool.
    pub(crate) fn take_vad(&self) -> Option<Arc<VadInstance>> {
        self.vad.lock().take()
    }

    pub(crate) fn segmentation(&self) -> &Mutex<SegmentationState> {
        &self.segmentation
    }
}

pub(crate) fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
