//! Bounded pool of reusable VAD detector instances.
//!
//! Detector construction dominates startup latency and each detector holds
//! model resources, so a fixed set is pre-built and recycled across
//! sessions. The pool never blocks the streaming path: when every instance
//! is checked out, `get` falls back to constructing a transient instance
//! after a short timeout instead of waiting for a return.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::{Detector, DetectorFactory, EngineError};

/// Instance id marking a transient, over-capacity detector.
pub const TRANSIENT_ID: i32 = -1;

/// How long `get` waits for a returned instance before constructing a
/// transient one.
const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("VAD pool is shutting down")]
    Shutdown,
    #[error("failed to create VAD detector: {0}")]
    Create(#[from] EngineError),
}

/// One pooled detector.
///
/// The in-use flag is toggled only via compare-and-swap so a racing
/// acquire/release pair can never double-assign an instance.
pub struct VadInstance {
    id: i32,
    type_tag: &'static str,
    in_use: AtomicBool,
    last_used: AtomicI64,
    detector: Mutex<Detector>,
}

impl VadInstance {
    fn new(id: i32, detector: Detector, in_use: bool) -> Self {
        let type_tag = detector.type_tag();
        Self {
            id,
            type_tag,
            in_use: AtomicBool::new(in_use),
            last_used: AtomicI64::new(now_nanos()),
            detector: Mutex::new(detector),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn type_tag(&self) -> &'static str {
        self.type_tag
    }

    pub fn is_transient(&self) -> bool {
        self.id == TRANSIENT_ID
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Exclusive access to the wrapped detector. Callers lock only inside
    /// blocking tasks; the detector itself is not safe for concurrent use.
    pub fn detector(&self) -> &Mutex<Detector> {
        &self.detector
    }

    fn try_acquire(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_release(&self) -> bool {
        self.in_use
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn touch(&self) {
        self.last_used.store(now_nanos(), Ordering::Relaxed);
    }

    /// Drain pending segments so the next session starts clean.
    fn reset(&self) {
        self.detector.lock().reset();
    }
}

/// Pool statistics exposed through `/health` and `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub vad_type: &'static str,
    pub pool_size: usize,
    pub total_instances: usize,
    pub available_count: usize,
    pub active_count: i64,
    pub total_created: u64,
    pub total_reused: u64,
}

/// Fixed-capacity detector pool with a bounded available queue.
pub struct VadPool {
    instances: Mutex<Vec<Arc<VadInstance>>>,
    available_tx: mpsc::Sender<Arc<VadInstance>>,
    available_rx: AsyncMutex<mpsc::Receiver<Arc<VadInstance>>>,
    factory: Arc<dyn DetectorFactory>,
    pool_size: usize,
    shutdown: AtomicBool,
    total_created: AtomicU64,
    total_reused: AtomicU64,
    total_active: AtomicI64,
}

impl VadPool {
    pub fn new(pool_size: usize, factory: Arc<dyn DetectorFactory>) -> Self {
        let (available_tx, available_rx) = mpsc::channel(pool_size.max(1));
        Self {
            instances: Mutex::new(Vec::with_capacity(pool_size)),
            available_tx,
            available_rx: AsyncMutex::new(available_rx),
            factory,
            pool_size,
            shutdown: AtomicBool::new(false),
            total_created: AtomicU64::new(0),
            total_reused: AtomicU64::new(0),
            total_active: AtomicI64::new(0),
        }
    }

    /// Construct the pre-built detector set in parallel.
    ///
    /// Succeeds if at least one detector was built; per-instance failures
    /// are logged and tolerated.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        info!(
            "Initializing {} pool with {} instances...",
            self.factory.detector_type(),
            self.pool_size
        );

        let mut builds = Vec::with_capacity(self.pool_size);
        for id in 0..self.pool_size {
            let factory = Arc::clone(&self.factory);
            builds.push(tokio::task::spawn_blocking(move || {
                (id as i32, factory.create())
            }));
        }

        let mut last_error = None;
        for build in builds {
            let (id, result) = match build.await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("VAD construction task failed: {}", e);
                    continue;
                }
            };
            match result {
                Ok(detector) => {
                    let instance = Arc::new(VadInstance::new(id, detector, false));
                    self.instances.lock().push(Arc::clone(&instance));
                    if self.available_tx.try_send(instance).is_ok() {
                        self.total_created.fetch_add(1, Ordering::Relaxed);
                        debug!("VAD instance {} initialized", id);
                    } else {
                        warn!("VAD pool queue full, instance {} discarded", id);
                    }
                }
                Err(e) => {
                    warn!("Failed to create VAD instance {}: {}", id, e);
                    last_error = Some(e);
                }
            }
        }

        let built = self.instances.lock().len();
        info!(
            "VAD pool initialized with {}/{} instances",
            built, self.pool_size
        );

        if built == 0 {
            return Err(PoolError::Create(last_error.unwrap_or_else(|| {
                EngineError::Inference("no VAD instances could be created".to_string())
            })));
        }
        Ok(())
    }

    /// Acquire a detector instance.
    ///
    /// Prefers a pooled instance; after [`ACQUIRE_TIMEOUT`] without one
    /// available, constructs a transient instance (id −1) so the streaming
    /// path degrades in latency rather than blocking. Fails only when the
    /// pool is shutting down.
    pub async fn get(&self) -> Result<Arc<VadInstance>, PoolError> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(PoolError::Shutdown);
            }

            let received = tokio::time::timeout(ACQUIRE_TIMEOUT, async {
                self.available_rx.lock().await.recv().await
            })
            .await;

            match received {
                Ok(Some(instance)) => {
                    if instance.try_acquire() {
                        instance.touch();
                        self.total_reused.fetch_add(1, Ordering::Relaxed);
                        self.total_active.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "VAD instance {} checked out (active: {})",
                            instance.id(),
                            self.total_active.load(Ordering::Relaxed)
                        );
                        return Ok(instance);
                    }
                    // Lost the flag race; requeue and retry.
                    warn!(
                        "VAD instance {} already in use, returning to queue",
                        instance.id()
                    );
                    let _ = self.available_tx.try_send(instance);
                }
                Ok(None) => return Err(PoolError::Shutdown),
                Err(_) => {
                    warn!("VAD pool acquire timeout, creating transient instance");
                    return self.create_transient().await;
                }
            }
        }
    }

    async fn create_transient(&self) -> Result<Arc<VadInstance>, PoolError> {
        let factory = Arc::clone(&self.factory);
        let detector = tokio::task::spawn_blocking(move || factory.create())
            .await
            .map_err(|e| PoolError::Create(EngineError::Inference(e.to_string())))??;

        self.total_created.fetch_add(1, Ordering::Relaxed);
        self.total_active.fetch_add(1, Ordering::Relaxed);
        info!("Created transient VAD instance");
        Ok(Arc::new(VadInstance::new(TRANSIENT_ID, detector, true)))
    }

    /// Return an instance to the pool.
    ///
    /// Resets the detector, then re-queues it. Transient instances are
    /// destroyed, never re-queued. Returning an instance that was not in
    /// use is a warning-level no-op.
    pub fn put(&self, instance: Arc<VadInstance>) {
        if !instance.try_release() {
            warn!(
                "VAD instance {} was not in use, cannot return",
                instance.id()
            );
            return;
        }
        instance.touch();
        self.total_active.fetch_sub(1, Ordering::Relaxed);
        instance.reset();

        if instance.is_transient() {
            debug!("Destroying transient VAD instance");
            return;
        }

        let id = instance.id();
        if self.available_tx.try_send(instance).is_err() {
            warn!("VAD pool queue full, destroying instance {}", id);
            self.instances.lock().retain(|i| i.id() != id);
        } else {
            debug!("VAD instance {} returned to pool", id);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let total_instances = self.instances.lock().len();
        let available_count =
            self.available_tx.max_capacity() - self.available_tx.capacity();
        PoolStats {
            vad_type: self.factory.detector_type(),
            pool_size: self.pool_size,
            total_instances,
            available_count,
            active_count: self.total_active.load(Ordering::Relaxed),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_reused: self.total_reused.load(Ordering::Relaxed),
        }
    }

    /// Destroy every instance. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down VAD pool...");

        let mut drained = 0usize;
        {
            let mut rx = self.available_rx.lock().await;
            while rx.try_recv().is_ok() {
                drained += 1;
            }
        }
        let remaining = {
            let mut instances = self.instances.lock();
            let count = instances.len();
            instances.clear();
            count
        };
        info!(
            "VAD pool shutdown complete ({} queued, {} total destroyed)",
            drained, remaining
        );
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
