//! Session registry and the streaming audio pipeline.
//!
//! `process_audio` is the hot path: validate the frame, widen to f32,
//! run it through the session's detector under the configured deadline,
//! and spawn one recognition task per completed utterance. Recognition
//! tasks deliver through `handle_recognition_result`, which drops empty
//! and failed results and never blocks on a full outbound queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{OutboundMessage, Session, unix_millis};
use crate::audio;
use crate::config::ServerConfig;
use crate::engine::{Detector, EngineError, RecognitionEngine, SpeechSegment};
use crate::pool::{PoolError, PoolStats, VadInstance, VadPool};

/// Streaming-path errors reported to the client as `error` messages.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session {0} is closed")]
    SessionClosed(String),
    #[error("empty audio data")]
    EmptyFrame,
    #[error("invalid audio data length: {0}")]
    InvalidFrame(usize),
    #[error("VAD processing timeout")]
    VadTimeout,
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("VAD processing failed: {0}")]
    Vad(#[from] EngineError),
}

/// Aggregate counters exposed through `/health` and `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionManagerStats {
    pub total_sessions: u64,
    pub active_sessions: i64,
    pub total_messages: u64,
    pub current_sessions: usize,
    pub pool: PoolStats,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    recognizer: Arc<dyn RecognitionEngine>,
    vad_pool: Arc<VadPool>,
    config: Arc<ServerConfig>,
    total_sessions: AtomicU64,
    active_sessions: AtomicI64,
    total_messages: AtomicU64,
}

impl SessionManager {
    pub fn new(
        recognizer: Arc<dyn RecognitionEngine>,
        vad_pool: Arc<VadPool>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            recognizer,
            vad_pool,
            config,
            total_sessions: AtomicU64::new(0),
            active_sessions: AtomicI64::new(0),
            total_messages: AtomicU64::new(0),
        }
    }

    /// Register a new session. The VAD instance is assigned lazily on the
    /// first audio frame, not here.
    pub fn create_session(
        &self,
        session_id: &str,
    ) -> (Arc<Session>, mpsc::Receiver<OutboundMessage>) {
        let (session, rx) = Session::new(
            session_id.to_string(),
            self.config.session.send_queue_size,
        );
        self.sessions
            .write()
            .insert(session_id.to_string(), Arc::clone(&session));
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        (session, rx)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().get(session_id).cloned();
        if let Some(session) = &session {
            session.touch();
        }
        session
    }

    /// Deregister and close a session, returning its VAD instance to the
    /// pool.
    pub fn remove_session(&self, session_id: &str) {
        let session = self.sessions.write().remove(session_id);
        if let Some(session) = session {
            self.close_session(&session);
            self.active_sessions.fetch_sub(1, Ordering::Relaxed);
            info!("Session {} removed", session_id);
        }
    }

    fn close_session(&self, session: &Arc<Session>) {
        if session.mark_closed() {
            // Critical: the instance goes back to the pool, it is never
            // destroyed here.
            if let Some(instance) = session.take_vad() {
                self.vad_pool.put(instance);
                debug!("Returned VAD instance to pool for session {}", session.id());
            }
        }
    }

    /// Process one inbound PCM frame for a session.
    pub async fn process_audio(
        self: &Arc<Self>,
        session_id: &str,
        data: Bytes,
    ) -> Result<(), PipelineError> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))?;
        if session.is_closed() {
            return Err(PipelineError::SessionClosed(session_id.to_string()));
        }

        // Lazy VAD assignment on the first frame.
        let instance = match session.vad_instance() {
            Some(instance) => instance,
            None => {
                let instance = self.vad_pool.get().await?;
                let bound = session.bind_vad(Arc::clone(&instance));
                if !Arc::ptr_eq(&bound, &instance) {
                    // Another frame won the binding race; hand ours back.
                    self.vad_pool.put(instance);
                } else {
                    info!(
                        "Session {} assigned {} VAD instance {}",
                        session_id,
                        bound.type_tag(),
                        bound.id()
                    );
                }
                bound
            }
        };

        self.total_messages.fetch_add(1, Ordering::Relaxed);

        if data.is_empty() {
            return Err(PipelineError::EmptyFrame);
        }
        if data.len() % 2 != 0 {
            warn!(
                "Session {}: audio frame length {} is not even",
                session_id,
                data.len()
            );
            return Err(PipelineError::InvalidFrame(data.len()));
        }

        let samples = audio::pcm16_to_f32(&data, self.config.audio.normalize_factor);
        debug!(
            "Session {}: converted {} bytes to {} samples",
            session_id,
            data.len(),
            samples.len()
        );

        let segments = self.run_detector(&session, &instance, samples).await?;
        let is_buffering = matches!(&*instance.detector().lock(), Detector::Buffering(_));

        for segment in segments {
            let samples = if is_buffering {
                match self.apply_duration_bounds(session_id, segment.samples) {
                    Some(samples) => samples,
                    None => continue,
                }
            } else {
                segment.samples
            };
            self.spawn_recognition(session_id.to_string(), samples);
        }

        Ok(())
    }

    /// Run the frame through the session's detector under the configured
    /// deadline. On timeout the frame is abandoned but the session
    /// continues.
    async fn run_detector(
        &self,
        session: &Arc<Session>,
        instance: &Arc<VadInstance>,
        samples: Vec<f32>,
    ) -> Result<Vec<SpeechSegment>, PipelineError> {
        let deadline = Duration::from_secs(self.config.response.timeout.max(1));
        let instance = Arc::clone(instance);
        let task_session = Arc::clone(session);
        let ten_vad = self.config.vad.ten_vad.clone();

        let task = tokio::task::spawn_blocking(move || -> Result<Vec<SpeechSegment>, EngineError> {
            let mut detector = instance.detector().lock();
            match &mut *detector {
                Detector::Buffering(detector) => {
                    detector.accept_waveform(&samples)?;
                    let mut segments = Vec::new();
                    while let Some(segment) = detector.pop_front() {
                        segments.push(segment);
                    }
                    Ok(segments)
                }
                Detector::FrameLevel(classifier) => {
                    let hop = classifier.hop_size().max(1);
                    let mut state = task_session.segmentation().lock();
                    let mut segments = Vec::new();
                    for frame in samples.chunks(hop) {
                        let is_speech = classifier.classify(frame)?;
                        if is_speech {
                            if !state.in_speech {
                                state.in_speech = true;
                                state.current.clear();
                                state.silence_frames = 0;
                            }
                            state.current.extend_from_slice(frame);
                            state.silence_frames = 0;
                        } else if state.in_speech {
                            state.silence_frames += 1;
                            state.current.extend_from_slice(frame);
                            if state.silence_frames >= ten_vad.max_silence_frames {
                                let frame_count = state.current.len() / hop;
                                if frame_count >= ten_vad.min_speech_frames {
                                    segments.push(SpeechSegment {
                                        samples: std::mem::take(&mut state.current),
                                    });
                                } else {
                                    debug!(
                                        "Speech segment too short ({} frames), discarding",
                                        frame_count
                                    );
                                    state.current.clear();
                                }
                                state.in_speech = false;
                                state.silence_frames = 0;
                            }
                        }
                    }
                    Ok(segments)
                }
            }
        });

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(join_error)) => Err(PipelineError::Vad(EngineError::Inference(
                join_error.to_string(),
            ))),
            Err(_) => {
                warn!("Session {}: VAD processing timeout", session.id());
                Err(PipelineError::VadTimeout)
            }
        }
    }

    /// Discard segments below the minimum duration and truncate segments
    /// above the maximum.
    fn apply_duration_bounds(&self, session_id: &str, mut samples: Vec<f32>) -> Option<Vec<f32>> {
        let sample_rate = self.config.audio.sample_rate as f32;
        let duration = samples.len() as f32 / sample_rate;

        let min = self.config.vad.silero_vad.min_speech_duration;
        if duration < min {
            debug!(
                "Session {}: skipping short segment ({:.2}s < {:.2}s)",
                session_id, duration, min
            );
            return None;
        }

        let max = self.config.vad.silero_vad.max_speech_duration;
        if duration > max {
            warn!(
                "Session {}: segment too long ({:.2}s > {:.2}s), truncating",
                session_id, duration, max
            );
            samples.truncate((max * sample_rate) as usize);
        }
        Some(samples)
    }

    /// Decode one utterance on a blocking thread and deliver the result.
    ///
    /// The engine is shared; each task gets its own stream, destroyed after
    /// use.
    fn spawn_recognition(self: &Arc<Self>, session_id: String, samples: Vec<f32>) {
        let manager = Arc::clone(self);
        let recognizer = Arc::clone(&self.recognizer);
        let sample_rate = self.config.audio.sample_rate;

        tokio::spawn(async move {
            let decoded = tokio::task::spawn_blocking(move || -> Result<String, EngineError> {
                let mut stream = recognizer.create_stream()?;
                stream.accept_waveform(sample_rate, &samples);
                stream.decode()
            })
            .await;

            match decoded {
                Ok(result) => manager.handle_recognition_result(&session_id, result),
                Err(join_error) => manager.handle_recognition_result(
                    &session_id,
                    Err(EngineError::Inference(join_error.to_string())),
                ),
            }
        });
    }

    /// Deliver a recognition result to the session.
    ///
    /// Empty transcripts are dropped silently; errors are logged and not
    /// surfaced to the client; results for closed or removed sessions are
    /// discarded.
    pub fn handle_recognition_result(&self, session_id: &str, result: Result<String, EngineError>) {
        let Some(session) = self.get_session(session_id) else {
            warn!(
                "Session {} not found when handling recognition result",
                session_id
            );
            return;
        };
        if session.is_closed() {
            warn!(
                "Session {} is closed when handling recognition result",
                session_id
            );
            return;
        }

        match result {
            Ok(text) if !text.is_empty() => {
                if session.enqueue(OutboundMessage::Final {
                    text: text.clone(),
                    timestamp: unix_millis(),
                }) {
                    info!("Recognition result queued for session {}: {}", session_id, text);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("Recognition error for session {}: {}", session_id, e);
            }
        }
    }

    pub fn stats(&self) -> SessionManagerStats {
        SessionManagerStats {
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            current_sessions: self.sessions.read().len(),
            pool: self.vad_pool.stats(),
        }
    }

    /// Close every session. In-flight recognition tasks find their session
    /// closed and drop their results.
    pub fn shutdown(&self) {
        info!("Shutting down session manager...");
        let sessions: Vec<_> = {
            let mut map = self.sessions.write();
            map.drain().collect()
        };
        for (session_id, session) in sessions {
            debug!("Closing session: {}", session_id);
            self.close_session(&session);
            self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        }
        info!("Session manager shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        DetectorFactory, FrameClassifier, RecognitionStream, VoiceDetector,
    };
    use parking_lot::Mutex;

    /// Buffering detector scripted to complete one segment per
    /// `segment_every` submitted samples.
    struct ScriptedDetector {
        buffered: Vec<f32>,
        segment_every: usize,
        completed: Vec<SpeechSegment>,
    }

    impl VoiceDetector for ScriptedDetector {
        fn accept_waveform(&mut self, samples: &[f32]) -> Result<(), EngineError> {
            self.buffered.extend_from_slice(samples);
            while self.buffered.len() >= self.segment_every {
                let samples: Vec<f32> = self.buffered.drain(..self.segment_every).collect();
                self.completed.push(SpeechSegment { samples });
            }
            Ok(())
        }
        fn is_empty(&self) -> bool {
            self.completed.is_empty()
        }
        fn pop_front(&mut self) -> Option<SpeechSegment> {
            if self.completed.is_empty() {
                None
            } else {
                Some(self.completed.remove(0))
            }
        }
        fn reset(&mut self) {
            self.buffered.clear();
            self.completed.clear();
        }
    }

    struct ScriptedFactory {
        segment_every: usize,
    }

    impl DetectorFactory for ScriptedFactory {
        fn create(&self) -> Result<Detector, EngineError> {
            Ok(Detector::Buffering(Box::new(ScriptedDetector {
                buffered: Vec::new(),
                segment_every: self.segment_every,
                completed: Vec::new(),
            })))
        }
        fn detector_type(&self) -> &'static str {
            crate::engine::vad::SILERO_TYPE
        }
    }

    /// Recognizer that reports the submitted sample count, so tests can
    /// assert on truncation.
    struct EchoLenEngine;
    struct EchoLenStream {
        len: usize,
    }

    impl RecognitionEngine for EchoLenEngine {
        fn create_stream(&self) -> Result<Box<dyn RecognitionStream>, EngineError> {
            Ok(Box::new(EchoLenStream { len: 0 }))
        }
    }
    impl RecognitionStream for EchoLenStream {
        fn accept_waveform(&mut self, _sample_rate: u32, samples: &[f32]) {
            self.len += samples.len();
        }
        fn decode(&mut self) -> Result<String, EngineError> {
            Ok(format!("samples={}", self.len))
        }
    }

    /// Frame classifier scripted by a shared flag sequence.
    struct ScriptedClassifier {
        hop: usize,
        flags: Arc<Mutex<Vec<bool>>>,
    }
    impl FrameClassifier for ScriptedClassifier {
        fn hop_size(&self) -> usize {
            self.hop
        }
        fn classify(&mut self, _frame: &[f32]) -> Result<bool, EngineError> {
            let mut flags = self.flags.lock();
            Ok(if flags.is_empty() {
                false
            } else {
                flags.remove(0)
            })
        }
        fn reset(&mut self) {}
    }

    struct ClassifierFactory {
        hop: usize,
        flags: Arc<Mutex<Vec<bool>>>,
    }
    impl DetectorFactory for ClassifierFactory {
        fn create(&self) -> Result<Detector, EngineError> {
            Ok(Detector::FrameLevel(Box::new(ScriptedClassifier {
                hop: self.hop,
                flags: Arc::clone(&self.flags),
            })))
        }
        fn detector_type(&self) -> &'static str {
            crate::engine::vad::TEN_TYPE
        }
    }

    async fn manager_with_factory(
        factory: Arc<dyn DetectorFactory>,
        configure: impl FnOnce(&mut ServerConfig),
    ) -> Arc<SessionManager> {
        let mut config = ServerConfig::default();
        configure(&mut config);
        let config = Arc::new(config);

        let pool = Arc::new(VadPool::new(config.vad.pool_size, factory));
        pool.initialize().await.unwrap();
        Arc::new(SessionManager::new(
            Arc::new(EchoLenEngine),
            pool,
            config,
        ))
    }

    fn pcm_frame(samples: usize) -> Bytes {
        let mut data = Vec::with_capacity(samples * 2);
        for _ in 0..samples {
            data.extend_from_slice(&1000i16.to_le_bytes());
        }
        Bytes::from(data)
    }

    #[tokio::test]
    async fn odd_length_frame_is_rejected_session_stays_open() {
        let manager =
            manager_with_factory(Arc::new(ScriptedFactory { segment_every: 1 << 30 }), |_| {})
                .await;
        let (session, _rx) = manager.create_session("s1");

        let result = manager
            .process_audio("s1", Bytes::from_static(&[0u8; 3]))
            .await;
        assert!(matches!(result, Err(PipelineError::InvalidFrame(3))));
        assert!(!session.is_closed());

        // The session still accepts well-formed frames afterwards.
        assert!(manager.process_audio("s1", pcm_frame(4)).await.is_ok());
    }

    #[tokio::test]
    async fn empty_frame_is_rejected() {
        let manager =
            manager_with_factory(Arc::new(ScriptedFactory { segment_every: 1 << 30 }), |_| {})
                .await;
        manager.create_session("s1");
        assert!(matches!(
            manager.process_audio("s1", Bytes::new()).await,
            Err(PipelineError::EmptyFrame)
        ));
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let manager =
            manager_with_factory(Arc::new(ScriptedFactory { segment_every: 1 << 30 }), |_| {})
                .await;
        assert!(matches!(
            manager.process_audio("nope", pcm_frame(4)).await,
            Err(PipelineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn segment_flows_to_recognition_and_final_message() {
        // 1600 samples = 0.1s at 16kHz; set min_speech_duration below that.
        let manager = manager_with_factory(
            Arc::new(ScriptedFactory { segment_every: 1600 }),
            |config| {
                config.vad.silero_vad.min_speech_duration = 0.05;
            },
        )
        .await;
        let (_session, mut rx) = manager.create_session("s1");

        manager.process_audio("s1", pcm_frame(1600)).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("final message")
            .expect("channel open");
        match message {
            OutboundMessage::Final { text, timestamp } => {
                assert_eq!(text, "samples=1600");
                assert!(timestamp > 0);
            }
            other => panic!("expected final message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_segment_is_discarded() {
        // 160 samples = 0.01s, below the 0.05s minimum.
        let manager = manager_with_factory(
            Arc::new(ScriptedFactory { segment_every: 160 }),
            |config| {
                config.vad.silero_vad.min_speech_duration = 0.05;
            },
        )
        .await;
        let (_session, mut rx) = manager.create_session("s1");

        manager.process_audio("s1", pcm_frame(160)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn long_segment_is_truncated_to_max() {
        // max_speech_duration 0.1s at 16kHz = 1600 samples; emit 3200.
        let manager = manager_with_factory(
            Arc::new(ScriptedFactory { segment_every: 3200 }),
            |config| {
                config.vad.silero_vad.min_speech_duration = 0.05;
                config.vad.silero_vad.max_speech_duration = 0.1;
            },
        )
        .await;
        let (_session, mut rx) = manager.create_session("s1");

        manager.process_audio("s1", pcm_frame(3200)).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("final message")
            .expect("channel open");
        match message {
            OutboundMessage::Final { text, .. } => assert_eq!(text, "samples=1600"),
            other => panic!("expected final message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_session_drops_recognition_results() {
        let manager =
            manager_with_factory(Arc::new(ScriptedFactory { segment_every: 1 << 30 }), |_| {})
                .await;
        let (session, mut rx) = manager.create_session("s1");
        session.mark_closed();

        manager.handle_recognition_result("s1", Ok("late".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn frame_level_variant_assembles_segments_on_the_session() {
        let hop = 160;
        // 4 speech hops, then silence hops until max_silence_frames = 2.
        let flags = Arc::new(Mutex::new(vec![
            true, true, true, true, false, false,
        ]));
        let manager = manager_with_factory(
            Arc::new(ClassifierFactory {
                hop,
                flags: Arc::clone(&flags),
            }),
            |config| {
                config.vad.provider = "ten_vad".to_string();
                config.vad.ten_vad.hop_size = hop;
                config.vad.ten_vad.min_speech_frames = 2;
                config.vad.ten_vad.max_silence_frames = 2;
            },
        )
        .await;
        let (_session, mut rx) = manager.create_session("s1");

        // 6 hops worth of audio, classified per the scripted flags.
        manager
            .process_audio("s1", pcm_frame(hop * 6))
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("final message")
            .expect("channel open");
        match message {
            // 4 speech hops + 2 trailing silence hops accumulate.
            OutboundMessage::Final { text, .. } => assert_eq!(text, format!("samples={}", hop * 6)),
            other => panic!("expected final message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remove_session_returns_instance_to_pool() {
        let manager =
            manager_with_factory(Arc::new(ScriptedFactory { segment_every: 1 << 30 }), |_| {})
                .await;
        manager.create_session("s1");
        manager.process_audio("s1", pcm_frame(4)).await.unwrap();
        assert_eq!(manager.stats().pool.active_count, 1);

        manager.remove_session("s1");
        let stats = manager.stats();
        assert_eq!(stats.pool.active_count, 0);
        assert_eq!(stats.current_sessions, 0);
        assert_eq!(
            stats.pool.available_count + stats.pool.active_count as usize,
            stats.pool.total_instances
        );
    }
}
