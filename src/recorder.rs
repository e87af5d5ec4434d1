//! Core orchestrator: session lifecycle, capture lifecycle, and the gaze
//! ingestion entry point.
//!
//! The recorder is a state machine over `{Idle, Initialized, Recording,
//! Stopped, Error}`. Exactly one session may be active at a time; only the
//! recorder mutates session state. Adaptors submit samples through
//! [`GazeRecorder::add_gaze_sample`] and never touch the store directly.
//!
//! Ingestion policy: samples and events are accepted whenever a session
//! exists, before and after the capture window; exports trim to the window
//! at read time.

use crate::buffer::{FlushFn, QualityMonitor, QualityReport, SampleBuffer};
use crate::capture::{negotiate_encoding, CaptureDevice, CaptureRequest, CaptureStream};
use crate::config::GazecapConfig;
use crate::error::{GazecapError, Result};
use crate::events::{EventBus, RecorderEvent};
use crate::gaze::{
    EyeSample, GazeSample, RawEyeInput, RawGazeInput, SessionEvent, SessionEventKind,
    TrackingStatus, VideoChunkRecord,
};
use crate::session::{ScreenInfo, Session, SessionConfig, SessionStatus};
use crate::storage::{CleanupResult, SessionData, SessionStore, StorageQuota};
use crate::transform::{self, RawPosition, SurfaceGeometry, TransformContext};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const EVENT_BUS_CAPACITY: usize = 256;

/// Orchestrator lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderStatus {
    Idle,
    Initialized,
    Recording,
    Stopped,
    Error,
}

impl RecorderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecorderStatus::Idle => "idle",
            RecorderStatus::Initialized => "initialized",
            RecorderStatus::Recording => "recording",
            RecorderStatus::Stopped => "stopped",
            RecorderStatus::Error => "error",
        }
    }
}

/// Cheap snapshot for the subscription surface's `state()` accessor.
#[derive(Debug, Clone, Serialize)]
pub struct RecorderState {
    pub status: RecorderStatus,
    pub session_id: Option<String>,
    pub sample_count: u64,
    pub event_count: u64,
    pub chunk_count: u64,
    pub last_error: Option<String>,
}

struct RecorderInner {
    status: RecorderStatus,
    session: Option<Session>,
    last_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    samples: AtomicU64,
    events: AtomicU64,
    chunks: AtomicU64,
    captured_bytes: AtomicU64,
}

struct CaptureHandle {
    stop: CancellationToken,
    pump: tokio::task::JoinHandle<()>,
}

/// The acquisition pipeline's owning service. Constructed once at startup and
/// injected into consumers; there is no global instance.
pub struct GazeRecorder {
    config: GazecapConfig,
    device: Arc<dyn CaptureDevice>,
    /// Origin for all monotonic timestamps in this process
    origin: Instant,
    inner: RwLock<RecorderInner>,
    store: RwLock<Option<SessionStore>>,
    buffer: RwLock<Option<Arc<SampleBuffer<GazeSample>>>>,
    buffer_cancel: RwLock<Option<CancellationToken>>,
    quality: SyncMutex<QualityMonitor>,
    capture: Mutex<Option<CaptureHandle>>,
    counters: Arc<Counters>,
    event_bus: EventBus,
}

impl GazeRecorder {
    pub fn new(config: GazecapConfig, device: Arc<dyn CaptureDevice>) -> Self {
        let default_rate = config.tracking.default_sampling_rate_hz;
        Self {
            config,
            device,
            origin: Instant::now(),
            inner: RwLock::new(RecorderInner {
                status: RecorderStatus::Idle,
                session: None,
                last_error: None,
            }),
            store: RwLock::new(None),
            buffer: RwLock::new(None),
            buffer_cancel: RwLock::new(None),
            quality: SyncMutex::new(QualityMonitor::new(default_rate)),
            capture: Mutex::new(None),
            counters: Arc::new(Counters::default()),
            event_bus: EventBus::new(EVENT_BUS_CAPACITY),
        }
    }

    /// Milliseconds since recorder construction, the monotonic clock all
    /// samples and events share.
    pub fn monotonic_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }

    /// Subscribe to committed state changes. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RecorderEvent> {
        self.event_bus.subscribe()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> RecorderState {
        let inner = self.inner.read();
        RecorderState {
            status: inner.status,
            session_id: inner.session.as_ref().map(|s| s.id.clone()),
            sample_count: self.counters.samples.load(Ordering::Relaxed),
            event_count: self.counters.events.load(Ordering::Relaxed),
            chunk_count: self.counters.chunks.load(Ordering::Relaxed),
            last_error: inner.last_error.clone(),
        }
    }

    pub fn status(&self) -> RecorderStatus {
        self.inner.read().status
    }

    /// The active session, if any.
    pub fn current_session(&self) -> Option<Session> {
        self.inner.read().session.clone()
    }

    /// Live quality metrics for the incoming sample stream.
    pub fn quality_report(&self) -> QualityReport {
        self.quality.lock().report(self.monotonic_ms())
    }

    fn record_error(&self, error: &GazecapError) {
        let mut inner = self.inner.write();
        inner.last_error = Some(error.to_string());
        drop(inner);
        let _ = self.event_bus.publish(RecorderEvent::RecorderError {
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }

    fn store(&self) -> Result<SessionStore> {
        self.store.read().clone().ok_or_else(|| {
            GazecapError::invalid_state(
                self.status().as_str().to_string(),
                "storage is not initialized".to_string(),
            )
        })
    }

    /// Prepare storage and the sample buffer. Valid only from `Idle`.
    pub async fn initialize(&self) -> Result<()> {
        {
            let inner = self.inner.read();
            if inner.status != RecorderStatus::Idle {
                return Err(GazecapError::invalid_state(
                    inner.status.as_str().to_string(),
                    "initialize requires idle status".to_string(),
                ));
            }
        }

        let storage_config = self.config.storage.clone();
        let store = tokio::task::spawn_blocking(move || SessionStore::open(storage_config))
            .await
            .map_err(|e| GazecapError::storage(format!("store open task failed: {}", e)))??;

        let flush_store = store.clone();
        let flush: FlushFn<GazeSample> = Arc::new(move |batch| {
            let store = flush_store.clone();
            Box::pin(async move { store.insert_samples(batch).await })
        });
        let buffer = Arc::new(SampleBuffer::new(self.config.buffer.max_batch, flush));
        let cancel = CancellationToken::new();
        Arc::clone(&buffer).start_interval_flush(
            Duration::from_millis(self.config.buffer.flush_interval_ms),
            cancel.clone(),
        );

        *self.store.write() = Some(store);
        *self.buffer.write() = Some(buffer);
        *self.buffer_cancel.write() = Some(cancel);
        self.inner.write().status = RecorderStatus::Initialized;
        tracing::info!("Recorder initialized");
        Ok(())
    }

    /// Create and persist a new session. Requires status exactly
    /// `Initialized` with no session active; returns the new session id.
    pub async fn create_session(
        &self,
        config: SessionConfig,
        screen: ScreenInfo,
        surface: SurfaceGeometry,
    ) -> Result<String> {
        {
            let inner = self.inner.read();
            if inner.status != RecorderStatus::Initialized || inner.session.is_some() {
                return Err(GazecapError::invalid_state(
                    inner.status.as_str().to_string(),
                    "create_session requires initialized status with no active session"
                        .to_string(),
                ));
            }
        }

        let store = self.store()?;
        let session = Session::new(config, screen, surface);
        let session_id = session.id.clone();

        if let Err(e) = store.insert_session(&session).await {
            self.record_error(&e);
            return Err(e);
        }

        self.inner.write().session = Some(session.clone());

        self.append_event_internal(&session_id, SessionEventKind::SessionStart, None)
            .await?;
        let _ = self.event_bus.publish(RecorderEvent::SessionCreated {
            session_id: session_id.clone(),
            timestamp: session.started_at,
        });
        tracing::info!(
            "Session {} created for participant {}",
            session_id,
            session.config.participant_id
        );
        Ok(session_id)
    }

    /// Request display capture and begin chunked recording. Requires an
    /// existing session that is not already recording. Capability failures
    /// (permission denied, no supported encoding) leave the session exactly
    /// as it was.
    pub async fn start_recording(&self) -> Result<()> {
        let session = {
            let inner = self.inner.read();
            let session = inner.session.clone().ok_or_else(|| {
                GazecapError::invalid_state(
                    inner.status.as_str().to_string(),
                    "start_recording requires an active session".to_string(),
                )
            })?;
            if inner.status == RecorderStatus::Recording || session.is_capturing() {
                return Err(GazecapError::invalid_state(
                    inner.status.as_str().to_string(),
                    "recording is already in progress".to_string(),
                ));
            }
            if session.status != SessionStatus::Recording {
                return Err(GazecapError::invalid_state(
                    inner.status.as_str().to_string(),
                    "session is already finalized".to_string(),
                ));
            }
            session
        };

        let store = self.store()?;

        let preferred = session
            .config
            .preferred_codec
            .as_deref()
            .or(self.config.capture.preferred_codec.as_deref());
        let encoding = negotiate_encoding(self.device.as_ref(), preferred)?;

        let request = CaptureRequest {
            mode: session.recording_mode(),
            frame_rate: session.config.frame_rate,
            quality: session.config.quality.clone(),
            encoding: encoding.clone(),
            chunk_duration: Duration::from_millis(session.config.chunk_duration_ms),
        };
        let stream = self.device.open(request).await?;

        // Capture acquired; commit the recording window
        let started_ms = self.monotonic_ms();
        let updated_session = {
            let mut inner = self.inner.write();
            let session = inner.session.as_mut().ok_or_else(|| {
                GazecapError::invalid_state(
                    "idle".to_string(),
                    "session was torn down while starting recording".to_string(),
                )
            })?;
            session.recording_started_ms = Some(started_ms);
            session.recording_stopped_ms = None;
            session.encoding = Some(encoding.mime());
            let snapshot = session.clone();
            inner.status = RecorderStatus::Recording;
            snapshot
        };

        if let Err(e) = store.update_session(&updated_session).await {
            self.record_error(&e);
        }
        self.append_event_internal(&updated_session.id, SessionEventKind::RecordingStart, None)
            .await?;

        let stop = stream.stop_token();
        let pump = tokio::spawn(pump_chunks(
            stream,
            store,
            updated_session.id.clone(),
            self.event_bus.clone(),
            Arc::clone(&self.counters),
        ));
        *self.capture.lock().await = Some(CaptureHandle { stop, pump });

        let _ = self.event_bus.publish(RecorderEvent::RecordingStarted {
            session_id: updated_session.id.clone(),
            encoding: encoding.mime(),
            timestamp: Utc::now(),
        });
        tracing::info!(
            "Recording started for session {} ({})",
            updated_session.id,
            encoding.mime()
        );
        Ok(())
    }

    /// Halt capture, flush pending samples, and finalize the session.
    /// Requires active recording.
    pub async fn stop_recording(&self) -> Result<()> {
        let handle = {
            let mut capture = self.capture.lock().await;
            capture.take().ok_or_else(|| {
                GazecapError::invalid_state(
                    self.status().as_str().to_string(),
                    "stop_recording requires active recording".to_string(),
                )
            })?
        };

        // Stop the producer, then drain the pump to pick up trailing chunks
        handle.stop.cancel();
        if let Err(e) = handle.pump.await {
            tracing::warn!("Chunk pump ended abnormally: {}", e);
        }

        let flush_result = self.flush_pending().await;

        let stopped_ms = self.monotonic_ms();
        let ended_at = Utc::now();
        let finalized = {
            let mut inner = self.inner.write();
            let session = inner.session.as_mut().ok_or_else(|| {
                GazecapError::invalid_state(
                    "stopped".to_string(),
                    "no session to finalize".to_string(),
                )
            })?;
            session.recording_stopped_ms = Some(stopped_ms);
            session.ended_at = Some(ended_at);
            session.duration_ms =
                Some((ended_at - session.started_at).num_milliseconds().max(0) as u64);
            session.captured_bytes = self.counters.captured_bytes.load(Ordering::Relaxed);
            session.status = SessionStatus::Completed;
            let snapshot = session.clone();
            inner.status = RecorderStatus::Stopped;
            snapshot
        };

        let store = self.store()?;
        if let Err(e) = store.update_session(&finalized).await {
            self.record_error(&e);
            return Err(e);
        }
        self.append_event_internal(&finalized.id, SessionEventKind::RecordingStop, None)
            .await?;
        self.append_event_internal(&finalized.id, SessionEventKind::SessionStop, None)
            .await?;

        let _ = self.event_bus.publish(RecorderEvent::RecordingStopped {
            session_id: finalized.id.clone(),
            duration_ms: finalized.duration_ms.unwrap_or(0),
            captured_bytes: finalized.captured_bytes,
            timestamp: ended_at,
        });
        tracing::info!(
            "Recording stopped for session {} ({} chunks, {} bytes)",
            finalized.id,
            self.counters.chunks.load(Ordering::Relaxed),
            finalized.captured_bytes
        );

        // Un-flushed samples were re-queued and will retry on the interval;
        // surface the failure to the caller regardless
        flush_result.map(|_| ())
    }

    /// Ingestion entry point. Transforms the raw input into every derived
    /// frame, persists the enriched sample through the buffer, and notifies
    /// subscribers. Accepted whenever a session exists.
    ///
    /// `live_geometry` is the surface snapshot at capture time for
    /// current-tab sessions; the session's startup snapshot is the fallback.
    pub async fn add_gaze_sample(
        &self,
        raw: RawGazeInput,
        live_geometry: Option<SurfaceGeometry>,
    ) -> Result<GazeSample> {
        let session = self.inner.read().session.clone().ok_or_else(|| {
            GazecapError::invalid_state(
                self.status().as_str().to_string(),
                "add_gaze_sample requires an active session".to_string(),
            )
        })?;

        let sample = self.enrich_sample(&session, raw, live_geometry)?;

        let buffer = self
            .buffer
            .read()
            .clone()
            .ok_or_else(|| GazecapError::storage("sample buffer is not initialized"))?;

        let monotonic_ms = sample.monotonic_ms;
        let confidence = sample.confidence;
        let push_result = buffer.push(sample.clone()).await;

        // The sample is queued even when a flush attempt failed, so counters
        // advance either way (at-least-once persistence)
        self.counters.samples.fetch_add(1, Ordering::Relaxed);
        self.quality.lock().record(monotonic_ms, confidence);
        let _ = self.event_bus.publish(RecorderEvent::SampleIngested {
            session_id: session.id.clone(),
            sample_count: self.counters.samples.load(Ordering::Relaxed),
        });

        if let Err(e) = push_result {
            self.record_error(&e);
            return Err(e);
        }
        Ok(sample)
    }

    /// Run the transform engine over a raw input, including per-eye records.
    fn enrich_sample(
        &self,
        session: &Session,
        raw: RawGazeInput,
        live_geometry: Option<SurfaceGeometry>,
    ) -> Result<GazeSample> {
        let geometry = live_geometry.unwrap_or(session.surface);
        let ctx = TransformContext::new(
            session.recording_mode(),
            Some(session.screen.extent()),
            Some(&geometry),
        );

        let position = RawPosition {
            x: raw.screen_x,
            y: raw.screen_y,
            normalized: raw.normalized,
        };
        let result = transform::transform_all(position, &ctx)?;

        let left_eye = raw
            .left_eye
            .map(|eye| self.enrich_eye(eye, raw.normalized, &ctx))
            .transpose()?;
        let right_eye = raw
            .right_eye
            .map(|eye| self.enrich_eye(eye, raw.normalized, &ctx))
            .transpose()?;

        let stores_geometry = matches!(
            session.recording_mode(),
            crate::session::RecordingMode::CurrentTab
        );

        Ok(GazeSample {
            session_id: session.id.clone(),
            device_timestamp: raw.device_timestamp,
            system_time: Utc::now(),
            monotonic_ms: self.monotonic_ms(),
            raw_x: raw.screen_x,
            raw_y: raw.screen_y,
            raw_normalized: raw.normalized,
            content: result.content,
            page: result.page,
            normalized: result.normalized,
            within_bounds: result.within_bounds,
            confidence: raw.confidence.unwrap_or(1.0),
            left_eye,
            right_eye,
            geometry: stores_geometry.then_some(geometry),
        })
    }

    fn enrich_eye(
        &self,
        eye: RawEyeInput,
        normalized: bool,
        ctx: &TransformContext<'_>,
    ) -> Result<EyeSample> {
        let position = RawPosition {
            x: eye.screen_x,
            y: eye.screen_y,
            normalized,
        };
        let display = transform::to_display(position, ctx)?;
        let content = transform::to_content(position, ctx)?;
        Ok(EyeSample {
            screen: display,
            content,
            position_x: eye.position_x,
            position_y: eye.position_y,
            position_z: eye.position_z,
            pupil_size: eye.pupil_size,
            rotation: eye.rotation,
        })
    }

    /// Append a session event. Accepted whenever a session exists.
    pub async fn add_event(
        &self,
        kind: SessionEventKind,
        payload: Option<serde_json::Value>,
    ) -> Result<SessionEvent> {
        let session_id = self
            .inner
            .read()
            .session
            .as_ref()
            .map(|s| s.id.clone())
            .ok_or_else(|| {
                GazecapError::invalid_state(
                    self.status().as_str().to_string(),
                    "add_event requires an active session".to_string(),
                )
            })?;
        self.append_event_internal(&session_id, kind, payload).await
    }

    async fn append_event_internal(
        &self,
        session_id: &str,
        kind: SessionEventKind,
        payload: Option<serde_json::Value>,
    ) -> Result<SessionEvent> {
        let event = SessionEvent {
            session_id: session_id.to_string(),
            kind,
            timestamp: Utc::now(),
            monotonic_ms: self.monotonic_ms(),
            payload,
        };

        let store = self.store()?;
        if let Err(e) = store.insert_event(&event).await {
            self.record_error(&e);
            return Err(e);
        }

        self.counters.events.fetch_add(1, Ordering::Relaxed);
        let _ = self.event_bus.publish(RecorderEvent::EventRecorded {
            session_id: session_id.to_string(),
            kind: kind.as_str().to_string(),
        });
        Ok(event)
    }

    /// Flush buffered samples to storage immediately.
    pub async fn flush_pending(&self) -> Result<usize> {
        let buffer = match self.buffer.read().clone() {
            Some(buffer) => buffer,
            None => return Ok(0),
        };
        match buffer.flush_now().await {
            Ok(count) => Ok(count),
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Publish an adaptor status change on the subscription surface. Called
    /// by the tracking layer; adaptor status is never persisted.
    pub fn report_adaptor_status(&self, adaptor_id: &str, status: TrackingStatus) {
        let _ = self.event_bus.publish(RecorderEvent::AdaptorStatusChanged {
            adaptor_id: adaptor_id.to_string(),
            status,
        });
    }

    /// Full session reconstruction for export consumers.
    pub async fn get_session_data(
        &self,
        session_id: &str,
        trim_to_recording: bool,
    ) -> Result<Option<SessionData>> {
        self.store()?
            .get_session_data(session_id, trim_to_recording)
            .await
    }

    /// Raw chunk payload retrieval for export consumers.
    pub async fn get_video_chunk_data(&self, chunk_id: &str) -> Result<Option<Bytes>> {
        self.store()?.get_video_chunk_data(chunk_id).await
    }

    /// Remove a session and all dependent records.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.store()?.delete_session(session_id).await
    }

    /// Storage usage against the configured budget.
    pub async fn storage_quota(&self) -> Result<StorageQuota> {
        self.store()?.quota().await
    }

    /// Run the two-tier chunk cleanup policy.
    pub async fn run_cleanup(&self) -> Result<CleanupResult> {
        self.store()?.run_cleanup().await
    }

    /// Forcibly halt any in-progress capture and return to `Idle`. Buffered
    /// samples are flushed best-effort before teardown; a session left
    /// mid-recording is finalized with status `error`.
    pub async fn reset(&self) {
        if let Some(handle) = self.capture.lock().await.take() {
            handle.stop.cancel();
            let _ = handle.pump.await;
        }

        if let Some(cancel) = self.buffer_cancel.write().take() {
            cancel.cancel();
        }
        let _ = self.flush_pending().await;

        // A session that never stopped cleanly is recorded as errored, never
        // silently left in 'recording'
        let abandoned = {
            let mut inner = self.inner.write();
            let abandoned = inner.session.take().filter(|s| {
                s.status == SessionStatus::Recording
            });
            inner.status = RecorderStatus::Idle;
            inner.last_error = None;
            abandoned
        };
        if let Some(mut session) = abandoned {
            session.status = SessionStatus::Error;
            session.ended_at = Some(Utc::now());
            if let Ok(store) = self.store() {
                if let Err(e) = store.update_session(&session).await {
                    tracing::warn!("Failed to finalize abandoned session: {}", e);
                }
            }
        }

        *self.buffer.write() = None;
        *self.store.write() = None;
        self.counters.samples.store(0, Ordering::Relaxed);
        self.counters.events.store(0, Ordering::Relaxed);
        self.counters.chunks.store(0, Ordering::Relaxed);
        self.counters.captured_bytes.store(0, Ordering::Relaxed);
        self.quality.lock().reset();

        let _ = self.event_bus.publish(RecorderEvent::RecorderReset {
            timestamp: Utc::now(),
        });
        tracing::info!("Recorder reset to idle");
    }
}

/// Consume the capture stream, persisting each chunk with a contiguous index
/// starting at 0. Storage failures are surfaced as recoverable errors without
/// stopping capture.
async fn pump_chunks(
    mut stream: CaptureStream,
    store: SessionStore,
    session_id: String,
    event_bus: EventBus,
    counters: Arc<Counters>,
) {
    let mut index: u32 = 0;
    while let Some(chunk) = stream.next_chunk().await {
        let byte_size = chunk.data.len() as u64;
        let record = VideoChunkRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            index,
            timestamp: chunk.timestamp,
            duration_ms: chunk.duration_ms,
            byte_size,
        };

        match store.insert_chunk(&record, chunk.data).await {
            Ok(()) => {
                index += 1;
                counters.chunks.fetch_add(1, Ordering::Relaxed);
                counters
                    .captured_bytes
                    .fetch_add(byte_size, Ordering::Relaxed);
                let _ = event_bus.publish(RecorderEvent::ChunkStored {
                    session_id: session_id.clone(),
                    index: record.index,
                    byte_size,
                });
            }
            Err(e) => {
                tracing::error!("Failed to store chunk {}: {}", index, e);
                let _ = event_bus.publish(RecorderEvent::RecorderError {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
    tracing::debug!("Chunk pump for session {} finished", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticCapture;
    use crate::session::RecordingMode;
    use crate::transform::Point;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> GazecapConfig {
        let mut config = GazecapConfig::default();
        config.storage.path = dir
            .path()
            .join("recorder.db")
            .to_string_lossy()
            .to_string();
        config.buffer.flush_interval_ms = 50;
        config
    }

    fn recorder(dir: &TempDir) -> GazeRecorder {
        GazeRecorder::new(test_config(dir), Arc::new(SyntheticCapture::new()))
    }

    fn tab_session_config() -> SessionConfig {
        let mut config = SessionConfig::new("p1", "t1", RecordingMode::CurrentTab);
        config.chunk_duration_ms = 20;
        config.quality = "low".to_string();
        config
    }

    fn tab_surface() -> SurfaceGeometry {
        SurfaceGeometry {
            screen_x: 100.0,
            screen_y: 50.0,
            scroll_x: 0.0,
            scroll_y: 0.0,
            inner_width: 1200.0,
            inner_height: 800.0,
            outer_width: 1280.0,
            outer_height: 900.0,
        }
    }

    async fn create_tab_session(recorder: &GazeRecorder) -> String {
        recorder
            .create_session(
                tab_session_config(),
                ScreenInfo::new(1920.0, 1080.0),
                tab_surface(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_session_requires_initialized_status() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir);

        let err = recorder
            .create_session(
                tab_session_config(),
                ScreenInfo::new(1920.0, 1080.0),
                tab_surface(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_state");

        recorder.initialize().await.unwrap();
        create_tab_session(&recorder).await;

        // A second session while one is active is rejected
        let err = recorder
            .create_session(
                tab_session_config(),
                ScreenInfo::new(1920.0, 1080.0),
                tab_surface(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[tokio::test]
    async fn double_initialize_is_rejected() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir);
        recorder.initialize().await.unwrap();
        let err = recorder.initialize().await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[tokio::test]
    async fn recording_transitions_are_guarded() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir);
        recorder.initialize().await.unwrap();

        // No session yet
        let err = recorder.start_recording().await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");

        // Not recording yet
        let err = recorder.stop_recording().await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");

        create_tab_session(&recorder).await;
        recorder.start_recording().await.unwrap();
        assert_eq!(recorder.status(), RecorderStatus::Recording);

        // Already recording
        let err = recorder.start_recording().await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");

        recorder.stop_recording().await.unwrap();
        assert_eq!(recorder.status(), RecorderStatus::Stopped);

        let err = recorder.stop_recording().await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[tokio::test]
    async fn permission_denial_leaves_session_untouched() {
        let dir = TempDir::new().unwrap();
        let recorder =
            GazeRecorder::new(test_config(&dir), Arc::new(SyntheticCapture::denying()));
        recorder.initialize().await.unwrap();
        create_tab_session(&recorder).await;

        let err = recorder.start_recording().await.unwrap_err();
        assert_eq!(err.kind(), "capability");

        let session = recorder.current_session().unwrap();
        assert!(!session.is_capturing());
        assert_eq!(recorder.status(), RecorderStatus::Initialized);
    }

    #[tokio::test]
    async fn ingestion_is_allowed_before_recording_starts() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir);
        recorder.initialize().await.unwrap();
        create_tab_session(&recorder).await;

        let sample = recorder
            .add_gaze_sample(RawGazeInput::at(700.0, 450.0).with_confidence(0.9), None)
            .await
            .unwrap();
        assert_eq!(sample.content, Point::new(600.0, 400.0));
        assert_eq!(recorder.state().sample_count, 1);
    }

    #[tokio::test]
    async fn end_to_end_session_flow() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir);

        recorder.initialize().await.unwrap();
        let session_id = create_tab_session(&recorder).await;
        recorder.start_recording().await.unwrap();

        let sample = recorder
            .add_gaze_sample(RawGazeInput::at(700.0, 450.0).with_confidence(0.9), None)
            .await
            .unwrap();
        assert_eq!(sample.content, Point::new(600.0, 400.0));
        assert!(sample.within_bounds);

        // Let the synthetic device emit a few chunks
        tokio::time::sleep(Duration::from_millis(70)).await;

        recorder.stop_recording().await.unwrap();

        let data = recorder
            .get_session_data(&session_id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.session.status, SessionStatus::Completed);
        assert!(data.session.ended_at.is_some());
        assert!(data.session.duration_ms.is_some());
        assert!(data.session.captured_bytes > 0);

        assert_eq!(data.derived.sample_count, 1);
        let stored = &data.gaze_samples[0];
        assert_eq!(stored.content, Point::new(600.0, 400.0));
        assert!(stored.within_bounds);
        assert!(stored.geometry.is_some());

        // Chunks are contiguous from 0 and their payloads retrievable
        assert!(!data.video_chunks.is_empty());
        for (i, chunk) in data.video_chunks.iter().enumerate() {
            assert_eq!(chunk.index as usize, i);
        }
        let payload = recorder
            .get_video_chunk_data(&data.video_chunks[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.len() as u64, data.video_chunks[0].byte_size);

        // Lifecycle events were persisted in order
        let kinds: Vec<_> = data.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SessionEventKind::SessionStart,
                SessionEventKind::RecordingStart,
                SessionEventKind::RecordingStop,
                SessionEventKind::SessionStop,
            ]
        );
    }

    #[tokio::test]
    async fn per_eye_records_are_transformed() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir);
        recorder.initialize().await.unwrap();
        create_tab_session(&recorder).await;

        let mut raw = RawGazeInput::at(700.0, 450.0).with_confidence(0.9);
        raw.left_eye = Some(RawEyeInput {
            screen_x: 690.0,
            screen_y: 445.0,
            position_x: Some(-30.0),
            position_y: Some(5.0),
            position_z: Some(600.0),
            pupil_size: Some(3.2),
            rotation: None,
        });

        let sample = recorder.add_gaze_sample(raw, None).await.unwrap();
        let left = sample.left_eye.unwrap();
        assert_eq!(left.screen, Point::new(690.0, 445.0));
        assert_eq!(left.content, Point::new(590.0, 395.0));
        assert_eq!(left.pupil_size, Some(3.2));
    }

    #[tokio::test]
    async fn user_events_persist_with_payload() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir);
        recorder.initialize().await.unwrap();
        let session_id = create_tab_session(&recorder).await;

        recorder
            .add_event(
                SessionEventKind::UserEvent,
                Some(serde_json::json!({"action": "click", "target": "submit"})),
            )
            .await
            .unwrap();
        recorder
            .add_event(SessionEventKind::CalibrationStart, None)
            .await
            .unwrap();

        let data = recorder
            .get_session_data(&session_id, false)
            .await
            .unwrap()
            .unwrap();
        let user_event = data
            .events
            .iter()
            .find(|e| e.kind == SessionEventKind::UserEvent)
            .unwrap();
        assert_eq!(
            user_event.payload.as_ref().unwrap()["action"],
            serde_json::json!("click")
        );
        assert!(data
            .events
            .iter()
            .any(|e| e.kind == SessionEventKind::CalibrationStart));
    }

    #[tokio::test]
    async fn trimmed_export_excludes_preroll_samples() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir);
        recorder.initialize().await.unwrap();
        let session_id = create_tab_session(&recorder).await;

        // Pre-roll sample before recording starts
        recorder
            .add_gaze_sample(RawGazeInput::at(200.0, 100.0).with_confidence(0.8), None)
            .await
            .unwrap();

        recorder.start_recording().await.unwrap();
        recorder
            .add_gaze_sample(RawGazeInput::at(700.0, 450.0).with_confidence(0.9), None)
            .await
            .unwrap();
        recorder.stop_recording().await.unwrap();

        let trimmed = recorder
            .get_session_data(&session_id, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trimmed.derived.sample_count, 1);
        assert_eq!(trimmed.gaze_samples[0].content, Point::new(600.0, 400.0));

        let full = recorder
            .get_session_data(&session_id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(full.derived.sample_count, 2);
    }

    #[tokio::test]
    async fn reset_returns_to_idle_and_errors_abandoned_session() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir);
        recorder.initialize().await.unwrap();
        let session_id = create_tab_session(&recorder).await;
        recorder.start_recording().await.unwrap();

        recorder.reset().await;
        assert_eq!(recorder.status(), RecorderStatus::Idle);
        assert!(recorder.current_session().is_none());

        // Store is gone until re-initialization
        assert!(recorder.get_session_data(&session_id, false).await.is_err());

        // The abandoned session was finalized as errored, not left recording
        recorder.initialize().await.unwrap();
        let data = recorder
            .get_session_data(&session_id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.session.status, SessionStatus::Error);
        assert!(data.session.ended_at.is_some());

        // And a fresh session can be created after re-initialization
        let new_id = create_tab_session(&recorder).await;
        assert_ne!(new_id, session_id);
    }

    #[tokio::test]
    async fn subscribers_observe_lifecycle_events() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir);
        let mut events = recorder.subscribe();

        recorder.initialize().await.unwrap();
        create_tab_session(&recorder).await;
        recorder.start_recording().await.unwrap();
        recorder.stop_recording().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.event_type().to_string());
        }
        assert!(seen.contains(&"session_created".to_string()));
        assert!(seen.contains(&"recording_started".to_string()));
        assert!(seen.contains(&"recording_stopped".to_string()));
    }

    #[tokio::test]
    async fn quality_report_tracks_ingested_samples() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir);
        recorder.initialize().await.unwrap();
        create_tab_session(&recorder).await;

        for i in 0..5 {
            recorder
                .add_gaze_sample(
                    RawGazeInput::at(300.0 + i as f64, 300.0).with_confidence(0.9),
                    None,
                )
                .await
                .unwrap();
        }

        let report = recorder.quality_report();
        assert_eq!(report.observed_samples, 5);
        assert_eq!(report.histogram.high, 5);
        assert!(report.average_confidence.unwrap() > 0.8);
    }

    #[tokio::test]
    async fn full_screen_sessions_skip_geometry_snapshot() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir);
        recorder.initialize().await.unwrap();

        let mut config = SessionConfig::new("p2", "t2", RecordingMode::FullScreen);
        config.chunk_duration_ms = 20;
        recorder
            .create_session(config, ScreenInfo::new(1920.0, 1080.0), tab_surface())
            .await
            .unwrap();

        let sample = recorder
            .add_gaze_sample(RawGazeInput::at(640.0, 360.0), None)
            .await
            .unwrap();
        // Full-screen: content equals display, always in bounds, no geometry
        assert_eq!(sample.content, Point::new(640.0, 360.0));
        assert!(sample.within_bounds);
        assert!(sample.geometry.is_none());
        assert!(sample.page.is_none());
        assert_eq!(sample.confidence, 1.0);
    }
}
