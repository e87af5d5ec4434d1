//! SQLite-backed session store.
//!
//! All access goes through a dedicated connection worker thread; callers hand
//! closures to [`SessionStore::execute`] and await the reply. Writes for one
//! logical operation run inside a single transaction. The schema is versioned
//! through the `user_version` pragma (see [`migrations`]).

use crate::config::StorageConfig;
use crate::error::{GazecapError, Result};
use crate::gaze::{EyeSample, GazeSample, SessionEvent, SessionEventKind, VideoChunkRecord};
use crate::session::{ScreenInfo, Session, SessionConfig, SessionStatus};
use crate::transform::{Point, SurfaceGeometry};
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

mod migrations;

pub use migrations::CURRENT_SCHEMA_VERSION;
use migrations::run_migrations;

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if self.sender.send(StoreCommand::Shutdown).is_err() {
                error!("Failed to send shutdown to store thread");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {:?}", join_err);
            }
        }
    }
}

/// Full reconstruction of one session for export consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionData {
    pub session: Session,
    pub events: Vec<SessionEvent>,
    pub gaze_samples: Vec<GazeSample>,
    pub video_chunks: Vec<VideoChunkRecord>,
    pub derived: DerivedMetadata,
}

/// Summary figures assembled alongside a session read.
#[derive(Debug, Clone, Serialize)]
pub struct DerivedMetadata {
    pub sample_count: usize,
    pub event_count: usize,
    pub chunk_count: usize,
    pub total_video_bytes: u64,
    pub recording_duration_ms: Option<f64>,
}

/// Storage usage relative to the configured budget.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StorageQuota {
    pub used_bytes: u64,
    pub budget_bytes: u64,
    pub usage_ratio: f64,
}

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupResult {
    pub chunks_pruned: usize,
    pub bytes_freed: u64,
    pub escalated: bool,
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width RFC 3339 so string comparison orders chronologically
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GazecapError::storage(format!("invalid timestamp '{}': {}", value, e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(value)?)
}

/// Handle to the session store. Cheap to clone; all clones share one
/// connection worker.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
    config: StorageConfig,
    db_path: Arc<PathBuf>,
}

impl SessionStore {
    /// Open (or create) the store at the configured path and run migrations.
    pub fn open(config: StorageConfig) -> Result<Self> {
        let db_path = PathBuf::from(&config.path);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("gazecap-store".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(GazecapError::storage(format!(
                            "failed to open database: {}",
                            err
                        ))));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    warn!("Failed to enable WAL mode: {}", err);
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    warn!("Failed to enable foreign keys: {}", err);
                }

                let init_result = run_migrations(&mut conn);
                if ready_tx.send(init_result).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(&mut conn),
                        StoreCommand::Shutdown => break,
                    }
                }

                debug!("Store thread shutting down");
            })
            .map_err(|e| GazecapError::storage(format!("failed to spawn store thread: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| GazecapError::storage("store worker exited before signaling readiness"))??;

        info!("Session store opened at {}", db_path.display());

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            config,
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        self.db_path.as_path()
    }

    /// Run a task on the store's connection worker and await its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|_| GazecapError::storage("store thread is no longer running"))?;

        reply_rx
            .await
            .map_err(|_| GazecapError::storage("store thread terminated unexpectedly"))?
    }

    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, participant_id, experiment_type, recording_mode,
                                       config, screen, surface, status, started_at, ended_at,
                                       duration_ms, recording_started_ms, recording_stopped_ms,
                                       encoding, captured_bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    record.id,
                    record.config.participant_id,
                    record.config.experiment_type,
                    record.config.recording_mode.as_str(),
                    to_json(&record.config)?,
                    to_json(&record.screen)?,
                    to_json(&record.surface)?,
                    record.status.as_str(),
                    fmt_ts(record.started_at),
                    record.ended_at.map(fmt_ts),
                    record.duration_ms.map(|ms| ms as i64),
                    record.recording_started_ms,
                    record.recording_stopped_ms,
                    record.encoding,
                    record.captured_bytes as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Persist the mutable fields of a session (status, end time, recording
    /// window, captured size, negotiated encoding).
    pub async fn update_session(&self, session: &Session) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            let updated = conn.execute(
                "UPDATE sessions
                 SET status = ?1,
                     ended_at = ?2,
                     duration_ms = ?3,
                     recording_started_ms = ?4,
                     recording_stopped_ms = ?5,
                     encoding = ?6,
                     captured_bytes = ?7
                 WHERE id = ?8",
                params![
                    record.status.as_str(),
                    record.ended_at.map(fmt_ts),
                    record.duration_ms.map(|ms| ms as i64),
                    record.recording_started_ms,
                    record.recording_stopped_ms,
                    record.encoding,
                    record.captured_bytes as i64,
                    record.id,
                ],
            )?;
            if updated == 0 {
                return Err(GazecapError::storage(format!(
                    "session {} not found for update",
                    record.id
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| read_session(conn, &session_id)).await
    }

    pub async fn insert_event(&self, event: &SessionEvent) -> Result<()> {
        let record = event.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO session_events (session_id, kind, timestamp, monotonic_ms, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.session_id,
                    record.kind.as_str(),
                    fmt_ts(record.timestamp),
                    record.monotonic_ms,
                    record.payload.as_ref().map(to_json).transpose()?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Insert a batch of gaze samples inside one transaction. This is the
    /// buffer's flush target.
    pub async fn insert_samples(&self, samples: Vec<GazeSample>) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO gaze_samples (session_id, device_timestamp, system_time,
                                               monotonic_ms, raw_x, raw_y, raw_normalized,
                                               content_x, content_y, page_x, page_y,
                                               normalized_x, normalized_y, within_bounds,
                                               confidence, left_eye, right_eye, geometry)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                )?;
                for sample in &samples {
                    stmt.execute(params![
                        sample.session_id,
                        sample.device_timestamp,
                        fmt_ts(sample.system_time),
                        sample.monotonic_ms,
                        sample.raw_x,
                        sample.raw_y,
                        sample.raw_normalized as i64,
                        sample.content.x,
                        sample.content.y,
                        sample.page.map(|p| p.x),
                        sample.page.map(|p| p.y),
                        sample.normalized.x,
                        sample.normalized.y,
                        sample.within_bounds as i64,
                        sample.confidence,
                        sample.left_eye.as_ref().map(to_json).transpose()?,
                        sample.right_eye.as_ref().map(to_json).transpose()?,
                        sample.geometry.as_ref().map(to_json).transpose()?,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Persist one video chunk: metadata row plus payload row, atomically.
    pub async fn insert_chunk(&self, record: &VideoChunkRecord, payload: Bytes) -> Result<()> {
        let record = record.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO video_chunks (id, session_id, chunk_index, timestamp, duration_ms, byte_size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.session_id,
                    record.index as i64,
                    fmt_ts(record.timestamp),
                    record.duration_ms as i64,
                    record.byte_size as i64,
                ],
            )?;
            tx.execute(
                "INSERT INTO chunk_payloads (chunk_id, data) VALUES (?1, ?2)",
                params![record.id, payload.as_ref()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Retrieve one chunk's binary payload. Returns `None` for unknown or
    /// pruned chunks.
    pub async fn get_video_chunk_data(&self, chunk_id: &str) -> Result<Option<Bytes>> {
        let chunk_id = chunk_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare("SELECT data FROM chunk_payloads WHERE chunk_id = ?1")?;
            let mut rows = stmt.query(params![chunk_id])?;
            if let Some(row) = rows.next()? {
                let data: Vec<u8> = row.get(0)?;
                Ok(Some(Bytes::from(data)))
            } else {
                Ok(None)
            }
        })
        .await
    }

    /// Assemble a full session: session row plus indexed events, samples, and
    /// chunk metadata. With `trim_to_recording`, gaze samples are filtered to
    /// the monotonic window bounded by the `recording_start` and
    /// `recording_stop` events, excluding pre-roll/post-roll noise.
    pub async fn get_session_data(
        &self,
        session_id: &str,
        trim_to_recording: bool,
    ) -> Result<Option<SessionData>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let session = match read_session(conn, &session_id)? {
                Some(session) => session,
                None => return Ok(None),
            };

            let window = if trim_to_recording {
                read_recording_window(conn, &session_id)?
            } else {
                None
            };

            let events = read_events(conn, &session_id)?;
            let gaze_samples = read_samples(conn, &session_id, window)?;
            let video_chunks = read_chunks(conn, &session_id)?;

            let total_video_bytes = video_chunks.iter().map(|c| c.byte_size).sum();
            let recording_duration_ms = match window
                .or_else(|| session.recording_started_ms.map(|s| (s, session.recording_stopped_ms)))
            {
                Some((start, Some(stop))) => Some(stop - start),
                _ => None,
            };

            let derived = DerivedMetadata {
                sample_count: gaze_samples.len(),
                event_count: events.len(),
                chunk_count: video_chunks.len(),
                total_video_bytes,
                recording_duration_ms,
            };

            Ok(Some(SessionData {
                session,
                events,
                gaze_samples,
                video_chunks,
                derived,
            }))
        })
        .await
    }

    /// Delete a session and everything referencing it. Returns whether the
    /// session existed.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
            Ok(deleted > 0)
        })
        .await
    }

    /// Current storage usage against the configured budget. Usage counts live
    /// pages only, so freed-but-unreclaimed space is not charged.
    pub async fn quota(&self) -> Result<StorageQuota> {
        let budget = self.config.quota_budget_bytes;
        self.execute(move |conn| {
            let page_count: i64 = conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
            let freelist: i64 = conn.pragma_query_value(None, "freelist_count", |row| row.get(0))?;
            let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
            let used_bytes = ((page_count - freelist).max(0) * page_size) as u64;
            Ok(StorageQuota {
                used_bytes,
                budget_bytes: budget,
                usage_ratio: if budget == 0 {
                    0.0
                } else {
                    used_bytes as f64 / budget as f64
                },
            })
        })
        .await
    }

    /// Two-tier chunk cleanup. First pass prunes chunk payloads older than
    /// the configured age for non-recording sessions; if quota usage remains
    /// at or above the trigger threshold, a second pass runs with the
    /// aggressive cutoff and compacts the file. Chunk metadata rows survive
    /// pruning, so chunk indices stay contiguous.
    pub async fn run_cleanup(&self) -> Result<CleanupResult> {
        let cleanup = self.config.cleanup.clone();
        if !cleanup.enabled {
            return Ok(CleanupResult {
                chunks_pruned: 0,
                bytes_freed: 0,
                escalated: false,
            });
        }

        let first_cutoff = Utc::now() - ChronoDuration::hours(cleanup.max_chunk_age_hours as i64);
        let (pruned, freed) = self.prune_payloads_before(first_cutoff).await?;

        let quota = self.quota().await?;
        if quota.usage_ratio < cleanup.usage_trigger {
            if pruned > 0 {
                info!("Cleanup pruned {} chunk payloads ({} bytes)", pruned, freed);
            }
            return Ok(CleanupResult {
                chunks_pruned: pruned,
                bytes_freed: freed,
                escalated: false,
            });
        }

        warn!(
            "Storage usage {:.0}% still above trigger after cleanup; escalating",
            quota.usage_ratio * 100.0
        );
        let aggressive_cutoff =
            Utc::now() - ChronoDuration::hours(cleanup.aggressive_age_hours as i64);
        let (pruned_2, freed_2) = self.prune_payloads_before(aggressive_cutoff).await?;
        self.execute(|conn| {
            conn.execute_batch("VACUUM")?;
            Ok(())
        })
        .await?;

        info!(
            "Escalated cleanup pruned {} chunk payloads ({} bytes)",
            pruned + pruned_2,
            freed + freed_2
        );
        Ok(CleanupResult {
            chunks_pruned: pruned + pruned_2,
            bytes_freed: freed + freed_2,
            escalated: true,
        })
    }

    async fn prune_payloads_before(&self, cutoff: DateTime<Utc>) -> Result<(usize, u64)> {
        self.execute(move |conn| {
            let cutoff = fmt_ts(cutoff);
            let freed: Option<i64> = conn.query_row(
                "SELECT SUM(c.byte_size)
                 FROM video_chunks c
                 JOIN sessions s ON s.id = c.session_id
                 JOIN chunk_payloads p ON p.chunk_id = c.id
                 WHERE s.status != 'recording' AND c.timestamp < ?1",
                params![cutoff],
                |row| row.get(0),
            )?;
            let pruned = conn.execute(
                "DELETE FROM chunk_payloads WHERE chunk_id IN (
                     SELECT c.id
                     FROM video_chunks c
                     JOIN sessions s ON s.id = c.session_id
                     WHERE s.status != 'recording' AND c.timestamp < ?1
                 )",
                params![cutoff],
            )?;
            Ok((pruned, freed.unwrap_or(0).max(0) as u64))
        })
        .await
    }
}

fn read_session(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
    let mut stmt = conn.prepare(
        "SELECT id, config, screen, surface, status, started_at, ended_at, duration_ms,
                recording_started_ms, recording_stopped_ms, encoding, captured_bytes
         FROM sessions WHERE id = ?1",
    )?;
    let mut rows = stmt.query(params![session_id])?;
    let row = match rows.next()? {
        Some(row) => row,
        None => return Ok(None),
    };

    let config: SessionConfig = from_json(&row.get::<_, String>(1)?)?;
    let screen: ScreenInfo = from_json(&row.get::<_, String>(2)?)?;
    let surface: SurfaceGeometry = from_json(&row.get::<_, String>(3)?)?;
    let status_raw: String = row.get(4)?;
    let status = SessionStatus::parse(&status_raw)
        .ok_or_else(|| GazecapError::storage(format!("unknown session status '{}'", status_raw)))?;

    Ok(Some(Session {
        id: row.get(0)?,
        config,
        screen,
        surface,
        status,
        started_at: parse_ts(&row.get::<_, String>(5)?)?,
        ended_at: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_ts(&s))
            .transpose()?,
        duration_ms: row.get::<_, Option<i64>>(7)?.map(|ms| ms as u64),
        recording_started_ms: row.get(8)?,
        recording_stopped_ms: row.get(9)?,
        encoding: row.get(10)?,
        captured_bytes: row.get::<_, i64>(11)? as u64,
    }))
}

/// Monotonic window bounded by the recording start/stop events. The stop
/// bound is open when recording never stopped cleanly.
fn read_recording_window(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<(f64, Option<f64>)>> {
    let start: Option<f64> = conn.query_row(
        "SELECT MIN(monotonic_ms) FROM session_events
         WHERE session_id = ?1 AND kind = 'recording_start'",
        params![session_id],
        |row| row.get(0),
    )?;
    let stop: Option<f64> = conn.query_row(
        "SELECT MAX(monotonic_ms) FROM session_events
         WHERE session_id = ?1 AND kind = 'recording_stop'",
        params![session_id],
        |row| row.get(0),
    )?;
    Ok(start.map(|s| (s, stop)))
}

fn read_events(conn: &Connection, session_id: &str) -> Result<Vec<SessionEvent>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, kind, timestamp, monotonic_ms, payload
         FROM session_events WHERE session_id = ?1 ORDER BY id",
    )?;
    let mut rows = stmt.query(params![session_id])?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        let kind_raw: String = row.get(1)?;
        let kind = SessionEventKind::parse(&kind_raw)
            .ok_or_else(|| GazecapError::storage(format!("unknown event kind '{}'", kind_raw)))?;
        events.push(SessionEvent {
            session_id: row.get(0)?,
            kind,
            timestamp: parse_ts(&row.get::<_, String>(2)?)?,
            monotonic_ms: row.get(3)?,
            payload: row
                .get::<_, Option<String>>(4)?
                .map(|s| from_json(&s))
                .transpose()?,
        });
    }
    Ok(events)
}

fn read_samples(
    conn: &Connection,
    session_id: &str,
    window: Option<(f64, Option<f64>)>,
) -> Result<Vec<GazeSample>> {
    let (lower, upper) = match window {
        Some((start, stop)) => (start, stop.unwrap_or(f64::MAX)),
        None => (f64::MIN, f64::MAX),
    };
    let mut stmt = conn.prepare(
        "SELECT session_id, device_timestamp, system_time, monotonic_ms, raw_x, raw_y,
                raw_normalized, content_x, content_y, page_x, page_y, normalized_x,
                normalized_y, within_bounds, confidence, left_eye, right_eye, geometry
         FROM gaze_samples
         WHERE session_id = ?1 AND monotonic_ms >= ?2 AND monotonic_ms <= ?3
         ORDER BY id",
    )?;
    let mut rows = stmt.query(params![session_id, lower, upper])?;
    let mut samples = Vec::new();
    while let Some(row) = rows.next()? {
        let page = match (
            row.get::<_, Option<f64>>(9)?,
            row.get::<_, Option<f64>>(10)?,
        ) {
            (Some(x), Some(y)) => Some(Point::new(x, y)),
            _ => None,
        };
        samples.push(GazeSample {
            session_id: row.get(0)?,
            device_timestamp: row.get(1)?,
            system_time: parse_ts(&row.get::<_, String>(2)?)?,
            monotonic_ms: row.get(3)?,
            raw_x: row.get(4)?,
            raw_y: row.get(5)?,
            raw_normalized: row.get::<_, i64>(6)? != 0,
            content: Point::new(row.get(7)?, row.get(8)?),
            page,
            normalized: Point::new(row.get(11)?, row.get(12)?),
            within_bounds: row.get::<_, i64>(13)? != 0,
            confidence: row.get(14)?,
            left_eye: row
                .get::<_, Option<String>>(15)?
                .map(|s| from_json::<EyeSample>(&s))
                .transpose()?,
            right_eye: row
                .get::<_, Option<String>>(16)?
                .map(|s| from_json::<EyeSample>(&s))
                .transpose()?,
            geometry: row
                .get::<_, Option<String>>(17)?
                .map(|s| from_json::<SurfaceGeometry>(&s))
                .transpose()?,
        });
    }
    Ok(samples)
}

fn read_chunks(conn: &Connection, session_id: &str) -> Result<Vec<VideoChunkRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, chunk_index, timestamp, duration_ms, byte_size
         FROM video_chunks WHERE session_id = ?1 ORDER BY chunk_index",
    )?;
    let mut rows = stmt.query(params![session_id])?;
    let mut chunks = Vec::new();
    while let Some(row) = rows.next()? {
        chunks.push(VideoChunkRecord {
            id: row.get(0)?,
            session_id: row.get(1)?,
            index: row.get::<_, i64>(2)? as u32,
            timestamp: parse_ts(&row.get::<_, String>(3)?)?,
            duration_ms: row.get::<_, i64>(4)? as u64,
            byte_size: row.get::<_, i64>(5)? as u64,
        });
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CleanupConfig;
    use crate::gaze::RawGazeInput;
    use crate::session::RecordingMode;
    use crate::transform::{self, RawPosition, TransformContext};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn test_config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            path: dir
                .path()
                .join("gazecap.db")
                .to_string_lossy()
                .to_string(),
            quota_budget_bytes: 64 * 1024 * 1024,
            cleanup: CleanupConfig {
                enabled: true,
                max_chunk_age_hours: 24,
                aggressive_age_hours: 6,
                usage_trigger: 0.8,
            },
        }
    }

    fn test_session() -> Session {
        Session::new(
            SessionConfig::new("p1", "t1", RecordingMode::CurrentTab),
            ScreenInfo::new(1920.0, 1080.0),
            SurfaceGeometry {
                screen_x: 100.0,
                screen_y: 50.0,
                scroll_x: 0.0,
                scroll_y: 0.0,
                inner_width: 1200.0,
                inner_height: 800.0,
                outer_width: 1280.0,
                outer_height: 900.0,
            },
        )
    }

    fn test_sample(session: &Session, monotonic_ms: f64) -> GazeSample {
        let geometry = session.surface;
        let ctx = TransformContext::new(
            session.recording_mode(),
            Some(session.screen.extent()),
            Some(&geometry),
        );
        let raw = RawGazeInput::at(700.0, 450.0).with_confidence(0.9);
        let result =
            transform::transform_all(RawPosition::pixels(raw.screen_x, raw.screen_y), &ctx)
                .unwrap();
        GazeSample {
            session_id: session.id.clone(),
            device_timestamp: None,
            system_time: Utc::now(),
            monotonic_ms,
            raw_x: raw.screen_x,
            raw_y: raw.screen_y,
            raw_normalized: false,
            content: result.content,
            page: result.page,
            normalized: result.normalized,
            within_bounds: result.within_bounds,
            confidence: 0.9,
            left_eye: None,
            right_eye: None,
            geometry: Some(geometry),
        }
    }

    fn test_event(session: &Session, kind: SessionEventKind, monotonic_ms: f64) -> SessionEvent {
        SessionEvent {
            session_id: session.id.clone(),
            kind,
            timestamp: Utc::now(),
            monotonic_ms,
            payload: None,
        }
    }

    fn test_chunk(session: &Session, index: u32) -> (VideoChunkRecord, Bytes) {
        let payload = Bytes::from(vec![index as u8; 256]);
        (
            VideoChunkRecord {
                id: Uuid::new_v4().to_string(),
                session_id: session.id.clone(),
                index,
                timestamp: Utc::now(),
                duration_ms: 1000,
                byte_size: payload.len() as u64,
            },
            payload,
        )
    }

    async fn table_count(store: &SessionStore, table: &str) -> i64 {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        store
            .execute(move |conn| Ok(conn.query_row(&sql, [], |row| row.get(0))?))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn session_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(test_config(&dir)).unwrap();

        let mut session = test_session();
        store.insert_session(&session).await.unwrap();

        session.status = SessionStatus::Completed;
        session.ended_at = Some(Utc::now());
        session.duration_ms = Some(1234);
        session.captured_bytes = 4096;
        session.encoding = Some("video/webm;codecs=vp9".to_string());
        store.update_session(&session).await.unwrap();

        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(loaded.duration_ms, Some(1234));
        assert_eq!(loaded.captured_bytes, 4096);
        assert_eq!(loaded.config.participant_id, "p1");
        assert_eq!(loaded.surface.inner_width, 1200.0);
    }

    #[tokio::test]
    async fn update_missing_session_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(test_config(&dir)).unwrap();
        let session = test_session();
        let err = store.update_session(&session).await.unwrap_err();
        assert_eq!(err.kind(), "storage");
    }

    #[tokio::test]
    async fn session_data_assembles_all_record_sets() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(test_config(&dir)).unwrap();

        let session = test_session();
        store.insert_session(&session).await.unwrap();
        store
            .insert_event(&test_event(&session, SessionEventKind::SessionStart, 0.0))
            .await
            .unwrap();
        store
            .insert_samples(vec![test_sample(&session, 100.0), test_sample(&session, 120.0)])
            .await
            .unwrap();
        let (record, payload) = test_chunk(&session, 0);
        store.insert_chunk(&record, payload.clone()).await.unwrap();

        let data = store
            .get_session_data(&session.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.derived.sample_count, 2);
        assert_eq!(data.derived.event_count, 1);
        assert_eq!(data.derived.chunk_count, 1);
        assert_eq!(data.derived.total_video_bytes, 256);
        assert_eq!(data.gaze_samples[0].content, Point::new(600.0, 400.0));
        assert!(data.gaze_samples[0].within_bounds);

        let loaded_payload = store
            .get_video_chunk_data(&record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded_payload, payload);
    }

    #[tokio::test]
    async fn trimmed_read_excludes_preroll_and_postroll() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(test_config(&dir)).unwrap();

        let session = test_session();
        store.insert_session(&session).await.unwrap();
        store
            .insert_event(&test_event(&session, SessionEventKind::RecordingStart, 1000.0))
            .await
            .unwrap();
        store
            .insert_event(&test_event(&session, SessionEventKind::RecordingStop, 2000.0))
            .await
            .unwrap();
        store
            .insert_samples(vec![
                test_sample(&session, 500.0),
                test_sample(&session, 1500.0),
                test_sample(&session, 2500.0),
            ])
            .await
            .unwrap();

        let trimmed = store
            .get_session_data(&session.id, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trimmed.derived.sample_count, 1);
        assert_eq!(trimmed.gaze_samples[0].monotonic_ms, 1500.0);
        assert_eq!(trimmed.derived.recording_duration_ms, Some(1000.0));

        let full = store
            .get_session_data(&session.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(full.derived.sample_count, 3);
    }

    #[tokio::test]
    async fn delete_session_leaves_no_orphans() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(test_config(&dir)).unwrap();

        let session = test_session();
        store.insert_session(&session).await.unwrap();
        store
            .insert_event(&test_event(&session, SessionEventKind::SessionStart, 0.0))
            .await
            .unwrap();
        store
            .insert_samples(vec![test_sample(&session, 10.0)])
            .await
            .unwrap();
        let (record, payload) = test_chunk(&session, 0);
        store.insert_chunk(&record, payload).await.unwrap();

        assert!(store.delete_session(&session.id).await.unwrap());

        assert_eq!(table_count(&store, "sessions").await, 0);
        assert_eq!(table_count(&store, "session_events").await, 0);
        assert_eq!(table_count(&store, "gaze_samples").await, 0);
        assert_eq!(table_count(&store, "video_chunks").await, 0);
        assert_eq!(table_count(&store, "chunk_payloads").await, 0);

        assert!(!store.delete_session(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn reopen_after_newer_version_stamp_recreates_store() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let store = SessionStore::open(config.clone()).unwrap();
            let session = test_session();
            store.insert_session(&session).await.unwrap();
            // Pretend a future build bumped the schema past this one
            store
                .execute(|conn| {
                    conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION + 5)?;
                    Ok(())
                })
                .await
                .unwrap();
        }

        let store = SessionStore::open(config).unwrap();
        assert_eq!(table_count(&store, "sessions").await, 0);

        // And the recreated store is fully usable
        let session = test_session();
        store.insert_session(&session).await.unwrap();
        assert!(store.get_session(&session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn quota_reports_nonzero_usage() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(test_config(&dir)).unwrap();
        let quota = store.quota().await.unwrap();
        assert!(quota.used_bytes > 0);
        assert!(quota.usage_ratio > 0.0);
        assert_eq!(quota.budget_bytes, 64 * 1024 * 1024);
    }

    #[tokio::test]
    async fn cleanup_prunes_old_payloads_but_keeps_metadata() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(test_config(&dir)).unwrap();

        let mut session = test_session();
        store.insert_session(&session).await.unwrap();
        session.status = SessionStatus::Completed;
        session.ended_at = Some(Utc::now());
        store.update_session(&session).await.unwrap();

        let (mut record, payload) = test_chunk(&session, 0);
        // Age the chunk well past the first-pass cutoff
        record.timestamp = Utc::now() - ChronoDuration::hours(48);
        store.insert_chunk(&record, payload).await.unwrap();

        let result = store.run_cleanup().await.unwrap();
        assert_eq!(result.chunks_pruned, 1);
        assert_eq!(result.bytes_freed, 256);
        assert!(!result.escalated);

        // Metadata survives so indices stay contiguous; the payload is gone
        assert_eq!(table_count(&store, "video_chunks").await, 1);
        assert!(store
            .get_video_chunk_data(&record.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cleanup_skips_recording_sessions() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(test_config(&dir)).unwrap();

        let session = test_session();
        store.insert_session(&session).await.unwrap();

        let (mut record, payload) = test_chunk(&session, 0);
        record.timestamp = Utc::now() - ChronoDuration::hours(48);
        store.insert_chunk(&record, payload).await.unwrap();

        let result = store.run_cleanup().await.unwrap();
        assert_eq!(result.chunks_pruned, 0);
        assert!(store
            .get_video_chunk_data(&record.id)
            .await
            .unwrap()
            .is_some());
    }
}
