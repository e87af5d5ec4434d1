use crate::transform::{Point, SurfaceGeometry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One eye's worth of raw positional input from a gaze source.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RawEyeInput {
    pub screen_x: f64,
    pub screen_y: f64,
    /// 3-D eye position in tracker space, millimetres
    pub position_x: Option<f64>,
    pub position_y: Option<f64>,
    pub position_z: Option<f64>,
    pub pupil_size: Option<f64>,
    pub rotation: Option<f64>,
}

/// A raw gaze sample as delivered by an adaptor, before coordinate
/// transformation and enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawGazeInput {
    pub screen_x: f64,
    pub screen_y: f64,
    /// Set when coordinates are pre-normalized to 0-1
    #[serde(default)]
    pub normalized: bool,
    pub confidence: Option<f64>,
    /// Timestamp assigned by the tracking device, device clock domain
    pub device_timestamp: Option<f64>,
    /// Wall-clock timestamp supplied by the source, epoch milliseconds
    pub system_timestamp: Option<f64>,
    pub left_eye: Option<RawEyeInput>,
    pub right_eye: Option<RawEyeInput>,
}

impl RawGazeInput {
    pub fn at(screen_x: f64, screen_y: f64) -> Self {
        Self {
            screen_x,
            screen_y,
            normalized: false,
            confidence: None,
            device_timestamp: None,
            system_timestamp: None,
            left_eye: None,
            right_eye: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Enriched per-eye record stored alongside a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyeSample {
    pub screen: Point,
    pub content: Point,
    pub position_x: Option<f64>,
    pub position_y: Option<f64>,
    pub position_z: Option<f64>,
    pub pupil_size: Option<f64>,
    pub rotation: Option<f64>,
}

/// One timestamped, coordinate-enriched gaze estimate. Append-only and
/// immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GazeSample {
    pub session_id: String,
    pub device_timestamp: Option<f64>,
    /// Wall-clock time of ingestion
    pub system_time: DateTime<Utc>,
    /// Monotonic capture time, milliseconds since recorder initialization
    pub monotonic_ms: f64,

    /// Raw input coordinates as delivered by the source
    pub raw_x: f64,
    pub raw_y: f64,
    pub raw_normalized: bool,

    /// Derived content-frame coordinates
    pub content: Point,
    /// Derived page-frame coordinates, current-tab sessions only
    pub page: Option<Point>,
    /// Derived normalized coordinates, clamped to [0, 1]
    pub normalized: Point,
    pub within_bounds: bool,

    pub confidence: f64,
    pub left_eye: Option<EyeSample>,
    pub right_eye: Option<EyeSample>,

    /// Surface geometry at capture time; only meaningful for non-full-screen
    /// recording modes
    pub geometry: Option<SurfaceGeometry>,
}

/// Kinds of session-scoped events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    SessionStart,
    SessionStop,
    RecordingStart,
    RecordingStop,
    UserEvent,
    CalibrationStart,
    CalibrationPoint,
    CalibrationStop,
}

impl SessionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventKind::SessionStart => "session_start",
            SessionEventKind::SessionStop => "session_stop",
            SessionEventKind::RecordingStart => "recording_start",
            SessionEventKind::RecordingStop => "recording_stop",
            SessionEventKind::UserEvent => "user_event",
            SessionEventKind::CalibrationStart => "calibration_start",
            SessionEventKind::CalibrationPoint => "calibration_point",
            SessionEventKind::CalibrationStop => "calibration_stop",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "session_start" => Some(SessionEventKind::SessionStart),
            "session_stop" => Some(SessionEventKind::SessionStop),
            "recording_start" => Some(SessionEventKind::RecordingStart),
            "recording_stop" => Some(SessionEventKind::RecordingStop),
            "user_event" => Some(SessionEventKind::UserEvent),
            "calibration_start" => Some(SessionEventKind::CalibrationStart),
            "calibration_point" => Some(SessionEventKind::CalibrationPoint),
            "calibration_stop" => Some(SessionEventKind::CalibrationStop),
            _ => None,
        }
    }
}

/// An append-only session event with optional structured payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub kind: SessionEventKind,
    pub timestamp: DateTime<Utc>,
    pub monotonic_ms: f64,
    pub payload: Option<serde_json::Value>,
}

/// Metadata for one stored video chunk. The binary payload lives in its own
/// record set; chunks concatenate in index order to reconstruct the full
/// recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoChunkRecord {
    pub id: String,
    pub session_id: String,
    pub index: u32,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub byte_size: u64,
}

/// Coarse classification of current tracking reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Excellent,
    Good,
    Poor,
    Unavailable,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Excellent => "excellent",
            QualityTier::Good => "good",
            QualityTier::Poor => "poor",
            QualityTier::Unavailable => "unavailable",
        }
    }
}

/// Ephemeral per-adaptor status, recomputed on every status-affecting event.
/// Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingStatus {
    pub connected: bool,
    pub tracking: bool,
    pub quality: QualityTier,
    pub message: Option<String>,
    /// Source-specific details (device model, firmware, feed address)
    pub metadata: Option<serde_json::Value>,
}

impl TrackingStatus {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            tracking: false,
            quality: QualityTier::Unavailable,
            message: None,
            metadata: None,
        }
    }

    pub fn connected(quality: QualityTier) -> Self {
        Self {
            connected: true,
            tracking: true,
            quality,
            message: None,
            metadata: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            connected: false,
            tracking: false,
            quality: QualityTier::Unavailable,
            message: Some(message.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_labels_round_trip() {
        let kinds = [
            SessionEventKind::SessionStart,
            SessionEventKind::SessionStop,
            SessionEventKind::RecordingStart,
            SessionEventKind::RecordingStop,
            SessionEventKind::UserEvent,
            SessionEventKind::CalibrationStart,
            SessionEventKind::CalibrationPoint,
            SessionEventKind::CalibrationStop,
        ];
        for kind in kinds {
            assert_eq!(SessionEventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SessionEventKind::parse("bogus"), None);
    }

    #[test]
    fn tracking_status_constructors_set_quality() {
        assert_eq!(
            TrackingStatus::disconnected().quality,
            QualityTier::Unavailable
        );
        let status = TrackingStatus::connected(QualityTier::Good);
        assert!(status.connected && status.tracking);
        let failed = TrackingStatus::failed("socket dropped");
        assert_eq!(failed.quality, QualityTier::Unavailable);
        assert!(failed.message.is_some());
    }
}
