use crate::transform::{Extent, SurfaceGeometry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which spatial region is being captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingMode {
    #[serde(rename = "full-screen")]
    FullScreen,
    #[serde(rename = "current-tab")]
    CurrentTab,
}

impl RecordingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingMode::FullScreen => "full-screen",
            RecordingMode::CurrentTab => "current-tab",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full-screen" => Some(RecordingMode::FullScreen),
            "current-tab" => Some(RecordingMode::CurrentTab),
            _ => None,
        }
    }
}

/// Lifecycle status of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Recording,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Recording => "recording",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "recording" => Some(SessionStatus::Recording),
            "completed" => Some(SessionStatus::Completed),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

/// Display geometry snapshot taken when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenInfo {
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub avail_width: f64,
    #[serde(default)]
    pub avail_height: f64,
    #[serde(default = "default_pixel_ratio")]
    pub device_pixel_ratio: f64,
}

fn default_pixel_ratio() -> f64 {
    1.0
}

impl ScreenInfo {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            avail_width: width,
            avail_height: height,
            device_pixel_ratio: 1.0,
        }
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }
}

/// Per-session capture configuration supplied at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub participant_id: String,
    pub experiment_type: String,
    pub recording_mode: RecordingMode,

    #[serde(default = "default_session_frame_rate")]
    pub frame_rate: u32,

    /// Capture quality tier (low, balanced, high)
    #[serde(default = "default_session_quality")]
    pub quality: String,

    #[serde(default = "default_session_chunk_duration_ms")]
    pub chunk_duration_ms: u64,

    /// Preferred codec; falls back through the negotiation priority list
    pub preferred_codec: Option<String>,
}

fn default_session_frame_rate() -> u32 {
    30
}

fn default_session_quality() -> String {
    "balanced".to_string()
}

fn default_session_chunk_duration_ms() -> u64 {
    1000
}

impl SessionConfig {
    pub fn new(
        participant_id: impl Into<String>,
        experiment_type: impl Into<String>,
        recording_mode: RecordingMode,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            experiment_type: experiment_type.into(),
            recording_mode,
            frame_rate: default_session_frame_rate(),
            quality: default_session_quality(),
            chunk_duration_ms: default_session_chunk_duration_ms(),
            preferred_codec: None,
        }
    }
}

/// One bounded recording/experiment run with a single participant.
///
/// Created on session-create, mutated on recording start/stop, immutable once
/// `completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub config: SessionConfig,

    /// Display geometry at session creation
    pub screen: ScreenInfo,
    /// Browsing-surface geometry at session creation
    pub surface: SurfaceGeometry,

    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,

    /// Monotonic timestamp at which recording began; samples inside the
    /// recording window have a capture timestamp at or after this value
    pub recording_started_ms: Option<f64>,
    pub recording_stopped_ms: Option<f64>,

    /// Total bytes of captured video content
    pub captured_bytes: u64,

    /// Negotiated encoding, set when recording starts
    pub encoding: Option<String>,
}

impl Session {
    pub fn new(config: SessionConfig, screen: ScreenInfo, surface: SurfaceGeometry) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            screen,
            surface,
            status: SessionStatus::Recording,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            recording_started_ms: None,
            recording_stopped_ms: None,
            captured_bytes: 0,
            encoding: None,
        }
    }

    pub fn recording_mode(&self) -> RecordingMode {
        self.config.recording_mode
    }

    pub fn is_capturing(&self) -> bool {
        self.recording_started_ms.is_some() && self.recording_stopped_ms.is_none()
    }
}
