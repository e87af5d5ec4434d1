pub mod buffer;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod gaze;
pub mod recorder;
pub mod session;
pub mod storage;
pub mod tracking;
pub mod transform;

pub use buffer::{BufferStatsSnapshot, ConfidenceHistogram, QualityMonitor, QualityReport, SampleBuffer};
pub use capture::{
    encoding_priority, negotiate_encoding, CaptureChunk, CaptureDevice, CaptureRequest,
    CaptureStream, EncodingProfile, SyntheticCapture,
};
pub use config::GazecapConfig;
pub use error::{GazecapError, Result};
pub use events::{EventBus, EventFilter, RecorderEvent};
pub use filter::{GazeSmoother, IvtFilter, OneEuroFilter};
pub use gaze::{
    EyeSample, GazeSample, QualityTier, RawEyeInput, RawGazeInput, SessionEvent,
    SessionEventKind, TrackingStatus, VideoChunkRecord,
};
pub use recorder::{GazeRecorder, RecorderState, RecorderStatus};
pub use session::{RecordingMode, ScreenInfo, Session, SessionConfig, SessionStatus};
pub use storage::{CleanupResult, DerivedMetadata, SessionData, SessionStore, StorageQuota};
pub use tracking::{
    pointer_simulator, AdaptorContext, AdaptorKind, IngestedSample, JsonGazeDecoder,
    PointerSample, SampleDecoder, SampleSink, SocketTrackerAdaptor, StatusReporter,
    SyntheticAdaptor, TrackingAdaptor, TrackingManager, TrackingSessionInfo,
};
pub use transform::{Extent, Point, RawPosition, SurfaceGeometry, TransformContext, TransformedPoint};
