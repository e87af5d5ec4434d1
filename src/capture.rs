//! Display-capture boundary: encoding negotiation against a device's
//! capability set, and the chunked capture stream the recorder consumes.
//!
//! The crate does not encode video itself; a [`CaptureDevice`] represents the
//! host's capture facility. [`SyntheticCapture`] backs tests and offline runs.

use crate::error::{GazecapError, Result};
use crate::session::RecordingMode;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A container/codec pair a capture device may support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingProfile {
    pub container: String,
    /// Empty codec means "container default" and is the known-safe fallback
    pub codec: String,
}

impl EncodingProfile {
    pub fn new(container: impl Into<String>, codec: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            codec: codec.into(),
        }
    }

    /// MIME-style label, e.g. `video/webm;codecs=vp9`.
    pub fn mime(&self) -> String {
        if self.codec.is_empty() {
            format!("video/{}", self.container)
        } else {
            format!("video/{};codecs={}", self.container, self.codec)
        }
    }
}

/// Build the negotiation priority list. A preferred codec, when given, is
/// tried first; the list always ends with the bare-container fallback.
pub fn encoding_priority(preferred_codec: Option<&str>) -> Vec<EncodingProfile> {
    let mut priority = vec![
        EncodingProfile::new("webm", "vp9"),
        EncodingProfile::new("webm", "vp8"),
        EncodingProfile::new("mp4", "h264"),
        EncodingProfile::new("webm", ""),
    ];

    if let Some(codec) = preferred_codec {
        let container = if codec == "h264" { "mp4" } else { "webm" };
        let preferred = EncodingProfile::new(container, codec);
        priority.retain(|p| *p != preferred);
        priority.insert(0, preferred);
    }

    priority
}

/// Walk the priority list against the device's capability set. Fails with a
/// capability error when nothing is supported.
pub fn negotiate_encoding(
    device: &dyn CaptureDevice,
    preferred_codec: Option<&str>,
) -> Result<EncodingProfile> {
    let priority = encoding_priority(preferred_codec);
    for profile in &priority {
        if device.supports(profile) {
            if preferred_codec.is_some() && profile != &priority[0] {
                warn!(
                    "Preferred encoding unsupported, falling back to {}",
                    profile.mime()
                );
            }
            debug!("Negotiated encoding: {}", profile.mime());
            return Ok(profile.clone());
        }
    }

    let tried: Vec<String> = priority.iter().map(|p| p.mime()).collect();
    Err(GazecapError::capability(format!(
        "no supported encoding among [{}]",
        tried.join(", ")
    )))
}

/// Parameters for opening a capture stream.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub mode: RecordingMode,
    pub frame_rate: u32,
    /// Quality tier label (low, balanced, high)
    pub quality: String,
    pub encoding: EncodingProfile,
    pub chunk_duration: Duration,
}

/// One chunk of encoded video as delivered by the device.
#[derive(Debug, Clone)]
pub struct CaptureChunk {
    pub data: Bytes,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// A live capture stream: a chunk channel plus the token that stops the
/// producer. Cancelling the token releases the underlying capture resources.
#[derive(Debug)]
pub struct CaptureStream {
    chunks: mpsc::Receiver<CaptureChunk>,
    stop: CancellationToken,
}

impl CaptureStream {
    pub fn new(chunks: mpsc::Receiver<CaptureChunk>, stop: CancellationToken) -> Self {
        Self { chunks, stop }
    }

    /// Receive the next chunk; `None` once the producer has stopped and the
    /// channel drained.
    pub async fn next_chunk(&mut self) -> Option<CaptureChunk> {
        self.chunks.recv().await
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// Host display-capture facility.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Whether the device can encode with the given profile
    fn supports(&self, profile: &EncodingProfile) -> bool;

    /// Request the capture stream. Permission denial and constraint failures
    /// surface as capability errors; no stream resources are held on failure.
    async fn open(&self, request: CaptureRequest) -> Result<CaptureStream>;
}

/// Nominal encoded bitrate for a quality tier, bits per second.
pub fn bitrate_for_quality(quality: &str) -> u64 {
    match quality {
        "low" => 1_000_000,
        "high" => 6_000_000,
        _ => 2_500_000,
    }
}

/// Capture device that synthesizes chunk payloads at the configured cadence.
/// Used by tests and offline/demo runs; also models permission denial.
pub struct SyntheticCapture {
    supported: Vec<EncodingProfile>,
    permission_granted: bool,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self {
            supported: encoding_priority(None),
            permission_granted: true,
        }
    }

    /// Restrict the capability set, e.g. to exercise negotiation fallback.
    pub fn with_supported(supported: Vec<EncodingProfile>) -> Self {
        Self {
            supported,
            permission_granted: true,
        }
    }

    /// A device whose permission prompt is always denied.
    pub fn denying() -> Self {
        Self {
            supported: encoding_priority(None),
            permission_granted: false,
        }
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureDevice for SyntheticCapture {
    fn supports(&self, profile: &EncodingProfile) -> bool {
        self.supported.contains(profile)
    }

    async fn open(&self, request: CaptureRequest) -> Result<CaptureStream> {
        if !self.permission_granted {
            return Err(GazecapError::capability(
                "display capture permission denied",
            ));
        }
        if !self.supports(&request.encoding) {
            return Err(GazecapError::capability(format!(
                "encoding {} not supported by capture device",
                request.encoding.mime()
            )));
        }

        info!(
            "Synthetic capture opened: {} mode, {} fps, {} chunks every {:?}",
            request.mode.as_str(),
            request.frame_rate,
            request.encoding.mime(),
            request.chunk_duration
        );

        let (tx, rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        let token = stop.clone();
        let chunk_ms = request.chunk_duration.as_millis() as u64;
        let chunk_bytes = (bitrate_for_quality(&request.quality) / 8 * chunk_ms.max(1) / 1000)
            .max(64) as usize;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(request.chunk_duration);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // Align to the first interval boundary
            let mut index: u8 = 0;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Synthetic capture stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let chunk = CaptureChunk {
                            data: Bytes::from(vec![index; chunk_bytes]),
                            timestamp: Utc::now(),
                            duration_ms: chunk_ms,
                        };
                        index = index.wrapping_add(1);
                        if tx.send(chunk).await.is_err() {
                            // Consumer dropped the stream
                            break;
                        }
                    }
                }
            }
        });

        Ok(CaptureStream::new(rx, stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(encoding: EncodingProfile, chunk_ms: u64) -> CaptureRequest {
        CaptureRequest {
            mode: RecordingMode::FullScreen,
            frame_rate: 30,
            quality: "low".to_string(),
            encoding,
            chunk_duration: Duration::from_millis(chunk_ms),
        }
    }

    #[test]
    fn priority_list_ends_with_safe_fallback() {
        let priority = encoding_priority(None);
        let last = priority.last().unwrap();
        assert!(last.codec.is_empty());
        assert_eq!(last.mime(), "video/webm");
    }

    #[test]
    fn preferred_codec_moves_to_front() {
        let priority = encoding_priority(Some("h264"));
        assert_eq!(priority[0], EncodingProfile::new("mp4", "h264"));
        // No duplicate left in the tail
        assert_eq!(
            priority.iter().filter(|p| p.codec == "h264").count(),
            1
        );
    }

    #[test]
    fn negotiation_falls_back_when_preferred_unsupported() {
        let device =
            SyntheticCapture::with_supported(vec![EncodingProfile::new("webm", "vp8")]);
        let profile = negotiate_encoding(&device, Some("vp9")).unwrap();
        assert_eq!(profile, EncodingProfile::new("webm", "vp8"));
    }

    #[test]
    fn negotiation_fails_when_nothing_supported() {
        let device = SyntheticCapture::with_supported(vec![]);
        let err = negotiate_encoding(&device, None).unwrap_err();
        assert_eq!(err.kind(), "capability");
    }

    #[tokio::test]
    async fn denied_permission_is_a_capability_error() {
        let device = SyntheticCapture::denying();
        let err = device
            .open(request(EncodingProfile::new("webm", "vp9"), 20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "capability");
    }

    #[tokio::test]
    async fn synthetic_stream_emits_chunks_until_stopped() {
        let device = SyntheticCapture::new();
        let mut stream = device
            .open(request(EncodingProfile::new("webm", "vp9"), 10))
            .await
            .unwrap();

        let first = stream.next_chunk().await.unwrap();
        let second = stream.next_chunk().await.unwrap();
        assert_eq!(first.duration_ms, 10);
        assert!(!first.data.is_empty());
        assert_ne!(first.data[0], second.data[0]);

        stream.stop();
        // Channel drains then closes
        while stream.next_chunk().await.is_some() {}
    }
}
