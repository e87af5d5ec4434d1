//! Socket-fed external tracker adaptor.
//!
//! Wire protocol: newline-delimited JSON over TCP. Outbound control messages
//! are `{"type": "start_tracking"|"stop_tracking", "sessionId": …,
//! "config": …}`, re-sent on every (re)connect. Inbound lines pass through a
//! pluggable [`SampleDecoder`]; the default decoder understands
//! `screenX`/`screenY`/`confidence` with optional `normalized`,
//! `deviceTimeStamp`, and nested `leftEye`/`rightEye` objects.

use super::{AdaptorContext, AdaptorKind, TrackingAdaptor};
use crate::config::SocketConfig;
use crate::error::{GazecapError, Result};
use crate::gaze::{QualityTier, RawEyeInput, RawGazeInput, TrackingStatus};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, trace, warn};

/// Decodes one inbound wire line into a raw gaze sample. `Ok(None)` marks
/// control acknowledgements and other non-sample traffic.
pub trait SampleDecoder: Send + Sync {
    fn decode(&self, line: &str) -> Result<Option<RawGazeInput>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEye {
    screen_x: f64,
    screen_y: f64,
    position_x: Option<f64>,
    position_y: Option<f64>,
    position_z: Option<f64>,
    pupil_size: Option<f64>,
    rotation: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSample {
    screen_x: f64,
    screen_y: f64,
    confidence: Option<f64>,
    #[serde(default)]
    normalized: bool,
    device_time_stamp: Option<f64>,
    system_timestamp: Option<f64>,
    left_eye: Option<WireEye>,
    right_eye: Option<WireEye>,
}

impl From<WireEye> for RawEyeInput {
    fn from(eye: WireEye) -> Self {
        RawEyeInput {
            screen_x: eye.screen_x,
            screen_y: eye.screen_y,
            position_x: eye.position_x,
            position_y: eye.position_y,
            position_z: eye.position_z,
            pupil_size: eye.pupil_size,
            rotation: eye.rotation,
        }
    }
}

/// Default decoder for the JSON wire format.
#[derive(Debug, Default, Clone)]
pub struct JsonGazeDecoder;

impl SampleDecoder for JsonGazeDecoder {
    fn decode(&self, line: &str) -> Result<Option<RawGazeInput>> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        if value.get("screenX").is_none() {
            // Control acknowledgement or unrelated message
            return Ok(None);
        }

        let wire: WireSample = serde_json::from_value(value)?;
        Ok(Some(RawGazeInput {
            screen_x: wire.screen_x,
            screen_y: wire.screen_y,
            normalized: wire.normalized,
            confidence: wire.confidence,
            device_timestamp: wire.device_time_stamp,
            system_timestamp: wire.system_timestamp,
            left_eye: wire.left_eye.map(Into::into),
            right_eye: wire.right_eye.map(Into::into),
        }))
    }
}

struct SocketState {
    connected: AtomicBool,
    status: RwLock<TrackingStatus>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Adaptor for a live tracker feed over TCP, with optional exponential
/// reconnect backoff.
pub struct SocketTrackerAdaptor {
    id: String,
    config: SocketConfig,
    decoder: Arc<dyn SampleDecoder>,
    state: Arc<SocketState>,
}

impl SocketTrackerAdaptor {
    pub fn new(id: impl Into<String>, config: SocketConfig) -> Self {
        Self::with_decoder(id, config, Arc::new(JsonGazeDecoder))
    }

    pub fn with_decoder(
        id: impl Into<String>,
        config: SocketConfig,
        decoder: Arc<dyn SampleDecoder>,
    ) -> Self {
        Self {
            id: id.into(),
            config,
            decoder,
            state: Arc::new(SocketState {
                connected: AtomicBool::new(false),
                status: RwLock::new(TrackingStatus::disconnected()),
                task: Mutex::new(None),
            }),
        }
    }

    fn set_status(state: &SocketState, ctx: &AdaptorContext, status: TrackingStatus) {
        *state.status.write() = status.clone();
        ctx.status.report(status);
    }

    fn control_message(kind: &str, ctx: &AdaptorContext) -> String {
        let (session_id, config) = match &ctx.session {
            Some(info) => (
                serde_json::Value::String(info.session_id.clone()),
                info.config.clone(),
            ),
            None => (serde_json::Value::Null, serde_json::Value::Null),
        };
        serde_json::json!({
            "type": kind,
            "sessionId": session_id,
            "config": config,
        })
        .to_string()
    }

    async fn run(
        id: String,
        config: SocketConfig,
        decoder: Arc<dyn SampleDecoder>,
        state: Arc<SocketState>,
        ctx: AdaptorContext,
    ) {
        let addr = format!("{}:{}", config.host, config.port);
        let cancel = ctx.sink.token();
        let mut attempt: u32 = 0;

        'reconnect: loop {
            if cancel.is_cancelled() {
                break;
            }

            let stream = tokio::select! {
                _ = cancel.cancelled() => break 'reconnect,
                result = TcpStream::connect(&addr) => result,
            };

            match stream {
                Ok(stream) => {
                    attempt = 0;
                    state.connected.store(true, Ordering::SeqCst);
                    Self::set_status(
                        &state,
                        &ctx,
                        TrackingStatus::connected(QualityTier::Good)
                            .with_metadata(serde_json::json!({ "address": addr })),
                    );
                    info!("Tracker socket {} connected to {}", id, addr);

                    let mut framed = Framed::new(stream, LinesCodec::new());

                    // Announce the session before samples flow
                    let start = Self::control_message("start_tracking", &ctx);
                    if let Err(e) = framed.send(start).await {
                        warn!("Failed to send start_tracking on {}: {}", id, e);
                    }

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                // Best-effort goodbye, bounded so teardown stays prompt
                                let stop = Self::control_message("stop_tracking", &ctx);
                                let _ = tokio::time::timeout(
                                    Duration::from_millis(250),
                                    framed.send(stop),
                                )
                                .await;
                                break 'reconnect;
                            }
                            line = framed.next() => match line {
                                Some(Ok(line)) => {
                                    match decoder.decode(&line) {
                                        Ok(Some(input)) => {
                                            if !ctx.sink.submit(input) {
                                                break 'reconnect;
                                            }
                                        }
                                        Ok(None) => trace!("Control message on {}: {}", id, line),
                                        Err(e) => debug!("Undecodable line on {}: {}", id, e),
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!("Tracker socket {} read error: {}", id, e);
                                    break;
                                }
                                None => {
                                    warn!("Tracker socket {} closed by peer", id);
                                    break;
                                }
                            }
                        }
                    }

                    state.connected.store(false, Ordering::SeqCst);
                    Self::set_status(
                        &state,
                        &ctx,
                        TrackingStatus {
                            connected: false,
                            tracking: false,
                            quality: QualityTier::Poor,
                            message: Some("connection lost".to_string()),
                            metadata: None,
                        },
                    );
                }
                Err(e) => {
                    Self::set_status(&state, &ctx, TrackingStatus::failed(e.to_string()));
                }
            }

            if !config.reconnect || cancel.is_cancelled() {
                break;
            }

            // Exponential backoff, capped
            attempt = attempt.saturating_add(1);
            let exp = config
                .reconnect_base_delay_ms
                .saturating_mul(1u64 << (attempt - 1).min(16));
            let delay = Duration::from_millis(exp.min(config.reconnect_max_delay_ms));
            debug!("Tracker socket {} reconnecting in {:?}", id, delay);
            tokio::select! {
                _ = cancel.cancelled() => break 'reconnect,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        state.connected.store(false, Ordering::SeqCst);
        *state.status.write() = TrackingStatus::disconnected();
        debug!("Tracker socket {} loop finished", id);
    }
}

#[async_trait]
impl TrackingAdaptor for SocketTrackerAdaptor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AdaptorKind {
        AdaptorKind::Socket
    }

    async fn connect(&self, ctx: AdaptorContext) -> Result<()> {
        let mut task = self.state.task.lock().await;
        if task.is_some() {
            return Err(GazecapError::invalid_state(
                "connected".to_string(),
                format!("adaptor {} is already connected", self.id),
            ));
        }

        let handle = tokio::spawn(Self::run(
            self.id.clone(),
            self.config.clone(),
            Arc::clone(&self.decoder),
            Arc::clone(&self.state),
            ctx,
        ));
        *task = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // The manager cancels the sink token before calling this; the run
        // loop observes it and exits after its goodbye message
        let stalled = match self.state.task.lock().await.take() {
            Some(handle) => tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err(),
            None => false,
        };
        self.state.connected.store(false, Ordering::SeqCst);
        *self.state.status.write() = TrackingStatus::disconnected();

        if stalled {
            warn!("Tracker socket {} did not stop in time", self.id);
            return Err(GazecapError::transport(
                self.id.clone(),
                "read loop did not stop within the teardown deadline".to_string(),
            ));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn status(&self) -> TrackingStatus {
        self.state.status.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_minimal_sample() {
        let decoder = JsonGazeDecoder;
        let input = decoder
            .decode(r#"{"screenX": 700.0, "screenY": 450.0, "confidence": 0.9}"#)
            .unwrap()
            .unwrap();
        assert_eq!(input.screen_x, 700.0);
        assert_eq!(input.screen_y, 450.0);
        assert_eq!(input.confidence, Some(0.9));
        assert!(!input.normalized);
        assert!(input.left_eye.is_none());
    }

    #[test]
    fn decodes_full_tracker_sample() {
        let decoder = JsonGazeDecoder;
        let line = r#"{
            "deviceTimeStamp": 123456.0,
            "systemTimestamp": 1700000000000.0,
            "normalized": true,
            "screenX": 0.45,
            "screenY": 0.55,
            "confidence": 0.97,
            "leftEye": {
                "screenX": 0.44, "screenY": 0.54,
                "positionX": -31.2, "positionY": 4.5, "positionZ": 601.3,
                "pupilSize": 3.1
            },
            "rightEye": {
                "screenX": 0.46, "screenY": 0.56,
                "positionX": 30.8, "positionY": 4.1, "positionZ": 598.7,
                "pupilSize": 3.0
            }
        }"#;
        let input = decoder.decode(line).unwrap().unwrap();
        assert!(input.normalized);
        assert_eq!(input.device_timestamp, Some(123456.0));
        let left = input.left_eye.unwrap();
        assert_eq!(left.position_z, Some(601.3));
        assert_eq!(left.pupil_size, Some(3.1));
        let right = input.right_eye.unwrap();
        assert_eq!(right.screen_x, 0.46);
    }

    #[test]
    fn control_acks_decode_to_none() {
        let decoder = JsonGazeDecoder;
        assert!(decoder.decode(r#"{"status": "ok"}"#).unwrap().is_none());
    }

    #[test]
    fn malformed_line_is_an_error() {
        let decoder = JsonGazeDecoder;
        assert!(decoder.decode("not json").is_err());
    }

    #[test]
    fn eye_without_position_fields_still_decodes() {
        let decoder = JsonGazeDecoder;
        let line = r#"{
            "screenX": 10.0, "screenY": 20.0, "confidence": 0.5,
            "leftEye": {"screenX": 9.0, "screenY": 19.0}
        }"#;
        let input = decoder.decode(line).unwrap().unwrap();
        let left = input.left_eye.unwrap();
        assert_eq!(left.position_x, None);
        assert_eq!(left.pupil_size, None);
    }
}
