use crate::gaze::{QualityTier, TrackingStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Committed state changes published to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecorderEvent {
    /// A session was created and persisted
    SessionCreated {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Screen capture began for the active session
    RecordingStarted {
        session_id: String,
        encoding: String,
        timestamp: DateTime<Utc>,
    },
    /// Screen capture stopped and the session was finalized
    RecordingStopped {
        session_id: String,
        duration_ms: u64,
        captured_bytes: u64,
        timestamp: DateTime<Utc>,
    },
    /// A gaze sample was accepted by the ingestion entry point
    SampleIngested {
        session_id: String,
        sample_count: u64,
    },
    /// A session event was persisted
    EventRecorded { session_id: String, kind: String },
    /// A video chunk was persisted
    ChunkStored {
        session_id: String,
        index: u32,
        byte_size: u64,
    },
    /// An adaptor's connection or quality state changed
    AdaptorStatusChanged {
        adaptor_id: String,
        status: TrackingStatus,
    },
    /// A recoverable error was recorded
    RecorderError { kind: String, message: String },
    /// The recorder was forcibly returned to idle
    RecorderReset { timestamp: DateTime<Utc> },
}

impl RecorderEvent {
    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            RecorderEvent::SessionCreated { .. } => "session_created",
            RecorderEvent::RecordingStarted { .. } => "recording_started",
            RecorderEvent::RecordingStopped { .. } => "recording_stopped",
            RecorderEvent::SampleIngested { .. } => "sample_ingested",
            RecorderEvent::EventRecorded { .. } => "event_recorded",
            RecorderEvent::ChunkStored { .. } => "chunk_stored",
            RecorderEvent::AdaptorStatusChanged { .. } => "adaptor_status_changed",
            RecorderEvent::RecorderError { .. } => "recorder_error",
            RecorderEvent::RecorderReset { .. } => "recorder_reset",
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            RecorderEvent::SessionCreated { session_id, .. } => {
                format!("Session created: {}", session_id)
            }
            RecorderEvent::RecordingStarted {
                session_id,
                encoding,
                ..
            } => {
                format!("Recording started for {} ({})", session_id, encoding)
            }
            RecorderEvent::RecordingStopped {
                session_id,
                duration_ms,
                captured_bytes,
                ..
            } => {
                format!(
                    "Recording stopped for {} ({} ms, {} bytes)",
                    session_id, duration_ms, captured_bytes
                )
            }
            RecorderEvent::SampleIngested { sample_count, .. } => {
                format!("Sample ingested (total: {})", sample_count)
            }
            RecorderEvent::EventRecorded { kind, .. } => {
                format!("Event recorded: {}", kind)
            }
            RecorderEvent::ChunkStored {
                index, byte_size, ..
            } => {
                format!("Chunk {} stored ({} bytes)", index, byte_size)
            }
            RecorderEvent::AdaptorStatusChanged { adaptor_id, status } => {
                format!(
                    "Adaptor {} {} (quality: {})",
                    adaptor_id,
                    if status.connected {
                        "connected"
                    } else {
                        "disconnected"
                    },
                    status.quality.as_str()
                )
            }
            RecorderEvent::RecorderError { kind, message } => {
                format!("Error ({}): {}", kind, message)
            }
            RecorderEvent::RecorderReset { .. } => "Recorder reset".to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },
}

/// Async event bus backing the subscription surface. Dropping a receiver
/// unsubscribes it.
pub struct EventBus {
    sender: broadcast::Sender<RecorderEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: RecorderEvent) -> Result<usize, EventBusError> {
        match &event {
            RecorderEvent::RecorderError { kind, message } => {
                error!("Recorder error ({}): {}", kind, message);
            }
            RecorderEvent::AdaptorStatusChanged { adaptor_id, status } => {
                if status.connected {
                    info!(
                        "Adaptor {} connected (quality: {})",
                        adaptor_id,
                        status.quality.as_str()
                    );
                } else if status.quality == QualityTier::Unavailable && status.message.is_some() {
                    warn!(
                        "Adaptor {} down: {}",
                        adaptor_id,
                        status.message.as_deref().unwrap_or("")
                    );
                } else {
                    info!("Adaptor {} disconnected", adaptor_id);
                }
            }
            RecorderEvent::SampleIngested { .. } => {
                // Per-sample events are too chatty for info level
            }
            other => {
                debug!("Event: {}", other.description());
            }
        }

        // A send error only means there are no subscribers right now; the
        // recorder publishes unconditionally
        if self.sender.receiver_count() == 0 {
            return Ok(0);
        }

        self.sender
            .send(event)
            .map_err(|e| EventBusError::PublishFailed {
                details: e.to_string(),
            })
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Accept all events
    All,
    /// Accept only specific event types
    EventTypes(Vec<&'static str>),
    /// Custom filter function
    Custom(fn(&RecorderEvent) -> bool),
}

impl EventFilter {
    /// Check if an event passes this filter
    pub fn matches(&self, event: &RecorderEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
            EventFilter::Custom(filter_fn) => filter_fn(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = EventBus::new(16);
        let mut receiver = bus.subscribe();

        bus.publish(RecorderEvent::SessionCreated {
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
        })
        .unwrap();

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "session_created");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(16);
        let delivered = bus
            .publish(RecorderEvent::RecorderReset {
                timestamp: Utc::now(),
            })
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[test]
    fn filter_matches_event_types() {
        let filter = EventFilter::EventTypes(vec!["chunk_stored"]);
        let matching = RecorderEvent::ChunkStored {
            session_id: "s1".to_string(),
            index: 0,
            byte_size: 100,
        };
        let other = RecorderEvent::SampleIngested {
            session_id: "s1".to_string(),
            sample_count: 1,
        };
        assert!(filter.matches(&matching));
        assert!(!filter.matches(&other));
    }
}
