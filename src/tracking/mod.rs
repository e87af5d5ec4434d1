//! Pluggable live gaze sources and the manager that multiplexes them onto
//! the recorder's single ingestion entry point.

use crate::error::Result;
use crate::gaze::{RawGazeInput, TrackingStatus};
use crate::recorder::GazeRecorder;
use crate::transform::SurfaceGeometry;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod pointer;
mod socket;

pub use pointer::{pointer_simulator, PointerSample, SetupFn, SyntheticAdaptor, TeardownFn};
pub use socket::{JsonGazeDecoder, SampleDecoder, SocketTrackerAdaptor};

/// Capability class of an adaptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptorKind {
    /// Socket-fed external tracker with a wire decoder
    Socket,
    /// Synthetic source driven by a setup/teardown pair
    Simulated,
    /// Caller-supplied generator
    Custom,
}

/// A raw sample tagged with its source adaptor.
#[derive(Debug, Clone)]
pub struct IngestedSample {
    pub adaptor_id: String,
    pub input: RawGazeInput,
}

pub type SampleObserver = Arc<dyn Fn(&IngestedSample) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(&str, TrackingStatus) + Send + Sync>;
pub type GeometryProvider = Arc<dyn Fn() -> Option<SurfaceGeometry> + Send + Sync>;

/// Handle adaptors push decoded samples through. The manager cancels the
/// sink's token before tearing an adaptor down, so no sample submitted after
/// teardown is accepted.
#[derive(Clone)]
pub struct SampleSink {
    adaptor_id: String,
    tx: mpsc::UnboundedSender<IngestedSample>,
    token: CancellationToken,
}

impl SampleSink {
    /// Submit one raw sample. Returns false once the adaptor is being torn
    /// down or the manager is gone.
    pub fn submit(&self, input: RawGazeInput) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.tx
            .send(IngestedSample {
                adaptor_id: self.adaptor_id.clone(),
                input,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token that fires when the manager disconnects this adaptor; adaptor
    /// tasks select on it to stop promptly.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

struct StatusShared {
    recorder: Arc<GazeRecorder>,
    user_callback: RwLock<Option<StatusCallback>>,
}

/// Reports adaptor status changes to the recorder's subscription surface and
/// any registered callback.
#[derive(Clone)]
pub struct StatusReporter {
    adaptor_id: String,
    shared: Arc<StatusShared>,
}

impl StatusReporter {
    pub fn report(&self, status: TrackingStatus) {
        self.shared
            .recorder
            .report_adaptor_status(&self.adaptor_id, status.clone());
        if let Some(callback) = self.shared.user_callback.read().as_ref() {
            callback(&self.adaptor_id, status);
        }
    }
}

/// Session identity shipped to external trackers in control messages.
#[derive(Debug, Clone)]
pub struct TrackingSessionInfo {
    pub session_id: String,
    pub config: serde_json::Value,
}

/// Everything an adaptor needs while live: the sample sink, the status
/// reporter, and the active session (if any) for control handshakes.
#[derive(Clone)]
pub struct AdaptorContext {
    pub sink: SampleSink,
    pub status: StatusReporter,
    pub session: Option<TrackingSessionInfo>,
}

/// A pluggable source of live gaze samples.
#[async_trait]
pub trait TrackingAdaptor: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> AdaptorKind;

    /// Begin producing samples into the context's sink. Establishing the
    /// underlying connection may complete asynchronously after this returns;
    /// `is_connected` reflects the live state.
    async fn connect(&self, ctx: AdaptorContext) -> Result<()>;

    /// Stop producing and release resources. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn status(&self) -> TrackingStatus;
}

struct ActiveAdaptor {
    adaptor: Arc<dyn TrackingAdaptor>,
    token: CancellationToken,
}

struct Observers {
    global: Vec<SampleObserver>,
    per_adaptor: HashMap<String, Vec<SampleObserver>>,
}

/// Manages the set of live adaptors, keyed by adaptor id: at most one live
/// adaptor per id, one ingestion funnel into the recorder, concurrent
/// teardown on shutdown.
pub struct TrackingManager {
    recorder: Arc<GazeRecorder>,
    adaptors: Mutex<HashMap<String, ActiveAdaptor>>,
    observers: Arc<RwLock<Observers>>,
    status_shared: Arc<StatusShared>,
    geometry_provider: Arc<RwLock<Option<GeometryProvider>>>,
    ingest_tx: mpsc::UnboundedSender<IngestedSample>,
    ingest_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TrackingManager {
    pub fn new(recorder: Arc<GazeRecorder>) -> Self {
        let (ingest_tx, mut ingest_rx) = mpsc::unbounded_channel::<IngestedSample>();
        let observers = Arc::new(RwLock::new(Observers {
            global: Vec::new(),
            per_adaptor: HashMap::new(),
        }));
        let geometry_provider: Arc<RwLock<Option<GeometryProvider>>> = Arc::new(RwLock::new(None));

        let task = {
            let recorder = Arc::clone(&recorder);
            let observers = Arc::clone(&observers);
            let geometry_provider = Arc::clone(&geometry_provider);
            tokio::spawn(async move {
                while let Some(sample) = ingest_rx.recv().await {
                    let geometry = geometry_provider.read().as_ref().and_then(|p| p());
                    if let Err(e) = recorder
                        .add_gaze_sample(sample.input.clone(), geometry)
                        .await
                    {
                        // Ingestion failures must not kill the funnel; the
                        // recorder has already surfaced the error state
                        debug!("Sample from {} rejected: {}", sample.adaptor_id, e);
                        continue;
                    }
                    let observers = observers.read();
                    for observer in &observers.global {
                        observer(&sample);
                    }
                    if let Some(list) = observers.per_adaptor.get(&sample.adaptor_id) {
                        for observer in list {
                            observer(&sample);
                        }
                    }
                }
                debug!("Ingestion funnel stopped");
            })
        };

        Self {
            status_shared: Arc::new(StatusShared {
                recorder: Arc::clone(&recorder),
                user_callback: RwLock::new(None),
            }),
            recorder,
            adaptors: Mutex::new(HashMap::new()),
            observers,
            geometry_provider,
            ingest_tx,
            ingest_task: Mutex::new(Some(task)),
        }
    }

    /// Register a callback invoked on every adaptor status change.
    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.status_shared.user_callback.write() = Some(callback);
    }

    /// Supply live surface geometry attached to every ingested sample
    /// (current-tab sessions; the session's startup snapshot is the fallback).
    pub fn set_geometry_provider(&self, provider: GeometryProvider) {
        *self.geometry_provider.write() = Some(provider);
    }

    /// Observe every accepted sample.
    pub fn add_observer(&self, observer: SampleObserver) {
        self.observers.write().global.push(observer);
    }

    /// Observe samples from one adaptor id.
    pub fn add_adaptor_observer(&self, adaptor_id: &str, observer: SampleObserver) {
        self.observers
            .write()
            .per_adaptor
            .entry(adaptor_id.to_string())
            .or_default()
            .push(observer);
    }

    /// Connect an adaptor. Any adaptor already live under the same id is
    /// disconnected and replaced first.
    pub async fn connect(&self, adaptor: Arc<dyn TrackingAdaptor>) -> Result<()> {
        let id = adaptor.id().to_string();

        let replaced = {
            let mut adaptors = self.adaptors.lock().await;
            adaptors.remove(&id)
        };
        if let Some(old) = replaced {
            info!("Replacing adaptor {}", id);
            old.token.cancel();
            if let Err(e) = old.adaptor.disconnect().await {
                warn!("Error disconnecting replaced adaptor {}: {}", id, e);
            }
        }

        let token = CancellationToken::new();
        let ctx = AdaptorContext {
            sink: SampleSink {
                adaptor_id: id.clone(),
                tx: self.ingest_tx.clone(),
                token: token.clone(),
            },
            status: StatusReporter {
                adaptor_id: id.clone(),
                shared: Arc::clone(&self.status_shared),
            },
            session: self.recorder.current_session().map(|s| TrackingSessionInfo {
                session_id: s.id.clone(),
                config: serde_json::to_value(&s.config).unwrap_or(serde_json::Value::Null),
            }),
        };

        if let Err(e) = adaptor.connect(ctx).await {
            error!("Adaptor {} failed to connect: {}", id, e);
            token.cancel();
            self.recorder
                .report_adaptor_status(&id, TrackingStatus::failed(e.to_string()));
            return Err(e);
        }

        self.adaptors
            .lock()
            .await
            .insert(id.clone(), ActiveAdaptor { adaptor, token });
        info!("Adaptor {} connected", id);
        Ok(())
    }

    /// Disconnect one adaptor. Ingestion from it stops before its resources
    /// are released. Returns whether the id was live.
    pub async fn disconnect(&self, adaptor_id: &str) -> Result<bool> {
        let active = {
            let mut adaptors = self.adaptors.lock().await;
            adaptors.remove(adaptor_id)
        };
        match active {
            Some(active) => {
                active.token.cancel();
                active.adaptor.disconnect().await?;
                info!("Adaptor {} disconnected", adaptor_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Tear down every live adaptor concurrently.
    pub async fn disconnect_all(&self) {
        let drained: Vec<(String, ActiveAdaptor)> = {
            let mut adaptors = self.adaptors.lock().await;
            adaptors.drain().collect()
        };
        if drained.is_empty() {
            return;
        }

        info!("Disconnecting {} adaptors", drained.len());
        let teardowns = drained.into_iter().map(|(id, active)| async move {
            active.token.cancel();
            if let Err(e) = active.adaptor.disconnect().await {
                warn!("Error disconnecting adaptor {}: {}", id, e);
            }
        });
        futures::future::join_all(teardowns).await;
    }

    /// Number of live adaptors.
    pub async fn active_count(&self) -> usize {
        self.adaptors.lock().await.len()
    }

    /// Live status of one adaptor, if connected under that id.
    pub async fn adaptor_status(&self, adaptor_id: &str) -> Option<TrackingStatus> {
        self.adaptors
            .lock()
            .await
            .get(adaptor_id)
            .map(|a| a.adaptor.status())
    }

    /// Stop the ingestion funnel. Called on recorder shutdown after all
    /// adaptors are down.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        if let Some(task) = self.ingest_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
    }
}
