//! Synthetic gaze sources.
//!
//! [`SyntheticAdaptor`] wraps a caller-supplied setup/teardown pair, which
//! also serves custom generators. [`pointer_simulator`] builds one that turns
//! a pointer-position feed into gaze samples, with jitter and periodic
//! simulated loss-of-signal ("blinks"). The imperfection model lives entirely
//! in [`SimulationConfig`] and this module, so it can be swapped out without
//! touching acquisition code.

use super::{AdaptorContext, AdaptorKind, StatusReporter, TrackingAdaptor};
use crate::config::SimulationConfig;
use crate::error::{GazecapError, Result};
use crate::filter::GazeSmoother;
use crate::gaze::{QualityTier, RawGazeInput, TrackingStatus};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// One pointer movement from the host's pointer-event feed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerSample {
    pub x: f64,
    pub y: f64,
}

/// Teardown closure returned by a setup function; awaited on disconnect.
pub type TeardownFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Setup closure invoked on connect with the live adaptor context.
pub type SetupFn =
    Box<dyn Fn(AdaptorContext) -> BoxFuture<'static, Result<TeardownFn>> + Send + Sync>;

/// Adaptor for synthetic sources: a setup closure starts sample production,
/// its returned teardown closure stops it.
pub struct SyntheticAdaptor {
    id: String,
    kind: AdaptorKind,
    setup: SetupFn,
    teardown: Mutex<Option<TeardownFn>>,
    connected: AtomicBool,
    status: RwLock<TrackingStatus>,
    reporter: RwLock<Option<StatusReporter>>,
}

impl SyntheticAdaptor {
    pub fn new(id: impl Into<String>, setup: SetupFn) -> Self {
        Self::with_kind(id, AdaptorKind::Custom, setup)
    }

    fn with_kind(id: impl Into<String>, kind: AdaptorKind, setup: SetupFn) -> Self {
        Self {
            id: id.into(),
            kind,
            setup,
            teardown: Mutex::new(None),
            connected: AtomicBool::new(false),
            status: RwLock::new(TrackingStatus::disconnected()),
            reporter: RwLock::new(None),
        }
    }

    fn set_status(&self, status: TrackingStatus) {
        *self.status.write() = status.clone();
        if let Some(reporter) = self.reporter.read().as_ref() {
            reporter.report(status);
        }
    }
}

#[async_trait]
impl TrackingAdaptor for SyntheticAdaptor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AdaptorKind {
        self.kind
    }

    async fn connect(&self, ctx: AdaptorContext) -> Result<()> {
        let mut teardown = self.teardown.lock().await;
        if teardown.is_some() {
            return Err(GazecapError::invalid_state(
                "connected".to_string(),
                format!("adaptor {} is already connected", self.id),
            ));
        }

        *self.reporter.write() = Some(ctx.status.clone());
        *teardown = Some((self.setup)(ctx).await?);
        self.connected.store(true, Ordering::SeqCst);
        self.set_status(TrackingStatus::connected(QualityTier::Good));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(teardown) = self.teardown.lock().await.take() {
            teardown().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.set_status(TrackingStatus::disconnected());
        *self.reporter.write() = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn status(&self) -> TrackingStatus {
        self.status.read().clone()
    }
}

/// Build a synthetic adaptor that derives one gaze sample from every pointer
/// movement while connected, degraded per the simulation config.
pub fn pointer_simulator(
    id: impl Into<String>,
    sim: SimulationConfig,
    feed: mpsc::Receiver<PointerSample>,
) -> SyntheticAdaptor {
    let id = id.into();
    let feed = Arc::new(Mutex::new(feed));

    let setup: SetupFn = Box::new(move |ctx: AdaptorContext| {
        let sim = sim.clone();
        let feed = Arc::clone(&feed);
        Box::pin(async move {
            let stop = CancellationToken::new();
            let task_stop = stop.clone();
            let handle = tokio::spawn(run_pointer_loop(ctx, sim, feed, task_stop));

            let teardown: TeardownFn = Box::new(move || {
                Box::pin(async move {
                    stop.cancel();
                    let _ = handle.await;
                })
            });
            Ok(teardown)
        })
    });

    SyntheticAdaptor::with_kind(id, AdaptorKind::Simulated, setup)
}

async fn run_pointer_loop(
    ctx: AdaptorContext,
    sim: SimulationConfig,
    feed: Arc<Mutex<mpsc::Receiver<PointerSample>>>,
    stop: CancellationToken,
) {
    let sink_cancel = ctx.sink.token();
    let blink_interval = Duration::from_secs(sim.blink_interval_secs.max(1));
    let blink_duration = Duration::from_millis(sim.blink_duration_ms);
    let mut blink_start = Instant::now() + blink_interval;
    let mut in_blink = false;
    let mut smoother = sim.smoothing.then(GazeSmoother::default);
    let started = Instant::now();

    loop {
        let pointer = tokio::select! {
            _ = stop.cancelled() => break,
            _ = sink_cancel.cancelled() => break,
            pointer = async { feed.lock().await.recv().await } => match pointer {
                Some(pointer) => pointer,
                None => {
                    debug!("Pointer feed closed");
                    break;
                }
            },
        };

        // Periodic loss-of-signal: drop every sample inside the blink window
        let now = Instant::now();
        if now >= blink_start {
            if now < blink_start + blink_duration {
                if !in_blink {
                    trace!("Simulated blink started");
                    in_blink = true;
                }
                continue;
            }
            blink_start = now + blink_interval;
            in_blink = false;
        }

        let (jitter_x, jitter_y) = if sim.jitter_px > 0.0 {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(-sim.jitter_px..=sim.jitter_px),
                rng.gen_range(-sim.jitter_px..=sim.jitter_px),
            )
        } else {
            (0.0, 0.0)
        };

        let (mut x, mut y) = (pointer.x + jitter_x, pointer.y + jitter_y);
        if let Some(smoother) = smoother.as_mut() {
            let t = started.elapsed().as_secs_f64();
            (x, y) = smoother.apply(t, x, y);
        }

        let input = RawGazeInput {
            screen_x: x,
            screen_y: y,
            normalized: false,
            confidence: Some(sim.confidence),
            device_timestamp: None,
            system_timestamp: None,
            left_eye: None,
            right_eye: None,
        };

        if !ctx.sink.submit(input) {
            break;
        }
    }

    debug!("Pointer simulation loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaze::RawGazeInput;
    use crate::recorder::GazeRecorder;
    use crate::tracking::TrackingManager;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn sim_config(jitter: f64, blink_interval_secs: u64) -> SimulationConfig {
        SimulationConfig {
            jitter_px: jitter,
            blink_interval_secs,
            blink_duration_ms: 50,
            confidence: 0.85,
            smoothing: false,
        }
    }

    async fn manager_with_session(dir: &TempDir) -> (Arc<GazeRecorder>, TrackingManager) {
        let mut config = crate::config::GazecapConfig::default();
        config.storage.path = dir.path().join("sim.db").to_string_lossy().to_string();
        let recorder = Arc::new(GazeRecorder::new(
            config,
            Arc::new(crate::capture::SyntheticCapture::new()),
        ));
        recorder.initialize().await.unwrap();
        recorder
            .create_session(
                crate::session::SessionConfig::new(
                    "p1",
                    "t1",
                    crate::session::RecordingMode::FullScreen,
                ),
                crate::session::ScreenInfo::new(1920.0, 1080.0),
                crate::transform::SurfaceGeometry {
                    screen_x: 0.0,
                    screen_y: 0.0,
                    scroll_x: 0.0,
                    scroll_y: 0.0,
                    inner_width: 1920.0,
                    inner_height: 1080.0,
                    outer_width: 1920.0,
                    outer_height: 1080.0,
                },
            )
            .await
            .unwrap();
        let manager = TrackingManager::new(Arc::clone(&recorder));
        (recorder, manager)
    }

    #[tokio::test]
    async fn pointer_moves_become_gaze_samples() {
        let dir = TempDir::new().unwrap();
        let (recorder, manager) = manager_with_session(&dir).await;

        let (tx, rx) = mpsc::channel(64);
        let adaptor = Arc::new(pointer_simulator("sim", sim_config(0.0, 1000), rx));
        manager.connect(adaptor.clone()).await.unwrap();
        assert!(adaptor.is_connected());
        assert_eq!(adaptor.kind(), AdaptorKind::Simulated);

        for i in 0..5 {
            tx.send(PointerSample {
                x: 100.0 + i as f64,
                y: 200.0,
            })
            .await
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.state().sample_count, 5);

        manager.disconnect("sim").await.unwrap();
        assert!(!adaptor.is_connected());
    }

    #[tokio::test]
    async fn jitter_perturbs_positions() {
        let dir = TempDir::new().unwrap();
        let (_recorder, manager) = manager_with_session(&dir).await;

        let positions = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let positions = Arc::clone(&positions);
            manager.add_observer(Arc::new(move |sample| {
                positions.lock().push((sample.input.screen_x, sample.input.screen_y));
            }));
        }

        let (tx, rx) = mpsc::channel(64);
        let adaptor = Arc::new(pointer_simulator("sim", sim_config(10.0, 1000), rx));
        manager.connect(adaptor).await.unwrap();

        for _ in 0..10 {
            tx.send(PointerSample { x: 500.0, y: 500.0 }).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let positions = positions.lock();
        assert_eq!(positions.len(), 10);
        for (x, y) in positions.iter() {
            assert!((x - 500.0).abs() <= 10.0);
            assert!((y - 500.0).abs() <= 10.0);
        }
        // At least one sample actually moved off the exact pointer position
        assert!(positions.iter().any(|(x, y)| *x != 500.0 || *y != 500.0));
    }

    #[tokio::test]
    async fn no_samples_after_disconnect() {
        let dir = TempDir::new().unwrap();
        let (recorder, manager) = manager_with_session(&dir).await;

        let (tx, rx) = mpsc::channel(64);
        let adaptor = Arc::new(pointer_simulator("sim", sim_config(0.0, 1000), rx));
        manager.connect(adaptor).await.unwrap();

        tx.send(PointerSample { x: 1.0, y: 2.0 }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.disconnect("sim").await.unwrap();

        let before = recorder.state().sample_count;
        // Feed keeps producing, but the torn-down adaptor must not ingest
        let _ = tx.send(PointerSample { x: 3.0, y: 4.0 }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.state().sample_count, before);
    }

    #[tokio::test]
    async fn custom_setup_teardown_runs() {
        let dir = TempDir::new().unwrap();
        let (recorder, manager) = manager_with_session(&dir).await;

        let torn_down = Arc::new(AtomicUsize::new(0));
        let torn_down_probe = Arc::clone(&torn_down);

        let setup: SetupFn = Box::new(move |ctx: AdaptorContext| {
            let torn_down = Arc::clone(&torn_down_probe);
            Box::pin(async move {
                ctx.sink.submit(RawGazeInput::at(10.0, 10.0));
                let teardown: TeardownFn = Box::new(move || {
                    Box::pin(async move {
                        torn_down.fetch_add(1, Ordering::SeqCst);
                    })
                });
                Ok(teardown)
            })
        });

        let adaptor = Arc::new(SyntheticAdaptor::new("custom", setup));
        manager.connect(adaptor.clone()).await.unwrap();
        assert_eq!(adaptor.kind(), AdaptorKind::Custom);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.state().sample_count, 1);

        manager.disconnect("custom").await.unwrap();
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    }
}
