use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

use gazecap::{
    pointer_simulator, GazeRecorder, GazecapConfig, PointerSample, RecordingMode, ScreenInfo,
    SessionConfig, SocketTrackerAdaptor, SurfaceGeometry, SyntheticCapture, TrackingManager,
};

#[derive(Parser, Debug)]
#[command(name = "gazecap")]
#[command(about = "Synchronized screen-recording and gaze acquisition for eye-tracking studies")]
#[command(version)]
#[command(long_about = "Runs a gazecap acquisition session: creates a session, starts chunked \
screen capture, and ingests live gaze samples from a socket-fed tracker and/or a simulated \
pointer-driven source. Captured data lands in the local session store for later export.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "gazecap.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Participant identifier for the session
    #[arg(short, long, default_value = "anonymous")]
    participant: String,

    /// Experiment-type label for the session
    #[arg(short, long, default_value = "default")]
    experiment: String,

    /// Recording mode: full-screen or current-tab
    #[arg(short, long, default_value = "full-screen")]
    mode: String,

    /// Display width in pixels
    #[arg(long, default_value_t = 1920.0)]
    screen_width: f64,

    /// Display height in pixels
    #[arg(long, default_value_t = 1080.0)]
    screen_height: f64,

    /// Connect the socket-fed tracker adaptor
    #[arg(long, help = "Connect to the external tracker socket configured in [tracking.socket]")]
    socket: bool,

    /// Connect a simulated pointer-driven gaze source
    #[arg(long, help = "Generate gaze samples from a simulated pointer path")]
    simulate: bool,

    /// Stop automatically after this many seconds (runs until Ctrl-C otherwise)
    #[arg(long)]
    duration: Option<u64>,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<String>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let _log_guard = init_logging(&args)?;

    info!("Starting gazecap v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match GazecapConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate()?;

    let mode = RecordingMode::parse(&args.mode)
        .ok_or_else(|| anyhow::anyhow!("unknown recording mode '{}'", args.mode))?;

    let recorder = Arc::new(GazeRecorder::new(
        config.clone(),
        Arc::new(SyntheticCapture::new()),
    ));
    recorder.initialize().await?;

    let mut session_config =
        SessionConfig::new(args.participant.clone(), args.experiment.clone(), mode);
    session_config.frame_rate = config.capture.frame_rate;
    session_config.quality = config.capture.quality.clone();
    session_config.chunk_duration_ms = config.capture.chunk_duration_ms;
    session_config.preferred_codec = config.capture.preferred_codec.clone();

    let screen = ScreenInfo::new(args.screen_width, args.screen_height);
    let surface = SurfaceGeometry {
        screen_x: 0.0,
        screen_y: 0.0,
        scroll_x: 0.0,
        scroll_y: 0.0,
        inner_width: args.screen_width,
        inner_height: args.screen_height,
        outer_width: args.screen_width,
        outer_height: args.screen_height,
    };

    let session_id = recorder
        .create_session(session_config, screen, surface)
        .await?;
    info!("Session {} created", session_id);

    recorder.start_recording().await?;

    let manager = TrackingManager::new(Arc::clone(&recorder));

    if args.socket {
        let adaptor = Arc::new(SocketTrackerAdaptor::new(
            "socket-tracker",
            config.tracking.socket.clone(),
        ));
        manager.connect(adaptor).await?;
    }

    let mut pointer_task = None;
    if args.simulate {
        let (tx, rx) = mpsc::channel(256);
        let adaptor = Arc::new(pointer_simulator(
            "pointer-sim",
            config.tracking.simulation.clone(),
            rx,
        ));
        manager.connect(adaptor).await?;
        pointer_task = Some(tokio::spawn(wander_pointer(
            tx,
            args.screen_width,
            args.screen_height,
        )));
    }

    if !args.socket && !args.simulate {
        info!("No gaze source connected; recording screen capture only");
    }

    match args.duration {
        Some(secs) => {
            info!("Recording for {} seconds", secs);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            info!("Recording until Ctrl-C");
            tokio::signal::ctrl_c().await?;
        }
    }

    info!("Shutting down");
    manager.shutdown().await;
    if let Some(task) = pointer_task {
        task.abort();
    }
    recorder.stop_recording().await?;

    let quality = recorder.quality_report();
    let state = recorder.state();
    println!("Session {} complete", session_id);
    println!(
        "  samples: {}  events: {}  chunks: {}",
        state.sample_count, state.event_count, state.chunk_count
    );
    if let Some(rate) = quality.sampling_rate_hz {
        println!("  sampling rate: {:.1} Hz", rate);
    }
    if let Some(confidence) = quality.average_confidence {
        println!(
            "  avg confidence: {:.2}  loss: {:.1}%",
            confidence,
            quality.data_loss_rate * 100.0
        );
    }

    let quota = recorder.storage_quota().await?;
    println!(
        "  store: {:.1} MiB used ({:.1}% of budget)",
        quota.used_bytes as f64 / (1024.0 * 1024.0),
        quota.usage_ratio * 100.0
    );

    if config.storage.cleanup.enabled {
        let cleanup = recorder.run_cleanup().await?;
        if cleanup.chunks_pruned > 0 {
            println!(
                "  cleanup: pruned {} chunks ({} bytes)",
                cleanup.chunks_pruned, cleanup.bytes_freed
            );
        }
    }

    Ok(())
}

/// Drive the pointer simulation along a smooth closed path at ~60 Hz.
async fn wander_pointer(tx: mpsc::Sender<PointerSample>, width: f64, height: f64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(16));
    let start = std::time::Instant::now();
    loop {
        ticker.tick().await;
        let t = start.elapsed().as_secs_f64();
        let sample = PointerSample {
            x: width * 0.5 + width * 0.35 * (0.37 * t).sin(),
            y: height * 0.5 + height * 0.35 * (0.53 * t).cos(),
        };
        if tx.send(sample).await.is_err() {
            break;
        }
    }
}

fn init_logging(args: &Args) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gazecap={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
    };

    let registry = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter);

    let guard = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "gazecap.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    };

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Gazecap Configuration File");
    println!("# Default configuration with all available options");
    println!();
    let config = GazecapConfig::default();
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
