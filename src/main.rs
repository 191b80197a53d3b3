//! Fiberscope CLI
//!
//! Runs an experiment from a configuration file, inspects recordings and
//! hosts the process-isolated worker loops.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use fiberscope::{
    electronics::SerialBoard,
    experiment::{ExperimentConfig, ExperimentController, ExperimentError},
    localization::{run_locator, CentroidLocator, LocateParams},
    metrics::MetricsRegistry,
    recording::{run_recorder, ContainerReader, ContainerWriter, DEFAULT_MAX_MEMORY},
    worker::serve_stdio,
};
use tracing::{error, info, warn};

/// Status log interval of the `run` command.
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "fiberscope", version, about = "Camera acquisition and recording for the fiber microscope")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Acquire from every configured camera for a while.
    Run {
        /// Experiment configuration (TOML). Without it, one simulated camera.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Seconds to run; 0 runs until Ctrl-C.
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
        /// Record every camera.
        #[arg(long)]
        record: bool,
        /// Locate features in every camera stream.
        #[arg(long)]
        track: bool,
        /// Serve Prometheus metrics on this port.
        #[cfg(feature = "metrics")]
        #[arg(long)]
        metrics_port: Option<u16>,
    },
    /// Print the header and frame summary of a recording.
    Inspect {
        file: PathBuf,
    },
    /// List USB serial ports.
    Ports,
    #[command(hide = true)]
    RecordWorker {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = DEFAULT_MAX_MEMORY)]
        max_memory: usize,
    },
    #[command(hide = true)]
    LocateWorker {
        #[arg(long)]
        diameter: u32,
        #[arg(long, default_value_t = 0.0)]
        min_mass: f64,
        #[arg(long, default_value_t = 0.0)]
        threshold: f64,
        #[arg(long)]
        max_features: Option<usize>,
    },
}

fn main() -> ExitCode {
    // Logs go to stderr; worker stdout carries frames.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        #[cfg(feature = "metrics")]
        Command::Run {
            config,
            seconds,
            record,
            track,
            metrics_port,
        } => run(config, seconds, record, track, metrics_port),
        #[cfg(not(feature = "metrics"))]
        Command::Run {
            config,
            seconds,
            record,
            track,
        } => run(config, seconds, record, track, None),
        Command::Inspect { file } => inspect(file),
        Command::Ports => ports(),
        Command::RecordWorker { path, max_memory } => record_worker(path, max_memory),
        Command::LocateWorker {
            diameter,
            min_mass,
            threshold,
            max_features,
        } => locate_worker(LocateParams {
            diameter,
            min_mass,
            threshold,
            max_features,
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("fiberscope: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(
    config_path: Option<PathBuf>,
    seconds: u64,
    record: bool,
    track: bool,
    metrics_port: Option<u16>,
) -> Result<(), ExperimentError> {
    info!("Fiberscope v{}", fiberscope::VERSION);
    let config = match &config_path {
        Some(path) => ExperimentConfig::from_file(path)?,
        None => {
            info!("No configuration given, using one simulated camera");
            ExperimentConfig::simulated("microscope")
        }
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst)) {
            warn!("Failed to install Ctrl-C handler: {}", e);
        }
    }

    let metrics = Arc::new(MetricsRegistry::new()?);
    serve_metrics(&metrics, metrics_port);

    let mut controller = ExperimentController::new(config);
    controller.initialize()?;
    let cameras = controller.camera_ids();
    for camera_id in &cameras {
        controller.start_free_run(camera_id)?;
        if record {
            let path = controller.start_recording(camera_id)?;
            info!(camera = %camera_id, path = %path.display(), "Recording");
        }
        if track {
            let topic = controller.start_tracking(camera_id)?;
            info!(camera = %camera_id, topic = %topic, "Tracking");
        }
    }

    let deadline = (seconds > 0).then(|| Instant::now() + Duration::from_secs(seconds));
    let mut last_status = Instant::now();
    while !interrupted.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        std::thread::sleep(Duration::from_millis(100));
        for fault in controller.poll_faults() {
            warn!(camera = %fault.camera_id, error = %fault.error, "Camera stopped");
        }
        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            let snapshot = controller.metrics_snapshot();
            metrics.update(&snapshot);
            for camera in &snapshot.cameras {
                info!(camera = %camera.camera_id, fps = %format!("{:.1}", camera.fps), frames = camera.frames_acquired, "Status");
            }
            if snapshot.hub_dropped > 0 {
                warn!(dropped = snapshot.hub_dropped, "Hub dropped messages");
            }
        }
    }
    if interrupted.load(Ordering::SeqCst) {
        info!("Interrupted, shutting down");
    }

    controller.finalize();
    let snapshot = controller.metrics_snapshot();
    metrics.update(&snapshot);
    for recording in &snapshot.recordings {
        info!(
            camera = %recording.camera_id,
            frames = recording.frames_written,
            bytes = recording.bytes_written,
            "Recording summary"
        );
    }
    info!("Done");
    Ok(())
}

#[cfg(feature = "metrics")]
fn serve_metrics(registry: &Arc<MetricsRegistry>, port: Option<u16>) {
    use fiberscope::metrics::{MetricsServer, MetricsServerConfig};

    let Some(port) = port else { return };
    let server = MetricsServer::new(MetricsServerConfig::with_port(port), Arc::clone(registry));
    if let Err(e) = server.spawn() {
        warn!("Metrics server not started: {}", e);
    }
}

#[cfg(not(feature = "metrics"))]
fn serve_metrics(_registry: &Arc<MetricsRegistry>, _port: Option<u16>) {}

fn inspect(file: PathBuf) -> Result<(), ExperimentError> {
    let mut reader = ContainerReader::open(&file)?;
    let header = reader.header().clone();
    println!("file:     {}", file.display());
    println!("version:  {}", header.version);
    println!("created:  {}", header.created_at);
    println!(
        "metadata: {}",
        serde_json::to_string_pretty(&header.metadata).map_err(fiberscope::recording::RecordingError::from)?
    );

    let mut count = 0u64;
    let mut bytes = 0usize;
    let mut first = None;
    let mut last = None;
    for frame in reader.by_ref() {
        let frame = frame?;
        count += 1;
        bytes += frame.byte_len();
        first.get_or_insert((frame.sequence(), frame.captured_at()));
        last = Some((frame.sequence(), frame.captured_at(), frame.width(), frame.height()));
    }
    println!("frames:   {}", count);
    println!("payload:  {} bytes", bytes);
    if let (Some((first_seq, first_at)), Some((last_seq, last_at, width, height))) = (first, last) {
        let span = (last_at - first_at).num_milliseconds() as f64 / 1000.0;
        println!("sequence: {}..={}", first_seq, last_seq);
        println!("size:     {}x{}", width, height);
        if span > 0.0 && count > 1 {
            println!("rate:     {:.1} fps over {:.2} s", (count - 1) as f64 / span, span);
        }
    }
    if reader.truncated() {
        println!("warning:  truncated trailing record");
    }
    Ok(())
}

fn ports() -> Result<(), ExperimentError> {
    let ports = SerialBoard::list_ports()?;
    if ports.is_empty() {
        println!("no USB serial ports found");
    }
    for (index, port) in ports.iter().enumerate() {
        println!("{}: {}", index, port);
    }
    Ok(())
}

fn record_worker(path: PathBuf, max_memory: usize) -> Result<(), ExperimentError> {
    let writer = ContainerWriter::open_append(&path)?;
    info!(path = %path.display(), max_memory, "Record worker started");
    serve_stdio(|source, sink| {
        let report = run_recorder(source, sink, writer, max_memory);
        info!(frames = report.processed, bytes = report.bytes_written, "Record worker finished");
    })?;
    Ok(())
}

fn locate_worker(params: LocateParams) -> Result<(), ExperimentError> {
    params.validate()?;
    info!(diameter = params.diameter, "Locate worker started");
    serve_stdio(|source, sink| {
        let report = run_locator(source, sink, &CentroidLocator, &params);
        info!(processed = report.processed, skipped = report.skipped, "Locate worker finished");
    })?;
    Ok(())
}
