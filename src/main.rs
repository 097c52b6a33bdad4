//! campipe - Simulated camera pipeline runner
//!
//! Opens a session on simulated hardware, streams a fixed number of capture
//! requests through it and prints a summary of what the client received.

use anyhow::Context;
use campipe::{
    config::PipelineConfig,
    hal::sim::{SimHardware, SimSensorClock},
    pipeline::{CameraId, CaptureRequest, ClientEvent, RequestParams, RequestStatus, Session},
    types::StreamKind,
};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "campipe")]
#[command(about = "Run capture requests through a simulated camera pipeline")]
#[command(version)]
struct Cli {
    /// Pipeline configuration file (default: platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of capture requests to submit
    #[arg(short = 'n', long, default_value = "30")]
    requests: usize,

    /// Simulated sensor frame rate
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Use the dual-sensor preset
    #[arg(long)]
    dual: bool,

    /// Zoom ratio carried by every request
    #[arg(long, default_value = "1.0")]
    zoom: f32,

    /// Ask for a still capture every N requests (0 disables)
    #[arg(long, default_value = "0")]
    still_every: usize,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Print the final health snapshot as JSON
    #[arg(long)]
    health_json: bool,
}

#[derive(Default)]
struct Summary {
    buffers: BTreeMap<StreamKind, u64>,
    buffer_errors: u64,
    metadata: u64,
    statuses: BTreeMap<&'static str, u64>,
    device_error: Option<String>,
}

impl Summary {
    fn record(&mut self, event: ClientEvent, session: &Session) {
        match event {
            ClientEvent::BufferComplete { stream, buffer, .. } => {
                *self.buffers.entry(stream).or_default() += 1;
                session.return_buffer(buffer);
            }
            ClientEvent::BufferError { .. } => self.buffer_errors += 1,
            ClientEvent::Metadata { .. } => self.metadata += 1,
            ClientEvent::RequestComplete { status, .. } => {
                let name = match status {
                    RequestStatus::Complete => "complete",
                    RequestStatus::PartialComplete => "partial",
                    RequestStatus::Aborted => "aborted",
                };
                *self.statuses.entry(name).or_default() += 1;
            }
            ClientEvent::DeviceError { reason } => self.device_error = Some(reason),
        }
    }

    fn completed(&self) -> u64 {
        self.statuses.values().sum()
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None if cli.dual => PipelineConfig::dual(),
        None => PipelineConfig::load_or_default(),
    };
    if cli.dual && !config.features.dual_sensor {
        let streams = config.streams.clone();
        config = PipelineConfig::dual();
        config.streams = streams;
    }
    Ok(config)
}

fn request_for(index: usize, cli: &Cli) -> CaptureRequest {
    let mut streams = vec![StreamKind::Preview, StreamKind::Callback];
    if cli.still_every > 0 && (index + 1) % cli.still_every == 0 {
        streams.push(StreamKind::Still);
    }
    CaptureRequest::new(streams).with_params(RequestParams {
        zoom_ratio: cli.zoom,
        ..RequestParams::default()
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let file_layer = cli.log_dir.as_ref().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "campipe.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
            guard,
        )
    });
    let (file_layer, _guard) = match file_layer {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,campipe=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    tracing::info!("Starting campipe");

    let config = load_config(&cli)?;
    let sim = SimHardware::default();
    let clock = Arc::new(SimSensorClock::new(cli.fps));
    let (session, bridge) = Session::open(CameraId(0), config, sim.hardware(clock.clone()))
        .context("opening session")?;
    session.start().context("starting session")?;

    let started = Instant::now();
    for index in 0..cli.requests {
        session.submit_request(request_for(index, &cli))?;
    }

    let mut summary = Summary::default();
    let deadline = Instant::now() + Duration::from_secs(5) + Duration::from_millis(cli.requests as u64 * 100);
    while summary.completed() < cli.requests as u64 && Instant::now() < deadline {
        if let Some(event) = bridge.recv_timeout(Duration::from_millis(100)) {
            summary.record(event, &session);
        }
    }

    let health = session.health();
    tracing::info!("Shutting down...");
    session.close();
    clock.stop();
    for event in bridge.drain().collect::<Vec<_>>() {
        summary.record(event, &session);
    }

    println!("requests:   {}", cli.requests);
    println!("elapsed:    {:.2?}", started.elapsed());
    for (status, count) in &summary.statuses {
        println!("{status:<11} {count}");
    }
    for (stream, count) in &summary.buffers {
        println!("{:<11} {count} buffers", format!("{stream}:"));
    }
    println!("errors:     {}", summary.buffer_errors);
    println!("metadata:   {}", summary.metadata);
    println!("pool:       {:?}", sim.pool.stats());
    if let Some(reason) = &summary.device_error {
        println!("device error: {reason}");
    }
    if cli.health_json {
        if let Some(health) = health {
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }
    Ok(())
}
