use anyhow::{Context, Result};
use capture_graph::capture::simulated::supported_sensors;
use capture_graph::config::{load_config, PipelineConfig};
use capture_graph::recorder::SwitchStrategy;
use capture_graph::{PipelineController, SimulatedHardware};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "capture-graph")]
#[command(version, about = "Run a capture/encode session with a live resolution switch")]
struct Cli {
    /// Pipeline config (JSON); built-in 960p + D1 session when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sensor name to detect
    #[arg(short, long)]
    sensor: Option<String>,

    /// Seconds to stream before and after the switch
    #[arg(long)]
    run_secs: Option<u64>,

    /// Simulated frame interval in milliseconds
    #[arg(long, default_value = "40")]
    frame_interval_ms: u64,

    /// Switch strategy: reinit or recreate
    #[arg(long)]
    strategy: Option<SwitchStrategy>,

    /// Skip the resolution switch
    #[arg(long)]
    no_switch: bool,

    /// Write streams to stream-<index>.<ext> in this directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// List supported sensors and exit
    #[arg(long)]
    list_sensors: bool,
}

impl Cli {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        if let Some(sensor) = &self.sensor {
            config.sensor = sensor.clone();
        }
        if let Some(secs) = self.run_secs {
            config.run_secs = secs;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(dir.clone());
        }
        if self.no_switch {
            config.switch = None;
        }
        if let (Some(strategy), Some(plan)) = (self.strategy, config.switch.as_mut()) {
            plan.strategy = strategy;
        }

        config.validate().context("invalid pipeline config")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    capture_graph::init_logging();
    let cli = Cli::parse();

    if cli.list_sensors {
        for name in supported_sensors() {
            println!("{name}");
        }
        return Ok(());
    }

    tracing::info!("Starting capture-graph v{}", env!("CARGO_PKG_VERSION"));
    let config = cli.pipeline_config()?;

    let hw = Arc::new(SimulatedHardware::with_frame_interval(Duration::from_millis(
        cli.frame_interval_ms.max(1),
    )));
    let mut controller = PipelineController::new(hw.clone(), config);

    // Ctrl+C ends the run early; teardown still happens
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    ctrlc::set_handler(move || {
        stop_flag.store(true, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    let summary = controller
        .run_session(&stop)
        .context("pipeline session failed")?;

    tracing::info!(
        "Session finished: {} unit(s), {} outstanding, {} leaked",
        summary.total_frames(),
        hw.outstanding_units(),
        hw.units_leaked()
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
