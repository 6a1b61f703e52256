use capture_coord::cli::Args;
use capture_coord::config::{self, PathConfig, PipelineConfig};
use capture_coord::core::workers::Workers;
use capture_coord::core::{AggregatorState, FrameQueue};
use capture_coord::entities::{ConsumerGroup, Executor, FrameSource};
use capture_coord::sim::{HardwareSimulator, MeanFusion, SimulatedPlatform};
use capture_coord::{
    CaptureAggregator, CaptureBundleSpec, CaptureError, DeviceError, DeviceRepository, FusedCycle, Observer,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Longest wait for one cycle to fuse
const CYCLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Logs fused cycles and fusion failures
struct CycleReporter;

impl Observer<FusedCycle, CaptureError> for CycleReporter {
    fn on_new_data(&self, cycle: FusedCycle) {
        info!("Cycle {} fused from ids {:?}", cycle.cycle, cycle.capture_ids);
    }

    fn on_error(&self, error: CaptureError) {
        error!("Cycle failed: {}", error);
    }
}

/// Logs device releases
struct ReleaseReporter;

impl Observer<String, DeviceError> for ReleaseReporter {
    fn on_new_data(&self, id: String) {
        info!("Device {} released", id);
    }

    fn on_error(&self, error: DeviceError) {
        warn!("{}", error);
    }
}

fn init_logger(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn run(cfg: &PipelineConfig) -> Result<u64> {
    let spec = cfg.bundle_spec();
    if spec.is_empty() {
        bail!("Bundle must contain at least one capture id");
    }

    // Worker pool for ingestion, fusion, observer dispatch and device release
    let workers: Arc<dyn Executor> = Arc::new(Workers::new(cfg.worker_threads()));

    // Devices
    let platform = SimulatedPlatform::new(
        cfg.devices.iter().cloned(),
        Arc::clone(&workers),
        Duration::from_millis(cfg.release_delay_ms),
    );
    let repository = Arc::new(DeviceRepository::new());
    repository.releases().add_observer(Arc::clone(&workers), Arc::new(ReleaseReporter));
    let registered = repository
        .register_all(&platform)
        .context("Failed to register devices")?;
    info!("Registered {} devices: {:?}", registered, repository.device_ids());

    let group = ConsumerGroup::new();
    let consumer = Uuid::new_v4();
    for id in repository.device_ids() {
        group.add_consumer(id, consumer);
    }
    group.add_listener(repository.clone());
    group.start();

    // Capture pipeline
    let input = Arc::new(FrameQueue::new(cfg.dimensions(), cfg.queue_depth));
    let aggregator = CaptureAggregator::new(input.clone(), Arc::new(MeanFusion::default()), Arc::clone(&workers));
    aggregator.results().add_observer(Arc::clone(&workers), Arc::new(CycleReporter));
    aggregator.set_bundle_spec(spec.clone())?;

    let hardware = HardwareSimulator::new(input.clone(), Duration::from_millis(cfg.frame_interval_ms));
    let outcome = drive(&aggregator, &hardware, &spec, cfg.cycles);

    // Teardown runs even if a cycle failed
    group.stop();
    aggregator.close();
    let shutdown = repository.shutdown_all();
    debug!("Waiting for devices to release");
    shutdown.wait().context("Device shutdown abandoned")?;
    info!("All devices released, {} frames outstanding", input.pool().outstanding());

    outcome
}

/// Emit one bundle per cycle and wait until it is fused.
fn drive(
    aggregator: &CaptureAggregator,
    hardware: &HardwareSimulator,
    spec: &CaptureBundleSpec,
    cycles: u64,
) -> Result<u64> {
    for cycle in 0..cycles {
        hardware
            .emit_bundle(spec, cycle)
            .with_context(|| format!("Hardware failed during cycle {}", cycle))?;

        let deadline = Instant::now() + CYCLE_TIMEOUT;
        while aggregator.cycles_completed() <= cycle {
            if Instant::now() >= deadline || aggregator.state() == AggregatorState::Closed {
                bail!("Cycle {} did not complete (state: {:?})", cycle, aggregator.state());
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        if let Some(fused) = aggregator.acquire_latest() {
            let mean = fused.read(|px| px.iter().map(|&p| u64::from(p)).sum::<u64>() / px.len().max(1) as u64);
            debug!("Fused frame {} mean level {}", fused.serial(), mean);
            fused.release();
        }
    }
    Ok(aggregator.cycles_completed())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Create path configuration from CLI args and environment
    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logger(&args, &path_config)?;
    info!("capture-sim starting...");
    debug!("Command-line args: {:?}", args);

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::config_file(config::CONFIG_FILE, &path_config));
    info!("Config path: {}", config_path.display());

    let mut cfg = PipelineConfig::load_or_default(&config_path)?;
    args.apply(&mut cfg);

    if args.save_config {
        cfg.save(&config_path)?;
        println!("Saved config to {}", config_path.display());
        return Ok(());
    }

    let fused = run(&cfg)?;
    println!("{} cycles fused from bundle {:?}", fused, cfg.bundle);
    Ok(())
}
