use std::{path::PathBuf, sync::Arc, time::Duration};

use air_brakes_flight_computer::{
    ActuatorHandle, CsvRecorder, FlightConfig, FlightLoop, MockServo, PacketQueue,
    SharedExtension, SnapshotPublisher,
    source::{Replay, ReplayPacing, simulation},
};
use air_brakes_flight_core::{DebugSnapshot, FlightPipeline};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{LevelFilter, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "Air Brakes Flight Computer")]
#[command(bin_name = "flight-computer")]
struct Cli {
    #[arg(long, short, help = "toml config, defaults are used when omitted")]
    config: Option<PathBuf>,

    #[arg(long, short, default_value = "flight_log.csv")]
    output: PathBuf,

    #[arg(long, help = "target apogee in m above the pad, overrides the config")]
    target_apogee: Option<f32>,

    #[arg(long, help = "stop the control loop after this many seconds")]
    duration_s: Option<f32>,

    #[arg(long, default_value_t = 1.0, help = "seconds between status lines, 0 disables")]
    status_interval_s: f32,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    source: SourceSelect,
}

#[derive(Subcommand, Debug)]
enum SourceSelect {
    #[command(about = "fly a simulated rocket in closed loop with a mock servo")]
    Simulate,

    #[command(about = "replay a recorded sensor csv")]
    Replay {
        path: PathBuf,
        #[arg(long, help = "push samples as fast as the loop consumes them")]
        fast: bool,
        #[arg(long, default_value_t = 1.0)]
        speed: f32,
    },
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .filter_module("air_brakes_flight_core", level)
        .filter_module("air_brakes_flight_computer", level)
        .filter_module("flight_computer", level)
        .parse_default_env()
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_logger(args.verbose);

    let mut config = FlightConfig::load(args.config.as_deref())?;
    if let Some(target_apogee) = args.target_apogee {
        config.controller.target_apogee = target_apogee;
    }
    if let Some(duration_s) = args.duration_s {
        config.control_loop.max_duration_s = Some(duration_s);
    }
    config.validate()?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, retracting and shutting down");
            }
            cancel.cancel();
        }
    });

    let queue = Arc::new(PacketQueue::new(config.queue.capacity));
    let extension = SharedExtension::default();
    let servo = MockServo::new(config.servo, extension.clone());

    // the producer thread is detached, it closes the queue when done
    match &args.source {
        SourceSelect::Simulate => {
            simulation::spawn(
                config.simulation.clone(),
                queue.clone(),
                extension,
                cancel.clone(),
            );
        }
        SourceSelect::Replay { path, fast, speed } => {
            let replay = Replay::open(path)
                .with_context(|| format!("loading replay {}", path.display()))?;
            info!("replaying {} samples from {}", replay.samples().len(), path.display());
            let pacing = if *fast {
                ReplayPacing::AsFastAsPossible
            } else {
                ReplayPacing::Recorded { speed: *speed }
            };
            replay.spawn(queue.clone(), pacing, cancel.clone());
        }
    }

    let recorder = CsvRecorder::create(&args.output, &config.recorder)
        .with_context(|| format!("creating flight log {}", args.output.display()))?;
    let (snapshots, status) = SnapshotPublisher::new();
    if args.status_interval_s > 0.0 {
        tokio::spawn(print_status(
            status,
            Duration::from_secs_f32(args.status_interval_s),
            cancel.clone(),
        ));
    }

    let flight_loop = FlightLoop::new(
        config.control_loop.clone(),
        FlightPipeline::new(config.pipeline_config()),
        ActuatorHandle::new(servo, config.controller.retracted_extension),
        queue,
        recorder,
        snapshots,
    );
    let report = flight_loop.run(cancel.clone()).await?;
    cancel.cancel();

    info!(
        "stopped ({:?}) in {:?} after {} ticks, max altitude {:.1} m",
        report.stop, report.final_phase, report.ticks, report.max_altitude
    );
    if report.overruns > 0 || report.queue_dropped > 0 || report.actuator_failures > 0 {
        warn!(
            "{} loop overruns, {} samples dropped, {} actuator failures",
            report.overruns, report.queue_dropped, report.actuator_failures
        );
    }
    info!(
        "{} rows written to {}",
        report.rows_written,
        args.output.display()
    );
    Ok(())
}

async fn print_status(
    status: watch::Receiver<Option<DebugSnapshot>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => return,
        }

        let Some(snapshot) = status.borrow().clone() else {
            continue;
        };
        let apogee = snapshot
            .prediction
            .as_ref()
            .map(|prediction| format!("{:.1} m", prediction.predicted_apogee))
            .unwrap_or_else(|| "-".to_string());
        info!(
            "tick {} {:?}: altitude {:.1} m, velocity {:.1} m/s, apogee {}, extension {:.2}",
            snapshot.tick,
            snapshot.phase,
            snapshot.processed.current_altitude,
            snapshot.processed.vertical_velocity,
            apogee,
            snapshot.command.extension,
        );
    }
}
