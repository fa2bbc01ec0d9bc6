// src/main.rs - Operator CLI: bus queries, single moves and probing
use clap::{Parser, Subcommand};
use serde_json::json;
use sluice_rs::bus::serial::SerialTransport;
use sluice_rs::config::{Config, TransportKind, load_config};
use sluice_rs::motion::{MoveGroup, MoveGroupRunner, MoveResult, MoveStep};
use sluice_rs::probe::{CapacitivePass, CapacitiveProbe, LiquidProbe};
use sluice_rs::sensors::{SensorId, SensorScheduler};
use sluice_rs::sim::{NodeBehavior, SimBus};
use sluice_rs::{Messenger, NodeId, Transport, network, probe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Host-side control of the motion and sensor nodes
#[derive(Parser, Debug)]
#[command(name = "sluice-host", about = "Coordinate moves and sensor probes on the node bus.")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log every bus frame
    #[arg(short, long)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the nodes that answer a broadcast device info request
    Nodes {
        #[arg(long, default_value_t = 200)]
        window_ms: u64,
    },
    /// Round-trip an echo through a node
    Echo {
        #[arg(long)]
        node: NodeId,
    },
    /// Set hold and run current (A) on a node
    MotorCurrent {
        #[arg(long)]
        node: NodeId,
        #[arg(long)]
        hold: f64,
        #[arg(long)]
        run: f64,
    },
    /// Reboot a node into its bootloader
    Bootloader {
        #[arg(long)]
        node: NodeId,
    },
    /// Move one axis by a distance (mm) at a speed (mm/s)
    Move {
        #[arg(long)]
        node: NodeId,
        #[arg(long, allow_hyphen_values = true)]
        distance: f64,
        #[arg(long)]
        speed: f64,
    },
    /// Home one axis against its limit switch
    Home {
        #[arg(long)]
        node: NodeId,
        #[arg(long, default_value_t = 200.0)]
        distance: f64,
        #[arg(long, default_value_t = 10.0)]
        speed: f64,
    },
    /// Move until the tool's capacitive sensor trips
    CapacitiveProbe {
        #[arg(long)]
        tool: NodeId,
        #[arg(long)]
        mover: NodeId,
        #[arg(long, allow_hyphen_values = true)]
        distance: Option<f64>,
        #[arg(long)]
        speed: Option<f64>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        log_readings: bool,
    },
    /// Move while streaming the tool's capacitive sensor
    CapacitivePass {
        #[arg(long)]
        tool: NodeId,
        #[arg(long)]
        mover: NodeId,
        #[arg(long, allow_hyphen_values = true)]
        distance: Option<f64>,
        #[arg(long)]
        speed: Option<f64>,
    },
    /// Lower the mount and plunger until the pressure sensor trips
    LiquidProbe {
        #[arg(long)]
        tool: NodeId,
        #[arg(long)]
        mount: NodeId,
        #[arg(long, allow_hyphen_values = true)]
        distance: Option<f64>,
        #[arg(long)]
        speed: Option<f64>,
        #[arg(long, default_value_t = 5.0)]
        plunger_distance: f64,
        #[arg(long, default_value_t = 2.0)]
        plunger_speed: f64,
        #[arg(long)]
        threshold: Option<f64>,
    },
}

fn result_json(node: NodeId, result: &MoveResult) -> serde_json::Value {
    json!({
        "node": node.to_string(),
        "position_mm": result.position,
        "elapsed_s": result.elapsed.as_secs_f64(),
        "outcome": format!("{:?}", result.outcome),
        "stopped_early": result.stopped_early(),
        "sensor_value": result.sensor_value,
    })
}

fn print_results<'a>(as_json: bool, results: impl IntoIterator<Item = (NodeId, &'a MoveResult)>) {
    for (node, result) in results {
        if as_json {
            println!("{}", result_json(node, result));
        } else {
            println!(
                "{:<14} {:>10.3} mm  {:>8.3} s  {:?}{}",
                node,
                result.position,
                result.elapsed.as_secs_f64(),
                result.outcome,
                result.sensor_value.map(|v| format!("  sensor {:.3}", v)).unwrap_or_default()
            );
        }
    }
}

fn open_transport(config: &Config) -> Result<(Arc<dyn Transport>, Option<SimBus>), BoxError> {
    match config.bus.transport {
        TransportKind::Serial => {
            let transport = SerialTransport::open(&config.bus.serial, config.bus.baud, config.bus.max_frame_len)?;
            Ok((Arc::new(transport), None))
        }
        TransportKind::Sim => {
            let nodes = NodeId::ALL
                .into_iter()
                .filter(|n| !matches!(n, NodeId::Broadcast | NodeId::Host))
                .map(|n| (n, NodeBehavior::tripping_after(Duration::from_millis(750))));
            let (transport, bus) = SimBus::spawn(nodes);
            Ok((Arc::new(transport), Some(bus)))
        }
    }
}

async fn run_command(cli: &Cli, config: &Config, messenger: &Messenger) -> Result<(), BoxError> {
    let scheduler = SensorScheduler::with_config(config.sensors.clone());
    let timeout = messenger.default_timeout();
    match &cli.command {
        Command::Nodes { window_ms } => {
            let nodes = network::probe_nodes(messenger, Duration::from_millis(*window_ms)).await?;
            for (node, info) in &nodes {
                if cli.json {
                    println!("{}", json!({ "node": node.to_string(), "version": info.version, "flags": info.flags }));
                } else {
                    println!("{:<14} version {} flags {:#x}", node, info.version, info.flags);
                }
            }
        }
        Command::Echo { node } => {
            let rtt = network::echo(messenger, *node, b"sluice", timeout).await?;
            println!("{} answered in {:?}", node, rtt);
        }
        Command::MotorCurrent { node, hold, run } => {
            network::set_motor_current(messenger, *node, *hold, *run).await?;
        }
        Command::Bootloader { node } => {
            network::enter_bootloader(messenger, *node, timeout).await?;
        }
        Command::Move { node, distance, speed } => {
            let group = MoveGroup::single(*node, MoveStep::linear(*distance, *speed)?)?;
            let mut runner = MoveGroupRunner::with_config(vec![group], config.motion.clone());
            let results = runner.run(messenger).await?;
            print_results(cli.json, results.iter().map(|(n, r)| (*n, r)));
        }
        Command::Home { node, distance, speed } => {
            let group = MoveGroup::home(&[(*node, *distance, *speed)])?;
            let mut runner = MoveGroupRunner::with_config(vec![group], config.motion.clone());
            let results = runner.run(messenger).await?;
            print_results(cli.json, results.iter().map(|(n, r)| (*n, r)));
        }
        Command::CapacitiveProbe { tool, mover, distance, speed, threshold, log_readings } => {
            let request = CapacitiveProbe {
                tool: *tool,
                mover: *mover,
                distance: distance.unwrap_or(-config.probe.distance),
                speed: speed.unwrap_or(config.probe.speed),
                sensor_id: SensorId::S0,
                threshold_pf: threshold.unwrap_or(config.probe.capacitive_threshold_pf),
                log_readings: *log_readings,
            };
            let found = probe::capacitive_probe(messenger, &scheduler, &config.motion, &request).await?;
            tracing::info!("Armed threshold {} pF", found.threshold);
            print_results(cli.json, [(*mover, &found.result)]);
        }
        Command::CapacitivePass { tool, mover, distance, speed } => {
            let pass = CapacitivePass {
                tool: *tool,
                mover: *mover,
                distance: distance.unwrap_or(config.probe.distance),
                speed: speed.unwrap_or(config.probe.speed),
                sensor_id: SensorId::S0,
            };
            let readings = probe::capacitive_pass(messenger, &scheduler, &config.motion, &pass).await?;
            if cli.json {
                println!("{}", json!({ "node": tool.to_string(), "readings": readings }));
            } else {
                for reading in readings {
                    println!("{:.4}", reading);
                }
            }
        }
        Command::LiquidProbe { tool, mount, distance, speed, plunger_distance, plunger_speed, threshold } => {
            let request = LiquidProbe {
                tool: *tool,
                mount: *mount,
                pipette_distance: *plunger_distance,
                pipette_speed: *plunger_speed,
                mount_distance: distance.unwrap_or(-config.probe.distance),
                mount_speed: speed.unwrap_or(config.probe.speed),
                sensor_id: SensorId::S0,
                threshold_pa: threshold.unwrap_or(config.probe.pressure_threshold_pa),
            };
            let results = probe::liquid_probe(messenger, &scheduler, &config.motion, &request).await?;
            print_results(cli.json, results.iter().map(|(n, r)| (*n, r)));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            load_config(&path.to_string_lossy()).map_err(|e| {
                tracing::error!("Please ensure the configuration file exists and is properly formatted");
                Box::new(e) as BoxError
            })?
        }
        None => Config::default(),
    };
    tracing::info!("Bus transport: {:?}", config.bus.transport);

    let (transport, _sim) = open_transport(&config)?;
    let messenger = Messenger::new(transport, config.messenger.clone());
    messenger.start()?;
    let result = run_command(&cli, &config, &messenger).await;
    messenger.stop().await;
    if let Err(e) = &result {
        tracing::error!("Command failed: {}", e);
    }
    result
}
