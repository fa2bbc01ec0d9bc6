//! CLI entry point for the simulation harness: runs built-in bus scenarios against simulated nodes.

use clap::{Parser, Subcommand, ValueEnum};
use sluice_rs::config::{Config, MotionConfig};
use sluice_rs::messages::MessageId;
use sluice_rs::motion::{MoveGroup, MoveGroupRunner, MoveStep, MoveStopCondition};
use sluice_rs::probe::{self, CapacitivePass, CapacitiveProbe, LiquidProbe};
use sluice_rs::sensors::{SensorId, SensorScheduler};
use sluice_rs::sim::{NodeBehavior, SimBus};
use sluice_rs::{Messenger, NodeId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Simulation Harness CLI
#[derive(Parser, Debug)]
#[command(name = "sim-harness", about = "Run move group and probing scenarios against simulated nodes.")]
struct Cli {
    /// Path to a TOML config file (overrides defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log every bus frame
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available built-in scenarios
    ListScenarios,
    /// Run one scenario, or all of them
    Run {
        #[arg(value_enum)]
        scenario: Option<Scenario>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Two axes, one trips the sync line part way through
    SyncTrip,
    /// One of three nodes never acknowledges its step
    SetupFault,
    /// A node never reports completion
    ExecutionTimeout,
    /// Cancel a group mid-move
    Cancel,
    /// Capacitive probe with the sensor on the pipette
    CapacitiveProbe,
    /// Stream capacitive readings during a pass
    CapacitivePass,
    /// Pressure-limited probe moving mount and plunger
    LiquidProbe,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn start(config: &Config, nodes: Vec<(NodeId, NodeBehavior)>) -> Result<(Messenger, SimBus), BoxError> {
    let (transport, bus) = SimBus::spawn(nodes);
    let messenger = Messenger::new(Arc::new(transport), config.messenger.clone());
    messenger.start()?;
    Ok((messenger, bus))
}

fn pair_group() -> Result<MoveGroup, BoxError> {
    let group = MoveGroup::from_steps([
        (
            NodeId::GantryX,
            MoveStep::linear(10.0, 10.0)?.with_stop_condition(MoveStopCondition::SyncLine),
        ),
        (NodeId::GantryY, MoveStep::linear(10.0, 10.0)?),
    ])?;
    Ok(group)
}

async fn run_scenario(scenario: Scenario, config: &Config) -> Result<(), BoxError> {
    let motion: &MotionConfig = &config.motion;
    let scheduler = SensorScheduler::with_config(config.sensors.clone());
    println!("== {:?}", scenario);
    match scenario {
        Scenario::SyncTrip => {
            let (messenger, _bus) = start(config, vec![
                (NodeId::GantryX, NodeBehavior::tripping_after(Duration::from_millis(400))),
                (NodeId::GantryY, NodeBehavior::default()),
            ])?;
            let mut runner = MoveGroupRunner::with_config(vec![pair_group()?], motion.clone());
            for (node, result) in runner.run(&messenger).await? {
                println!("{:<10} {:?} after {:?} at {:.3} mm", node, result.outcome, result.elapsed, result.position);
            }
            messenger.stop().await;
        }
        Scenario::SetupFault => {
            let (messenger, bus) = start(config, vec![
                (NodeId::GantryX, NodeBehavior::default()),
                (NodeId::GantryY, NodeBehavior::silent_setup()),
                (NodeId::HeadL, NodeBehavior::default()),
            ])?;
            let group = MoveGroup::pass(
                &[(NodeId::GantryX, 5.0, 5.0), (NodeId::GantryY, 5.0, 5.0), (NodeId::HeadL, 5.0, 5.0)],
                MoveStopCondition::None,
            )?;
            let mut runner = MoveGroupRunner::with_config(vec![group], motion.clone());
            match runner.run(&messenger).await {
                Ok(_) => println!("unexpected success"),
                Err(e) => println!("setup failed as expected: {}", e),
            }
            for node in bus.nodes() {
                let triggered = bus.received_kinds(node).contains(&MessageId::ExecuteMoveGroupRequest);
                println!("{:<10} saw trigger: {}", node, triggered);
            }
            messenger.stop().await;
        }
        Scenario::ExecutionTimeout => {
            let (messenger, _bus) = start(config, vec![
                (NodeId::GantryX, NodeBehavior::default()),
                (NodeId::GantryY, NodeBehavior::never_completes()),
            ])?;
            let mut runner = MoveGroupRunner::with_config(vec![pair_group()?], motion.clone());
            match runner.run(&messenger).await {
                Ok(_) => println!("unexpected success"),
                Err(e) => println!("{} (runner is {})", e, runner.state()),
            }
            messenger.stop().await;
        }
        Scenario::Cancel => {
            let (messenger, bus) = start(config, vec![
                (NodeId::GantryX, NodeBehavior::default()),
                (NodeId::GantryY, NodeBehavior::default()),
            ])?;
            let mut runner = MoveGroupRunner::with_config(vec![pair_group()?], motion.clone());
            runner.prepare(&messenger).await?;
            let cancel = tokio::time::sleep(Duration::from_millis(250));
            match runner.execute_until(&messenger, cancel).await {
                Ok(_) => println!("unexpected success"),
                Err(e) => println!("{}", e),
            }
            for node in bus.nodes() {
                let stopped = bus.received_kinds(node).contains(&MessageId::StopRequest);
                println!("{:<10} received stop: {}", node, stopped);
            }
            messenger.stop().await;
        }
        Scenario::CapacitiveProbe => {
            let (messenger, _bus) = start(config, vec![
                (NodeId::HeadL, NodeBehavior::default()),
                (NodeId::PipetteLeft, NodeBehavior::tripping_after(Duration::from_millis(1200))),
            ])?;
            let request = CapacitiveProbe {
                tool: NodeId::PipetteLeft,
                mover: NodeId::HeadL,
                distance: -config.probe.distance,
                speed: config.probe.speed,
                sensor_id: SensorId::S0,
                threshold_pf: config.probe.capacitive_threshold_pf,
                log_readings: true,
            };
            let found = probe::capacitive_probe(&messenger, &scheduler, motion, &request).await?;
            println!(
                "stopped at {:.3} mm ({:?}) with threshold {} pF",
                found.result.position, found.result.outcome, found.threshold
            );
            messenger.stop().await;
        }
        Scenario::CapacitivePass => {
            let sensor = NodeBehavior { sensor_value: 3.0, sample_noise: 0.05, ..NodeBehavior::default() };
            let (messenger, _bus) = start(config, vec![
                (NodeId::GantryX, NodeBehavior::default()),
                (NodeId::PipetteLeft, sensor),
            ])?;
            let pass = CapacitivePass {
                tool: NodeId::PipetteLeft,
                mover: NodeId::GantryX,
                distance: 2.0,
                speed: 10.0,
                sensor_id: SensorId::S0,
            };
            let readings = probe::capacitive_pass(&messenger, &scheduler, motion, &pass).await?;
            println!("{} readings: {:.3?}", readings.len(), readings);
            messenger.stop().await;
        }
        Scenario::LiquidProbe => {
            let (messenger, _bus) = start(config, vec![
                (NodeId::HeadL, NodeBehavior::default()),
                (NodeId::PipetteLeft, NodeBehavior::tripping_after(Duration::from_millis(900))),
            ])?;
            let request = LiquidProbe {
                tool: NodeId::PipetteLeft,
                mount: NodeId::HeadL,
                pipette_distance: 5.0,
                pipette_speed: 2.5,
                mount_distance: -10.0,
                mount_speed: 5.0,
                sensor_id: SensorId::S0,
                threshold_pa: config.probe.pressure_threshold_pa,
            };
            for (node, result) in probe::liquid_probe(&messenger, &scheduler, motion, &request).await? {
                println!("{:<12} {:?} at {:.3} mm", node, result.outcome, result.position);
            }
            messenger.stop().await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = if let Some(ref path) = cli.config {
        match sluice_rs::config::load_config(&path.to_string_lossy()) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    let scenarios = match cli.command {
        Some(Commands::ListScenarios) => {
            for scenario in Scenario::value_variants() {
                if let Some(value) = scenario.to_possible_value() {
                    println!("{:<18} {}", value.get_name(), value.get_help().map(|h| h.to_string()).unwrap_or_default());
                }
            }
            return;
        }
        Some(Commands::Run { scenario: Some(scenario) }) => vec![scenario],
        Some(Commands::Run { scenario: None }) | None => Scenario::value_variants().to_vec(),
    };

    let mut failed = false;
    for scenario in scenarios {
        if let Err(e) = run_scenario(scenario, &config).await {
            eprintln!("Scenario {:?} failed: {e}", scenario);
            failed = true;
        }
    }
    if failed {
        std::process::exit(1);
    }
}
