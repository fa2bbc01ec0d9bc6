// src/probe.rs - Sensor-limited moves built from move groups and sensor bindings
use crate::bus::NodeId;
use crate::config::MotionConfig;
use crate::messenger::Messenger;
use crate::motion::{MoveGroup, MoveGroupError, MoveGroupRunner, MoveResult, MoveStopCondition};
use crate::sensors::{
    SensorDataType, SensorError, SensorId, SensorInformation, SensorScheduler, SensorThresholdInformation,
    SensorThresholdMode, SensorType,
};
use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Probe motion failed: {0}")]
    Motion(#[from] MoveGroupError),
    #[error("Probe sensor failed: {0}")]
    Sensor(#[from] SensorError),
    #[error("No completion reported for {node}")]
    MissingResult { node: NodeId },
}

/// Lower the mount and move the plunger until the pressure sensor trips.
#[derive(Debug, Clone)]
pub struct LiquidProbe {
    pub tool: NodeId,
    pub mount: NodeId,
    pub pipette_distance: f64,
    pub pipette_speed: f64,
    pub mount_distance: f64,
    pub mount_speed: f64,
    pub sensor_id: SensorId,
    pub threshold_pa: f64,
}

/// Move `mover` until the capacitive sensor on `tool` trips.
///
/// The direction is sgn(distance) * sgn(speed), so negating either reverses it.
#[derive(Debug, Clone)]
pub struct CapacitiveProbe {
    pub tool: NodeId,
    pub mover: NodeId,
    pub distance: f64,
    pub speed: f64,
    pub sensor_id: SensorId,
    pub threshold_pf: f64,
    pub log_readings: bool,
}

/// Result of a capacitive probe: where the mover stopped and the threshold the node armed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacitiveProbeResult {
    pub result: MoveResult,
    pub threshold: f64,
}

pub async fn liquid_probe(
    messenger: &Messenger,
    scheduler: &SensorScheduler,
    motion: &MotionConfig,
    probe: &LiquidProbe,
) -> Result<IndexMap<NodeId, MoveResult>, ProbeError> {
    let sensor = SensorInformation::new(SensorType::Pressure, probe.sensor_id, probe.tool);
    let threshold = SensorThresholdInformation::new(
        sensor,
        SensorDataType::from_float(probe.threshold_pa)?,
        SensorThresholdMode::Absolute,
    );
    let group = MoveGroup::pass(
        &[
            (probe.mount, probe.mount_distance, probe.mount_speed),
            (probe.tool, probe.pipette_distance, probe.pipette_speed),
        ],
        MoveStopCondition::SyncLine,
    )?;
    let mut runner = MoveGroupRunner::with_config(vec![group], motion.clone());

    scheduler.send_threshold(&threshold, messenger).await?;
    let binding = scheduler.bind_output(messenger, &sensor).await?;
    let moved = runner.run(messenger).await;
    let closed = binding.close().await;
    let positions = moved?;
    closed?;
    Ok(positions)
}

pub async fn capacitive_probe(
    messenger: &Messenger,
    scheduler: &SensorScheduler,
    motion: &MotionConfig,
    probe: &CapacitiveProbe,
) -> Result<CapacitiveProbeResult, ProbeError> {
    let sensor = SensorInformation::new(SensorType::Capacitive, probe.sensor_id, probe.tool);
    let threshold = scheduler
        .send_threshold(
            &SensorThresholdInformation::new(
                sensor,
                SensorDataType::from_float(probe.threshold_pf)?,
                SensorThresholdMode::AutoBaseline,
            ),
            messenger,
        )
        .await?;
    tracing::info!("Starting capacitive probe with threshold {}", threshold.to_float());

    let group = MoveGroup::pass(&[(probe.mover, probe.distance, probe.speed)], MoveStopCondition::SyncLine)?;
    let mut runner = MoveGroupRunner::with_config(vec![group], motion.clone());
    let binding = scheduler.bind_sync(&sensor, messenger, probe.log_readings).await?;
    let moved = runner.run(messenger).await;
    let closed = binding.close().await;
    let mut positions = moved?;
    closed?;

    let result = positions
        .swap_remove(&probe.mover)
        .ok_or(ProbeError::MissingResult { node: probe.mover })?;
    Ok(CapacitiveProbeResult { result, threshold: threshold.to_float() })
}

/// Move `mover` while streaming the capacitive sensor on `tool`.
#[derive(Debug, Clone)]
pub struct CapacitivePass {
    pub tool: NodeId,
    pub mover: NodeId,
    pub distance: f64,
    pub speed: f64,
    pub sensor_id: SensorId,
}

/// Returns the readings captured during the pass, oldest first.
pub async fn capacitive_pass(
    messenger: &Messenger,
    scheduler: &SensorScheduler,
    motion: &MotionConfig,
    pass: &CapacitivePass,
) -> Result<Vec<f64>, ProbeError> {
    let sensor = SensorInformation::new(SensorType::Capacitive, pass.sensor_id, pass.tool);
    let group = MoveGroup::pass(&[(pass.mover, pass.distance, pass.speed)], MoveStopCondition::SyncLine)?;
    let mut runner = MoveGroupRunner::with_config(vec![group], motion.clone());
    runner.prepare(messenger).await?;

    let capture = scheduler.capture_output(&sensor, messenger).await?;
    let moved = runner.execute(messenger).await;
    let closed = capture.close().await;
    moved?;
    let mut samples = closed?;
    let readings: Vec<f64> = samples.drain().collect();
    tracing::info!("Captured {} readings from {}", readings.len(), sensor);
    Ok(readings)
}
