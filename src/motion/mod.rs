// src/motion/mod.rs - Move steps and move groups
//
// Duration is the scheduling unit. Distance is derived as velocity x duration, and every
// step in a group is commanded for the primary mover's duration so the whole group
// starts and finishes together.
pub mod runner;

pub use crate::messages::{MoveStopCondition, TipActionType};
pub use runner::{MoveGroupError, MoveGroupRunner, MoveOutcome, MoveResult, RunnerState};

use crate::bus::NodeId;
use crate::messages::AddMove;
use crate::messages::fixed_point::to_fixed_point;
use indexmap::IndexMap;
use std::time::Duration;

/// Allowed difference between a step's duration and the primary mover's.
pub const DURATION_TOLERANCE: Duration = Duration::from_micros(1);

/// One node's motion within a group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveStep {
    /// mm/s; the sign is the direction.
    pub velocity: f64,
    pub duration: Duration,
    /// mm/s^2
    pub acceleration: Option<f64>,
    pub stop_condition: MoveStopCondition,
    pub action: TipActionType,
}

/// Signed velocity for travelling `distance` at `speed`: sgn(distance) * speed, with a
/// zero distance counting as positive.
fn directed_velocity(distance: f64, speed: f64) -> f64 {
    if distance < 0.0 { -speed } else { speed }
}

fn duration_for(distance: f64, speed: f64) -> Result<Duration, MoveGroupError> {
    if speed == 0.0 || !speed.is_finite() || !distance.is_finite() {
        return Err(MoveGroupError::InvalidGroup(format!(
            "cannot move {} mm at {} mm/s",
            distance, speed
        )));
    }
    Duration::try_from_secs_f64((distance / speed).abs())
        .map_err(|e| MoveGroupError::InvalidGroup(format!("bad step duration: {}", e)))
}

impl MoveStep {
    pub fn new(velocity: f64, duration: Duration) -> Self {
        Self {
            velocity,
            duration,
            acceleration: None,
            stop_condition: MoveStopCondition::None,
            action: TipActionType::None,
        }
    }

    /// Travel `distance` at `speed`. The direction is sgn(distance) * sgn(speed), so either
    /// sign can be negated to reverse it.
    pub fn linear(distance: f64, speed: f64) -> Result<Self, MoveGroupError> {
        let duration = duration_for(distance, speed)?;
        Ok(Self::new(directed_velocity(distance, speed), duration))
    }

    /// Move toward home until the limit switch trips, for at most `distance`.
    pub fn home(distance: f64, speed: f64) -> Result<Self, MoveGroupError> {
        let duration = duration_for(distance, speed)?;
        Ok(Self::new(-speed.abs(), duration).with_stop_condition(MoveStopCondition::LimitSwitch))
    }

    /// Drive the tip mechanism of a pipette.
    pub fn tip_action(distance: f64, speed: f64, action: TipActionType) -> Result<Self, MoveGroupError> {
        let mut step = Self::linear(distance, speed)?;
        step.action = action;
        Ok(step)
    }

    pub fn with_stop_condition(mut self, stop_condition: MoveStopCondition) -> Self {
        self.stop_condition = stop_condition;
        self
    }

    pub fn with_acceleration(mut self, acceleration: f64) -> Self {
        self.acceleration = Some(acceleration);
        self
    }

    pub fn distance(&self) -> f64 {
        self.velocity * self.duration.as_secs_f64()
    }

    pub(crate) fn to_wire(&self, group: u8, seq: u8) -> Result<AddMove, MoveGroupError> {
        let duration_us = u32::try_from(self.duration.as_micros()).map_err(|_| {
            MoveGroupError::InvalidGroup(format!("step of {:?} is too long to command", self.duration))
        })?;
        let fixed = |value: f64, what: &str| {
            to_fixed_point(value)
                .ok_or_else(|| MoveGroupError::InvalidGroup(format!("{} {} is out of range", what, value)))
        };
        Ok(AddMove {
            group,
            seq,
            duration_us,
            velocity: fixed(self.velocity, "velocity")?,
            acceleration: fixed(self.acceleration.unwrap_or(0.0), "acceleration")?,
            stop_condition: self.stop_condition,
            action: self.action,
        })
    }
}

/// Steps dispatched together and expected to finish at the same instant.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveGroup {
    steps: IndexMap<NodeId, MoveStep>,
    primary: NodeId,
}

impl MoveGroup {
    /// Build a group, checking every step against the primary mover's duration.
    pub fn new(primary: NodeId, steps: IndexMap<NodeId, MoveStep>) -> Result<Self, MoveGroupError> {
        if steps.is_empty() {
            return Err(MoveGroupError::InvalidGroup("group has no steps".to_string()));
        }
        if let Some(node) = steps.keys().find(|n| matches!(n, NodeId::Broadcast | NodeId::Host)) {
            return Err(MoveGroupError::InvalidGroup(format!("{} cannot carry a move step", node)));
        }
        let nominal = steps
            .get(&primary)
            .ok_or_else(|| MoveGroupError::InvalidGroup(format!("primary mover {} has no step", primary)))?
            .duration;
        for (node, step) in &steps {
            if step.duration.abs_diff(nominal) > DURATION_TOLERANCE {
                return Err(MoveGroupError::InvalidGroup(format!(
                    "{} is commanded for {:?} but primary mover {} for {:?}",
                    node, step.duration, primary, nominal
                )));
            }
        }
        Ok(Self { steps, primary })
    }

    /// Group whose primary mover is the first step.
    pub fn from_steps(steps: impl IntoIterator<Item = (NodeId, MoveStep)>) -> Result<Self, MoveGroupError> {
        let steps: IndexMap<NodeId, MoveStep> = steps.into_iter().collect();
        let primary = steps
            .keys()
            .next()
            .copied()
            .ok_or_else(|| MoveGroupError::InvalidGroup("group has no steps".to_string()))?;
        Self::new(primary, steps)
    }

    pub fn single(node: NodeId, step: MoveStep) -> Result<Self, MoveGroupError> {
        Self::from_steps([(node, step)])
    }

    /// A pass of `(node, distance, speed)` movers that all stop on the sync line.
    ///
    /// When a pipette is among the movers the mount axis sets the duration, otherwise the
    /// first mover does. Other movers keep their speed and direction, sgn(distance) *
    /// sgn(speed) as for [`MoveStep::linear`], and are commanded for the same duration.
    pub fn pass(movers: &[(NodeId, f64, f64)], stop_condition: MoveStopCondition) -> Result<Self, MoveGroupError> {
        let has_pipette = movers.iter().any(|(node, _, _)| node.is_pipette());
        let primary = if has_pipette {
            movers.iter().find(|(node, _, _)| node.is_mount())
        } else {
            movers.first()
        };
        let &(primary, distance, speed) = primary
            .ok_or_else(|| MoveGroupError::InvalidGroup("pass has no primary mover".to_string()))?;
        let duration = duration_for(distance, speed)?;
        let steps = movers
            .iter()
            .map(|&(node, distance, speed)| {
                let step = MoveStep::new(directed_velocity(distance, speed), duration)
                    .with_stop_condition(stop_condition);
                (node, step)
            })
            .collect();
        Self::new(primary, steps)
    }

    /// Home every `(node, max_distance, speed)` axis, all commanded for the longest duration.
    pub fn home(axes: &[(NodeId, f64, f64)]) -> Result<Self, MoveGroupError> {
        let mut longest: Option<(NodeId, Duration)> = None;
        for &(node, distance, speed) in axes {
            let duration = duration_for(distance, speed)?;
            if longest.is_none_or(|(_, d)| duration > d) {
                longest = Some((node, duration));
            }
        }
        let (primary, duration) =
            longest.ok_or_else(|| MoveGroupError::InvalidGroup("nothing to home".to_string()))?;
        let steps = axes
            .iter()
            .map(|&(node, _, speed)| {
                let step = MoveStep::new(-speed.abs(), duration)
                    .with_stop_condition(MoveStopCondition::LimitSwitch);
                (node, step)
            })
            .collect();
        Self::new(primary, steps)
    }

    pub fn primary(&self) -> NodeId {
        self.primary
    }

    /// Nominal duration of the group, taken from the primary mover.
    pub fn duration(&self) -> Duration {
        self.steps.get(&self.primary).map(|s| s.duration).unwrap_or_default()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.steps.keys().copied()
    }

    pub fn get(&self, node: NodeId) -> Option<&MoveStep> {
        self.steps.get(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &MoveStep)> {
        self.steps.iter().map(|(node, step)| (*node, step))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
