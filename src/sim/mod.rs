//! In-process node simulator.
//!
//! Each simulated node is a task that speaks the same envelopes as real firmware over a
//! [`sim_link`](crate::bus::sim::sim_link). All nodes share one sync line: the first node
//! to trip asserts it and every other moving node stops. The router clears the line
//! whenever it forwards a group trigger.
//!
//! Timing uses `tokio::time`, so tests can run the simulator on a paused clock.

use crate::bus::NodeId;
use crate::bus::sim::{SimLink, SimTransport, sim_link};
use crate::messages::fixed_point::{from_fixed_point, to_fixed_point};
use crate::messages::{
    AddMove, DeviceInfo, Envelope, ExecuteMoveGroup, Message, MessageId, MotorCurrent, MoveAck, MoveCompleted,
    MoveStopCondition, SensorId, SensorOutputBinding, SensorReading, SensorThreshold, SensorType,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

/// `ack_failed` code for a threshold outside the sensor's range.
pub const THRESHOLD_OUT_OF_RANGE: u16 = 1;

/// How a simulated node behaves, including injected faults.
#[derive(Debug, Clone)]
pub struct NodeBehavior {
    /// Acknowledge move steps. When false the node stays silent during setup.
    pub ack_setup: bool,
    /// Report move completion. When false moves run but never report.
    pub complete: bool,
    /// Time into a triggered group at which this node's stop condition or bound sensor trips.
    pub trip_after: Option<Duration>,
    /// First streamed reading, and the reading reported when the sensor trips.
    pub sensor_value: f64,
    /// Increment between successive streamed readings. Streaming runs while the sensor
    /// is bound with `REPORT`, whether or not the node is moving.
    pub sample_step: f64,
    /// Uniform noise amplitude added to streamed readings.
    pub sample_noise: f64,
    pub sample_interval: Duration,
    /// Accepted thresholds are rounded to a multiple of this.
    pub threshold_step: f64,
    /// Thresholds with a larger magnitude are rejected.
    pub max_threshold: f64,
    pub accept_bootloader: bool,
    pub start_position_mm: f64,
}

impl Default for NodeBehavior {
    fn default() -> Self {
        Self {
            ack_setup: true,
            complete: true,
            trip_after: None,
            sensor_value: 0.0,
            sample_step: 0.25,
            sample_noise: 0.0,
            sample_interval: Duration::from_millis(10),
            threshold_step: 0.0,
            max_threshold: 1000.0,
            accept_bootloader: true,
            start_position_mm: 0.0,
        }
    }
}

impl NodeBehavior {
    pub fn tripping_after(trip_after: Duration) -> Self {
        Self { trip_after: Some(trip_after), ..Self::default() }
    }

    pub fn silent_setup() -> Self {
        Self { ack_setup: false, ..Self::default() }
    }

    pub fn never_completes() -> Self {
        Self { complete: false, ..Self::default() }
    }
}

/// What a test or the harness can observe about a node.
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    pub received: Vec<Message>,
    pub position_um: i32,
    pub motor_current: Option<MotorCurrent>,
    pub binding: SensorOutputBinding,
    pub threshold: Option<SensorThreshold>,
}

type SharedState = Arc<Mutex<NodeState>>;
type SyncLine = Arc<watch::Sender<Option<NodeId>>>;

fn lock(state: &SharedState) -> MutexGuard<'_, NodeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ActiveMove {
    group: u8,
    step: AddMove,
    started: Instant,
    deadline: Instant,
    trip_at: Option<Instant>,
}

struct Sampling {
    next: Instant,
    count: u32,
}

struct SimNode {
    id: NodeId,
    behavior: NodeBehavior,
    inbox: mpsc::UnboundedReceiver<(NodeId, Envelope)>,
    outbox: mpsc::UnboundedSender<(NodeId, Vec<u8>)>,
    sync: SyncLine,
    sync_rx: watch::Receiver<Option<NodeId>>,
    state: SharedState,
    groups: HashMap<u8, AddMove>,
    bound: Option<(SensorType, SensorId)>,
    active: Option<ActiveMove>,
    sensor_trip_at: Option<Instant>,
    sampling: Option<Sampling>,
    position_mm: f64,
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

impl SimNode {
    async fn run(mut self) {
        loop {
            let moving = self.active.is_some();
            let deadline = self.active.as_ref().map(|m| m.deadline);
            let trip_at = self.active.as_ref().and_then(|m| m.trip_at);
            let sample_at = self.sampling.as_ref().map(|s| s.next);
            let sensor_trip_at = self.sensor_trip_at;

            tokio::select! {
                biased;
                incoming = self.inbox.recv() => match incoming {
                    Some((dest, envelope)) => self.handle(dest, envelope),
                    None => break,
                },
                changed = self.sync_rx.changed(), if moving => {
                    let asserted = *self.sync_rx.borrow_and_update();
                    if changed.is_ok() && asserted.is_some_and(|by| by != self.id) {
                        self.finish(MoveAck::StoppedBySync);
                    }
                }
                _ = sleep_until(trip_at.unwrap_or_else(far_future)), if trip_at.is_some() => {
                    let own_sync = self
                        .active
                        .as_ref()
                        .is_some_and(|m| m.step.stop_condition == MoveStopCondition::SyncLine);
                    if own_sync {
                        self.assert_sync();
                    }
                    self.finish(MoveAck::StoppedByCondition);
                }
                _ = sleep_until(sensor_trip_at.unwrap_or_else(far_future)), if sensor_trip_at.is_some() => {
                    self.sensor_trip_at = None;
                    self.assert_sync();
                }
                _ = sleep_until(sample_at.unwrap_or_else(far_future)), if sample_at.is_some() => {
                    self.emit_sample();
                }
                _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    self.finish(MoveAck::CompletedWithoutCondition);
                }
            }
        }
    }

    fn reply(&self, index: u16, message: Message) {
        let _ = self.outbox.send((self.id, Envelope::new(index, message).encode()));
    }

    fn handle(&mut self, dest: NodeId, envelope: Envelope) {
        lock(&self.state).received.push(envelope.message.clone());
        let direct = dest != NodeId::Broadcast;
        let index = envelope.index;
        match envelope.message {
            Message::Echo(bytes) => self.reply(index, Message::Echo(bytes)),
            Message::DeviceInfoRequest => {
                let info = DeviceInfo { version: 1, flags: 0, shortsha: *b"sim0001\0" };
                self.reply(index, Message::DeviceInfoResponse(info));
            }
            Message::EnterBootloaderRequest => {
                let accepted = self.behavior.accept_bootloader;
                self.reply(index, Message::EnterBootloaderResponse { accepted });
            }
            Message::WriteMotorCurrentRequest(current) => {
                lock(&self.state).motor_current = Some(current);
            }
            Message::ClearAllMoveGroupsRequest => {
                self.groups.clear();
                if direct {
                    self.reply(index, Message::Ack);
                }
            }
            Message::AddMoveRequest(step) => {
                if self.behavior.ack_setup {
                    self.groups.insert(step.group, step);
                    self.reply(index, Message::Ack);
                } else {
                    tracing::debug!("{} ignoring setup for group {}", self.id, step.group);
                }
            }
            Message::ExecuteMoveGroupRequest(execute) => self.start(execute),
            Message::StopRequest => {
                self.sensor_trip_at = None;
                if self.active.is_some() {
                    self.finish(MoveAck::StoppedByHost);
                }
            }
            Message::SetSensorThresholdRequest(request) => self.set_threshold(index, request),
            Message::BindSensorOutputRequest(bind) => {
                if bind.binding.is_none() {
                    self.bound = None;
                    self.sensor_trip_at = None;
                } else {
                    self.bound = Some((bind.sensor_type, bind.sensor_id));
                }
                self.sampling = bind.binding.contains(SensorOutputBinding::REPORT).then(|| Sampling {
                    next: Instant::now() + self.behavior.sample_interval,
                    count: 0,
                });
                lock(&self.state).binding = bind.binding;
                if direct {
                    self.reply(index, Message::Ack);
                }
            }
            other => tracing::debug!("{} ignoring {}", self.id, other.id()),
        }
    }

    fn set_threshold(&mut self, index: u16, request: SensorThreshold) {
        let requested = from_fixed_point(request.threshold);
        if requested.abs() > self.behavior.max_threshold {
            self.reply(index, Message::AckFailed { code: THRESHOLD_OUT_OF_RANGE });
            return;
        }
        let step = self.behavior.threshold_step;
        let quantized = if step > 0.0 { (requested / step).round() * step } else { requested };
        let Some(threshold) = to_fixed_point(quantized) else {
            self.reply(index, Message::AckFailed { code: THRESHOLD_OUT_OF_RANGE });
            return;
        };
        let accepted = SensorThreshold { threshold, ..request };
        lock(&self.state).threshold = Some(accepted);
        self.reply(index, Message::SensorThresholdResponse(accepted));
    }

    fn binding(&self) -> SensorOutputBinding {
        lock(&self.state).binding
    }

    fn start(&mut self, execute: ExecuteMoveGroup) {
        let now = Instant::now();
        // Reset by the router before this trigger was delivered.
        self.sync_rx.borrow_and_update();
        if !execute.nodes.contains(&self.id) {
            if self.binding().contains(SensorOutputBinding::SYNC) {
                self.sensor_trip_at = self.behavior.trip_after.map(|t| now + t);
            }
            return;
        }
        let Some(step) = self.groups.get(&execute.group).copied() else {
            tracing::warn!("{} has no step for group {}", self.id, execute.group);
            return;
        };
        let duration = Duration::from_micros(step.duration_us as u64);
        let trip_at = self
            .behavior
            .trip_after
            .filter(|t| *t < duration && step.stop_condition != MoveStopCondition::None)
            .map(|t| now + t);
        self.active = Some(ActiveMove {
            group: execute.group,
            step,
            started: now,
            deadline: now + duration,
            trip_at,
        });
        tracing::debug!("{} started group {} for {:?}", self.id, execute.group, duration);
    }

    fn assert_sync(&self) {
        let id = self.id;
        let asserted = self.sync.send_if_modified(|line| {
            if line.is_none() {
                *line = Some(id);
                true
            } else {
                false
            }
        });
        if asserted {
            tracing::debug!("{} asserted the sync line", id);
        }
    }

    fn emit_sample(&mut self) {
        let Some((sensor_type, sensor_id)) = self.bound else {
            self.sampling = None;
            return;
        };
        let Some(sampling) = self.sampling.as_mut() else {
            return;
        };
        let noise = self.behavior.sample_noise;
        let mut reading = self.behavior.sensor_value + sampling.count as f64 * self.behavior.sample_step;
        if noise > 0.0 {
            reading += rand::random_range(-noise..noise);
        }
        sampling.count += 1;
        sampling.next += self.behavior.sample_interval;
        let Some(raw) = to_fixed_point(reading) else {
            return;
        };
        let reading = SensorReading { sensor_type, sensor_id, value: raw };
        self.reply(0, Message::ReadSensorResponse(reading));
    }

    fn finish(&mut self, ack: MoveAck) {
        let Some(active) = self.active.take() else {
            return;
        };
        let elapsed = Instant::now().saturating_duration_since(active.started).min(active.deadline - active.started);
        self.position_mm += from_fixed_point(active.step.velocity) * elapsed.as_secs_f64();
        let position_um = (self.position_mm * 1000.0).round() as i32;
        let sensor = match ack {
            MoveAck::StoppedByCondition => lock(&self.state)
                .threshold
                .map(|t| t.threshold)
                .or_else(|| to_fixed_point(self.behavior.sensor_value)),
            _ => None,
        };
        lock(&self.state).position_um = position_um;
        tracing::debug!("{} finished group {} with {:?} after {:?}", self.id, active.group, ack, elapsed);
        if !self.behavior.complete {
            return;
        }
        let done = MoveCompleted {
            group: active.group,
            seq: active.step.seq,
            position_um,
            elapsed_us: elapsed.as_micros() as u32,
            ack,
            sensor,
        };
        self.reply(0, Message::MoveCompleted(done));
    }
}

/// A running set of simulated nodes behind a [`SimTransport`].
pub struct SimBus {
    nodes: IndexMap<NodeId, SharedState>,
    link: SimLink,
    sync: SyncLine,
    tasks: Vec<JoinHandle<()>>,
}

impl SimBus {
    /// Spawn the given nodes and return the host transport connected to them.
    pub fn spawn(nodes: impl IntoIterator<Item = (NodeId, NodeBehavior)>) -> (SimTransport, SimBus) {
        let (transport, end) = sim_link();
        let (sync_tx, _) = watch::channel(None);
        let sync: SyncLine = Arc::new(sync_tx);

        let mut states = IndexMap::new();
        let mut inboxes = IndexMap::new();
        let mut tasks = Vec::new();
        for (id, behavior) in nodes {
            let (inbox_tx, inbox) = mpsc::unbounded_channel();
            let state = Arc::new(Mutex::new(NodeState {
                position_um: (behavior.start_position_mm * 1000.0).round() as i32,
                ..NodeState::default()
            }));
            let node = SimNode {
                id,
                position_mm: behavior.start_position_mm,
                behavior,
                inbox,
                outbox: end.to_host.clone(),
                sync: sync.clone(),
                sync_rx: sync.subscribe(),
                state: state.clone(),
                groups: HashMap::new(),
                bound: None,
                active: None,
                sensor_trip_at: None,
                sampling: None,
            };
            tasks.push(tokio::spawn(node.run()));
            states.insert(id, state);
            inboxes.insert(id, inbox_tx);
        }

        let router_sync = sync.clone();
        let mut from_host = end.from_host;
        tasks.push(tokio::spawn(async move {
            while let Some((dest, frame)) = from_host.recv().await {
                let envelope = match Envelope::decode(&frame) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!("Simulated bus dropped a frame for {}: {}", dest, e);
                        continue;
                    }
                };
                if envelope.message.id() == MessageId::ExecuteMoveGroupRequest {
                    router_sync.send_replace(None);
                }
                if dest == NodeId::Broadcast {
                    for inbox in inboxes.values() {
                        let _ = inbox.send((dest, envelope.clone()));
                    }
                } else if let Some(inbox) = inboxes.get(&dest) {
                    let _ = inbox.send((dest, envelope));
                } else {
                    tracing::debug!("No simulated node at {}", dest);
                }
            }
        }));

        tracing::info!("Simulated bus started with {} nodes", states.len());
        (transport, SimBus { nodes: states, link: end.link, sync, tasks })
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn state(&self, node: NodeId) -> Option<NodeState> {
        self.nodes.get(&node).map(|state| lock(state).clone())
    }

    /// Every message `node` has received, oldest first.
    pub fn received(&self, node: NodeId) -> Vec<Message> {
        self.state(node).map(|s| s.received).unwrap_or_default()
    }

    pub fn received_kinds(&self, node: NodeId) -> Vec<MessageId> {
        self.received(node).iter().map(Message::id).collect()
    }

    /// Position in mm as the node last reported it.
    pub fn position(&self, node: NodeId) -> Option<f64> {
        self.state(node).map(|s| s.position_um as f64 / 1000.0)
    }

    pub fn sync_asserted_by(&self) -> Option<NodeId> {
        *self.sync.borrow()
    }

    /// Cut the link; host sends and receives fail from now on.
    pub fn disconnect(&self) {
        self.link.disconnect();
    }
}

impl Drop for SimBus {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Transport;

    async fn request(transport: &SimTransport, node: NodeId, index: u16, message: Message) -> (NodeId, Message) {
        transport.send(node, &Envelope::new(index, message).encode()).await.unwrap();
        let (from, frame) = transport.recv().await.unwrap();
        (from, Envelope::decode(&frame).unwrap().message)
    }

    #[tokio::test]
    async fn test_node_answers_device_info_and_echo() {
        let (transport, bus) = SimBus::spawn([(NodeId::GantryX, NodeBehavior::default())]);
        let (from, reply) = request(&transport, NodeId::GantryX, 1, Message::DeviceInfoRequest).await;
        assert_eq!(from, NodeId::GantryX);
        assert!(matches!(reply, Message::DeviceInfoResponse(DeviceInfo { version: 1, .. })));
        let (_, reply) = request(&transport, NodeId::GantryX, 2, Message::Echo(vec![4, 2])).await;
        assert_eq!(reply, Message::Echo(vec![4, 2]));
        assert_eq!(bus.received_kinds(NodeId::GantryX), vec![MessageId::DeviceInfoRequest, MessageId::Echo]);
    }

    #[tokio::test]
    async fn test_threshold_is_quantized_or_rejected() {
        let behavior = NodeBehavior { threshold_step: 0.5, max_threshold: 10.0, ..NodeBehavior::default() };
        let (transport, _bus) = SimBus::spawn([(NodeId::PipetteLeft, behavior)]);
        let request_for = |value: f64| {
            Message::SetSensorThresholdRequest(SensorThreshold {
                sensor_type: SensorType::Capacitive,
                sensor_id: SensorId::S0,
                threshold: to_fixed_point(value).unwrap(),
                mode: crate::messages::SensorThresholdMode::Absolute,
            })
        };
        let (_, reply) = request(&transport, NodeId::PipetteLeft, 1, request_for(1.3)).await;
        match reply {
            Message::SensorThresholdResponse(t) => assert_eq!(from_fixed_point(t.threshold), 1.5),
            other => panic!("unexpected reply {:?}", other),
        }
        let (_, reply) = request(&transport, NodeId::PipetteLeft, 2, request_for(20.0)).await;
        assert_eq!(reply, Message::AckFailed { code: THRESHOLD_OUT_OF_RANGE });
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_node() {
        let (transport, bus) = SimBus::spawn([
            (NodeId::GantryX, NodeBehavior::default()),
            (NodeId::GantryY, NodeBehavior::default()),
        ]);
        transport
            .send(NodeId::Broadcast, &Envelope::unsolicited(Message::ClearAllMoveGroupsRequest).encode())
            .await
            .unwrap();
        transport.send(NodeId::GantryY, &Envelope::new(5, Message::Echo(vec![])).encode()).await.unwrap();
        // The echo is handled after the broadcast on GantryY.
        let _ = transport.recv().await.unwrap();
        assert_eq!(bus.received_kinds(NodeId::GantryY)[0], MessageId::ClearAllMoveGroupsRequest);
        tokio::task::yield_now().await;
        assert!(bus.received_kinds(NodeId::GantryX).contains(&MessageId::ClearAllMoveGroupsRequest));
    }
}
