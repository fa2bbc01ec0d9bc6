// src/motion/runner.rs - Prepare and execute move groups with a completion barrier
use super::MoveGroup;
use crate::bus::NodeId;
use crate::config::MotionConfig;
use crate::messages::fixed_point::from_fixed_point;
use crate::messages::{ExecuteMoveGroup, Message, MessageId, MoveAck, MoveCompleted};
use crate::messenger::{MessageFilter, MessageSender, Messenger, MessengerError, Subscription};
use futures::future::join_all;
use indexmap::{IndexMap, IndexSet};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MoveGroupError {
    #[error("Invalid move group: {0}")]
    InvalidGroup(String),
    #[error("{node} did not accept its move steps: {source}")]
    Setup {
        node: NodeId,
        #[source]
        source: MessengerError,
    },
    #[error("{node} did not complete group {group} in time; its position is unknown")]
    ExecutionTimeout { group: usize, node: NodeId },
    #[error("Execution cancelled during group {group}")]
    Cancelled { group: usize },
    #[error("Runner is {found}, expected {expected}")]
    InvalidState { expected: RunnerState, found: RunnerState },
    #[error("Messenger error: {0}")]
    Messenger(#[from] MessengerError),
}

/// Lifecycle of a [`MoveGroupRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Groups assembled, nothing sent.
    Built,
    /// Step parameters sent; once every node has acknowledged, ready to execute.
    Preparing,
    Running,
    Completed,
    Faulted,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a node's step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Ran the full commanded duration.
    Completed,
    /// This node's own stop condition tripped.
    Triggered,
    /// Stopped because a peer tripped the sync line.
    TriggeredByPeer,
    StoppedByHost,
    PositionError,
}

impl From<MoveAck> for MoveOutcome {
    fn from(ack: MoveAck) -> Self {
        match ack {
            MoveAck::CompletedWithoutCondition => MoveOutcome::Completed,
            MoveAck::StoppedByCondition => MoveOutcome::Triggered,
            MoveAck::StoppedBySync => MoveOutcome::TriggeredByPeer,
            MoveAck::StoppedByHost => MoveOutcome::StoppedByHost,
            MoveAck::PositionError => MoveOutcome::PositionError,
        }
    }
}

/// Final report for one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveResult {
    /// mm
    pub position: f64,
    pub elapsed: Duration,
    pub outcome: MoveOutcome,
    /// Reading of the sensor that ended the step, when the node reports one.
    pub sensor_value: Option<f64>,
}

impl MoveResult {
    pub fn stopped_early(&self) -> bool {
        matches!(
            self.outcome,
            MoveOutcome::Triggered | MoveOutcome::TriggeredByPeer | MoveOutcome::StoppedByHost
        )
    }
}

impl From<&MoveCompleted> for MoveResult {
    fn from(done: &MoveCompleted) -> Self {
        Self {
            position: done.position_um as f64 / 1000.0,
            elapsed: Duration::from_micros(done.elapsed_us as u64),
            outcome: done.ack.into(),
            sensor_value: done.sensor.map(from_fixed_point),
        }
    }
}

/// Sends stop requests to a group's nodes unless disarmed first.
///
/// `close` stops and waits; dropping it while armed spawns the stops instead.
struct StopGuard {
    sender: MessageSender,
    nodes: Vec<NodeId>,
    armed: bool,
}

impl StopGuard {
    fn new(sender: MessageSender, nodes: Vec<NodeId>) -> Self {
        Self { sender, nodes, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    async fn close(mut self) {
        self.armed = false;
        send_stops(&self.sender, &self.nodes).await;
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let sender = self.sender.clone();
        let nodes = std::mem::take(&mut self.nodes);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { send_stops(&sender, &nodes).await });
            }
            Err(_) => tracing::error!("No runtime to stop {:?}; nodes may still be moving", nodes),
        }
    }
}

async fn send_stops(sender: &MessageSender, nodes: &[NodeId]) {
    for node in nodes {
        if let Err(e) = sender.send(*node, Message::StopRequest).await {
            tracing::error!("Failed to stop {}: {}", node, e);
        }
    }
}

/// Marks the runner `Faulted` unless the phase it covers finishes, so a dropped
/// `prepare` or `execute` cannot leave it looking usable.
struct PhaseGuard<'a> {
    state: &'a mut RunnerState,
    finished: bool,
}

impl<'a> PhaseGuard<'a> {
    fn begin(state: &'a mut RunnerState, phase: RunnerState) -> Self {
        *state = phase;
        Self { state, finished: false }
    }

    fn finish(mut self, next: RunnerState) {
        *self.state = next;
        self.finished = true;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.state = RunnerState::Faulted;
        }
    }
}

enum GroupWait {
    Done,
    Failed(MoveGroupError),
    TimedOut,
    Cancelled,
}

/// Executes move groups strictly in order.
pub struct MoveGroupRunner {
    groups: Vec<MoveGroup>,
    config: MotionConfig,
    state: RunnerState,
}

impl MoveGroupRunner {
    pub fn new(groups: Vec<MoveGroup>) -> Self {
        Self::with_config(groups, MotionConfig::default())
    }

    pub fn with_config(groups: Vec<MoveGroup>, config: MotionConfig) -> Self {
        Self { groups, config, state: RunnerState::Built }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn groups(&self) -> &[MoveGroup] {
        &self.groups
    }

    /// Every node any group addresses, in first-use order.
    pub fn nodes(&self) -> Vec<NodeId> {
        let nodes: IndexSet<NodeId> = self.groups.iter().flat_map(|g| g.nodes()).collect();
        nodes.into_iter().collect()
    }

    /// Sum of the groups' nominal durations.
    pub fn nominal_duration(&self) -> Duration {
        self.groups.iter().map(|g| g.duration()).sum()
    }

    /// Clear old groups on every node, then load and acknowledge each node's steps.
    ///
    /// Nodes are loaded concurrently; each node's steps go out in group order. No motion
    /// starts here.
    pub async fn prepare(&mut self, messenger: &Messenger) -> Result<(), MoveGroupError> {
        if self.groups.len() > u8::MAX as usize + 1 {
            return Err(MoveGroupError::InvalidGroup(format!("{} groups exceed the node limit", self.groups.len())));
        }
        let mut per_node: IndexMap<NodeId, Vec<Message>> = IndexMap::new();
        for (index, group) in self.groups.iter().enumerate() {
            for (node, step) in group.iter() {
                let add = step.to_wire(index as u8, 0)?;
                per_node.entry(node).or_default().push(Message::AddMoveRequest(add));
            }
        }

        let phase = PhaseGuard::begin(&mut self.state, RunnerState::Preparing);
        tracing::info!("Preparing {} move groups on {} nodes", self.groups.len(), per_node.len());
        messenger.send(NodeId::Broadcast, Message::ClearAllMoveGroupsRequest).await?;

        let timeout = self.config.setup_timeout();
        let loads = per_node.into_iter().map(|(node, messages)| async move {
            for message in messages {
                messenger
                    .send_and_wait(node, message, &[MessageId::Ack], timeout)
                    .await
                    .map_err(|source| MoveGroupError::Setup { node, source })?;
            }
            Ok::<(), MoveGroupError>(())
        });
        for result in join_all(loads).await {
            if let Err(e) = result {
                tracing::error!("Move setup failed: {}", e);
                return Err(e);
            }
        }
        phase.finish(RunnerState::Preparing);
        Ok(())
    }

    /// Trigger the prepared groups one by one and collect each node's final report.
    pub async fn execute(&mut self, messenger: &Messenger) -> Result<IndexMap<NodeId, MoveResult>, MoveGroupError> {
        self.execute_until(messenger, std::future::pending()).await
    }

    /// Like [`execute`](Self::execute), but abandons the run when `cancel` resolves.
    ///
    /// On cancellation or timeout every node of the in-progress group is sent a stop
    /// before the error is returned.
    pub async fn execute_until<F>(
        &mut self,
        messenger: &Messenger,
        cancel: F,
    ) -> Result<IndexMap<NodeId, MoveResult>, MoveGroupError>
    where
        F: Future<Output = ()>,
    {
        if self.state != RunnerState::Preparing {
            return Err(MoveGroupError::InvalidState { expected: RunnerState::Preparing, found: self.state });
        }
        let phase = PhaseGuard::begin(&mut self.state, RunnerState::Running);
        tokio::pin!(cancel);

        let mut results = IndexMap::new();
        for (index, group) in self.groups.iter().enumerate() {
            let nodes: Vec<NodeId> = group.nodes().collect();
            let mut completions = messenger.subscribe(MessageFilter::kinds(&[MessageId::MoveCompleted]));
            let guard = StopGuard::new(messenger.sender(), nodes.clone());

            tracing::debug!("Starting group {} on {:?} for {:?}", index, nodes, group.duration());
            let trigger = Message::ExecuteMoveGroupRequest(ExecuteMoveGroup { group: index as u8, nodes: nodes.clone() });
            if let Err(e) = messenger.send(NodeId::Broadcast, trigger).await {
                guard.close().await;
                return Err(e.into());
            }

            let mut pending = nodes;
            let timeout = self.config.execution_timeout(group.duration());
            let outcome = tokio::select! {
                biased;
                _ = &mut cancel => GroupWait::Cancelled,
                waited = tokio::time::timeout(
                    timeout,
                    wait_for_group(&mut completions, index as u8, &mut pending, &mut results),
                ) => match waited {
                    Ok(Ok(())) => GroupWait::Done,
                    Ok(Err(e)) => GroupWait::Failed(e),
                    Err(_) => GroupWait::TimedOut,
                },
            };

            let error = match outcome {
                GroupWait::Done => {
                    guard.disarm();
                    continue;
                }
                GroupWait::Cancelled => {
                    tracing::warn!("Cancelling group {}; stopping {:?}", index, group.nodes().collect::<Vec<_>>());
                    MoveGroupError::Cancelled { group: index }
                }
                GroupWait::TimedOut => {
                    let node = pending.first().copied().unwrap_or(group.primary());
                    tracing::error!("Group {} timed out after {:?} waiting for {:?}", index, timeout, pending);
                    MoveGroupError::ExecutionTimeout { group: index, node }
                }
                GroupWait::Failed(e) => e,
            };
            guard.close().await;
            return Err(error);
        }

        phase.finish(RunnerState::Completed);
        Ok(results)
    }

    /// `prepare` followed by `execute`.
    pub async fn run(&mut self, messenger: &Messenger) -> Result<IndexMap<NodeId, MoveResult>, MoveGroupError> {
        self.prepare(messenger).await?;
        self.execute(messenger).await
    }
}

async fn wait_for_group(
    completions: &mut Subscription,
    group: u8,
    pending: &mut Vec<NodeId>,
    results: &mut IndexMap<NodeId, MoveResult>,
) -> Result<(), MoveGroupError> {
    while !pending.is_empty() {
        let received = completions.recv().await.ok_or(MessengerError::NotRunning)?;
        let Message::MoveCompleted(done) = &received.message else {
            continue;
        };
        let Some(slot) = pending.iter().position(|n| *n == received.node) else {
            tracing::debug!("Ignoring completion from {} outside group {}", received.node, group);
            continue;
        };
        if done.group != group {
            tracing::debug!("Ignoring stale completion of group {} from {}", done.group, received.node);
            continue;
        }
        pending.remove(slot);
        let result = MoveResult::from(done);
        if result.outcome == MoveOutcome::PositionError {
            tracing::warn!("{} reported a position error in group {}", received.node, group);
        }
        tracing::debug!("{} finished group {}: {:?}", received.node, group, result);
        results.insert(received.node, result);
    }
    Ok(())
}
