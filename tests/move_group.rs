// Move group preparation and execution against simulated nodes

#[cfg(test)]
mod tests {
    use sluice_rs::config::MessengerConfig;
    use sluice_rs::messages::{Message, MessageId};
    use sluice_rs::motion::{
        MoveGroup, MoveGroupError, MoveGroupRunner, MoveOutcome, MoveStep, MoveStopCondition, RunnerState,
    };
    use sluice_rs::sim::{NodeBehavior, SimBus};
    use sluice_rs::{Messenger, MessengerError, NodeId};
    use std::sync::Arc;
    use std::time::Duration;

    fn start(nodes: Vec<(NodeId, NodeBehavior)>) -> (Messenger, SimBus) {
        let (transport, bus) = SimBus::spawn(nodes);
        let messenger = Messenger::new(Arc::new(transport), MessengerConfig::default());
        messenger.start().unwrap();
        (messenger, bus)
    }

    /// X and Y move 10 mm at 10 mm/s; X stops on the sync line.
    fn sync_pair() -> MoveGroup {
        MoveGroup::from_steps([
            (
                NodeId::GantryX,
                MoveStep::linear(10.0, 10.0).unwrap().with_stop_condition(MoveStopCondition::SyncLine),
            ),
            (NodeId::GantryY, MoveStep::linear(10.0, 10.0).unwrap()),
        ])
        .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_runs_to_completion() {
        let (messenger, bus) = start(vec![
            (NodeId::GantryX, NodeBehavior::default()),
            (NodeId::GantryY, NodeBehavior::default()),
        ]);
        let mut runner = MoveGroupRunner::new(vec![sync_pair()]);
        let results = runner.run(&messenger).await.unwrap();

        assert_eq!(runner.state(), RunnerState::Completed);
        assert_eq!(results.keys().copied().collect::<Vec<_>>(), vec![NodeId::GantryX, NodeId::GantryY]);
        for result in results.values() {
            assert_eq!(result.outcome, MoveOutcome::Completed);
            assert_eq!(result.elapsed, Duration::from_secs(1));
            assert!((result.position - 10.0).abs() < 1e-3);
        }
        assert_eq!(bus.position(NodeId::GantryX), Some(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_trip_stops_every_mover() {
        let (messenger, bus) = start(vec![
            (NodeId::GantryX, NodeBehavior::tripping_after(Duration::from_millis(400))),
            (NodeId::GantryY, NodeBehavior::default()),
        ]);
        let mut runner = MoveGroupRunner::new(vec![sync_pair()]);
        let results = runner.run(&messenger).await.unwrap();

        let x = results[&NodeId::GantryX];
        let y = results[&NodeId::GantryY];
        assert_eq!(x.outcome, MoveOutcome::Triggered);
        assert_eq!(y.outcome, MoveOutcome::TriggeredByPeer);
        assert!(x.stopped_early() && y.stopped_early());
        for result in [x, y] {
            assert!(result.elapsed.abs_diff(Duration::from_millis(400)) <= Duration::from_millis(1));
            assert!((result.position - 4.0).abs() < 0.02);
        }
        assert_eq!(bus.sync_asserted_by(), Some(NodeId::GantryX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_fault_never_triggers_motion() {
        let (messenger, bus) = start(vec![
            (NodeId::GantryX, NodeBehavior::default()),
            (NodeId::GantryY, NodeBehavior::silent_setup()),
            (NodeId::HeadL, NodeBehavior::default()),
        ]);
        let group = MoveGroup::pass(
            &[(NodeId::GantryX, 5.0, 5.0), (NodeId::GantryY, 5.0, 5.0), (NodeId::HeadL, 5.0, 5.0)],
            MoveStopCondition::None,
        )
        .unwrap();
        let mut runner = MoveGroupRunner::new(vec![group]);
        let result = runner.run(&messenger).await;

        match result {
            Err(MoveGroupError::Setup { node, source }) => {
                assert_eq!(node, NodeId::GantryY);
                assert!(matches!(source, MessengerError::Timeout { node: NodeId::GantryY, .. }));
            }
            other => panic!("expected a setup failure, got {:?}", other),
        }
        assert_eq!(runner.state(), RunnerState::Faulted);
        settle().await;
        for node in bus.nodes() {
            let kinds = bus.received_kinds(node);
            assert_eq!(kinds[0], MessageId::ClearAllMoveGroupsRequest);
            assert!(!kinds.contains(&MessageId::ExecuteMoveGroupRequest), "{} was triggered", node);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_the_group() {
        let (messenger, bus) = start(vec![
            (NodeId::GantryX, NodeBehavior::default()),
            (NodeId::GantryY, NodeBehavior::default()),
        ]);
        let mut runner = MoveGroupRunner::new(vec![sync_pair()]);
        runner.prepare(&messenger).await.unwrap();
        let result = runner
            .execute_until(&messenger, tokio::time::sleep(Duration::from_millis(250)))
            .await;

        assert!(matches!(result, Err(MoveGroupError::Cancelled { group: 0 })));
        assert_eq!(runner.state(), RunnerState::Faulted);
        settle().await;
        for node in [NodeId::GantryX, NodeId::GantryY] {
            assert!(bus.received_kinds(node).contains(&MessageId::StopRequest));
            let position = bus.position(node).unwrap();
            assert!((position - 2.5).abs() < 0.02, "{} stopped at {}", node, position);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_execute_stops_nodes_and_faults_runner() {
        let (messenger, bus) = start(vec![
            (NodeId::GantryX, NodeBehavior::default()),
            (NodeId::GantryY, NodeBehavior::default()),
        ]);
        let mut runner = MoveGroupRunner::new(vec![sync_pair()]);
        runner.prepare(&messenger).await.unwrap();
        let abandoned = tokio::time::timeout(Duration::from_millis(200), runner.execute(&messenger)).await;
        assert!(abandoned.is_err());
        assert_eq!(runner.state(), RunnerState::Faulted);

        settle().await;
        for node in [NodeId::GantryX, NodeId::GantryY] {
            let kinds = bus.received_kinds(node);
            assert_eq!(kinds.last(), Some(&MessageId::StopRequest), "{} was not stopped", node);
            let position = bus.position(node).unwrap();
            assert!(position < 10.0, "{} ran to {}", node, position);
        }
        let again = runner.execute(&messenger).await;
        assert!(matches!(
            again,
            Err(MoveGroupError::InvalidState { expected: RunnerState::Preparing, found: RunnerState::Faulted })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_completion_times_out_and_stops() {
        let (messenger, bus) = start(vec![
            (NodeId::GantryX, NodeBehavior::default()),
            (NodeId::GantryY, NodeBehavior::never_completes()),
        ]);
        let mut runner = MoveGroupRunner::new(vec![sync_pair()]);
        let started = tokio::time::Instant::now();
        let result = runner.run(&messenger).await;

        assert!(matches!(
            result,
            Err(MoveGroupError::ExecutionTimeout { group: 0, node: NodeId::GantryY })
        ));
        // Twice the nominal duration plus the margin.
        assert!(started.elapsed() >= Duration::from_secs(3));
        settle().await;
        assert!(bus.received_kinds(NodeId::GantryY).contains(&MessageId::StopRequest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_run_in_order() {
        let (messenger, bus) = start(vec![
            (NodeId::GantryX, NodeBehavior::default()),
            (NodeId::HeadL, NodeBehavior::default()),
        ]);
        let first = MoveGroup::single(NodeId::GantryX, MoveStep::linear(10.0, 10.0).unwrap()).unwrap();
        let second = MoveGroup::from_steps([
            (NodeId::GantryX, MoveStep::linear(-4.0, 2.0).unwrap()),
            (NodeId::HeadL, MoveStep::linear(-6.0, 3.0).unwrap()),
        ])
        .unwrap();
        let mut runner = MoveGroupRunner::new(vec![first, second]);
        let results = runner.run(&messenger).await.unwrap();

        assert!((results[&NodeId::GantryX].position - 6.0).abs() < 1e-3);
        assert!((results[&NodeId::HeadL].position + 6.0).abs() < 1e-3);
        let triggers: Vec<u8> = bus
            .received(NodeId::GantryX)
            .into_iter()
            .filter_map(|m| match m {
                Message::ExecuteMoveGroupRequest(execute) => Some(execute.group),
                _ => None,
            })
            .collect();
        assert_eq!(triggers, vec![0, 1]);
        let adds = bus
            .received_kinds(NodeId::HeadL)
            .into_iter()
            .filter(|k| *k == MessageId::AddMoveRequest)
            .count();
        assert_eq!(adds, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_requires_prepare() {
        let (messenger, bus) = start(vec![(NodeId::GantryX, NodeBehavior::default())]);
        let mut runner = MoveGroupRunner::new(vec![sync_pair()]);
        let result = runner.execute(&messenger).await;
        assert!(matches!(
            result,
            Err(MoveGroupError::InvalidState { expected: RunnerState::Preparing, found: RunnerState::Built })
        ));
        settle().await;
        assert!(bus.received(NodeId::GantryX).is_empty());
    }

    #[test]
    fn test_mismatched_durations_are_rejected() {
        let result = MoveGroup::from_steps([
            (NodeId::GantryX, MoveStep::linear(10.0, 10.0).unwrap()),
            (NodeId::GantryY, MoveStep::linear(10.0, 5.0).unwrap()),
        ]);
        assert!(matches!(result, Err(MoveGroupError::InvalidGroup(_))));
    }
}
