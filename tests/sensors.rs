// Sensor thresholds, bindings and captures against simulated nodes

#[cfg(test)]
mod tests {
    use sluice_rs::config::MessengerConfig;
    use sluice_rs::messages::MessageId;
    use sluice_rs::sensors::{
        SensorDataType, SensorError, SensorId, SensorInformation, SensorOutputBinding, SensorScheduler,
        SensorThresholdInformation, SensorThresholdMode, SensorType,
    };
    use sluice_rs::sim::{NodeBehavior, SimBus};
    use sluice_rs::{Messenger, NodeId};
    use std::sync::Arc;
    use std::time::Duration;

    fn start(behavior: NodeBehavior) -> (Messenger, SimBus) {
        let (transport, bus) = SimBus::spawn([(NodeId::PipetteLeft, behavior)]);
        let messenger = Messenger::new(Arc::new(transport), MessengerConfig::default());
        messenger.start().unwrap();
        (messenger, bus)
    }

    fn capacitive() -> SensorInformation {
        SensorInformation::new(SensorType::Capacitive, SensorId::S0, NodeId::PipetteLeft)
    }

    fn threshold(value: f64) -> SensorThresholdInformation {
        SensorThresholdInformation::new(
            capacitive(),
            SensorDataType::from_float(value).unwrap(),
            SensorThresholdMode::Absolute,
        )
    }

    fn binding(bus: &SimBus) -> SensorOutputBinding {
        bus.state(NodeId::PipetteLeft).unwrap().binding
    }

    fn bind_requests(bus: &SimBus) -> usize {
        bus.received_kinds(NodeId::PipetteLeft)
            .into_iter()
            .filter(|k| *k == MessageId::BindSensorOutputRequest)
            .count()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_returns_the_accepted_value() {
        let behavior = NodeBehavior { threshold_step: 0.5, ..NodeBehavior::default() };
        let (messenger, bus) = start(behavior);
        let scheduler = SensorScheduler::new();

        let first = scheduler.send_threshold(&threshold(1.3), &messenger).await.unwrap();
        let second = scheduler.send_threshold(&threshold(1.3), &messenger).await.unwrap();
        assert_eq!(first.to_float(), 1.5);
        assert_eq!(first, second);
        let armed = bus.state(NodeId::PipetteLeft).unwrap().threshold.unwrap();
        assert_eq!(armed.threshold, first.raw());
        assert_eq!(armed.mode, SensorThresholdMode::Absolute);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_threshold_is_rejected() {
        let (messenger, _bus) = start(NodeBehavior { max_threshold: 10.0, ..NodeBehavior::default() });
        let scheduler = SensorScheduler::new();
        let result = scheduler.send_threshold(&threshold(50.0), &messenger).await;
        match result {
            Err(SensorError::ThresholdRejected { node, sensor, .. }) => {
                assert_eq!(node, NodeId::PipetteLeft);
                assert_eq!(sensor, capacitive());
            }
            other => panic!("expected a rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_unrepresentable_threshold_is_an_error() {
        assert!(matches!(SensorDataType::from_float(f64::NAN), Err(SensorError::OutOfRange(_))));
        assert!(matches!(SensorDataType::from_float(1e9), Err(SensorError::OutOfRange(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_binding_is_refused() {
        let (messenger, bus) = start(NodeBehavior::default());
        let scheduler = SensorScheduler::new();
        let shared = scheduler.clone();

        let held = scheduler.bind_sync(&capacitive(), &messenger, false).await.unwrap();
        let again = shared.bind_output(&messenger, &capacitive()).await;
        assert!(matches!(again, Err(SensorError::AlreadyBound { node: NodeId::PipetteLeft, .. })));
        assert!(messenger.is_sensor_bound(&capacitive()));
        assert_eq!(binding(&bus), SensorOutputBinding::SYNC);
        // The refused attempt never reached the node.
        assert_eq!(bind_requests(&bus), 1);

        held.close().await.unwrap();
        settle().await;
        assert!(!messenger.is_sensor_bound(&capacitive()));
        assert!(binding(&bus).is_none());
        let rebound = shared.bind_output(&messenger, &capacitive()).await.unwrap();
        assert_eq!(rebound.sensor(), &capacitive());
        rebound.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_schedulers_share_one_bus_claim() {
        let (messenger, bus) = start(NodeBehavior::default());
        let first = SensorScheduler::new();
        let second = SensorScheduler::new();

        let held = first.bind_sync(&capacitive(), &messenger, false).await.unwrap();
        let again = second.bind_sync(&capacitive(), &messenger, false).await;
        assert!(matches!(again, Err(SensorError::AlreadyBound { node: NodeId::PipetteLeft, .. })));
        assert_eq!(bind_requests(&bus), 1);

        // The refused scheduler must not release the holder's claim.
        drop(again);
        settle().await;
        assert!(messenger.is_sensor_bound(&capacitive()));
        assert_eq!(binding(&bus), SensorOutputBinding::SYNC);

        held.close().await.unwrap();
        let rebound = second.bind_sync(&capacitive(), &messenger, false).await.unwrap();
        rebound.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_sensors_bind_independently() {
        let (messenger, bus) = start(NodeBehavior::default());
        let scheduler = SensorScheduler::new();
        let pressure = SensorInformation::new(SensorType::Pressure, SensorId::S1, NodeId::PipetteLeft);

        let first = scheduler.bind_output(&messenger, &capacitive()).await.unwrap();
        let second = scheduler.bind_output(&messenger, &pressure).await.unwrap();
        assert!(messenger.is_sensor_bound(&capacitive()) && messenger.is_sensor_bound(&pressure));
        second.close().await.unwrap();
        first.close().await.unwrap();
        settle().await;
        assert!(binding(&bus).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_binding_is_unbound() {
        let (messenger, bus) = start(NodeBehavior::default());
        let scheduler = SensorScheduler::new();
        {
            let _binding = scheduler.bind_sync(&capacitive(), &messenger, true).await.unwrap();
            assert_eq!(binding(&bus), SensorOutputBinding::SYNC | SensorOutputBinding::REPORT);
        }
        settle().await;
        assert!(binding(&bus).is_none());
        assert!(!messenger.is_sensor_bound(&capacitive()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_drains_readings_in_order() {
        let behavior = NodeBehavior {
            sensor_value: 1.0,
            sample_step: 0.25,
            sample_interval: Duration::from_millis(10),
            ..NodeBehavior::default()
        };
        let (messenger, bus) = start(behavior);
        let scheduler = SensorScheduler::new();

        let capture = scheduler.capture_output(&capacitive(), &messenger).await.unwrap();
        assert_eq!(binding(&bus), SensorOutputBinding::REPORT);
        tokio::time::sleep(Duration::from_millis(55)).await;
        let mut samples = capture.close().await.unwrap();

        assert_eq!(samples.try_next(), Some(1.0));
        let rest: Vec<f64> = samples.drain().collect();
        assert_eq!(rest, vec![1.25, 1.5, 1.75, 2.0]);
        assert_eq!(samples.try_next(), None);
        assert!(!messenger.is_sensor_bound(&capacitive()));

        // Nothing arrives once the capture is closed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(samples.try_next(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_without_node_times_out_and_releases() {
        let (transport, _bus) = SimBus::spawn([(NodeId::GantryX, NodeBehavior::default())]);
        let messenger = Messenger::new(Arc::new(transport), MessengerConfig::default());
        messenger.start().unwrap();
        let scheduler = SensorScheduler::new();

        let result = scheduler.bind_output(&messenger, &capacitive()).await;
        assert!(matches!(result, Err(SensorError::Messenger(_))));
        assert!(!messenger.is_sensor_bound(&capacitive()));
    }
}
