// Inventory, echo and housekeeping requests on the simulated bus

#[cfg(test)]
mod tests {
    use sluice_rs::config::MessengerConfig;
    use sluice_rs::messages::fixed_point::from_unsigned_fixed_point;
    use sluice_rs::network::{self, NetworkError};
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

    #[tokio::test(start_paused = true)]
    async fn test_probe_nodes_lists_every_responder_in_address_order() {
        let (messenger, _bus) = start(vec![
            (NodeId::PipetteLeft, NodeBehavior::default()),
            (NodeId::GantryY, NodeBehavior::default()),
            (NodeId::GantryX, NodeBehavior::default()),
        ]);
        let found = network::probe_nodes(&messenger, Duration::from_millis(100)).await.unwrap();
        assert_eq!(
            found.keys().copied().collect::<Vec<_>>(),
            vec![NodeId::GantryX, NodeId::GantryY, NodeId::PipetteLeft]
        );
        assert!(found.values().all(|info| info.version == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_round_trips() {
        let (messenger, _bus) = start(vec![(NodeId::HeadR, NodeBehavior::default())]);
        let rtt = network::echo(&messenger, NodeId::HeadR, b"ping", Duration::from_secs(1)).await.unwrap();
        assert!(rtt < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_to_missing_node_times_out() {
        let (messenger, _bus) = start(vec![(NodeId::HeadR, NodeBehavior::default())]);
        let result = network::echo(&messenger, NodeId::Gripper, b"ping", Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(NetworkError::Messenger(MessengerError::Timeout { node: NodeId::Gripper, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_current_is_written() {
        let (messenger, bus) = start(vec![(NodeId::GantryX, NodeBehavior::default())]);
        network::set_motor_current(&messenger, NodeId::GantryX, 0.5, 1.25).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let current = bus.state(NodeId::GantryX).unwrap().motor_current.unwrap();
        assert_eq!(from_unsigned_fixed_point(current.hold), 0.5);
        assert_eq!(from_unsigned_fixed_point(current.run), 1.25);

        let negative = network::set_motor_current(&messenger, NodeId::GantryX, -1.0, 1.0).await;
        assert!(matches!(negative, Err(NetworkError::InvalidCurrent(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootloader_refusal_is_reported() {
        let (messenger, _bus) = start(vec![
            (NodeId::HeadL, NodeBehavior::default()),
            (NodeId::HeadR, NodeBehavior { accept_bootloader: false, ..NodeBehavior::default() }),
        ]);
        network::enter_bootloader(&messenger, NodeId::HeadL, Duration::from_secs(1)).await.unwrap();
        let refused = network::enter_bootloader(&messenger, NodeId::HeadR, Duration::from_secs(1)).await;
        assert!(matches!(refused, Err(NetworkError::BootloaderRefused { node: NodeId::HeadR })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_fails_requests() {
        let (messenger, bus) = start(vec![(NodeId::HeadL, NodeBehavior::default())]);
        bus.disconnect();
        let result = network::echo(&messenger, NodeId::HeadL, b"x", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(NetworkError::Messenger(_))));
    }
}
