// src/network.rs - Bus inventory and per-node housekeeping requests
use crate::bus::NodeId;
use crate::messages::fixed_point::to_unsigned_fixed_point;
use crate::messages::{DeviceInfo, Message, MessageId, MotorCurrent};
use crate::messenger::{MessageFilter, Messenger, MessengerError};
use futures::StreamExt;
use indexmap::IndexMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Motor current {0} A is out of range")]
    InvalidCurrent(f64),
    #[error("{node} refused to enter the bootloader")]
    BootloaderRefused { node: NodeId },
    #[error("{node} echoed a different payload")]
    EchoMismatch { node: NodeId },
    #[error("Messenger error: {0}")]
    Messenger(#[from] MessengerError),
}

/// Broadcast a device info request and collect every node that answers within `window`.
pub async fn probe_nodes(
    messenger: &Messenger,
    window: Duration,
) -> Result<IndexMap<NodeId, DeviceInfo>, NetworkError> {
    let responses = messenger
        .subscribe(MessageFilter::kinds(&[MessageId::DeviceInfoResponse]))
        .into_stream();
    tokio::pin!(responses);
    messenger.send(NodeId::Broadcast, Message::DeviceInfoRequest).await?;

    let deadline = Instant::now() + window;
    let mut found = IndexMap::new();
    while let Ok(Some(received)) = tokio::time::timeout_at(deadline, responses.next()).await {
        if let Message::DeviceInfoResponse(info) = received.message {
            tracing::debug!("{} answered: version {} sha {:02x?}", received.node, info.version, info.shortsha);
            found.insert(received.node, info);
        }
    }
    found.sort_keys();
    tracing::info!("Found {} nodes on the bus: {:?}", found.len(), found.keys().collect::<Vec<_>>());
    Ok(found)
}

/// Set hold and run currents, in amps.
pub async fn set_motor_current(messenger: &Messenger, node: NodeId, hold: f64, run: f64) -> Result<(), NetworkError> {
    let current = MotorCurrent {
        hold: to_unsigned_fixed_point(hold).ok_or(NetworkError::InvalidCurrent(hold))?,
        run: to_unsigned_fixed_point(run).ok_or(NetworkError::InvalidCurrent(run))?,
    };
    tracing::info!("Setting {} motor current: hold {} A, run {} A", node, hold, run);
    messenger.send(node, Message::WriteMotorCurrentRequest(current)).await?;
    Ok(())
}

/// Ask `node` to reboot into its bootloader.
pub async fn enter_bootloader(messenger: &Messenger, node: NodeId, timeout: Duration) -> Result<(), NetworkError> {
    let reply = messenger
        .send_and_wait(node, Message::EnterBootloaderRequest, &[MessageId::EnterBootloaderResponse], timeout)
        .await?;
    match reply.message {
        Message::EnterBootloaderResponse { accepted: true } => {
            tracing::info!("{} is entering the bootloader", node);
            Ok(())
        }
        _ => Err(NetworkError::BootloaderRefused { node }),
    }
}

/// Round-trip `payload` through `node`, returning the time it took.
pub async fn echo(messenger: &Messenger, node: NodeId, payload: &[u8], timeout: Duration) -> Result<Duration, NetworkError> {
    let started = Instant::now();
    let reply = messenger
        .send_and_wait(node, Message::Echo(payload.to_vec()), &[MessageId::Echo], timeout)
        .await?;
    match reply.message {
        Message::Echo(bytes) if bytes == payload => Ok(started.elapsed()),
        _ => Err(NetworkError::EchoMismatch { node }),
    }
}
