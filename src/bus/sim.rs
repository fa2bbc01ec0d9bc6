// src/bus/sim.rs - In-memory transport for the simulator and tests
use super::{NodeId, Transport, TransportError};
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};

/// Host side of an in-memory bus.
pub struct SimTransport {
    to_bus: mpsc::UnboundedSender<(NodeId, Vec<u8>)>,
    from_bus: Mutex<mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>>,
    link: watch::Receiver<bool>,
}

/// Bus side of an in-memory bus: frames the host sent (tagged with their
/// destination) and a sender for frames going to the host (tagged with their source).
pub struct SimBusEnd {
    pub from_host: mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>,
    pub to_host: mpsc::UnboundedSender<(NodeId, Vec<u8>)>,
    pub link: SimLink,
}

/// Handle that can cut the simulated link.
#[derive(Debug, Clone)]
pub struct SimLink {
    state: std::sync::Arc<watch::Sender<bool>>,
}

impl SimLink {
    pub fn disconnect(&self) {
        tracing::warn!("Simulated bus link cut");
        self.state.send_replace(false);
    }

    pub fn is_up(&self) -> bool {
        *self.state.borrow()
    }
}

/// Create a connected host transport and bus end.
pub fn sim_link() -> (SimTransport, SimBusEnd) {
    let (to_bus, from_host) = mpsc::unbounded_channel();
    let (to_host, from_bus) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = watch::channel(true);
    (
        SimTransport {
            to_bus,
            from_bus: Mutex::new(from_bus),
            link: link_rx,
        },
        SimBusEnd {
            from_host,
            to_host,
            link: SimLink { state: std::sync::Arc::new(link_tx) },
        },
    )
}

#[async_trait]
impl Transport for SimTransport {
    async fn send(&self, node: NodeId, frame: &[u8]) -> Result<(), TransportError> {
        let up = *self.link.borrow();
        if !up {
            return Err(TransportError::LinkDown);
        }
        self.to_bus
            .send((node, frame.to_vec()))
            .map_err(|_| TransportError::LinkDown)
    }

    async fn recv(&self) -> Result<(NodeId, Vec<u8>), TransportError> {
        let mut link = self.link.clone();
        let mut rx = self.from_bus.lock().await;
        loop {
            if !*link.borrow_and_update() {
                return Err(TransportError::LinkDown);
            }
            tokio::select! {
                biased;
                frame = rx.recv() => return frame.ok_or(TransportError::LinkDown),
                changed = link.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::LinkDown);
                    }
                }
            }
        }
    }
}
