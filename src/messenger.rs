// src/messenger.rs - Addressed request/response exchange over the bus
//
// One receive task reads frames off the transport and fans each one out, in arrival
// order, to the waiter correlated with it (if any) and to every matching subscription.
use crate::bus::{NodeId, Transport, TransportError};
use crate::config::MessengerConfig;
use crate::messages::{Envelope, Message, MessageId};
use crate::sensors::SensorInformation;
use crate::sensors::scheduler::SensorClaims;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Timed out waiting for {node} to answer {kind}")]
    Timeout { node: NodeId, kind: MessageId },
    #[error("{node} rejected {kind} (code {code})")]
    Protocol { node: NodeId, kind: MessageId, code: u16 },
    #[error("Wait for {node} on {kind} was cancelled")]
    Cancelled { node: NodeId, kind: MessageId },
    #[error("A wait for {kind} from {node} is already outstanding")]
    DuplicateWaiter { node: NodeId, kind: MessageId },
    #[error("Cannot wait for a reply to broadcast {kind}")]
    BroadcastWait { kind: MessageId },
    #[error("Bus link lost while waiting for {node}")]
    LinkLost { node: NodeId },
    #[error("Messenger is not running")]
    NotRunning,
    #[error("Messenger is already running")]
    AlreadyRunning,
}

/// A message as delivered by the receive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub node: NodeId,
    pub index: u16,
    pub message: Message,
}

/// Which messages a subscription receives. Empty `kinds` means every kind.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub node: Option<NodeId>,
    pub kinds: Vec<MessageId>,
}

impl MessageFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn node(node: NodeId) -> Self {
        Self { node: Some(node), kinds: Vec::new() }
    }

    pub fn kinds(kinds: &[MessageId]) -> Self {
        Self { node: None, kinds: kinds.to_vec() }
    }

    pub fn with_kinds(mut self, kinds: &[MessageId]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn matches(&self, node: NodeId, kind: MessageId) -> bool {
        self.node.is_none_or(|n| n == node) && (self.kinds.is_empty() || self.kinds.contains(&kind))
    }
}

type WaitResult = Result<Received, MessengerError>;

struct Waiter {
    node: NodeId,
    request: MessageId,
    index: u16,
    kinds: Vec<MessageId>,
    tx: oneshot::Sender<WaitResult>,
}

#[derive(Default)]
struct WaiterTable {
    keys: HashMap<(NodeId, MessageId), u64>,
    entries: HashMap<u64, Waiter>,
}

impl WaiterTable {
    fn remove(&mut self, id: u64) -> Option<Waiter> {
        let waiter = self.entries.remove(&id)?;
        for kind in &waiter.kinds {
            self.keys.remove(&(waiter.node, *kind));
        }
        Some(waiter)
    }

    /// Find the waiter a response from `node` resolves, honoring the echoed index.
    fn take_match(&mut self, node: NodeId, kind: MessageId, index: u16) -> Option<Waiter> {
        let id = if kind == MessageId::AckFailed {
            // A rejection resolves the request from this node it answers. Without an
            // index it can only be attributed when exactly one request is outstanding.
            let mut candidates = self
                .entries
                .iter()
                .filter(|(_, w)| w.node == node && !w.kinds.contains(&MessageId::AckFailed))
                .filter(|(_, w)| index == 0 || w.index == index)
                .map(|(id, _)| *id);
            let found = match (candidates.next(), candidates.next()) {
                (Some(id), None) => Some(id),
                (Some(_), Some(_)) => {
                    tracing::warn!("Cannot attribute unindexed {} from {} to one request", kind, node);
                    return None;
                }
                (None, _) => None,
            };
            found.or_else(|| self.keys.get(&(node, kind)).copied())?
        } else {
            *self.keys.get(&(node, kind))?
        };
        let waiter = self.entries.get(&id)?;
        if index != 0 && waiter.index != index {
            return None;
        }
        self.remove(id)
    }
}

struct Subscriber {
    filter: MessageFilter,
    tx: mpsc::UnboundedSender<Received>,
    pending: Arc<AtomicUsize>,
}

struct Shared {
    waiters: Mutex<WaiterTable>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    next_index: AtomicU16,
    running: AtomicBool,
    warn_depth: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn next_index(&self) -> u16 {
        loop {
            let index = self.next_index.fetch_add(1, Ordering::Relaxed);
            if index != 0 {
                return index;
            }
        }
    }

    fn dispatch(&self, node: NodeId, envelope: Envelope) {
        let kind = envelope.message.id();
        let received = Received { node, index: envelope.index, message: envelope.message };
        tracing::debug!("Bus RX <- {}: {} #{}", node, kind, received.index);

        let waiter = lock(&self.waiters).take_match(node, kind, received.index);
        match waiter {
            Some(waiter) => {
                let result = match &received.message {
                    Message::AckFailed { code } if !waiter.kinds.contains(&MessageId::AckFailed) => {
                        Err(MessengerError::Protocol { node, kind: waiter.request, code: *code })
                    }
                    _ => Ok(received.clone()),
                };
                let _ = waiter.tx.send(result);
            }
            None => {
                if kind == MessageId::Ack || kind == MessageId::AckFailed {
                    tracing::debug!("Dropping uncorrelated {} from {} #{}", kind, node, received.index);
                }
            }
        }

        let subscribers = lock(&self.subscribers);
        for subscriber in subscribers.values() {
            if !subscriber.filter.matches(node, kind) {
                continue;
            }
            if subscriber.tx.send(received.clone()).is_ok() {
                let depth = subscriber.pending.fetch_add(1, Ordering::Relaxed) + 1;
                if depth == self.warn_depth {
                    tracing::warn!("Subscription for {:?} has {} undrained messages", subscriber.filter, depth);
                }
            }
        }
    }

    fn cancel_waiters(&self, link_lost: bool) {
        let waiters: Vec<Waiter> = {
            let mut table = lock(&self.waiters);
            table.keys.clear();
            table.entries.drain().map(|(_, w)| w).collect()
        };
        for waiter in waiters {
            let error = if link_lost {
                MessengerError::LinkLost { node: waiter.node }
            } else {
                MessengerError::Cancelled { node: waiter.node, kind: waiter.request }
            };
            let _ = waiter.tx.send(Err(error));
        }
    }

    fn unsubscribe(&self, id: u64) {
        lock(&self.subscribers).remove(&id);
    }
}

/// Removes its waiter if the waiting future is dropped before resolution.
struct PendingWaiter<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        lock(&self.shared.waiters).remove(self.id);
    }
}

/// Stream of messages matching a filter. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Received>,
    pending: Arc<AtomicUsize>,
    shared: Weak<Shared>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Received> {
        let received = self.rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::Relaxed);
        Some(received)
    }

    /// Next buffered message, without waiting.
    pub fn try_recv(&mut self) -> Option<Received> {
        let received = self.rx.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::Relaxed);
        Some(received)
    }

    /// Stop receiving new messages; anything already buffered stays readable.
    pub fn detach(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unsubscribe(self.id);
        }
        self.shared = Weak::new();
    }

    /// Consume the subscription as a stream that ends when the messenger stops.
    pub fn into_stream(mut self) -> impl futures::Stream<Item = Received> {
        async_stream::stream! {
            while let Some(received) = self.recv().await {
                yield received;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Addressed, correlated message exchange on top of a [`Transport`].
pub struct Messenger {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    config: MessengerConfig,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    sensor_claims: SensorClaims,
}

impl Messenger {
    pub fn new(transport: Arc<dyn Transport>, config: MessengerConfig) -> Self {
        Self {
            transport,
            shared: Arc::new(Shared {
                waiters: Mutex::new(WaiterTable::default()),
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_index: AtomicU16::new(1),
                running: AtomicBool::new(false),
                warn_depth: config.subscription_warn_depth,
            }),
            config,
            receive_task: Mutex::new(None),
            sensor_claims: SensorClaims::default(),
        }
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout()
    }

    pub(crate) fn sensor_claims(&self) -> &SensorClaims {
        &self.sensor_claims
    }

    /// Whether any scheduler on this bus holds `sensor` bound.
    pub fn is_sensor_bound(&self, sensor: &SensorInformation) -> bool {
        lock(&*self.sensor_claims).contains(sensor)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Spawn the receive loop. Only one loop may run per messenger.
    pub fn start(&self) -> Result<(), MessengerError> {
        let mut task = lock(&self.receive_task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(MessengerError::AlreadyRunning);
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let transport = self.transport.clone();
        let shared = self.shared.clone();
        *task = Some(tokio::spawn(receive_loop(transport, shared)));
        tracing::info!("Messenger receive loop started");
        Ok(())
    }

    /// Stop the receive loop, cancel every outstanding wait and close every subscription.
    pub async fn stop(&self) {
        let task = lock(&self.receive_task).take();
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.shared.cancel_waiters(false);
        // Dropping the senders ends every subscription once it is drained.
        lock(&self.shared.subscribers).clear();
        tracing::info!("Messenger stopped");
    }

    /// Fire-and-forget send. Returns once the frame is handed to the transport.
    pub async fn send(&self, node: NodeId, message: Message) -> Result<(), MessengerError> {
        let index = self.shared.next_index();
        write(self.transport.as_ref(), node, Envelope::new(index, message)).await
    }

    /// Detached send handle, usable from cleanup tasks that outlive this borrow.
    pub fn sender(&self) -> MessageSender {
        MessageSender { transport: self.transport.clone(), shared: self.shared.clone() }
    }

    /// Send `message` and wait for the first reply from `node` whose kind is in `expected`.
    ///
    /// An `ack_failed` from `node` answering this request fails the wait with
    /// [`MessengerError::Protocol`] unless `expected` lists `AckFailed` itself.
    pub async fn send_and_wait(
        &self,
        node: NodeId,
        message: Message,
        expected: &[MessageId],
        timeout: Duration,
    ) -> Result<Received, MessengerError> {
        let request = message.id();
        if node == NodeId::Broadcast {
            return Err(MessengerError::BroadcastWait { kind: request });
        }
        if !self.is_running() {
            return Err(MessengerError::NotRunning);
        }
        let index = self.shared.next_index();
        let (tx, rx) = oneshot::channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = lock(&self.shared.waiters);
            if let Some(kind) = expected.iter().find(|k| table.keys.contains_key(&(node, **k))) {
                return Err(MessengerError::DuplicateWaiter { node, kind: *kind });
            }
            for kind in expected {
                table.keys.insert((node, *kind), id);
            }
            table.entries.insert(
                id,
                Waiter { node, request, index, kinds: expected.to_vec(), tx },
            );
        }
        let _pending = PendingWaiter { shared: &self.shared, id };

        write(self.transport.as_ref(), node, Envelope::new(index, message)).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MessengerError::Cancelled { node, kind: request }),
            Err(_) => {
                tracing::warn!("{} did not answer {} #{} within {:?}", node, request, index, timeout);
                Err(MessengerError::Timeout { node, kind: request })
            }
        }
    }

    /// Register a queue that receives every message matching `filter`.
    pub fn subscribe(&self, filter: MessageFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::new(AtomicUsize::new(0));
        lock(&self.shared.subscribers).insert(
            id,
            Subscriber { filter, tx, pending: pending.clone() },
        );
        Subscription { id, rx, pending, shared: Arc::downgrade(&self.shared) }
    }
}

/// Fire-and-forget handle onto a messenger's transport.
#[derive(Clone)]
pub struct MessageSender {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
}

impl MessageSender {
    pub async fn send(&self, node: NodeId, message: Message) -> Result<(), MessengerError> {
        let index = self.shared.next_index();
        write(self.transport.as_ref(), node, Envelope::new(index, message)).await
    }
}

async fn write(transport: &dyn Transport, node: NodeId, envelope: Envelope) -> Result<(), MessengerError> {
    let kind = envelope.message.id();
    tracing::debug!("Bus TX -> {}: {} #{}", node, kind, envelope.index);
    transport.send(node, &envelope.encode()).await.map_err(|e| {
        tracing::error!("Failed to send {} to {}: {}", kind, node, e);
        MessengerError::Transport(e)
    })
}

impl Drop for Messenger {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.receive_task).take() {
            task.abort();
        }
        self.shared.cancel_waiters(false);
    }
}

async fn receive_loop(transport: Arc<dyn Transport>, shared: Arc<Shared>) {
    loop {
        match transport.recv().await {
            Ok((node, frame)) => match Envelope::decode(&frame) {
                Ok(envelope) => shared.dispatch(node, envelope),
                Err(e) => tracing::warn!("Dropping undecodable frame from {}: {}", node, e),
            },
            Err(e @ (TransportError::Crc { .. } | TransportError::Malformed(_))) => {
                tracing::warn!("Dropping bad frame: {}", e);
            }
            Err(e) => {
                tracing::error!("Bus receive failed, stopping receive loop: {}", e);
                shared.running.store(false, Ordering::SeqCst);
                shared.cancel_waiters(true);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::{SimBusEnd, sim_link};

    fn messenger() -> (Messenger, SimBusEnd) {
        let (transport, end) = sim_link();
        let messenger = Messenger::new(Arc::new(transport), MessengerConfig::default());
        messenger.start().unwrap();
        (messenger, end)
    }

    async fn next_request(end: &mut SimBusEnd) -> (NodeId, Envelope) {
        let (node, frame) = end.from_host.recv().await.unwrap();
        (node, Envelope::decode(&frame).unwrap())
    }

    fn reply(end: &SimBusEnd, node: NodeId, index: u16, message: Message) {
        end.to_host.send((node, Envelope::new(index, message).encode())).unwrap();
    }

    #[test]
    fn test_filter_matching() {
        let filter = MessageFilter::node(NodeId::HeadL).with_kinds(&[MessageId::Ack]);
        assert!(filter.matches(NodeId::HeadL, MessageId::Ack));
        assert!(!filter.matches(NodeId::HeadR, MessageId::Ack));
        assert!(!filter.matches(NodeId::HeadL, MessageId::Echo));
        assert!(MessageFilter::any().matches(NodeId::GantryX, MessageId::MoveCompleted));
    }

    #[tokio::test]
    async fn test_send_and_wait_correlates_reply() {
        let (messenger, mut end) = messenger();
        let wait = messenger.send_and_wait(
            NodeId::HeadL,
            Message::Echo(vec![1, 2]),
            &[MessageId::Echo],
            Duration::from_secs(1),
        );
        let node_side = async {
            let (node, request) = next_request(&mut end).await;
            assert_eq!(node, NodeId::HeadL);
            reply(&end, NodeId::HeadL, request.index, Message::Echo(vec![1, 2]));
        };
        let (result, _) = tokio::join!(wait, node_side);
        let received = result.unwrap();
        assert_eq!(received.node, NodeId::HeadL);
        assert_eq!(received.message, Message::Echo(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_ack_failed_surfaces_protocol_error() {
        let (messenger, mut end) = messenger();
        let wait = messenger.send_and_wait(
            NodeId::GantryX,
            Message::ClearAllMoveGroupsRequest,
            &[MessageId::Ack],
            Duration::from_secs(1),
        );
        let node_side = async {
            let (_, request) = next_request(&mut end).await;
            reply(&end, NodeId::GantryX, request.index, Message::AckFailed { code: 3 });
        };
        let (result, _) = tokio::join!(wait, node_side);
        assert!(matches!(
            result,
            Err(MessengerError::Protocol { node: NodeId::GantryX, kind: MessageId::ClearAllMoveGroupsRequest, code: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unindexed_rejection_needs_a_single_waiter() {
        let (messenger, mut end) = messenger();
        let info = messenger.send_and_wait(
            NodeId::GantryX,
            Message::DeviceInfoRequest,
            &[MessageId::DeviceInfoResponse],
            Duration::from_millis(100),
        );
        let clear = messenger.send_and_wait(
            NodeId::GantryX,
            Message::ClearAllMoveGroupsRequest,
            &[MessageId::Ack],
            Duration::from_millis(100),
        );
        let node_side = async {
            next_request(&mut end).await;
            next_request(&mut end).await;
            reply(&end, NodeId::GantryX, 0, Message::AckFailed { code: 7 });
        };
        let (info, clear, _) = tokio::join!(info, clear, node_side);
        // Two requests were outstanding, so the rejection resolves neither.
        assert!(matches!(info, Err(MessengerError::Timeout { .. })));
        assert!(matches!(clear, Err(MessengerError::Timeout { .. })));

        let clear = messenger.send_and_wait(
            NodeId::GantryX,
            Message::ClearAllMoveGroupsRequest,
            &[MessageId::Ack],
            Duration::from_millis(100),
        );
        let node_side = async {
            next_request(&mut end).await;
            reply(&end, NodeId::GantryX, 0, Message::AckFailed { code: 7 });
        };
        let (clear, _) = tokio::join!(clear, node_side);
        assert!(matches!(clear, Err(MessengerError::Protocol { code: 7, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_node_and_kind() {
        let (messenger, _end) = messenger();
        let result = messenger
            .send_and_wait(NodeId::HeadR, Message::DeviceInfoRequest, &[MessageId::DeviceInfoResponse], Duration::from_millis(50))
            .await;
        assert!(matches!(
            result,
            Err(MessengerError::Timeout { node: NodeId::HeadR, kind: MessageId::DeviceInfoRequest })
        ));
        // The waiter is gone, so the same key can be waited on again.
        let again = messenger
            .send_and_wait(NodeId::HeadR, Message::DeviceInfoRequest, &[MessageId::DeviceInfoResponse], Duration::from_millis(50))
            .await;
        assert!(matches!(again, Err(MessengerError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_waiter_fails_fast() {
        let (messenger, _end) = messenger();
        let first = messenger.send_and_wait(
            NodeId::HeadL,
            Message::DeviceInfoRequest,
            &[MessageId::DeviceInfoResponse],
            Duration::from_secs(1),
        );
        let second = async {
            tokio::task::yield_now().await;
            messenger
                .send_and_wait(NodeId::HeadL, Message::DeviceInfoRequest, &[MessageId::DeviceInfoResponse], Duration::from_secs(1))
                .await
        };
        let (first, second) = tokio::join!(first, second);
        assert!(matches!(second, Err(MessengerError::DuplicateWaiter { node: NodeId::HeadL, .. })));
        assert!(matches!(first, Err(MessengerError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_uncorrelated_reply_is_dropped() {
        let (messenger, end) = messenger();
        let mut all = messenger.subscribe(MessageFilter::any());
        reply(&end, NodeId::HeadL, 999, Message::Ack);
        reply(&end, NodeId::HeadL, 0, Message::Echo(vec![5]));
        assert_eq!(all.recv().await.unwrap().message, Message::Ack);
        assert_eq!(all.recv().await.unwrap().message, Message::Echo(vec![5]));
        assert!(messenger.is_running());
    }

    #[tokio::test]
    async fn test_subscription_preserves_arrival_order() {
        let (messenger, end) = messenger();
        let mut readings = messenger.subscribe(MessageFilter::node(NodeId::PipetteLeft).with_kinds(&[MessageId::Echo]));
        for i in 0..5u8 {
            reply(&end, NodeId::PipetteLeft, 0, Message::Echo(vec![i]));
            reply(&end, NodeId::HeadL, 0, Message::Echo(vec![100 + i]));
        }
        for i in 0..5u8 {
            assert_eq!(readings.recv().await.unwrap().message, Message::Echo(vec![i]));
        }
        assert!(readings.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_subscription_stream_ends_on_stop() {
        use futures::StreamExt;

        let (messenger, end) = messenger();
        let stream = messenger.subscribe(MessageFilter::node(NodeId::HeadR)).into_stream();
        reply(&end, NodeId::HeadL, 0, Message::Echo(vec![9]));
        reply(&end, NodeId::HeadR, 0, Message::Echo(vec![1]));
        reply(&end, NodeId::HeadR, 0, Message::Ack);
        let mut stream = Box::pin(stream);
        assert_eq!(stream.next().await.unwrap().message, Message::Echo(vec![1]));
        assert_eq!(stream.next().await.unwrap().message, Message::Ack);
        messenger.stop().await;
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_waiters_and_closes_subscriptions() {
        let (messenger, _end) = messenger();
        let mut subscription = messenger.subscribe(MessageFilter::any());
        let wait = messenger.send_and_wait(
            NodeId::GantryY,
            Message::DeviceInfoRequest,
            &[MessageId::DeviceInfoResponse],
            Duration::from_secs(10),
        );
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            messenger.stop().await;
        };
        let (result, _) = tokio::join!(wait, stopper);
        assert!(matches!(result, Err(MessengerError::Cancelled { node: NodeId::GantryY, .. })));
        assert!(subscription.recv().await.is_none());
        assert!(!messenger.is_running());
    }

    #[tokio::test]
    async fn test_broadcast_wait_is_rejected() {
        let (messenger, _end) = messenger();
        let result = messenger
            .send_and_wait(NodeId::Broadcast, Message::DeviceInfoRequest, &[MessageId::DeviceInfoResponse], Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(MessengerError::BroadcastWait { .. })));
    }

    #[tokio::test]
    async fn test_link_loss_fails_sends_and_waiters() {
        let (messenger, end) = messenger();
        let wait = messenger.send_and_wait(
            NodeId::HeadL,
            Message::DeviceInfoRequest,
            &[MessageId::DeviceInfoResponse],
            Duration::from_secs(5),
        );
        let cutter = async {
            tokio::task::yield_now().await;
            end.link.disconnect();
        };
        let (result, _) = tokio::join!(wait, cutter);
        assert!(matches!(result, Err(MessengerError::LinkLost { node: NodeId::HeadL })));
        let send = messenger.send(NodeId::HeadL, Message::StopRequest).await;
        assert!(matches!(send, Err(MessengerError::Transport(TransportError::LinkDown))));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (messenger, _end) = messenger();
        assert!(matches!(messenger.start(), Err(MessengerError::AlreadyRunning)));
    }
}
