// src/sensors/scheduler.rs - Threshold configuration and scoped sensor bindings
//
// A bound sensor is owned by exactly one guard. Closing the guard (or dropping it)
// unbinds the node's output; the identity is released only after that unbind is sent.
// Claims live on the messenger, so every scheduler sharing a bus sees the same set.
use super::{SensorDataType, SensorInformation, SensorThresholdInformation};
use crate::bus::NodeId;
use crate::config::SensorConfig;
use crate::messages::fixed_point::from_fixed_point;
use crate::messages::{BindSensorOutput, Message, MessageId, SensorOutputBinding};
use crate::messenger::{MessageFilter, MessageSender, Messenger, MessengerError, Subscription};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("{node} rejected threshold for {sensor}: {reason}")]
    ThresholdRejected { node: NodeId, sensor: SensorInformation, reason: String },
    #[error("{sensor} is already bound on {node}")]
    AlreadyBound { node: NodeId, sensor: SensorInformation },
    #[error("Sensor value {0} cannot be represented in fixed point")]
    OutOfRange(f64),
    #[error("Messenger error: {0}")]
    Messenger(#[from] MessengerError),
}

/// Sensor identities currently bound on one bus.
pub(crate) type SensorClaims = Arc<Mutex<HashSet<SensorInformation>>>;

fn lock(registry: &SensorClaims) -> MutexGuard<'_, HashSet<SensorInformation>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Claim on a sensor identity, released on drop.
struct Reservation {
    registry: SensorClaims,
    sensor: SensorInformation,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.sensor);
    }
}

fn unbind_message(sensor: &SensorInformation) -> Message {
    Message::BindSensorOutputRequest(BindSensorOutput {
        sensor_type: sensor.sensor_type,
        sensor_id: sensor.sensor_id,
        binding: SensorOutputBinding::NONE,
    })
}

/// An armed sensor output. Unbinds on `disarm`, or from a spawned task if dropped armed.
struct BoundSensor {
    sensor: SensorInformation,
    sender: MessageSender,
    reservation: Option<Reservation>,
    armed: bool,
}

impl BoundSensor {
    async fn disarm(&mut self) -> Result<(), SensorError> {
        self.armed = false;
        let result = self.sender.send(self.sensor.node, unbind_message(&self.sensor)).await;
        self.reservation.take();
        tracing::debug!("Unbound {}", self.sensor);
        result.map_err(SensorError::from)
    }
}

impl Drop for BoundSensor {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let sensor = self.sensor;
        let sender = self.sender.clone();
        let reservation = self.reservation.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sender.send(sensor.node, unbind_message(&sensor)).await {
                        tracing::error!("Failed to unbind {}: {}", sensor, e);
                    }
                    drop(reservation);
                });
            }
            Err(_) => tracing::error!("No runtime to unbind {}; it stays armed", sensor),
        }
    }
}

/// Scoped sync binding: while held, the sensor's trip asserts the sync line.
pub struct SensorBinding {
    bound: BoundSensor,
    readings: Option<Subscription>,
}

impl SensorBinding {
    pub fn sensor(&self) -> &SensorInformation {
        &self.bound.sensor
    }

    /// Unbind the sensor, logging any readings it reported while bound.
    pub async fn close(mut self) -> Result<(), SensorError> {
        let result = self.bound.disarm().await;
        if let Some(mut readings) = self.readings.take() {
            readings.detach();
            let mut samples = SampleQueue::new(readings, self.bound.sensor);
            let values: Vec<f64> = samples.drain().collect();
            tracing::debug!("{} reported {} readings: {:?}", self.bound.sensor, values.len(), values);
        }
        result
    }
}

/// Scoped streaming binding; closing it yields the captured samples.
pub struct SensorCapture {
    bound: BoundSensor,
    samples: SampleQueue,
}

impl SensorCapture {
    pub fn sensor(&self) -> &SensorInformation {
        &self.bound.sensor
    }

    /// Stop streaming and hand back everything received so far.
    pub async fn close(self) -> Result<SampleQueue, SensorError> {
        let SensorCapture { mut bound, mut samples } = self;
        let result = bound.disarm().await;
        samples.subscription.detach();
        result.map(|()| samples)
    }
}

/// Sensor readings buffered in arrival order.
pub struct SampleQueue {
    subscription: Subscription,
    sensor: SensorInformation,
}

impl SampleQueue {
    fn new(subscription: Subscription, sensor: SensorInformation) -> Self {
        Self { subscription, sensor }
    }

    /// Next buffered reading; `None` as soon as the queue is empty.
    pub fn try_next(&mut self) -> Option<f64> {
        while let Some(received) = self.subscription.try_recv() {
            if let Message::ReadSensorResponse(reading) = received.message {
                if reading.sensor_type == self.sensor.sensor_type && reading.sensor_id == self.sensor.sensor_id {
                    return Some(from_fixed_point(reading.value));
                }
            }
        }
        None
    }

    /// Every buffered reading, oldest first. Never waits.
    pub fn drain(&mut self) -> impl Iterator<Item = f64> + '_ {
        std::iter::from_fn(move || self.try_next())
    }
}

/// Sends thresholds and hands out exclusive sensor bindings.
///
/// Exclusivity is per bus: two schedulers driving the same [`Messenger`] cannot both
/// bind one sensor.
#[derive(Clone, Default)]
pub struct SensorScheduler {
    config: SensorConfig,
}

impl SensorScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SensorConfig) -> Self {
        Self { config }
    }

    /// Arm a threshold and return the value the node actually accepted.
    ///
    /// The node may quantize the request, so the accepted value can differ from it.
    pub async fn send_threshold(
        &self,
        info: &SensorThresholdInformation,
        messenger: &Messenger,
    ) -> Result<SensorDataType, SensorError> {
        let sensor = info.sensor;
        let reply = messenger
            .send_and_wait(
                sensor.node,
                Message::SetSensorThresholdRequest(info.to_wire()),
                &[MessageId::SensorThresholdResponse],
                self.config.threshold_timeout(),
            )
            .await;
        match reply {
            Ok(received) => match received.message {
                Message::SensorThresholdResponse(accepted)
                    if accepted.sensor_type == sensor.sensor_type && accepted.sensor_id == sensor.sensor_id =>
                {
                    let accepted = SensorDataType::from_raw(accepted.threshold);
                    tracing::info!(
                        "{} threshold set to {} (requested {})",
                        sensor,
                        accepted.to_float(),
                        info.data.to_float()
                    );
                    Ok(accepted)
                }
                other => Err(SensorError::ThresholdRejected {
                    node: sensor.node,
                    sensor,
                    reason: format!("unexpected reply {}", other.id()),
                }),
            },
            Err(MessengerError::Protocol { code, .. }) => Err(SensorError::ThresholdRejected {
                node: sensor.node,
                sensor,
                reason: format!("rejected with code {}", code),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Bind the sensor to the sync line for the life of the returned guard.
    ///
    /// With `log_readings` the node also reports readings, which are logged on close.
    pub async fn bind_sync(
        &self,
        sensor: &SensorInformation,
        messenger: &Messenger,
        log_readings: bool,
    ) -> Result<SensorBinding, SensorError> {
        let (binding, readings) = if log_readings {
            (SensorOutputBinding::SYNC | SensorOutputBinding::REPORT, Some(self.readings(sensor, messenger)))
        } else {
            (SensorOutputBinding::SYNC, None)
        };
        let bound = self.bind(sensor, messenger, binding).await?;
        Ok(SensorBinding { bound, readings })
    }

    /// Sync binding without reporting, as used for threshold-stopped probing.
    pub async fn bind_output(
        &self,
        messenger: &Messenger,
        sensor: &SensorInformation,
    ) -> Result<SensorBinding, SensorError> {
        self.bind_sync(sensor, messenger, false).await
    }

    /// Stream raw readings into a queue for the life of the returned guard.
    pub async fn capture_output(
        &self,
        sensor: &SensorInformation,
        messenger: &Messenger,
    ) -> Result<SensorCapture, SensorError> {
        // Subscribe first so no sample sent right after arming is missed.
        let subscription = self.readings(sensor, messenger);
        let bound = self.bind(sensor, messenger, SensorOutputBinding::REPORT).await?;
        Ok(SensorCapture { bound, samples: SampleQueue::new(subscription, *sensor) })
    }

    fn readings(&self, sensor: &SensorInformation, messenger: &Messenger) -> Subscription {
        messenger.subscribe(MessageFilter::node(sensor.node).with_kinds(&[MessageId::ReadSensorResponse]))
    }

    async fn bind(
        &self,
        sensor: &SensorInformation,
        messenger: &Messenger,
        binding: SensorOutputBinding,
    ) -> Result<BoundSensor, SensorError> {
        let claims = messenger.sensor_claims();
        if !lock(claims).insert(*sensor) {
            return Err(SensorError::AlreadyBound { node: sensor.node, sensor: *sensor });
        }
        let reservation = Reservation { registry: claims.clone(), sensor: *sensor };
        let request = Message::BindSensorOutputRequest(BindSensorOutput {
            sensor_type: sensor.sensor_type,
            sensor_id: sensor.sensor_id,
            binding,
        });
        messenger
            .send_and_wait(sensor.node, request, &[MessageId::Ack], self.config.bind_timeout())
            .await?;
        tracing::debug!("Bound {} with output {:#04x}", sensor, binding.bits());
        Ok(BoundSensor {
            sensor: *sensor,
            sender: messenger.sender(),
            reservation: Some(reservation),
            armed: true,
        })
    }
}
