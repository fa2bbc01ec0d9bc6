//! Message kind registry and payload codec.
//!
//! Every frame body is an [`Envelope`]: `[message_id: u16][index: u16][payload]`,
//! all little-endian. Message ids are append-only; an existing id is never renumbered.
//! Trailing payload bytes beyond the fields a kind defines are ignored so nodes can
//! extend a payload without breaking older hosts.

pub mod fixed_point;

use crate::bus::NodeId;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unknown message id {0:#06x}")]
    UnknownMessageId(u16),
    #[error("Truncated payload for {id}")]
    Truncated { id: MessageId },
    #[error("Invalid {field} in {id}")]
    InvalidField { id: MessageId, field: &'static str },
    #[error("Frame shorter than the envelope header")]
    MissingHeader,
}

/// Stable discriminators shared with node firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum MessageId {
    Echo = 0x00,
    Ack = 0x01,
    AckFailed = 0x02,
    DeviceInfoRequest = 0x03,
    DeviceInfoResponse = 0x04,
    EnterBootloaderRequest = 0x05,
    EnterBootloaderResponse = 0x06,
    WriteMotorCurrentRequest = 0x10,
    ClearAllMoveGroupsRequest = 0x11,
    AddMoveRequest = 0x12,
    ExecuteMoveGroupRequest = 0x13,
    StopRequest = 0x14,
    MoveCompleted = 0x15,
    SetSensorThresholdRequest = 0x20,
    SensorThresholdResponse = 0x21,
    BindSensorOutputRequest = 0x22,
    ReadSensorResponse = 0x23,
}

impl MessageId {
    pub fn from_u16(value: u16) -> Option<Self> {
        let id = match value {
            0x00 => MessageId::Echo,
            0x01 => MessageId::Ack,
            0x02 => MessageId::AckFailed,
            0x03 => MessageId::DeviceInfoRequest,
            0x04 => MessageId::DeviceInfoResponse,
            0x05 => MessageId::EnterBootloaderRequest,
            0x06 => MessageId::EnterBootloaderResponse,
            0x10 => MessageId::WriteMotorCurrentRequest,
            0x11 => MessageId::ClearAllMoveGroupsRequest,
            0x12 => MessageId::AddMoveRequest,
            0x13 => MessageId::ExecuteMoveGroupRequest,
            0x14 => MessageId::StopRequest,
            0x15 => MessageId::MoveCompleted,
            0x20 => MessageId::SetSensorThresholdRequest,
            0x21 => MessageId::SensorThresholdResponse,
            0x22 => MessageId::BindSensorOutputRequest,
            0x23 => MessageId::ReadSensorResponse,
            _ => return None,
        };
        Some(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SensorType {
    Tip = 0x00,
    Capacitive = 0x01,
    Environment = 0x02,
    Pressure = 0x03,
}

impl SensorType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(SensorType::Tip),
            0x01 => Some(SensorType::Capacitive),
            0x02 => Some(SensorType::Environment),
            0x03 => Some(SensorType::Pressure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum SensorId {
    S0 = 0x00,
    S1 = 0x01,
}

impl SensorId {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(SensorId::S0),
            0x01 => Some(SensorId::S1),
            _ => None,
        }
    }
}

/// How a node interprets a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SensorThresholdMode {
    /// Trip at the given absolute reading.
    Absolute = 0x00,
    /// Sample a baseline first, then trip at baseline + threshold.
    AutoBaseline = 0x01,
}

impl SensorThresholdMode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(SensorThresholdMode::Absolute),
            0x01 => Some(SensorThresholdMode::AutoBaseline),
            _ => None,
        }
    }
}

/// What a bound sensor does with its readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorOutputBinding(u8);

impl SensorOutputBinding {
    pub const NONE: Self = Self(0);
    pub const SYNC: Self = Self(0x01);
    pub const REPORT: Self = Self(0x02);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x03)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for SensorOutputBinding {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Condition that ends a move step before its commanded duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MoveStopCondition {
    None = 0,
    LimitSwitch = 1,
    SyncLine = 2,
    SensorThreshold = 3,
}

impl MoveStopCondition {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MoveStopCondition::None),
            1 => Some(MoveStopCondition::LimitSwitch),
            2 => Some(MoveStopCondition::SyncLine),
            3 => Some(MoveStopCondition::SensorThreshold),
            _ => None,
        }
    }
}

/// Tip mechanism action attached to a step; `None` for plain axis motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TipActionType {
    None = 0,
    PickUp = 1,
    Drop = 2,
}

impl TipActionType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TipActionType::None),
            1 => Some(TipActionType::PickUp),
            2 => Some(TipActionType::Drop),
            _ => None,
        }
    }
}

/// Reason a node reports for finishing a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MoveAck {
    CompletedWithoutCondition = 1,
    StoppedByCondition = 2,
    StoppedBySync = 3,
    StoppedByHost = 4,
    PositionError = 5,
}

impl MoveAck {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MoveAck::CompletedWithoutCondition),
            2 => Some(MoveAck::StoppedByCondition),
            3 => Some(MoveAck::StoppedBySync),
            4 => Some(MoveAck::StoppedByHost),
            5 => Some(MoveAck::PositionError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub version: u32,
    pub flags: u32,
    pub shortsha: [u8; 8],
}

/// Motor currents in amps, fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorCurrent {
    pub hold: u32,
    pub run: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddMove {
    pub group: u8,
    pub seq: u8,
    pub duration_us: u32,
    /// mm/s, fixed point
    pub velocity: i32,
    /// mm/s^2, fixed point
    pub acceleration: i32,
    pub stop_condition: MoveStopCondition,
    pub action: TipActionType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteMoveGroup {
    pub group: u8,
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveCompleted {
    pub group: u8,
    pub seq: u8,
    pub position_um: i32,
    pub elapsed_us: u32,
    pub ack: MoveAck,
    /// Fixed-point reading of the sensor that ended the step, if any.
    pub sensor: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorThreshold {
    pub sensor_type: SensorType,
    pub sensor_id: SensorId,
    pub threshold: i32,
    pub mode: SensorThresholdMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindSensorOutput {
    pub sensor_type: SensorType,
    pub sensor_id: SensorId,
    pub binding: SensorOutputBinding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorReading {
    pub sensor_type: SensorType,
    pub sensor_id: SensorId,
    pub value: i32,
}

/// Every message either side of the bus can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Echo(Vec<u8>),
    Ack,
    AckFailed { code: u16 },
    DeviceInfoRequest,
    DeviceInfoResponse(DeviceInfo),
    EnterBootloaderRequest,
    EnterBootloaderResponse { accepted: bool },
    WriteMotorCurrentRequest(MotorCurrent),
    ClearAllMoveGroupsRequest,
    AddMoveRequest(AddMove),
    ExecuteMoveGroupRequest(ExecuteMoveGroup),
    StopRequest,
    MoveCompleted(MoveCompleted),
    SetSensorThresholdRequest(SensorThreshold),
    SensorThresholdResponse(SensorThreshold),
    BindSensorOutputRequest(BindSensorOutput),
    ReadSensorResponse(SensorReading),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Echo(_) => MessageId::Echo,
            Message::Ack => MessageId::Ack,
            Message::AckFailed { .. } => MessageId::AckFailed,
            Message::DeviceInfoRequest => MessageId::DeviceInfoRequest,
            Message::DeviceInfoResponse(_) => MessageId::DeviceInfoResponse,
            Message::EnterBootloaderRequest => MessageId::EnterBootloaderRequest,
            Message::EnterBootloaderResponse { .. } => MessageId::EnterBootloaderResponse,
            Message::WriteMotorCurrentRequest(_) => MessageId::WriteMotorCurrentRequest,
            Message::ClearAllMoveGroupsRequest => MessageId::ClearAllMoveGroupsRequest,
            Message::AddMoveRequest(_) => MessageId::AddMoveRequest,
            Message::ExecuteMoveGroupRequest(_) => MessageId::ExecuteMoveGroupRequest,
            Message::StopRequest => MessageId::StopRequest,
            Message::MoveCompleted(_) => MessageId::MoveCompleted,
            Message::SetSensorThresholdRequest(_) => MessageId::SetSensorThresholdRequest,
            Message::SensorThresholdResponse(_) => MessageId::SensorThresholdResponse,
            Message::BindSensorOutputRequest(_) => MessageId::BindSensorOutputRequest,
            Message::ReadSensorResponse(_) => MessageId::ReadSensorResponse,
        }
    }

    fn encode_payload(&self, out: &mut PayloadWriter) {
        match self {
            Message::Echo(bytes) => out.bytes(bytes),
            Message::Ack
            | Message::DeviceInfoRequest
            | Message::EnterBootloaderRequest
            | Message::ClearAllMoveGroupsRequest
            | Message::StopRequest => {}
            Message::AckFailed { code } => out.u16(*code),
            Message::DeviceInfoResponse(info) => {
                out.u32(info.version);
                out.u32(info.flags);
                out.bytes(&info.shortsha);
            }
            Message::EnterBootloaderResponse { accepted } => out.u8(*accepted as u8),
            Message::WriteMotorCurrentRequest(current) => {
                out.u32(current.hold);
                out.u32(current.run);
            }
            Message::AddMoveRequest(step) => {
                out.u8(step.group);
                out.u8(step.seq);
                out.u32(step.duration_us);
                out.i32(step.velocity);
                out.i32(step.acceleration);
                out.u8(step.stop_condition as u8);
                out.u8(step.action as u8);
            }
            Message::ExecuteMoveGroupRequest(execute) => {
                out.u8(execute.group);
                out.u8(execute.nodes.len() as u8);
                for node in &execute.nodes {
                    out.u8(node.as_u8());
                }
            }
            Message::MoveCompleted(done) => {
                out.u8(done.group);
                out.u8(done.seq);
                out.i32(done.position_um);
                out.u32(done.elapsed_us);
                out.u8(done.ack as u8);
                out.u8(done.sensor.is_some() as u8);
                out.i32(done.sensor.unwrap_or(0));
            }
            Message::SetSensorThresholdRequest(threshold)
            | Message::SensorThresholdResponse(threshold) => {
                out.u8(threshold.sensor_type as u8);
                out.u8(threshold.sensor_id as u8);
                out.i32(threshold.threshold);
                out.u8(threshold.mode as u8);
            }
            Message::BindSensorOutputRequest(bind) => {
                out.u8(bind.sensor_type as u8);
                out.u8(bind.sensor_id as u8);
                out.u8(bind.binding.bits());
            }
            Message::ReadSensorResponse(reading) => {
                out.u8(reading.sensor_type as u8);
                out.u8(reading.sensor_id as u8);
                out.i32(reading.value);
            }
        }
    }

    fn decode_payload(id: MessageId, input: &mut PayloadReader<'_>) -> Result<Self, CodecError> {
        let message = match id {
            MessageId::Echo => Message::Echo(input.rest().to_vec()),
            MessageId::Ack => Message::Ack,
            MessageId::AckFailed => Message::AckFailed { code: input.u16()? },
            MessageId::DeviceInfoRequest => Message::DeviceInfoRequest,
            MessageId::DeviceInfoResponse => {
                let version = input.u32()?;
                let flags = input.u32()?;
                let mut shortsha = [0u8; 8];
                shortsha.copy_from_slice(input.take(8)?);
                Message::DeviceInfoResponse(DeviceInfo { version, flags, shortsha })
            }
            MessageId::EnterBootloaderRequest => Message::EnterBootloaderRequest,
            MessageId::EnterBootloaderResponse => {
                Message::EnterBootloaderResponse { accepted: input.u8()? != 0 }
            }
            MessageId::WriteMotorCurrentRequest => Message::WriteMotorCurrentRequest(MotorCurrent {
                hold: input.u32()?,
                run: input.u32()?,
            }),
            MessageId::ClearAllMoveGroupsRequest => Message::ClearAllMoveGroupsRequest,
            MessageId::AddMoveRequest => Message::AddMoveRequest(AddMove {
                group: input.u8()?,
                seq: input.u8()?,
                duration_us: input.u32()?,
                velocity: input.i32()?,
                acceleration: input.i32()?,
                stop_condition: input.field(MoveStopCondition::from_u8, "stop_condition")?,
                action: input.field(TipActionType::from_u8, "action")?,
            }),
            MessageId::ExecuteMoveGroupRequest => {
                let group = input.u8()?;
                let count = input.u8()?;
                let mut nodes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    nodes.push(input.field(NodeId::from_u8, "nodes")?);
                }
                Message::ExecuteMoveGroupRequest(ExecuteMoveGroup { group, nodes })
            }
            MessageId::StopRequest => Message::StopRequest,
            MessageId::MoveCompleted => {
                let group = input.u8()?;
                let seq = input.u8()?;
                let position_um = input.i32()?;
                let elapsed_us = input.u32()?;
                let ack = input.field(MoveAck::from_u8, "ack")?;
                let has_sensor = input.u8()? != 0;
                let sensor = input.i32()?;
                Message::MoveCompleted(MoveCompleted {
                    group,
                    seq,
                    position_um,
                    elapsed_us,
                    ack,
                    sensor: has_sensor.then_some(sensor),
                })
            }
            MessageId::SetSensorThresholdRequest => {
                Message::SetSensorThresholdRequest(Self::decode_threshold(input)?)
            }
            MessageId::SensorThresholdResponse => {
                Message::SensorThresholdResponse(Self::decode_threshold(input)?)
            }
            MessageId::BindSensorOutputRequest => Message::BindSensorOutputRequest(BindSensorOutput {
                sensor_type: input.field(SensorType::from_u8, "sensor_type")?,
                sensor_id: input.field(SensorId::from_u8, "sensor_id")?,
                binding: SensorOutputBinding::from_bits(input.u8()?),
            }),
            MessageId::ReadSensorResponse => Message::ReadSensorResponse(SensorReading {
                sensor_type: input.field(SensorType::from_u8, "sensor_type")?,
                sensor_id: input.field(SensorId::from_u8, "sensor_id")?,
                value: input.i32()?,
            }),
        };
        Ok(message)
    }

    fn decode_threshold(input: &mut PayloadReader<'_>) -> Result<SensorThreshold, CodecError> {
        Ok(SensorThreshold {
            sensor_type: input.field(SensorType::from_u8, "sensor_type")?,
            sensor_id: input.field(SensorId::from_u8, "sensor_id")?,
            threshold: input.i32()?,
            mode: input.field(SensorThresholdMode::from_u8, "mode")?,
        })
    }
}

/// A message plus the correlation index it travels with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Assigned by the host for requests, echoed by nodes; 0 when unsolicited.
    pub index: u16,
    pub message: Message,
}

impl Envelope {
    pub fn new(index: u16, message: Message) -> Self {
        Self { index, message }
    }

    pub fn unsolicited(message: Message) -> Self {
        Self { index: 0, message }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = PayloadWriter::default();
        out.u16(self.message.id() as u16);
        out.u16(self.index);
        self.message.encode_payload(&mut out);
        out.into_inner()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < 4 {
            return Err(CodecError::MissingHeader);
        }
        let raw_id = u16::from_le_bytes([frame[0], frame[1]]);
        let id = MessageId::from_u16(raw_id).ok_or(CodecError::UnknownMessageId(raw_id))?;
        let index = u16::from_le_bytes([frame[2], frame[3]]);
        let mut reader = PayloadReader { id, data: &frame[4..] };
        let message = Message::decode_payload(id, &mut reader)?;
        Ok(Self { index, message })
    }
}

#[derive(Debug, Default)]
struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

struct PayloadReader<'a> {
    id: MessageId,
    data: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.data.len() < n {
            return Err(CodecError::Truncated { id: self.id });
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }
    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }
    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }
    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn i32(&mut self) -> Result<i32, CodecError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn field<T>(&mut self, parse: fn(u8) -> Option<T>, field: &'static str) -> Result<T, CodecError> {
        let raw = self.u8()?;
        parse(raw).ok_or(CodecError::InvalidField { id: self.id, field })
    }
}
