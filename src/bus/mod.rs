// src/bus/mod.rs - Node addressing and the transport boundary
pub mod serial;
pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Bus link is down")]
    LinkDown,
    #[error("Serial port error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("CRC mismatch (expected {expected:#06x}, got {actual:#06x})")]
    Crc { expected: u16, actual: u16 },
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Addressable controller on the bus.
///
/// The set is fixed by the bus topology; `Broadcast` addresses every node at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum NodeId {
    Broadcast = 0x00,
    Host = 0x10,
    Gripper = 0x20,
    GripperZ = 0x21,
    GripperG = 0x22,
    GantryX = 0x30,
    GantryY = 0x40,
    Head = 0x50,
    HeadL = 0x51,
    HeadR = 0x52,
    PipetteLeft = 0x60,
    PipetteRight = 0x70,
}

impl NodeId {
    pub const ALL: [NodeId; 12] = [
        NodeId::Broadcast,
        NodeId::Host,
        NodeId::Gripper,
        NodeId::GripperZ,
        NodeId::GripperG,
        NodeId::GantryX,
        NodeId::GantryY,
        NodeId::Head,
        NodeId::HeadL,
        NodeId::HeadR,
        NodeId::PipetteLeft,
        NodeId::PipetteRight,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|node| *node as u8 == value)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_pipette(self) -> bool {
        matches!(self, NodeId::PipetteLeft | NodeId::PipetteRight)
    }

    /// Mount axes that carry a pipette.
    pub fn is_mount(self) -> bool {
        matches!(self, NodeId::HeadL | NodeId::HeadR)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeId::Broadcast => "broadcast",
            NodeId::Host => "host",
            NodeId::Gripper => "gripper",
            NodeId::GripperZ => "gripper_z",
            NodeId::GripperG => "gripper_g",
            NodeId::GantryX => "gantry_x",
            NodeId::GantryY => "gantry_y",
            NodeId::Head => "head",
            NodeId::HeadL => "head_l",
            NodeId::HeadR => "head_r",
            NodeId::PipetteLeft => "pipette_left",
            NodeId::PipetteRight => "pipette_right",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|node| node.to_string() == s)
            .ok_or_else(|| format!("unknown node '{}'", s))
    }
}

/// Byte transport shared by the host and every node.
///
/// `send` takes the destination and an opaque frame body; `recv` yields the next
/// body together with the node that sent it. Implementations must deliver frames
/// from any one node in the order that node produced them. Only the `Messenger`
/// should hold a transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, node: NodeId, frame: &[u8]) -> Result<(), TransportError>;
    async fn recv(&self) -> Result<(NodeId, Vec<u8>), TransportError>;
}
