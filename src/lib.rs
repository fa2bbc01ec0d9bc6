// src/lib.rs - Motion and sensor coordination for bus-connected robot nodes
pub mod bus;
pub mod config;
pub mod messages;
pub mod messenger;
pub mod motion;
pub mod network;
pub mod probe;
pub mod sensors;
pub mod sim;

pub use bus::{NodeId, Transport, TransportError};
pub use config::{Config, ConfigError, load_config};
pub use messenger::{Messenger, MessengerError};
