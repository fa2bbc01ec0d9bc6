// src/sensors/mod.rs - Sensor identities and threshold values
pub mod scheduler;

pub use crate::messages::{SensorId, SensorOutputBinding, SensorThresholdMode, SensorType};
pub use scheduler::{SampleQueue, SensorBinding, SensorCapture, SensorError, SensorScheduler};

use crate::bus::NodeId;
use crate::messages::SensorThreshold;
use crate::messages::fixed_point::{from_fixed_point, to_fixed_point};
use std::fmt;

/// Which sensor, on which node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SensorInformation {
    pub sensor_type: SensorType,
    pub sensor_id: SensorId,
    pub node: NodeId,
}

impl SensorInformation {
    pub fn new(sensor_type: SensorType, sensor_id: SensorId, node: NodeId) -> Self {
        Self { sensor_type, sensor_id, node }
    }
}

impl fmt::Display for SensorInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?} on {}", self.sensor_type, self.sensor_id, self.node)
    }
}

/// A sensor value in the fixed-point form nodes use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SensorDataType {
    raw: i32,
}

impl SensorDataType {
    pub fn from_float(value: f64) -> Result<Self, SensorError> {
        to_fixed_point(value)
            .map(|raw| Self { raw })
            .ok_or(SensorError::OutOfRange(value))
    }

    pub fn from_raw(raw: i32) -> Self {
        Self { raw }
    }

    pub fn raw(self) -> i32 {
        self.raw
    }

    pub fn to_float(self) -> f64 {
        from_fixed_point(self.raw)
    }
}

/// Threshold to arm on a sensor before a bound move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorThresholdInformation {
    pub sensor: SensorInformation,
    pub data: SensorDataType,
    pub mode: SensorThresholdMode,
}

impl SensorThresholdInformation {
    pub fn new(sensor: SensorInformation, data: SensorDataType, mode: SensorThresholdMode) -> Self {
        Self { sensor, data, mode }
    }

    pub(crate) fn to_wire(&self) -> SensorThreshold {
        SensorThreshold {
            sensor_type: self.sensor.sensor_type,
            sensor_id: self.sensor.sensor_id,
            threshold: self.data.raw(),
            mode: self.mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_data_type_conversion() {
        let data = SensorDataType::from_float(1.5).unwrap();
        assert_eq!(data.raw(), 98304);
        assert_eq!(data.to_float(), 1.5);
        assert!(matches!(SensorDataType::from_float(1e9), Err(SensorError::OutOfRange(_))));
    }

    #[test]
    fn test_sensor_display_names_node() {
        let sensor = SensorInformation::new(SensorType::Capacitive, SensorId::S0, NodeId::PipetteLeft);
        assert_eq!(sensor.to_string(), "Capacitive S0 on pipette_left");
    }

    proptest! {
        #[test]
        fn prop_threshold_requantizes_without_drift(x in -1000.0f64..1000.0) {
            let once = SensorDataType::from_float(x).unwrap();
            let twice = SensorDataType::from_float(once.to_float()).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
