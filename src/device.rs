use std::time::{Duration, SystemTime};

use serde::{Serialize, Serializer};

use crate::driver::{DeviceProfile, SensorValues};
use crate::error::{ErrorClass, GatewayError};

/// Identity and polling configuration for one physical device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    /// Transport address, usually the BLE MAC. Unique per gateway.
    pub address: String,
    pub profile: DeviceProfile,
    /// Never the broadcast id, these devices only answer reads addressed to them.
    pub modbus_unit_id: u8,
    pub poll_interval: Duration,
    /// Reset to zero by every successful poll.
    pub consecutive_failures: u32,
}

impl DeviceRecord {
    pub fn new(address: &str, profile: DeviceProfile, modbus_unit_id: u8, poll_interval: Duration) -> Self {
        Self {
            address: address.to_string(),
            profile,
            modbus_unit_id,
            poll_interval,
            consecutive_failures: 0,
        }
    }
}

/// The outcome of one poll cycle, handed to the publishing bridge.
#[derive(Debug, Clone, Serialize)]
pub struct PollResult {
    pub device_address: String,
    pub timestamp: SystemTime,
    pub values: SensorValues,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<GatewayError>,
    /// Set after a permanent error, the device is not polled again until reconfigured.
    pub offline: bool,
}

impl PollResult {
    pub fn success(device_address: &str, values: SensorValues) -> Self {
        Self {
            device_address: device_address.to_string(),
            timestamp: SystemTime::now(),
            values,
            error: None,
            offline: false,
        }
    }

    pub fn failure(device_address: &str, error: GatewayError) -> Self {
        let offline = error.class() == ErrorClass::Permanent;
        Self {
            device_address: device_address.to_string(),
            timestamp: SystemTime::now(),
            values: SensorValues::new(),
            error: Some(error),
            offline,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Serialize)]
struct ErrorReport {
    class: ErrorClass,
    message: String,
}

fn serialize_error<S: Serializer>(error: &Option<GatewayError>, serializer: S) -> Result<S::Ok, S::Error> {
    error
        .as_ref()
        .map(|e| ErrorReport { class: e.class(), message: e.to_string() })
        .serialize(serializer)
}

#[test]
fn test_permanent_failure_marks_offline() {
    let result = PollResult::failure("aa", GatewayError::DeviceNotFound("aa".into()));
    assert!(result.offline);
    assert!(!result.is_success());

    let result = PollResult::failure("aa", GatewayError::NoConnectionSlot);
    assert!(!result.offline);
}

#[test]
fn test_serializes_error_as_class_and_message() {
    let result = PollResult::failure("aa", GatewayError::NoConnectionSlot);
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["error"]["class"], "transient");
    assert_eq!(json["error"]["message"], "No connection slot available");
    assert_eq!(json["device_address"], "aa");
}
