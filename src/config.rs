//! Gateway configuration, loaded from a JSON file.
//!
//! ```json
//! {
//!     "cache_ttl_secs": 60,
//!     "max_sessions": 3,
//!     "devices": [
//!         { "address": "AA:BB:CC:DD:EE:01", "profile": "controller", "poll_interval_secs": 30 },
//!         { "address": "AA:BB:CC:DD:EE:02", "profile": "inverter", "unit_id": 32 }
//!     ]
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::{BackoffConfig, BackoffPolicy};
use crate::device::DeviceRecord;
use crate::driver::{Controller, DeviceProfile, GenericModbus, Inverter, RegisterEntry};
use crate::error::{GatewayError, Result};
use crate::frame::BROADCAST_UNIT_ID;
use crate::manager::ConnectionManagerConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub cache_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub connect_timeout_secs: u64,
    /// How long the BLE transport scans for a device before giving up on it.
    pub scan_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub max_sessions: usize,
    pub busy_retry_delay_ms: u64,
    pub max_busy_retries: u32,
    pub shutdown_grace_secs: u64,
    pub backoff: BackoffConfig,
    pub devices: Vec<DeviceDescriptor>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 60,
            sweep_interval_secs: 15,
            connect_timeout_secs: 30,
            scan_timeout_secs: 15,
            response_timeout_secs: 5,
            max_sessions: 3,
            busy_retry_delay_ms: 500,
            max_busy_retries: 2,
            shutdown_grace_secs: 5,
            backoff: BackoffConfig::default(),
            devices: Vec::new(),
        }
    }
}

/// One device as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceDescriptor {
    pub address: String,
    pub profile: String,
    /// Defaults to the profile's usual unit id. Required for `generic_modbus`.
    pub unit_id: Option<u8>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Replaces the built-in register map of the profile.
    pub register_map: Option<Vec<RegisterEntry>>,
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl GatewayConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_json::from_str(json).map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Checks the gateway-wide settings. Devices are checked one by one in
    /// [`DeviceDescriptor::into_record`] so that one bad device does not stop the rest.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("cache_ttl_secs", self.cache_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("scan_timeout_secs", self.scan_timeout_secs),
            ("response_timeout_secs", self.response_timeout_secs),
            ("max_sessions", self.max_sessions as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(GatewayError::InvalidConfig(format!("{name} must be greater than zero")));
        }
        if self.backoff.multiplier <= 1.0 {
            return Err(GatewayError::InvalidConfig("backoff.multiplier must be greater than 1".into()));
        }
        if self.backoff.initial_delay_ms == 0 || self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            return Err(GatewayError::InvalidConfig(
                "backoff.initial_delay_ms must be between 1 and backoff.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn connection_manager(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_sessions: self.max_sessions,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            busy_retry_delay: Duration::from_millis(self.busy_retry_delay_ms),
            max_busy_retries: self.max_busy_retries,
            backoff: BackoffPolicy::from(&self.backoff),
            max_concurrent_polls: self.max_sessions,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

impl DeviceDescriptor {
    pub fn into_record(self) -> Result<DeviceRecord> {
        let (profile, default_unit_id) = match self.profile.as_str() {
            Inverter::PROFILE_NAME => (Some(DeviceProfile::Inverter), Some(Inverter::DEFAULT_UNIT_ID)),
            Controller::PROFILE_NAME => (Some(DeviceProfile::Controller), Some(Controller::DEFAULT_UNIT_ID)),
            GenericModbus::PROFILE_NAME => (None, None),
            other => return Err(GatewayError::UnknownProfile(other.to_string())),
        };

        // A register map turns any profile into a plain map-driven device.
        let profile = match (self.register_map, profile) {
            (Some(register_map), _) if register_map.is_empty() => {
                return Err(GatewayError::InvalidConfig(format!("{}: register_map is empty", self.address)))
            }
            (Some(register_map), _) => {
                if let Err(reason) = register_map.iter().try_for_each(RegisterEntry::check) {
                    return Err(GatewayError::InvalidConfig(format!("{}: {reason}", self.address)));
                }
                DeviceProfile::GenericModbus { register_map }
            }
            (None, Some(profile)) => profile,
            (None, None) => {
                return Err(GatewayError::InvalidConfig(format!(
                    "{}: generic_modbus needs a register_map",
                    self.address
                )))
            }
        };

        let unit_id = self.unit_id.or(default_unit_id).ok_or_else(|| {
            GatewayError::InvalidConfig(format!("{}: unit_id is required for this profile", self.address))
        })?;
        if unit_id == 0 || unit_id == BROADCAST_UNIT_ID {
            return Err(GatewayError::InvalidConfig(format!(
                "{}: unit_id {unit_id} is a broadcast address, devices only answer their own id",
                self.address
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(GatewayError::InvalidConfig(format!("{}: poll_interval_secs must be positive", self.address)));
        }

        Ok(DeviceRecord::new(&self.address, profile, unit_id, Duration::from_secs(self.poll_interval_secs)))
    }
}

#[test]
fn test_defaults_and_devices() {
    let config = GatewayConfig::from_json(
        r#"{
            "max_sessions": 2,
            "devices": [
                { "address": "AA:BB:CC:DD:EE:01", "profile": "controller" },
                { "address": "AA:BB:CC:DD:EE:02", "profile": "inverter", "unit_id": 33, "poll_interval_secs": 10 },
                { "address": "AA:BB:CC:DD:EE:03", "profile": "generic_modbus", "unit_id": 1,
                  "register_map": [ { "start_address": 256, "word_count": 1, "data_type": "uint16", "scale": 0.1, "sensor_key": "v" } ] }
            ]
        }"#,
    )
    .unwrap();
    assert_eq!(config.cache_ttl_secs, 60);
    assert_eq!(config.scheduler().max_concurrent_polls, 2);

    let records: Vec<DeviceRecord> = config.devices.into_iter().map(|d| d.into_record().unwrap()).collect();
    assert_eq!(records[0].modbus_unit_id, Controller::DEFAULT_UNIT_ID);
    assert_eq!(records[0].poll_interval, Duration::from_secs(30));
    assert_eq!(records[1].profile, DeviceProfile::Inverter);
    assert_eq!(records[1].modbus_unit_id, 33);
    match &records[2].profile {
        DeviceProfile::GenericModbus { register_map } => assert_eq!(register_map[0].sensor_key, "v"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_rejects_bad_devices() {
    let descriptor = |profile: &str, unit_id: Option<u8>| DeviceDescriptor {
        address: "AA".into(),
        profile: profile.into(),
        unit_id,
        poll_interval_secs: 30,
        register_map: None,
    };
    assert_eq!(
        descriptor("toaster", None).into_record(),
        Err(GatewayError::UnknownProfile("toaster".into()))
    );
    assert!(matches!(descriptor("controller", Some(0xFF)).into_record(), Err(GatewayError::InvalidConfig(_))));
    assert!(matches!(descriptor("generic_modbus", Some(1)).into_record(), Err(GatewayError::InvalidConfig(_))));
}

#[test]
fn test_rejects_bad_settings() {
    assert!(GatewayConfig::from_json(r#"{ "max_sessions": 0 }"#).is_err());
    assert!(GatewayConfig::from_json(r#"{ "backoff": { "multiplier": 1.0 } }"#).is_err());
    assert!(GatewayConfig::from_json("not json").is_err());
}

#[test]
fn test_rejects_register_maps_that_cannot_be_polled() {
    use crate::driver::DataType;

    let descriptor = |entry: RegisterEntry| DeviceDescriptor {
        address: "AA".into(),
        profile: "generic_modbus".into(),
        unit_id: Some(1),
        poll_interval_secs: 30,
        register_map: Some(vec![entry]),
    };
    let oversized = RegisterEntry::new(0, 70, DataType::Ascii, 1.0, "serial");
    assert!(matches!(descriptor(oversized).into_record(), Err(GatewayError::InvalidConfig(_))));
    let empty = RegisterEntry::new(0, 0, DataType::Uint16, 1.0, "nothing");
    assert!(matches!(descriptor(empty).into_record(), Err(GatewayError::InvalidConfig(_))));
    let short = RegisterEntry::new(0, 1, DataType::Uint32, 1.0, "total");
    assert!(matches!(descriptor(short).into_record(), Err(GatewayError::InvalidConfig(_))));
    let fits = RegisterEntry::new(0, 64, DataType::Ascii, 1.0, "serial");
    assert!(descriptor(fits).into_record().is_ok());
}
