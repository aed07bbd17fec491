use once_cell::sync::Lazy;

use super::{DataType, DeviceDriver, RegisterEntry, Window};

/// Renogy inverters (RIV series) behind a BT-2 module.
///
/// The status block at 4000 covers AC input, AC output, load, battery and
/// solar passthrough in ten registers, read in one request.
pub struct Inverter;

impl Inverter {
    pub const PROFILE_NAME: &'static str = "inverter";
    pub const DEFAULT_UNIT_ID: u8 = 0x20;

    const STATUS: Window = Window::new(4000, 10);
}

static STATUS_MAP: Lazy<Vec<RegisterEntry>> = Lazy::new(|| {
    vec![
        RegisterEntry::new(4000, 1, DataType::Uint16, 0.1, "input_voltage"),
        RegisterEntry::new(4001, 1, DataType::Uint16, 0.01, "input_current"),
        RegisterEntry::new(4002, 1, DataType::Uint16, 0.1, "output_voltage"),
        RegisterEntry::new(4003, 1, DataType::Uint16, 0.01, "output_current"),
        RegisterEntry::new(4004, 1, DataType::Uint16, 0.01, "output_frequency"),
        RegisterEntry::new(4005, 1, DataType::Uint16, 0.1, "battery_voltage"),
        RegisterEntry::new(4006, 1, DataType::Int16, 0.1, "temperature"),
        RegisterEntry::new(4007, 1, DataType::Uint16, 0.01, "input_frequency"),
        RegisterEntry::new(4008, 1, DataType::Uint16, 1.0, "load_power"),
        RegisterEntry::new(4009, 1, DataType::Uint16, 1.0, "solar_power"),
    ]
});

impl DeviceDriver for Inverter {
    fn profile_name(&self) -> &'static str {
        Self::PROFILE_NAME
    }

    fn register_map(&self) -> &[RegisterEntry] {
        &STATUS_MAP
    }

    fn build_poll_sequence(&self) -> Vec<Window> {
        vec![Self::STATUS]
    }
}

#[test]
fn test_inverter_status_block() {
    let driver = Inverter;
    let windows = driver.build_poll_sequence();
    assert_eq!(windows, vec![Window::new(4000, 10)]);

    let registers: [u16; 10] = [2301, 150, 1200, 80, 5000, 262, 0xfff6, 5000, 640, 120];
    let payload: Vec<u8> = registers.iter().flat_map(|r| r.to_be_bytes()).collect();
    let values = driver.interpret(&payload, &windows[0]);
    assert_eq!(values.len(), 10);
    assert!(values.values().all(|v| v.is_some()));
    let temperature = values["temperature"].as_ref().and_then(|v| v.as_f64()).unwrap();
    assert!((temperature + 1.0).abs() < 1e-9);
    let load = values["load_power"].as_ref().and_then(|v| v.as_f64()).unwrap();
    assert_eq!(load, 640.0);
}
