use once_cell::sync::Lazy;

use super::{decode_window, DataType, DeviceDriver, RegisterEntry, SensorValue, SensorValues, Window};

/// Renogy MPPT charge controllers (Rover, Wanderer, Adventurer) behind a BT-1 or BT-2 module.
pub struct Controller;

impl Controller {
    pub const PROFILE_NAME: &'static str = "controller";
    /// The BT-2 hub address. BT-1 modules often ship configured for 0xFF, which these devices will not answer.
    pub const DEFAULT_UNIT_ID: u8 = 0x61;

    const WINDOWS: [Window; 5] = [
        Window::new(0x000C, 8),
        Window::new(0x0100, 10),
        Window::new(0x010B, 6),
        Window::new(0x0115, 9),
        Window::new(0x0120, 1),
    ];

    const STATUS_WORD: &'static str = "status_word";
}

static MAP: Lazy<Vec<RegisterEntry>> = Lazy::new(|| {
    vec![
        RegisterEntry::new(0x000C, 8, DataType::Ascii, 1.0, "model"),
        // status
        RegisterEntry::new(0x0100, 1, DataType::Uint16, 1.0, "battery_percentage"),
        RegisterEntry::new(0x0101, 1, DataType::Uint16, 0.1, "battery_voltage"),
        RegisterEntry::new(0x0102, 1, DataType::Uint16, 0.01, "battery_current"),
        RegisterEntry::new(0x0103, 1, DataType::SignByteHigh, 1.0, "controller_temperature"),
        RegisterEntry::new(0x0103, 1, DataType::SignByteLow, 1.0, "battery_temperature"),
        RegisterEntry::new(0x0104, 1, DataType::Uint16, 0.1, "load_voltage"),
        RegisterEntry::new(0x0105, 1, DataType::Uint16, 0.01, "load_current"),
        RegisterEntry::new(0x0106, 1, DataType::Uint16, 1.0, "load_power"),
        RegisterEntry::new(0x0107, 1, DataType::Uint16, 0.1, "pv_voltage"),
        RegisterEntry::new(0x0108, 1, DataType::Uint16, 0.01, "pv_current"),
        RegisterEntry::new(0x0109, 1, DataType::Uint16, 1.0, "pv_power"),
        // today
        RegisterEntry::new(0x010B, 1, DataType::Uint16, 1.0, "max_charging_power_today"),
        RegisterEntry::new(0x010C, 1, DataType::Uint16, 1.0, "max_discharging_power_today"),
        RegisterEntry::new(0x010D, 1, DataType::Uint16, 1.0, "charging_amp_hours_today"),
        RegisterEntry::new(0x010E, 1, DataType::Uint16, 1.0, "discharging_amp_hours_today"),
        RegisterEntry::new(0x010F, 1, DataType::Uint16, 1.0, "power_generation_today"),
        RegisterEntry::new(0x0110, 1, DataType::Uint16, 1.0, "power_consumption_today"),
        // totals
        RegisterEntry::new(0x0115, 1, DataType::Uint16, 1.0, "operating_days"),
        RegisterEntry::new(0x0116, 1, DataType::Uint16, 1.0, "battery_over_discharges"),
        RegisterEntry::new(0x0117, 1, DataType::Uint16, 1.0, "battery_full_charges"),
        RegisterEntry::new(0x0118, 2, DataType::Uint32, 1.0, "charging_amp_hours_total"),
        RegisterEntry::new(0x011A, 2, DataType::Uint32, 1.0, "discharging_amp_hours_total"),
        RegisterEntry::new(0x011C, 2, DataType::Uint32, 0.001, "power_generation_total"),
        RegisterEntry::new(0x0120, 1, DataType::Uint16, 1.0, Controller::STATUS_WORD),
    ]
});

/// Low byte of the status word.
fn charging_state_name(code: u8) -> &'static str {
    match code {
        0 => "deactivated",
        1 => "activated",
        2 => "mppt",
        3 => "equalizing",
        4 => "boost",
        5 => "floating",
        6 => "current_limiting",
        _ => "unknown",
    }
}

impl DeviceDriver for Controller {
    fn profile_name(&self) -> &'static str {
        Self::PROFILE_NAME
    }

    fn register_map(&self) -> &[RegisterEntry] {
        &MAP
    }

    fn build_poll_sequence(&self) -> Vec<Window> {
        Self::WINDOWS.to_vec()
    }

    fn interpret(&self, payload: &[u8], window: &Window) -> SensorValues {
        let mut values = decode_window(&MAP, payload, window);
        if let Some(status) = values.remove(Self::STATUS_WORD) {
            let word = status.and_then(|v| v.as_f64()).map(|v| v as u16);
            values.insert(
                "load_on".to_string(),
                word.map(|w| SensorValue::Number((w >> 15) as f64)),
            );
            values.insert(
                "charging_state".to_string(),
                word.map(|w| SensorValue::Text(charging_state_name((w & 0xff) as u8).to_string())),
            );
        }
        values
    }
}

#[test]
fn test_every_entry_is_polled() {
    let windows = Controller.build_poll_sequence();
    assert!(MAP.iter().all(|entry| windows.iter().any(|w| w.contains(entry))));
}

#[test]
fn test_status_word_split() {
    let window = Window::new(0x0120, 1);
    let values = Controller.interpret(&[0x80, 0x02], &window);
    assert_eq!(values["load_on"], Some(SensorValue::Number(1.0)));
    assert_eq!(values["charging_state"], Some(SensorValue::Text("mppt".into())));
    assert!(!values.contains_key(Controller::STATUS_WORD));

    let values = Controller.interpret(&[], &window);
    assert_eq!(values.len(), 2);
    assert!(values.values().all(|v| v.is_none()));
}

#[test]
fn test_packed_temperatures() {
    let window = Window::new(0x0100, 10);
    let mut payload = vec![0u8; 20];
    payload[6] = 0x19;
    payload[7] = 0x85;
    let values = Controller.interpret(&payload, &window);
    assert_eq!(values["controller_temperature"], Some(SensorValue::Number(25.0)));
    assert_eq!(values["battery_temperature"], Some(SensorValue::Number(-5.0)));
}
