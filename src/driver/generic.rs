use super::{DeviceDriver, RegisterEntry};

/// A device with no built-in knowledge, read through a caller supplied map.
///
/// Windows are derived by grouping the map, see [`super::group_windows`].
pub struct GenericModbus {
    register_map: Vec<RegisterEntry>,
}

impl GenericModbus {
    pub const PROFILE_NAME: &'static str = "generic_modbus";

    pub fn new(register_map: Vec<RegisterEntry>) -> Self {
        Self { register_map }
    }
}

impl DeviceDriver for GenericModbus {
    fn profile_name(&self) -> &'static str {
        Self::PROFILE_NAME
    }

    fn register_map(&self) -> &[RegisterEntry] {
        &self.register_map
    }
}

#[test]
fn test_generic_reads_whatever_it_is_given() {
    use super::{DataType, SensorValue, Window};

    let driver = GenericModbus::new(vec![
        RegisterEntry::new(0x0010, 1, DataType::Uint16, 1.0, "a"),
        RegisterEntry::new(0x0011, 1, DataType::Int16, 0.5, "b"),
        RegisterEntry::new(0x0400, 2, DataType::Uint32, 1.0, "c"),
    ]);
    let windows = driver.build_poll_sequence();
    assert_eq!(windows, vec![Window::new(0x0010, 2), Window::new(0x0400, 2)]);

    let values = driver.interpret(&[0x00, 0x01, 0xff, 0xfc], &windows[0]);
    assert_eq!(values["a"], Some(SensorValue::Number(1.0)));
    assert_eq!(values["b"], Some(SensorValue::Number(-2.0)));
    assert!(!values.contains_key("c"));
}
