use serde::{Deserialize, Serialize};

use super::{SensorValue, SensorValues, Window, MAX_WINDOW_WORDS};

/// How the words of a register entry are turned into a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Uint16,
    Int16,
    /// Two words, high word first.
    Uint32,
    /// Two ASCII characters per word, trailing NULs and spaces trimmed.
    Ascii,
    /// High byte of the word as sign-magnitude (bit 7 is the sign).
    SignByteHigh,
    /// Low byte of the word as sign-magnitude.
    SignByteLow,
}

impl DataType {
    /// Number of words the type needs, or `None` for variable length runs.
    pub fn fixed_words(&self) -> Option<u16> {
        match self {
            DataType::Uint16 | DataType::Int16 | DataType::SignByteHigh | DataType::SignByteLow => Some(1),
            DataType::Uint32 => Some(2),
            DataType::Ascii => None,
        }
    }
}

/// One sensor value inside a device's register space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntry {
    pub start_address: u16,
    pub word_count: u16,
    pub data_type: DataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    pub sensor_key: String,
}

fn default_scale() -> f64 {
    1.0
}

impl RegisterEntry {
    pub fn new(start_address: u16, word_count: u16, data_type: DataType, scale: f64, sensor_key: &str) -> Self {
        Self { start_address, word_count, data_type, scale, sensor_key: sensor_key.to_string() }
    }

    /// Address one past the last register of the entry.
    pub fn end_address(&self) -> u32 {
        self.start_address as u32 + self.word_count as u32
    }

    /// Why this entry could never be read, if it cannot.
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.word_count == 0 || self.word_count > MAX_WINDOW_WORDS {
            return Err(format!(
                "{}: word_count must be between 1 and {MAX_WINDOW_WORDS}",
                self.sensor_key
            ));
        }
        match self.data_type.fixed_words() {
            Some(words) if words != self.word_count => Err(format!(
                "{}: {:?} takes {words} words, not {}",
                self.sensor_key, self.data_type, self.word_count
            )),
            _ => Ok(()),
        }
    }

    /// Decode this entry from `bytes`, which must be exactly its registers.
    ///
    /// Returns `None` when the byte length does not fit the data type.
    pub fn decode(&self, bytes: &[u8]) -> Option<SensorValue> {
        if bytes.len() != self.word_count as usize * 2 {
            return None;
        }
        if let Some(words) = self.data_type.fixed_words() {
            if words != self.word_count {
                return None;
            }
        }
        let raw = match self.data_type {
            DataType::Uint16 => u16::from_be_bytes([bytes[0], bytes[1]]) as f64,
            DataType::Int16 => i16::from_be_bytes([bytes[0], bytes[1]]) as f64,
            DataType::Uint32 => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            DataType::SignByteHigh => sign_magnitude(bytes[0]),
            DataType::SignByteLow => sign_magnitude(bytes[1]),
            DataType::Ascii => return decode_ascii(bytes).map(SensorValue::Text),
        };
        Some(SensorValue::Number(raw * self.scale))
    }
}

fn sign_magnitude(byte: u8) -> f64 {
    let magnitude = (byte & 0x7f) as f64;
    if byte & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

fn decode_ascii(bytes: &[u8]) -> Option<String> {
    if !bytes.iter().all(|b| *b == 0 || b.is_ascii_graphic() || *b == b' ') {
        return None;
    }
    let text: String = bytes.iter().filter(|b| **b != 0).map(|b| *b as char).collect();
    Some(text.trim().to_string())
}

/// Decode every entry of `map` that starts inside `window`.
///
/// Entries the payload is too short for come back as `None`, so an empty
/// payload yields the full key set of the window with no values.
pub fn decode_window(map: &[RegisterEntry], payload: &[u8], window: &Window) -> SensorValues {
    map.iter()
        .filter(|entry| window.contains(entry))
        .map(|entry| {
            let offset = (entry.start_address - window.start_address) as usize * 2;
            let len = entry.word_count as usize * 2;
            let value = payload.get(offset..offset + len).and_then(|bytes| entry.decode(bytes));
            (entry.sensor_key.clone(), value)
        })
        .collect()
}

#[test]
fn test_decode_data_types() {
    let entry = RegisterEntry::new(0, 1, DataType::Uint16, 0.1, "battery_voltage");
    match entry.decode(&[0x00, 0x84]) {
        Some(SensorValue::Number(v)) => assert!((v - 13.2).abs() < 1e-9),
        other => panic!("unexpected {other:?}"),
    }

    let entry = RegisterEntry::new(0, 1, DataType::Int16, 1.0, "current");
    assert_eq!(entry.decode(&[0xff, 0xfe]), Some(SensorValue::Number(-2.0)));

    let entry = RegisterEntry::new(0, 2, DataType::Uint32, 1.0, "total");
    assert_eq!(entry.decode(&[0x00, 0x01, 0x00, 0x02]), Some(SensorValue::Number(65538.0)));

    let entry = RegisterEntry::new(0, 1, DataType::SignByteHigh, 1.0, "controller_temperature");
    assert_eq!(entry.decode(&[0x99, 0x14]), Some(SensorValue::Number(-25.0)));
    let entry = RegisterEntry::new(0, 1, DataType::SignByteLow, 1.0, "battery_temperature");
    assert_eq!(entry.decode(&[0x99, 0x14]), Some(SensorValue::Number(20.0)));

    let entry = RegisterEntry::new(0, 4, DataType::Ascii, 1.0, "model");
    assert_eq!(entry.decode(b"RNG-CTRL"), Some(SensorValue::Text("RNG-CTRL".into())));
    let entry = RegisterEntry::new(0, 2, DataType::Ascii, 1.0, "model");
    assert_eq!(entry.decode(b" AB\0"), Some(SensorValue::Text("AB".into())));
}

#[test]
fn test_decode_rejects_mismatched_lengths() {
    let entry = RegisterEntry::new(0, 1, DataType::Uint32, 1.0, "total");
    assert_eq!(entry.decode(&[0x00, 0x01]), None);
    let entry = RegisterEntry::new(0, 2, DataType::Uint16, 1.0, "voltage");
    assert_eq!(entry.decode(&[0x00, 0x01]), None);
    let entry = RegisterEntry::new(0, 1, DataType::Ascii, 1.0, "model");
    assert_eq!(entry.decode(&[0x01, 0x41]), None);
}

#[test]
fn test_decode_window_short_payload_yields_none_per_key() {
    let map = vec![
        RegisterEntry::new(0x100, 1, DataType::Uint16, 1.0, "a"),
        RegisterEntry::new(0x101, 2, DataType::Uint32, 1.0, "b"),
        RegisterEntry::new(0x200, 1, DataType::Uint16, 1.0, "outside"),
    ];
    let window = Window::new(0x100, 3);
    let values = decode_window(&map, &[0x00, 0x07, 0x00, 0x00], &window);
    assert_eq!(values.len(), 2);
    assert_eq!(values["a"], Some(SensorValue::Number(7.0)));
    assert_eq!(values["b"], None);
}

#[test]
fn test_check_rejects_unreadable_entries() {
    assert!(RegisterEntry::new(0, 1, DataType::Uint16, 1.0, "a").check().is_ok());
    assert!(RegisterEntry::new(0, 64, DataType::Ascii, 1.0, "serial").check().is_ok());
    assert!(RegisterEntry::new(0, 70, DataType::Ascii, 1.0, "serial").check().is_err());
    assert!(RegisterEntry::new(0, 0, DataType::Uint16, 1.0, "a").check().is_err());
    assert!(RegisterEntry::new(0, 1, DataType::Uint32, 1.0, "total").check().is_err());
}
