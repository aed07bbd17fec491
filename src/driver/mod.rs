//! Device drivers: what to read from a device and what the registers mean.
//!
//! Each [`DeviceProfile`] variant selects one driver. Drivers only deal in
//! register windows and payload bytes, the transport never sees them.

mod controller;
mod generic;
mod inverter;
mod register;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use controller::Controller;
pub use generic::GenericModbus;
pub use inverter::Inverter;
pub use register::{decode_window, DataType, RegisterEntry};

/// Windows are never grown past this many words.
pub const MAX_WINDOW_WORDS: u16 = 64;
/// Entries closer than this many words are read in the same window.
const MAX_WINDOW_GAP: u32 = 4;

/// A decoded sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SensorValue {
    Number(f64),
    Text(String),
}

impl SensorValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SensorValue::Number(value) => Some(*value),
            SensorValue::Text(_) => None,
        }
    }
}

/// Sensor key to value, `None` for keys that could not be decoded this cycle.
pub type SensorValues = BTreeMap<String, Option<SensorValue>>;

/// A contiguous register range read by one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start_address: u16,
    pub word_count: u16,
}

impl Window {
    pub const fn new(start_address: u16, word_count: u16) -> Self {
        Self { start_address, word_count }
    }

    pub fn end_address(&self) -> u32 {
        self.start_address as u32 + self.word_count as u32
    }

    /// Whether every register of `entry` lies inside this window.
    pub fn contains(&self, entry: &RegisterEntry) -> bool {
        entry.start_address >= self.start_address && entry.end_address() <= self.end_address()
    }
}

pub trait DeviceDriver: Send + Sync {
    fn profile_name(&self) -> &'static str;

    fn register_map(&self) -> &[RegisterEntry];

    /// The windows to read, in order, on every poll.
    fn build_poll_sequence(&self) -> Vec<Window> {
        group_windows(self.register_map())
    }

    /// Decode the payload returned for `window`.
    ///
    /// Must return the full key set of the window even for an empty payload,
    /// which is how failed windows are reported.
    fn interpret(&self, payload: &[u8], window: &Window) -> SensorValues {
        decode_window(self.register_map(), payload, window)
    }
}

/// Selects the driver for a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceProfile {
    Inverter,
    Controller,
    GenericModbus { register_map: Vec<RegisterEntry> },
}

impl DeviceProfile {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceProfile::Inverter => Inverter::PROFILE_NAME,
            DeviceProfile::Controller => Controller::PROFILE_NAME,
            DeviceProfile::GenericModbus { .. } => GenericModbus::PROFILE_NAME,
        }
    }

    pub fn driver(&self) -> Arc<dyn DeviceDriver> {
        match self {
            DeviceProfile::Inverter => Arc::new(Inverter),
            DeviceProfile::Controller => Arc::new(Controller),
            DeviceProfile::GenericModbus { register_map } => Arc::new(GenericModbus::new(register_map.clone())),
        }
    }
}

/// Group a register map into as few windows as possible.
///
/// Entries are sorted by address and merged while the gap between them is
/// small and the window stays under [`MAX_WINDOW_WORDS`].
pub fn group_windows(map: &[RegisterEntry]) -> Vec<Window> {
    let mut entries: Vec<&RegisterEntry> = map.iter().filter(|e| e.word_count > 0).collect();
    entries.sort_by_key(|e| e.start_address);

    let mut windows: Vec<Window> = Vec::new();
    for entry in entries {
        if let Some(last) = windows.last_mut() {
            let end = last.end_address().max(entry.end_address());
            let gap = (entry.start_address as u32).saturating_sub(last.end_address());
            if gap <= MAX_WINDOW_GAP && end - last.start_address as u32 <= MAX_WINDOW_WORDS as u32 {
                last.word_count = (end - last.start_address as u32) as u16;
                continue;
            }
        }
        windows.push(Window::new(entry.start_address, entry.word_count.min(MAX_WINDOW_WORDS)));
    }
    windows
}

#[test]
fn test_group_windows_merges_close_entries() {
    let map = vec![
        RegisterEntry::new(0x105, 1, DataType::Uint16, 1.0, "c"),
        RegisterEntry::new(0x100, 1, DataType::Uint16, 1.0, "a"),
        RegisterEntry::new(0x101, 2, DataType::Uint32, 1.0, "b"),
        RegisterEntry::new(0x200, 1, DataType::Uint16, 1.0, "far"),
    ];
    assert_eq!(group_windows(&map), vec![Window::new(0x100, 6), Window::new(0x200, 1)]);
}

#[test]
fn test_group_windows_caps_window_size() {
    let map: Vec<RegisterEntry> = (0..100u16)
        .map(|i| RegisterEntry::new(i, 1, DataType::Uint16, 1.0, &format!("r{i}")))
        .collect();
    let windows = group_windows(&map);
    assert_eq!(windows, vec![Window::new(0, 64), Window::new(64, 36)]);
    assert!(map.iter().all(|e| windows.iter().any(|w| w.contains(e))));
}
