//! Poll Renogy solar charge controllers and inverters over Bluetooth Low Energy
//!
//! Renogy's BT-1 and BT-2 modules bridge a device's RS-485 Modbus port onto a
//! pair of GATT characteristics. Requests are written as Modbus RTU frames and
//! responses arrive as notifications, often split across several of them.
//!
//! The gateway keeps one cached session per device, polls each device's
//! register windows on its own schedule and hands every result to a
//! [`PublishingBridge`].
//!
//! Currently the following devices are understood:
//!
//! - Charge controllers (battery, PV, load, daily and lifetime counters)
//! - Inverters (input, output, battery, solar)
//! - Anything else speaking Modbus, given a register map
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! #
//! # #[tokio::main]
//! # pub async fn main(){
//!     let config = renogy_ble::GatewayConfig::from_file("gateway.json").unwrap();
//!     let factory = renogy_ble::BluestTransportFactory::new(config.scan_timeout()).await.unwrap();
//!     let gateway = renogy_ble::Gateway::start(&config, Arc::new(factory), Arc::new(renogy_ble::LogBridge))
//!         .await
//!         .unwrap();
//!     tokio::time::sleep(Duration::from_secs(300)).await;
//!     gateway.shutdown().await;
//! # }
//! ```

pub mod backoff;
mod bluetooth;
pub mod bridge;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod frame;
mod gateway;
pub mod manager;
pub mod mock;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use bluetooth::{BluestTransport, BluestTransportFactory, DiscoveredDevice};
pub use bridge::{ChannelBridge, JsonLinesBridge, LogBridge, PublishingBridge};
pub use config::{DeviceDescriptor, GatewayConfig};
pub use device::{DeviceRecord, PollResult};
pub use driver::{DeviceDriver, DeviceProfile, SensorValue, SensorValues};
pub use error::{ErrorClass, GatewayError, Result};
pub use gateway::Gateway;
