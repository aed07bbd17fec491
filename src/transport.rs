//! The seam between the gateway and a concrete BLE stack.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::Result;

/// Notification payloads from the device, in arrival order.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// One device's GATT link: a command characteristic to write to and a
/// notification characteristic to listen on.
#[async_trait]
pub trait BleTransport: Send {
    /// Find the device and establish the link.
    async fn connect(&mut self) -> Result<()>;

    /// Start listening on the notification characteristic.
    ///
    /// The stream ends when the link goes down.
    async fn subscribe(&mut self) -> Result<NotificationStream>;

    async fn write_command(&mut self, data: &[u8]) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// Creates unconnected transports for device addresses.
pub trait TransportFactory: Send + Sync {
    fn create(&self, address: &str) -> Box<dyn BleTransport>;
}
