//! Where poll results go once the gateway is done with them.

use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::mpsc;

use crate::device::PollResult;

#[async_trait]
pub trait PublishingBridge: Send + Sync {
    async fn publish(&self, result: PollResult);
}

/// Logs every result.
pub struct LogBridge;

#[async_trait]
impl PublishingBridge for LogBridge {
    async fn publish(&self, result: PollResult) {
        match &result.error {
            None => info!("{}: {:?}", result.device_address, result.values),
            Some(err) => warn!("{}: poll failed (offline: {}): {err}", result.device_address, result.offline),
        }
    }
}

/// Writes each result to stdout as one JSON document per line.
pub struct JsonLinesBridge;

#[async_trait]
impl PublishingBridge for JsonLinesBridge {
    async fn publish(&self, result: PollResult) {
        match serde_json::to_string(&result) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!("{}: failed to serialize poll result: {err}", result.device_address),
        }
    }
}

/// Forwards results into a channel, for embedding the gateway in another program.
pub struct ChannelBridge {
    sender: mpsc::Sender<PollResult>,
}

impl ChannelBridge {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PollResult>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl PublishingBridge for ChannelBridge {
    async fn publish(&self, result: PollResult) {
        if self.sender.send(result).await.is_err() {
            warn!("Poll result receiver dropped");
        }
    }
}
