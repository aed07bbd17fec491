//! The assembled gateway: connection manager, poll scheduler and bridge.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::bridge::PublishingBridge;
use crate::config::{DeviceDescriptor, GatewayConfig};
use crate::device::{DeviceRecord, PollResult};
use crate::error::{GatewayError, Result};
use crate::frame;
use crate::manager::ConnectionManager;
use crate::scheduler::PollScheduler;
use crate::transport::TransportFactory;

pub struct Gateway {
    manager: Arc<ConnectionManager>,
    scheduler: PollScheduler,
    bridge: Arc<dyn PublishingBridge>,
    response_timeout: Duration,
}

impl Gateway {
    /// Start polling every device in `config`.
    ///
    /// A device that fails validation does not stop the others. It is
    /// reported once through the bridge as offline and never polled.
    pub async fn start(
        config: &GatewayConfig,
        factory: Arc<dyn TransportFactory>,
        bridge: Arc<dyn PublishingBridge>,
    ) -> Result<Self> {
        config.validate()?;
        let manager = ConnectionManager::new(factory, config.connection_manager());
        manager.start_sweeper().await;
        let scheduler_config = config.scheduler();
        let response_timeout = scheduler_config.response_timeout;
        let scheduler = PollScheduler::new(manager.clone(), bridge.clone(), scheduler_config);

        let gateway = Self { manager, scheduler, bridge, response_timeout };
        for descriptor in config.devices.iter().cloned() {
            // Rejections are already published, nothing more to do with them here.
            let _ = gateway.add_descriptor(descriptor).await;
        }
        info!("Gateway started with {} devices", gateway.scheduler.devices().await.len());
        Ok(gateway)
    }

    /// Validate `descriptor` and start polling it.
    pub async fn add_descriptor(&self, descriptor: DeviceDescriptor) -> Result<()> {
        let address = descriptor.address.clone();
        match descriptor.into_record() {
            Ok(record) => {
                self.add_device(record).await;
                Ok(())
            }
            Err(err) => {
                warn!("{address}: not polled: {err}");
                self.bridge.publish(PollResult::failure(&address, err.clone())).await;
                Err(err)
            }
        }
    }

    /// Start polling `record`, replacing any device with the same address.
    pub async fn add_device(&self, record: DeviceRecord) {
        self.scheduler.add_device(record).await;
    }

    /// Stop polling `address` and close any session to it, including one
    /// left open by [`Self::write_register`]. Returns false if it was not polled.
    pub async fn remove_device(&self, address: &str) -> bool {
        let removed = self.scheduler.remove_device(address).await;
        self.manager.invalidate(address).await;
        removed
    }

    pub async fn devices(&self) -> Vec<String> {
        self.scheduler.devices().await
    }

    /// Write one holding register and wait for the device to echo it back.
    pub async fn write_register(&self, address: &str, unit_id: u8, register: u16, value: u16) -> Result<()> {
        if unit_id == frame::BROADCAST_UNIT_ID {
            return Err(GatewayError::InvalidConfig("writes must address a single unit".into()));
        }
        let request = frame::encode_write_single_register(unit_id, register, value)?;
        let session = self.manager.acquire(address).await?;
        let response = match session.request(&request, self.response_timeout).await {
            Ok(response) => response,
            Err(err) => {
                if err.requires_reconnect() {
                    self.manager.invalidate(address).await;
                }
                return Err(err);
            }
        };
        if response.payload != request[2..6] {
            return Err(GatewayError::InvalidFrame("Write echo does not match request"));
        }
        info!("{address}: wrote 0x{value:04x} to register 0x{register:04x}");
        Ok(())
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Stop polling, then close every session.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.manager.shutdown().await;
        info!("Gateway stopped");
    }
}
