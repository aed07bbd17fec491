//! The real BLE transport, built on `bluest`.
//!
//! Renogy BT-1 and BT-2 modules expose a serial bridge as two GATT services:
//! commands are written to characteristic `ffd1` of service `ffd0`, and the
//! device's answers come back as notifications on characteristic `fff1` of
//! service `fff0`, usually split over several notifications.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluest::error::ErrorKind;
use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::{stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{GatewayError, Result};
use crate::transport::{BleTransport, NotificationStream, TransportFactory};

const WRITE_SERVICE_ID: Uuid = Uuid::from_u128(0x0000ffd0_0000_1000_8000_00805f9b34fb);
const WRITE_CHARACTERISTIC_ID: Uuid = Uuid::from_u128(0x0000ffd1_0000_1000_8000_00805f9b34fb);
const NOTIFY_SERVICE_ID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
const NOTIFY_CHARACTERISTIC_ID: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);

const NOTIFICATION_QUEUE: usize = 64;

/// A device seen while scanning.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Creates [`BluestTransport`]s sharing the default adapter.
#[derive(Clone)]
pub struct BluestTransportFactory {
    adapter: Adapter,
    /// The adapter can only run one scan at a time.
    scan_lock: Arc<Mutex<()>>,
    scan_timeout: Duration,
}

impl BluestTransportFactory {
    pub async fn new(scan_timeout: Duration) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(GatewayError::Transport("Default adapter not found".into()))?;
        adapter.wait_available().await.map_err(from_bluest)?;
        Ok(Self { adapter, scan_lock: Arc::new(Mutex::new(())), scan_timeout })
    }

    /// List every advertising device seen within `duration`.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        let _scanning = self.scan_lock.lock().await;
        let mut events = self.adapter.scan(&[]).await.map_err(from_bluest)?;
        let mut seen = BTreeMap::new();
        let _ = timeout(duration, async {
            while let Some(advertisement) = events.next().await {
                let id = format!("{:?}", advertisement.device.id());
                seen.insert(
                    id.clone(),
                    DiscoveredDevice { id, name: advertisement.adv_data.local_name, rssi: advertisement.rssi },
                );
            }
        })
        .await;
        Ok(seen.into_values().collect())
    }
}

impl TransportFactory for BluestTransportFactory {
    fn create(&self, address: &str) -> Box<dyn BleTransport> {
        Box::new(BluestTransport {
            address: address.to_string(),
            adapter: self.adapter.clone(),
            scan_lock: self.scan_lock.clone(),
            scan_timeout: self.scan_timeout,
            device: None,
            write: None,
            notify: None,
            forwarder: None,
        })
    }
}

pub struct BluestTransport {
    address: String,
    adapter: Adapter,
    scan_lock: Arc<Mutex<()>>,
    scan_timeout: Duration,
    device: Option<Device>,
    write: Option<Characteristic>,
    notify: Option<Characteristic>,
    forwarder: Option<JoinHandle<()>>,
}

impl BluestTransport {
    async fn find_device(&self) -> Result<Device> {
        for device in self.adapter.connected_devices().await.map_err(from_bluest)? {
            let name = device.name().ok();
            if matches_address(&format!("{:?}", device.id()), name.as_deref(), &self.address) {
                return Ok(device);
            }
        }

        let _scanning = self.scan_lock.lock().await;
        let mut events = self.adapter.scan(&[]).await.map_err(from_bluest)?;
        let found = timeout(self.scan_timeout, async {
            while let Some(advertisement) = events.next().await {
                let id = format!("{:?}", advertisement.device.id());
                if matches_address(&id, advertisement.adv_data.local_name.as_deref(), &self.address) {
                    return Some(advertisement.device);
                }
            }
            None
        })
        .await;

        match found {
            Ok(Some(device)) => Ok(device),
            _ => Err(GatewayError::DeviceNotFound(self.address.clone())),
        }
    }

    async fn characteristic(device: &Device, service_id: Uuid, characteristic_id: Uuid) -> Result<Characteristic> {
        let service = device
            .discover_services_with_uuid(service_id)
            .await
            .map_err(from_bluest)?
            .first()
            .ok_or(GatewayError::DeviceNotFound(format!("service {service_id} not offered")))?
            .clone();
        let characteristic = service
            .discover_characteristics_with_uuid(characteristic_id)
            .await
            .map_err(from_bluest)?
            .first()
            .ok_or(GatewayError::DeviceNotFound(format!("characteristic {characteristic_id} not offered")))?
            .clone();
        Ok(characteristic)
    }
}

#[async_trait]
impl BleTransport for BluestTransport {
    async fn connect(&mut self) -> Result<()> {
        let device = self.find_device().await?;
        if !device.is_connected().await {
            let mut retries = 2;
            loop {
                match self.adapter.connect_device(&device).await {
                    Ok(()) => break,
                    Err(err) if retries > 0 => {
                        warn!("{}: failed to connect: {err}", self.address);
                        retries -= 1;
                    }
                    Err(err) => return Err(from_bluest(err)),
                }
            }
        }

        self.write = Some(Self::characteristic(&device, WRITE_SERVICE_ID, WRITE_CHARACTERISTIC_ID).await?);
        self.notify = Some(Self::characteristic(&device, NOTIFY_SERVICE_ID, NOTIFY_CHARACTERISTIC_ID).await?);
        self.device = Some(device);
        info!("{}: GATT link up", self.address);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<NotificationStream> {
        let notify = self
            .notify
            .clone()
            .ok_or(GatewayError::Disconnected("not connected".into()))?;
        let (sender, receiver) = mpsc::channel(NOTIFICATION_QUEUE);
        let (ready_sender, ready) = oneshot::channel();
        let address = self.address.clone();

        // The notification stream borrows the characteristic, so it lives in its own task.
        let forwarder = tokio::spawn(async move {
            let mut notifications = match notify.notify().await {
                Ok(notifications) => {
                    let _ = ready_sender.send(Ok(()));
                    notifications
                }
                Err(err) => {
                    let _ = ready_sender.send(Err(from_bluest(err)));
                    return;
                }
            };
            while let Some(item) = notifications.next().await {
                if sender.send(item.map_err(from_bluest)).await.is_err() {
                    break;
                }
            }
            debug!("{address}: notification forwarder finished");
        });
        if let Some(previous) = self.forwarder.replace(forwarder) {
            previous.abort();
        }

        ready
            .await
            .map_err(|_| GatewayError::Disconnected("notification task ended".into()))??;

        Ok(Box::pin(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })))
    }

    async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        let write = self
            .write
            .as_ref()
            .ok_or(GatewayError::Disconnected("not connected".into()))?;
        write.write(data).await.map_err(from_bluest)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.write = None;
        self.notify = None;
        if let Some(device) = self.device.take() {
            if device.is_connected().await {
                self.adapter.disconnect_device(&device).await.map_err(from_bluest)?;
            }
        }
        Ok(())
    }
}

impl Drop for BluestTransport {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Whether a device id or advertised name refers to `address`.
///
/// Platforms render ids differently (`AA:BB:..`, `dev_AA_BB_..`, bare hex), so
/// separators and case are ignored.
fn matches_address(id: &str, name: Option<&str>, address: &str) -> bool {
    fn normalize(s: &str) -> String {
        s.chars().filter(|c| c.is_ascii_alphanumeric()).collect::<String>().to_ascii_uppercase()
    }
    let wanted = normalize(address);
    if wanted.is_empty() {
        return false;
    }
    normalize(id).contains(&wanted) || name.is_some_and(|name| normalize(name) == wanted)
}

fn from_bluest(err: bluest::Error) -> GatewayError {
    let message = err.to_string();
    match err.kind() {
        ErrorKind::NotFound => GatewayError::DeviceNotFound(message),
        ErrorKind::NotAuthorized => GatewayError::AccessDenied(message),
        ErrorKind::NotConnected => GatewayError::Disconnected(message),
        _ if is_slot_exhaustion(&message) => GatewayError::NoConnectionSlot,
        _ => GatewayError::Transport(message),
    }
}

/// BlueZ reports a full connection table as a busy or in-progress error.
fn is_slot_exhaustion(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["resource busy", "inprogress", "no resources", "connection limit"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[test]
fn test_matches_address() {
    assert!(matches_address("DeviceId(\"/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF\")", None, "aa:bb:cc:dd:ee:ff"));
    assert!(matches_address("AA:BB:CC:DD:EE:FF", None, "AA:BB:CC:DD:EE:FF"));
    assert!(matches_address("unrelated", Some("BT-TH-66A1B2C3"), "BT-TH-66A1B2C3"));
    assert!(!matches_address("AA:BB:CC:DD:EE:00", Some("BT-TH-1"), "AA:BB:CC:DD:EE:FF"));
    assert!(!matches_address("AA:BB:CC:DD:EE:FF", None, "::"));
}

#[test]
fn test_slot_exhaustion_messages() {
    assert!(is_slot_exhaustion("org.bluez.Error.InProgress"));
    assert!(is_slot_exhaustion("Resource busy"));
    assert!(!is_slot_exhaustion("Page timeout"));
}
