//! In-memory devices for exercising the gateway without a radio.
//!
//! A [`MockDevice`] answers register reads from its own register bank unless
//! a scripted [`MockReply`] is queued, and counts connects, disconnects and
//! writes so tests can check what the gateway did to it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::mpsc;

use crate::error::{GatewayError, ModbusException, Result};
use crate::frame;
use crate::transport::{BleTransport, NotificationStream, TransportFactory};

/// How the device answers the next command.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer from the register bank.
    Registers,
    /// Send these exact bytes.
    Frame(Vec<u8>),
    /// Send these notifications one after another.
    Fragments(Vec<Vec<u8>>),
    Exception(u8),
    /// Say nothing, the request times out.
    Silence,
    /// Drop the link, ending the notification stream.
    Disconnect,
}

#[derive(Default)]
struct DeviceState {
    registers: HashMap<u16, u16>,
    replies: VecDeque<MockReply>,
    connect_error: Option<GatewayError>,
    connect_delay: Duration,
    fragment_size: Option<usize>,
    opens: usize,
    closes: usize,
    writes: Vec<Vec<u8>>,
    notifier: Option<mpsc::UnboundedSender<Result<Vec<u8>>>>,
}

#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_registers(&self, start_address: u16, values: &[u16]) {
        let mut state = self.state();
        for (offset, value) in values.iter().enumerate() {
            state.registers.insert(start_address.wrapping_add(offset as u16), *value);
        }
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.state().registers.get(&address).copied()
    }

    pub fn push_reply(&self, reply: MockReply) {
        self.state().replies.push_back(reply);
    }

    /// Make every connect attempt fail with `error`, or succeed again with `None`.
    pub fn fail_connect(&self, error: Option<GatewayError>) {
        self.state().connect_error = error;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = delay;
    }

    /// Split every answer into notifications of at most `size` bytes.
    pub fn set_fragment_size(&self, size: usize) {
        self.state().fragment_size = Some(size.max(1));
    }

    /// Push a notification nobody asked for.
    pub fn notify_unsolicited(&self, data: &[u8]) {
        if let Some(notifier) = &self.state().notifier {
            let _ = notifier.send(Ok(data.to_vec()));
        }
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().notifier.is_some()
    }
}

impl DeviceState {
    fn answer(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < 8 {
            return None;
        }
        let unit_id = request[0];
        let function_code = request[1];
        let address = u16::from_be_bytes([request[2], request[3]]);
        let argument = u16::from_be_bytes([request[4], request[5]]);
        match function_code {
            frame::READ_HOLDING_REGISTERS | frame::READ_INPUT_REGISTERS => {
                let registers: Vec<u16> = (0..argument)
                    .map(|offset| *self.registers.get(&address.wrapping_add(offset)).unwrap_or(&0))
                    .collect();
                Some(frame::encode_read_response(unit_id, &registers))
            }
            frame::WRITE_SINGLE_REGISTER => {
                self.registers.insert(address, argument);
                Some(request.to_vec())
            }
            _ => Some(frame::encode_exception_response(
                unit_id,
                function_code,
                ModbusException::IllegalFunction.code(),
            )),
        }
    }

    fn send(&self, data: Vec<u8>) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let size = self.fragment_size.unwrap_or(data.len().max(1));
        for chunk in data.chunks(size) {
            let _ = notifier.send(Ok(chunk.to_vec()));
        }
    }
}

pub struct MockTransport {
    device: MockDevice,
}

impl MockTransport {
    pub fn new(device: MockDevice) -> Self {
        Self { device }
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        let (delay, error) = {
            let mut state = self.device.state();
            state.opens += 1;
            (state.connect_delay, state.connect_error.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn subscribe(&mut self) -> Result<NotificationStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.device.state().notifier = Some(sender);
        Ok(Box::pin(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })))
    }

    async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.device.state();
        if state.notifier.is_none() {
            return Err(GatewayError::Disconnected("not connected".into()));
        }
        state.writes.push(data.to_vec());
        match state.replies.pop_front().unwrap_or(MockReply::Registers) {
            MockReply::Registers => {
                if let Some(answer) = state.answer(data) {
                    state.send(answer);
                }
            }
            MockReply::Frame(bytes) => state.send(bytes),
            MockReply::Fragments(fragments) => {
                if let Some(notifier) = &state.notifier {
                    for fragment in fragments {
                        let _ = notifier.send(Ok(fragment));
                    }
                }
            }
            MockReply::Exception(code) => {
                let function_code = data.get(1).copied().unwrap_or(frame::READ_HOLDING_REGISTERS);
                let unit_id = data.first().copied().unwrap_or(1);
                state.send(frame::encode_exception_response(unit_id, function_code, code));
            }
            MockReply::Silence => {}
            MockReply::Disconnect => state.notifier = None,
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.device.state();
        state.closes += 1;
        state.notifier = None;
        Ok(())
    }
}

/// Hands out transports bound to per-address [`MockDevice`]s.
#[derive(Default)]
pub struct MockTransportFactory {
    devices: Mutex<HashMap<String, MockDevice>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device behind `address`, created on first use.
    pub fn device(&self, address: &str) -> MockDevice {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(address.to_string())
            .or_default()
            .clone()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, address: &str) -> Box<dyn BleTransport> {
        Box::new(MockTransport::new(self.device(address)))
    }
}
