//! A single logical connection to one device and its request/response cycle.

use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use log::{debug, info, warn};
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::{GatewayError, Result};
use crate::frame::{DecodedFrame, FrameBuffer, FrameDecodeResult};
use crate::transport::{BleTransport, NotificationStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Connected and idle.
    Connected,
    AwaitingResponse,
}

pub struct Session {
    address: String,
    transport: Box<dyn BleTransport>,
    notifications: Option<NotificationStream>,
    buffer: FrameBuffer,
    state: SessionState,
    connect_timeout: Duration,
}

impl Session {
    pub fn new(address: &str, transport: Box<dyn BleTransport>, connect_timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            transport,
            notifications: None,
            buffer: FrameBuffer::new(),
            state: SessionState::Disconnected,
            connect_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Connect and subscribe to notifications. Does nothing if already connected.
    pub async fn open(&mut self) -> Result<()> {
        if self.state == SessionState::Connected {
            return Ok(());
        }

        info!("{}: connecting", self.address);
        self.state = SessionState::Connecting;

        let transport = &mut self.transport;
        let connected = timeout(self.connect_timeout, async {
            transport.connect().await?;
            transport.subscribe().await
        })
        .await;

        let err = match connected {
            Ok(Ok(notifications)) => {
                self.notifications = Some(notifications);
                self.buffer.clear();
                self.state = SessionState::Connected;
                info!("{}: connected", self.address);
                return Ok(());
            }
            Ok(Err(err)) => err,
            Err(_) => GatewayError::ConnectTimeout(self.connect_timeout),
        };

        warn!("{}: failed to connect: {err}", self.address);
        self.close().await;
        Err(err)
    }

    /// Write `frame` and wait up to `response_timeout` for the complete answer.
    pub async fn request(&mut self, frame: &[u8], response_timeout: Duration) -> Result<DecodedFrame> {
        if self.state != SessionState::Connected {
            return Err(GatewayError::Disconnected(format!("session is {:?}", self.state)));
        }
        let Some(notifications) = self.notifications.as_mut() else {
            self.state = SessionState::Disconnected;
            return Err(GatewayError::Disconnected("no notification subscription".into()));
        };

        // Anything that arrived while idle belongs to no request.
        while let Some(stray) = notifications.next().now_or_never() {
            match stray {
                Some(Ok(data)) => debug!("{}: discarding stray notification 0x{}", self.address, hex::encode(&data)),
                Some(Err(err)) => debug!("{}: discarding stray notification error: {err}", self.address),
                None => {
                    self.notifications = None;
                    self.state = SessionState::Disconnected;
                    return Err(GatewayError::Disconnected("notification stream ended".into()));
                }
            }
        }

        self.buffer.expect_response_to(frame);
        self.state = SessionState::AwaitingResponse;

        debug!("{}: TX: {}", self.address, hex::encode(frame));
        if let Err(err) = self.transport.write_command(frame).await {
            warn!("{}: write failed: {err}", self.address);
            self.buffer.clear();
            self.notifications = None;
            self.state = SessionState::Disconnected;
            return Err(err);
        }

        let result = self.read_response(response_timeout).await;
        self.buffer.clear();
        if self.state == SessionState::AwaitingResponse {
            self.state = SessionState::Connected;
        }
        result
    }

    async fn read_response(&mut self, response_timeout: Duration) -> Result<DecodedFrame> {
        let deadline = Instant::now() + response_timeout;
        let Some(notifications) = self.notifications.as_mut() else {
            self.state = SessionState::Disconnected;
            return Err(GatewayError::Disconnected("no notification subscription".into()));
        };

        loop {
            let data = match timeout_at(deadline, notifications.next()).await {
                Err(_) => {
                    debug!(
                        "{}: timed out with {} bytes buffered: 0x{}",
                        self.address,
                        self.buffer.len(),
                        hex::encode(self.buffer.as_bytes())
                    );
                    return Err(GatewayError::ResponseTimeout(response_timeout));
                }
                Ok(None) => {
                    debug!("{}: end of notification stream", self.address);
                    self.notifications = None;
                    self.state = SessionState::Disconnected;
                    return Err(GatewayError::Disconnected("notification stream ended".into()));
                }
                Ok(Some(Err(err))) => {
                    warn!("{}: notification error: {err}", self.address);
                    self.notifications = None;
                    self.state = SessionState::Disconnected;
                    return Err(err);
                }
                Ok(Some(Ok(data))) => data,
            };

            debug!("{}: RX notification: 0x{}", self.address, hex::encode(&data));
            self.buffer.push(&data);

            match self.buffer.try_decode() {
                FrameDecodeResult::Incomplete => continue,
                FrameDecodeResult::Complete(frame) => return Ok(frame),
                FrameDecodeResult::Exception { code, .. } => return Err(GatewayError::from_exception(code)),
                FrameDecodeResult::Invalid(reason) => {
                    debug!("{}: message invalid: {reason}: 0x{}", self.address, hex::encode(self.buffer.as_bytes()));
                    return Err(GatewayError::InvalidFrame(reason));
                }
            }
        }
    }

    /// Best-effort disconnect. Failures are logged, never returned.
    pub async fn close(&mut self) {
        self.notifications = None;
        self.buffer.clear();
        if let Err(err) = self.transport.disconnect().await {
            warn!("{}: failed to disconnect: {err}", self.address);
        }
        if self.state != SessionState::Disconnected {
            info!("{}: disconnected", self.address);
        }
        self.state = SessionState::Disconnected;
    }
}
