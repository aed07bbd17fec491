//! Error taxonomy shared by every layer of the gateway.
//!
//! Every failure the gateway can observe is a [`GatewayError`]. The poll
//! scheduler only ever needs to know two things about an error: whether it
//! is worth retrying ([`GatewayError::class`]) and whether the session that
//! produced it can still be trusted ([`GatewayError::requires_reconnect`]).

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Whether an error is expected to clear up on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retry with backoff.
    Transient,
    /// Needs reconfiguration or a new device before anything will change.
    Permanent,
}

/// A Modbus exception code returned by a device in place of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusException {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    Other(u8),
}

impl ModbusException {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::Other(code) => *code,
        }
    }

    /// The device accepted the request but cannot answer right now.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Acknowledge | Self::ServerDeviceBusy)
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "illegal function"),
            Self::IllegalDataAddress => write!(f, "illegal data address"),
            Self::IllegalDataValue => write!(f, "illegal data value"),
            Self::ServerDeviceFailure => write!(f, "server device failure"),
            Self::Acknowledge => write!(f, "acknowledge"),
            Self::ServerDeviceBusy => write!(f, "server device busy"),
            Self::Other(code) => write!(f, "exception 0x{code:02x}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("Timed out connecting after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Timed out waiting for a response after {0:?}")]
    ResponseTimeout(Duration),

    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// The device answered with a busy/acknowledge exception.
    #[error("Device busy: {0}")]
    DeviceBusy(ModbusException),

    /// The host Bluetooth stack has no free link for another session.
    #[error("No connection slot available")]
    NoConnectionSlot,

    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("Modbus exception: {0}")]
    ModbusException(ModbusException),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unknown device profile: {0}")]
    UnknownProfile(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Gateway is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    /// Map a Modbus exception code onto the taxonomy.
    pub fn from_exception(code: u8) -> Self {
        let exception = ModbusException::from_code(code);
        if exception.is_busy() {
            GatewayError::DeviceBusy(exception)
        } else {
            GatewayError::ModbusException(exception)
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::ConnectTimeout(_)
            | GatewayError::ResponseTimeout(_)
            | GatewayError::Disconnected(_)
            | GatewayError::DeviceBusy(_)
            | GatewayError::NoConnectionSlot
            | GatewayError::InvalidFrame(_)
            | GatewayError::Transport(_) => ErrorClass::Transient,
            GatewayError::ModbusException(_)
            | GatewayError::DeviceNotFound(_)
            | GatewayError::AccessDenied(_)
            | GatewayError::UnknownProfile(_)
            | GatewayError::InvalidConfig(_)
            | GatewayError::ShuttingDown => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether the session that produced this error must be thrown away.
    ///
    /// A busy device is still connected, and a missing connection slot never
    /// had a session to begin with.
    pub fn requires_reconnect(&self) -> bool {
        !matches!(self, GatewayError::DeviceBusy(_) | GatewayError::NoConnectionSlot)
    }

    /// Errors that only spoil the register window being read, not the session.
    pub fn is_window_local(&self) -> bool {
        matches!(self, GatewayError::InvalidFrame(_) | GatewayError::ModbusException(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[test]
fn test_busy_exceptions_are_transient_without_reconnect() {
    for code in [0x05, 0x06] {
        let err = GatewayError::from_exception(code);
        assert!(err.is_transient());
        assert!(!err.requires_reconnect());
        assert!(!err.is_window_local());
    }
}

#[test]
fn test_other_exceptions_are_window_local() {
    let err = GatewayError::from_exception(0x02);
    assert_eq!(err, GatewayError::ModbusException(ModbusException::IllegalDataAddress));
    assert_eq!(err.class(), ErrorClass::Permanent);
    assert!(err.is_window_local());
}

#[test]
fn test_classification() {
    assert!(GatewayError::Disconnected("gone".into()).is_transient());
    assert!(GatewayError::NoConnectionSlot.is_transient());
    assert!(!GatewayError::DeviceNotFound("aa".into()).is_transient());
    assert!(!GatewayError::UnknownProfile("toaster".into()).is_transient());
    assert_eq!(ModbusException::from_code(0x42).code(), 0x42);
}
