//! Error taxonomy shared by the queue, the worker, the cache and the bridge.
//!
//! Failures fall into three classes. Transport-level errors mean the serial
//! link (or the device's responsiveness) is suspect and a reconnect may help.
//! Protocol-level errors are Modbus exceptions reported by a healthy device.
//! Application-level errors never reach the bus at all.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::queue::RegisterType;

pub const ILLEGAL_FUNCTION: u8 = 0x01;
pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// No complete response arrived within the response timeout.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The response arrived but failed the CRC check or could not be framed.
    #[error("CRC or framing error: {0}")]
    Crc(String),

    /// Any other I/O failure on the serial line (port closed, not connected).
    #[error("transport error: {0}")]
    Transport(String),

    /// Reopening the serial line failed.
    #[error("reconnect failed: {0}")]
    Reconnect(String),

    /// Modbus exception response from the device.
    #[error("device exception {code:#04x} ({})", exception_name(*.code))]
    Exception { code: u8 },

    /// A cache-only request found nothing for this register.
    #[error("no cached value for slave {slave_id} {register_type} {address}")]
    NotFound {
        slave_id: u8,
        register_type: RegisterType,
        address: u16,
    },

    /// The request was rejected before it was queued.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The worker went away before answering.
    #[error("request dropped before completion")]
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transport,
    Protocol,
    Application,
}

/// Per-slave error log classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorState {
    Timeout,
    Crc,
    IllegalFunction,
    IllegalAddress,
    Other,
}

impl ModbusError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ModbusError::Timeout(_)
            | ModbusError::Crc(_)
            | ModbusError::Transport(_)
            | ModbusError::Reconnect(_) => ErrorClass::Transport,
            ModbusError::Exception { .. } => ErrorClass::Protocol,
            ModbusError::NotFound { .. } | ModbusError::InvalidRequest(_) | ModbusError::Dropped => {
                ErrorClass::Application
            }
        }
    }

    pub fn is_transport(&self) -> bool {
        self.class() == ErrorClass::Transport
    }

    pub fn state(&self) -> ErrorState {
        match self {
            ModbusError::Timeout(_) => ErrorState::Timeout,
            ModbusError::Crc(_) => ErrorState::Crc,
            ModbusError::Exception {
                code: ILLEGAL_FUNCTION,
            } => ErrorState::IllegalFunction,
            ModbusError::Exception {
                code: ILLEGAL_DATA_ADDRESS,
            } => ErrorState::IllegalAddress,
            _ => ErrorState::Other,
        }
    }
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

pub type Result<T> = std::result::Result<T, ModbusError>;
