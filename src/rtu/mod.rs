//! The physical side of the gateway: one RTU bus, one call at a time.

mod context;
mod dispatch;

pub use context::{ReconnectPolicy, RtuContext, SerialSettings};
pub(crate) use dispatch::dispatch;

use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::ExceptionCode;

use crate::error::Result;
use crate::queue::Task;

pub type Coil = bool;
pub type Word = u16;

/// Outcome of a successful read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub data: Vec<Word>,
    pub duration: Duration,
}

/// One physical read or write per call. Only the worker calls this.
#[async_trait]
pub trait Transport: Send {
    async fn read_holding_registers(&mut self, slave_id: u8, address: u16, length: u16)
        -> Result<ReadResult>;

    async fn read_coils(&mut self, slave_id: u8, address: u16, length: u16) -> Result<ReadResult>;

    async fn read_discrete_inputs(&mut self, slave_id: u8, address: u16, length: u16)
        -> Result<ReadResult>;

    async fn read_input_registers(&mut self, slave_id: u8, address: u16, length: u16)
        -> Result<ReadResult>;

    async fn write_holding_registers(&mut self, slave_id: u8, address: u16, data: &[Word])
        -> Result<()>;

    /// Non-zero words are written as `true`.
    async fn write_coils(&mut self, slave_id: u8, address: u16, data: &[Word]) -> Result<()>;

    /// Close and reopen the line. `task` names whoever asked, for the log.
    async fn reconnect_rtu(&mut self, task: Task) -> Result<()>;

    /// Identifies the bus this transport drives.
    fn cache_id(&self) -> String;
}

pub(crate) fn exception_to_code(exception: ExceptionCode) -> u8 {
    match exception {
        ExceptionCode::IllegalFunction => 0x01,
        ExceptionCode::IllegalDataAddress => 0x02,
        ExceptionCode::IllegalDataValue => 0x03,
        ExceptionCode::ServerDeviceFailure => 0x04,
        ExceptionCode::Acknowledge => 0x05,
        ExceptionCode::ServerDeviceBusy => 0x06,
        ExceptionCode::MemoryParityError => 0x08,
        ExceptionCode::GatewayPathUnavailable => 0x0A,
        ExceptionCode::GatewayTargetDevice => 0x0B,
        ExceptionCode::Custom(code) => code,
    }
}

pub(crate) fn code_to_exception(code: u8) -> ExceptionCode {
    match code {
        0x01 => ExceptionCode::IllegalFunction,
        0x02 => ExceptionCode::IllegalDataAddress,
        0x03 => ExceptionCode::IllegalDataValue,
        0x04 => ExceptionCode::ServerDeviceFailure,
        0x05 => ExceptionCode::Acknowledge,
        0x06 => ExceptionCode::ServerDeviceBusy,
        0x08 => ExceptionCode::MemoryParityError,
        0x0A => ExceptionCode::GatewayPathUnavailable,
        0x0B => ExceptionCode::GatewayTargetDevice,
        other => ExceptionCode::Custom(other),
    }
}
