use std::borrow::Cow;
use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Instant};
use tokio_modbus::{prelude::*, Error as ClientError};
use tokio_retry::strategy::{jitter, FixedInterval};
use tokio_retry::Retry;
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};
use tracing::{debug, info, warn};

use super::{exception_to_code, Coil, ReadResult, Transport, Word};
use crate::error::{ModbusError, Result};
use crate::queue::Task;

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub response_timeout: Duration,
}

impl SerialSettings {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            parity: Parity::None,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            response_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl ReconnectPolicy {
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        FixedInterval::new(self.delay).map(jitter).take(self.attempts)
    }
}

/// Modbus RTU client over a serial port that reopens the port on demand.
///
/// Starts disconnected; every call fails with a transport error until
/// [`Transport::reconnect_rtu`] succeeds.
pub struct RtuContext {
    settings: SerialSettings,
    reconnect: ReconnectPolicy,
    ctx: io::Result<client::Context>,
}

impl fmt::Debug for RtuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtuContext")
            .field("settings", &self.settings)
            .field("connected", &self.ctx.is_ok())
            .finish()
    }
}

async fn open_port(settings: SerialSettings) -> io::Result<client::Context> {
    debug!(port = %settings.path, baud_rate = settings.baud_rate, "opening serial port");
    let builder = tokio_serial::new(&settings.path, settings.baud_rate)
        .parity(settings.parity)
        .data_bits(settings.data_bits)
        .stop_bits(settings.stop_bits);
    let port = SerialStream::open(&builder)?;
    Ok(rtu::attach(port))
}

impl RtuContext {
    pub fn new(settings: SerialSettings, reconnect: ReconnectPolicy) -> Self {
        Self {
            settings,
            reconnect,
            ctx: Err(not_connected()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_ok()
    }

    async fn refresh_context(&mut self, task: Task) -> Result<()> {
        if let Ok(ctx) = self.ctx.as_mut() {
            if let Err(e) = ctx.disconnect().await {
                debug!(port = %self.settings.path, error = %e, "closing serial line failed");
            }
        }
        self.ctx = Err(not_connected());

        let settings = self.settings.clone();
        let action = || open_port(settings.clone());
        match Retry::spawn(self.reconnect.strategy(), action).await {
            Ok(ctx) => {
                info!(port = %self.settings.path, %task, "serial line reconnected");
                self.ctx = Ok(ctx);
                Ok(())
            }
            Err(e) => {
                warn!(port = %self.settings.path, %task, error = %e, "could not reconnect serial line");
                let message = e.to_string();
                self.ctx = Err(e);
                Err(ModbusError::Reconnect(message))
            }
        }
    }

    async fn call(&mut self, slave_id: u8, request: Request<'_>) -> Result<Response> {
        let timeout = self.settings.response_timeout;
        let ctx = self
            .ctx
            .as_mut()
            .map_err(|e| ModbusError::Transport(e.to_string()))?;
        ctx.set_slave(Slave(slave_id));

        match time::timeout(timeout, ctx.call(request)).await {
            Err(_) => Err(ModbusError::Timeout(timeout)),
            Ok(Err(e)) => Err(classify_client_error(e, timeout)),
            Ok(Ok(Err(exception))) => Err(ModbusError::Exception {
                code: exception_to_code(exception),
            }),
            Ok(Ok(Ok(response))) => Ok(response),
        }
    }

    async fn read(&mut self, slave_id: u8, request: Request<'_>, length: u16) -> Result<ReadResult> {
        let started = Instant::now();
        let response = self.call(slave_id, request).await?;
        let data = words_from_response(response, length)?;
        Ok(ReadResult {
            data,
            duration: started.elapsed(),
        })
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "not yet connected")
}

fn classify_client_error(error: ClientError, timeout: Duration) -> ModbusError {
    match error {
        ClientError::Transport(e) => match e.kind() {
            io::ErrorKind::TimedOut => ModbusError::Timeout(timeout),
            io::ErrorKind::InvalidData => ModbusError::Crc(e.to_string()),
            _ => ModbusError::Transport(e.to_string()),
        },
        ClientError::Protocol(e) => ModbusError::Crc(e.to_string()),
    }
}

/// Bit responses are padded to whole bytes on the wire, so they are cut back
/// to the requested length.
fn words_from_response(response: Response, length: u16) -> Result<Vec<Word>> {
    match response {
        Response::ReadCoils(bits) | Response::ReadDiscreteInputs(bits) => Ok(bits
            .into_iter()
            .take(usize::from(length))
            .map(Word::from)
            .collect()),
        Response::ReadHoldingRegisters(words) | Response::ReadInputRegisters(words) => Ok(words),
        other => Err(ModbusError::Crc(format!("unexpected response {other:?}"))),
    }
}

fn coils_from_words(data: &[Word]) -> Vec<Coil> {
    data.iter().map(|w| *w != 0).collect()
}

#[async_trait]
impl Transport for RtuContext {
    async fn read_holding_registers(&mut self, slave_id: u8, address: u16, length: u16) -> Result<ReadResult> {
        self.read(slave_id, Request::ReadHoldingRegisters(address, length), length)
            .await
    }

    async fn read_coils(&mut self, slave_id: u8, address: u16, length: u16) -> Result<ReadResult> {
        self.read(slave_id, Request::ReadCoils(address, length), length).await
    }

    async fn read_discrete_inputs(&mut self, slave_id: u8, address: u16, length: u16) -> Result<ReadResult> {
        self.read(slave_id, Request::ReadDiscreteInputs(address, length), length)
            .await
    }

    async fn read_input_registers(&mut self, slave_id: u8, address: u16, length: u16) -> Result<ReadResult> {
        self.read(slave_id, Request::ReadInputRegisters(address, length), length)
            .await
    }

    async fn write_holding_registers(&mut self, slave_id: u8, address: u16, data: &[Word]) -> Result<()> {
        let request = Request::WriteMultipleRegisters(address, Cow::Borrowed(data));
        self.call(slave_id, request).await.map(|_| ())
    }

    async fn write_coils(&mut self, slave_id: u8, address: u16, data: &[Word]) -> Result<()> {
        let request = Request::WriteMultipleCoils(address, Cow::Owned(coils_from_words(data)));
        self.call(slave_id, request).await.map(|_| ())
    }

    async fn reconnect_rtu(&mut self, task: Task) -> Result<()> {
        self.refresh_context(task).await
    }

    fn cache_id(&self) -> String {
        format!("rtu:{}", self.settings.path)
    }
}
