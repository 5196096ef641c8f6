//! Modbus TCP server in front of the RTU bus.
//!
//! Every TCP request becomes one entry on the shared [`RequestQueue`], so TCP
//! clients wait their turn exactly like the poll loop does. The unit id of the
//! TCP request is used as the RTU slave id.

use std::io;
use std::net::SocketAddr;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
use tracing::{debug, error, info, warn};

use crate::error::ModbusError;
use crate::queue::{QueueOptions, RegisterAddress, RegisterType, RequestQueue, Task};
use crate::rtu::{code_to_exception, Coil, Word};

pub const DEFAULT_PORT: u16 = 502;

/// Shape of the TCP response, remembered while the entry is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
    SingleCoil(u16, Coil),
    MultipleCoils(u16, u16),
    SingleRegister(u16, Word),
    MultipleRegisters(u16, u16),
}

impl Reply {
    fn into_response(self, data: Vec<Word>) -> Response {
        match self {
            Reply::Coils => Response::ReadCoils(to_bits(data)),
            Reply::DiscreteInputs => Response::ReadDiscreteInputs(to_bits(data)),
            Reply::HoldingRegisters => Response::ReadHoldingRegisters(data),
            Reply::InputRegisters => Response::ReadInputRegisters(data),
            Reply::SingleCoil(address, value) => Response::WriteSingleCoil(address, value),
            Reply::MultipleCoils(address, quantity) => {
                Response::WriteMultipleCoils(address, quantity)
            }
            Reply::SingleRegister(address, value) => Response::WriteSingleRegister(address, value),
            Reply::MultipleRegisters(address, quantity) => {
                Response::WriteMultipleRegisters(address, quantity)
            }
        }
    }
}

fn to_bits(data: Vec<Word>) -> Vec<Coil> {
    data.into_iter().map(|w| w != 0).collect()
}

fn quantity(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

fn translate(request: Request<'_>) -> Result<(RegisterAddress, Reply), ExceptionCode> {
    let (address, reply) = match request {
        Request::ReadCoils(address, count) => (
            RegisterAddress::read(RegisterType::Coils, address, count),
            Reply::Coils,
        ),
        Request::ReadDiscreteInputs(address, count) => (
            RegisterAddress::read(RegisterType::DiscreteInputs, address, count),
            Reply::DiscreteInputs,
        ),
        Request::ReadHoldingRegisters(address, count) => (
            RegisterAddress::read(RegisterType::HoldingRegister, address, count),
            Reply::HoldingRegisters,
        ),
        Request::ReadInputRegisters(address, count) => (
            RegisterAddress::read(RegisterType::AnalogInputs, address, count),
            Reply::InputRegisters,
        ),
        Request::WriteSingleCoil(address, value) => (
            RegisterAddress::write(RegisterType::Coils, address, vec![Word::from(value)]),
            Reply::SingleCoil(address, value),
        ),
        Request::WriteMultipleCoils(address, values) => (
            RegisterAddress::write(
                RegisterType::Coils,
                address,
                values.iter().map(|b| Word::from(*b)).collect(),
            ),
            Reply::MultipleCoils(address, quantity(values.len())),
        ),
        Request::WriteSingleRegister(address, value) => (
            RegisterAddress::write(RegisterType::HoldingRegister, address, vec![value]),
            Reply::SingleRegister(address, value),
        ),
        Request::WriteMultipleRegisters(address, values) => {
            let count = quantity(values.len());
            (
                RegisterAddress::write(RegisterType::HoldingRegister, address, values.into_owned()),
                Reply::MultipleRegisters(address, count),
            )
        }
        other => {
            debug!(request = ?other, "unsupported function code");
            return Err(ExceptionCode::IllegalFunction);
        }
    };

    let max = address.register_type.max_quantity(address.is_write());
    if address.length == 0 || address.length > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    if address.validate().is_err() {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok((address, reply))
}

fn exception_for(error: &ModbusError) -> ExceptionCode {
    match error {
        ModbusError::Exception { code } => code_to_exception(*code),
        ModbusError::InvalidRequest(_) | ModbusError::NotFound { .. } => {
            ExceptionCode::IllegalDataAddress
        }
        ModbusError::Timeout(_)
        | ModbusError::Crc(_)
        | ModbusError::Transport(_)
        | ModbusError::Reconnect(_)
        | ModbusError::Dropped => ExceptionCode::GatewayTargetDevice,
    }
}

/// Per-connection service handed to the tokio-modbus TCP server.
#[derive(Debug, Clone)]
pub struct BridgeService {
    queue: RequestQueue,
}

impl BridgeService {
    pub fn new(queue: RequestQueue) -> Self {
        Self { queue }
    }
}

impl tokio_modbus::server::Service for BridgeService {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let queue = self.queue.clone();
        async move {
            let SlaveRequest { slave, request } = req;
            let (address, reply) = translate(request)?;
            match queue
                .request(slave, address, QueueOptions::new(Task::TcpBridge))
                .await
            {
                Ok(data) => Ok(reply.into_response(data)),
                Err(e) => {
                    debug!(slave, error = %e, "bridged request failed");
                    Err(exception_for(&e))
                }
            }
        }
        .boxed()
    }
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the TCP listener. Starting and stopping it has no effect on the
/// worker.
pub struct TcpRtuBridge {
    queue: RequestQueue,
    server: Option<RunningServer>,
}

impl TcpRtuBridge {
    pub fn new(queue: RequestQueue) -> Self {
        Self {
            queue,
            server: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr)
    }

    /// Bind `addr` and start accepting clients. Returns the bound address,
    /// which differs from `addr` when port 0 was asked for.
    pub async fn start_server(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        if let Some(server) = &self.server {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("TCP bridge already listening on {}", server.local_addr),
            ));
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, abort) = oneshot::channel::<()>();
        let queue = self.queue.clone();

        let task = tokio::spawn(async move {
            let server = Server::new(listener);
            let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
                let queue = queue.clone();
                async move {
                    debug!(%socket_addr, "TCP client connected");
                    accept_tcp_connection(stream, socket_addr, move |_| {
                        Ok(Some(BridgeService::new(queue.clone())))
                    })
                }
            };
            let on_process_error = |err: io::Error| {
                warn!(error = %err, "TCP bridge connection failed");
            };
            match server
                .serve_until(&on_connected, on_process_error, abort.map(|_| ()))
                .await
            {
                Ok(_) => info!("TCP bridge stopped"),
                Err(e) => error!(error = %e, "TCP bridge terminated"),
            }
        });

        info!(%local_addr, "TCP bridge listening");
        self.server = Some(RunningServer {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stop accepting clients and wait for the listener to close.
    pub async fn stop_server(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };
        let _ = server.shutdown.send(());
        if let Err(e) = server.task.await {
            warn!(error = %e, "TCP bridge task ended abnormally");
        }
    }
}
