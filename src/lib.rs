//! Gateway that shares one Modbus RTU serial line between local producers
//! and Modbus TCP clients.
//!
//! Producers append to a [`RequestQueue`]; a single [`RtuWorker`] drains it
//! against the bus and keeps a per-slave [`ModbusCache`]. The
//! [`TcpRtuBridge`] feeds TCP requests into the same queue.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod processor;
pub mod queue;
pub mod rtu;
pub mod worker;

#[cfg(test)]
mod testing;

pub use bridge::{BridgeService, TcpRtuBridge};
pub use cache::{Clock, ModbusCache, SharedCache, SystemClock};
pub use config::Config;
pub use error::{ModbusError, Result};
pub use processor::ReadProcessor;
pub use queue::{
    callbacks, CachePolicy, Completion, ErrorAction, QueueEntry, QueueOptions, RegisterAddress,
    RegisterType, RequestQueue, Task,
};
pub use rtu::{RtuContext, Transport};
pub use worker::{RtuWorker, RunReport};
