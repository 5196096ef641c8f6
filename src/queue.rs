//! The request queue every producer shares.
//!
//! Poll loop, HTTP handlers and the TCP bridge all append to the same
//! [`RequestQueue`]; only the [`RtuWorker`](crate::worker::RtuWorker) takes
//! entries off the front. Insertion order is service order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{oneshot, Notify};

use crate::error::{ModbusError, Result};

const MAX_READ_REGISTERS: u16 = 125;
const MAX_WRITE_REGISTERS: u16 = 123;
const MAX_READ_BITS: u16 = 2000;
const MAX_WRITE_BITS: u16 = 1968;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RegisterType {
    Coils,
    DiscreteInputs,
    HoldingRegister,
    AnalogInputs,
}

impl RegisterType {
    /// Single-bit tables (coils and discrete inputs).
    pub fn is_bit(self) -> bool {
        matches!(self, RegisterType::Coils | RegisterType::DiscreteInputs)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, RegisterType::Coils | RegisterType::HoldingRegister)
    }

    /// Largest quantity one request may carry.
    pub fn max_quantity(self, write: bool) -> u16 {
        match (self.is_bit(), write) {
            (true, false) => MAX_READ_BITS,
            (true, true) => MAX_WRITE_BITS,
            (false, false) => MAX_READ_REGISTERS,
            (false, true) => MAX_WRITE_REGISTERS,
        }
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterType::Coils => "coils",
            RegisterType::DiscreteInputs => "discrete-inputs",
            RegisterType::HoldingRegister => "holding-registers",
            RegisterType::AnalogInputs => "input-registers",
        };
        f.write_str(name)
    }
}

/// A contiguous range of one register table, optionally carrying values to
/// write. `write` present means write, absent means read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAddress {
    pub register_type: RegisterType,
    pub address: u16,
    pub length: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write: Option<Vec<u16>>,
}

impl RegisterAddress {
    pub fn read(register_type: RegisterType, address: u16, length: u16) -> Self {
        Self {
            register_type,
            address,
            length,
            write: None,
        }
    }

    /// Write request; the length follows from the number of values.
    pub fn write(register_type: RegisterType, address: u16, values: Vec<u16>) -> Self {
        Self {
            register_type,
            address,
            length: u16::try_from(values.len()).unwrap_or(u16::MAX),
            write: Some(values),
        }
    }

    pub fn is_write(&self) -> bool {
        self.write.is_some()
    }

    /// Every register address covered by this range.
    pub fn addresses(&self) -> impl Iterator<Item = u16> {
        let start = u32::from(self.address);
        let end = (start + u32::from(self.length)).min(u32::from(u16::MAX) + 1);
        (start..end).map(|a| a as u16)
    }

    /// The single-register read at `offset` within this range.
    pub fn single(&self, offset: u16) -> RegisterAddress {
        RegisterAddress::read(self.register_type, self.address.wrapping_add(offset), 1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.length == 0 {
            return Err(ModbusError::InvalidRequest(format!(
                "{} {}: length must be at least 1",
                self.register_type, self.address
            )));
        }
        if u32::from(self.address) + u32::from(self.length) > u32::from(u16::MAX) + 1 {
            return Err(ModbusError::InvalidRequest(format!(
                "{} {}: range of {} exceeds the address space",
                self.register_type, self.address, self.length
            )));
        }
        let max = self.register_type.max_quantity(self.is_write());
        if self.length > max {
            return Err(ModbusError::InvalidRequest(format!(
                "{} {}: length {} exceeds {max}",
                self.register_type, self.address, self.length
            )));
        }
        if let Some(values) = &self.write {
            if !self.register_type.is_writable() {
                return Err(ModbusError::InvalidRequest(format!(
                    "{} are read-only",
                    self.register_type
                )));
            }
            if values.len() != usize::from(self.length) {
                return Err(ModbusError::InvalidRequest(format!(
                    "{} {}: {} values for length {}",
                    self.register_type,
                    self.address,
                    values.len(),
                    self.length
                )));
            }
        }
        Ok(())
    }
}

/// Producer tag, used only for request-rate bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Task {
    Specification,
    Poll,
    Entity,
    WriteEntity,
    DeviceDetection,
    TcpBridge,
    Splitted,
    InitialConnect,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Task::Specification => "specification",
            Task::Poll => "poll",
            Task::Entity => "entity",
            Task::WriteEntity => "write-entity",
            Task::DeviceDetection => "device-detection",
            Task::TcpBridge => "tcp-bridge",
            Task::Splitted => "splitted",
            Task::InitialConnect => "initial-connect",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorHandling {
    pub retry: bool,
    pub split: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CachePolicy {
    /// Always go to the bus.
    #[default]
    Bypass,
    /// Answer from the cache only; a miss is a `NotFound` error.
    CacheOnly,
    /// Answer from the cache when the whole range is cached, else go to the bus.
    ReadThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    pub task: Task,
    pub error_handling: ErrorHandling,
    pub cache: CachePolicy,
}

impl QueueOptions {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            error_handling: ErrorHandling::default(),
            cache: CachePolicy::Bypass,
        }
    }

    pub fn with_retry(mut self) -> Self {
        self.error_handling.retry = true;
        self
    }

    /// Retry a failed multi-register request as single-register requests.
    /// Implies retry.
    pub fn with_split(mut self) -> Self {
        self.error_handling.retry = true;
        self.error_handling.split = true;
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    fn validate(&self, address: &RegisterAddress) -> Result<()> {
        if self.error_handling.split && !self.error_handling.retry {
            return Err(ModbusError::InvalidRequest(
                "split requires retry".to_string(),
            ));
        }
        if self.cache != CachePolicy::Bypass && address.is_write() {
            return Err(ModbusError::InvalidRequest(
                "writes cannot be answered from the cache".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the producer wants done after it has seen an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    NotHandled,
    HandledReconnect,
    HandledNoReconnect,
}

/// The immutable description of a queued request, as producers and
/// introspection see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
    pub slave_id: u8,
    pub address: RegisterAddress,
    pub options: QueueOptions,
}

/// Receives the outcome of one queue entry. Both methods consume the
/// completion, so an entry resolves exactly once.
pub trait Completion: Send {
    fn resolve(self: Box<Self>, request: &QueuedRequest, data: Vec<u16>);

    fn fail(self: Box<Self>, request: &QueuedRequest, error: ModbusError) -> ErrorAction;
}

struct Callbacks<R, E> {
    on_resolve: R,
    on_error: E,
}

impl<R, E> Completion for Callbacks<R, E>
where
    R: FnOnce(&QueuedRequest, Vec<u16>) + Send,
    E: FnOnce(&QueuedRequest, ModbusError) -> ErrorAction + Send,
{
    fn resolve(self: Box<Self>, request: &QueuedRequest, data: Vec<u16>) {
        let Callbacks { on_resolve, .. } = *self;
        on_resolve(request, data)
    }

    fn fail(self: Box<Self>, request: &QueuedRequest, error: ModbusError) -> ErrorAction {
        let Callbacks { on_error, .. } = *self;
        on_error(request, error)
    }
}

/// Build a completion from a pair of closures.
pub fn callbacks<R, E>(on_resolve: R, on_error: E) -> Box<dyn Completion>
where
    R: FnOnce(&QueuedRequest, Vec<u16>) + Send + 'static,
    E: FnOnce(&QueuedRequest, ModbusError) -> ErrorAction + Send + 'static,
{
    Box::new(Callbacks {
        on_resolve,
        on_error,
    })
}

struct Reply(oneshot::Sender<Result<Vec<u16>>>);

impl Completion for Reply {
    fn resolve(self: Box<Self>, _request: &QueuedRequest, data: Vec<u16>) {
        let Reply(tx) = *self;
        let _ = tx.send(Ok(data));
    }

    fn fail(self: Box<Self>, _request: &QueuedRequest, error: ModbusError) -> ErrorAction {
        let Reply(tx) = *self;
        let _ = tx.send(Err(error));
        ErrorAction::HandledNoReconnect
    }
}

pub struct QueueEntry {
    request: QueuedRequest,
    completion: Box<dyn Completion>,
}

impl QueueEntry {
    pub fn new(
        slave_id: u8,
        address: RegisterAddress,
        completion: Box<dyn Completion>,
        options: QueueOptions,
    ) -> Self {
        Self {
            request: QueuedRequest {
                slave_id,
                address,
                options,
            },
            completion,
        }
    }

    pub fn request(&self) -> &QueuedRequest {
        &self.request
    }

    pub(crate) fn into_parts(self) -> (QueuedRequest, Box<dyn Completion>) {
        (self.request, self.completion)
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Inner {
    entries: Mutex<VecDeque<QueueEntry>>,
    new_entry: Notify,
}

/// FIFO of pending requests. Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct RequestQueue {
    inner: Arc<Inner>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries_guard(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate and append a request.
    pub fn enqueue(
        &self,
        slave_id: u8,
        address: RegisterAddress,
        completion: Box<dyn Completion>,
        options: QueueOptions,
    ) -> Result<()> {
        self.enqueue_entry(QueueEntry::new(slave_id, address, completion, options))
    }

    /// Append a pre-built entry.
    pub fn enqueue_entry(&self, entry: QueueEntry) -> Result<()> {
        entry.request.address.validate()?;
        entry.request.options.validate(&entry.request.address)?;
        self.entries_guard().push_back(entry);
        self.inner.new_entry.notify_one();
        Ok(())
    }

    /// Enqueue a request and wait for its outcome.
    pub async fn request(
        &self,
        slave_id: u8,
        address: RegisterAddress,
        options: QueueOptions,
    ) -> Result<Vec<u16>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(slave_id, address, Box::new(Reply(tx)), options)?;
        rx.await.unwrap_or(Err(ModbusError::Dropped))
    }

    pub fn len(&self) -> usize {
        self.entries_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries_guard().is_empty()
    }

    /// Snapshot of the queued requests, front first.
    pub fn entries(&self) -> Vec<QueuedRequest> {
        self.entries_guard()
            .iter()
            .map(|e| e.request.clone())
            .collect()
    }

    pub(crate) fn pop_front(&self) -> Option<QueueEntry> {
        self.entries_guard().pop_front()
    }

    /// Resolves once the queue holds at least one entry.
    pub async fn wait_for_entries(&self) {
        loop {
            let notified = self.inner.new_entry.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ignore() -> Box<dyn Completion> {
        callbacks(|_, _| {}, |_, _| ErrorAction::HandledNoReconnect)
    }

    #[test]
    fn keeps_insertion_order() {
        let queue = RequestQueue::new();
        for address in [7, 3, 5] {
            queue
                .enqueue(
                    1,
                    RegisterAddress::read(RegisterType::HoldingRegister, address, 1),
                    ignore(),
                    QueueOptions::new(Task::Poll),
                )
                .unwrap();
        }
        let addresses: Vec<u16> = queue.entries().iter().map(|r| r.address.address).collect();
        assert_eq!(addresses, vec![7, 3, 5]);
        assert_eq!(queue.len(), 3);
        // introspection does not consume
        assert_eq!(queue.entries().len(), 3);
        assert_eq!(queue.pop_front().unwrap().request().address.address, 7);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn write_length_follows_values() {
        let address = RegisterAddress::write(RegisterType::HoldingRegister, 10, vec![1, 2, 3]);
        assert_eq!(address.length, 3);
        assert!(address.is_write());
        assert_eq!(address.addresses().collect::<Vec<_>>(), vec![10, 11, 12]);
    }

    #[test]
    fn rejects_inconsistent_requests() {
        let queue = RequestQueue::new();
        let mut split_only = QueueOptions::new(Task::Poll);
        split_only.error_handling.split = true;
        let err = queue
            .enqueue(
                1,
                RegisterAddress::read(RegisterType::Coils, 0, 4),
                ignore(),
                split_only,
            )
            .unwrap_err();
        assert_eq!(err, ModbusError::InvalidRequest("split requires retry".into()));

        let cases = [
            RegisterAddress::read(RegisterType::HoldingRegister, 0, 0),
            RegisterAddress::read(RegisterType::HoldingRegister, 0, 126),
            RegisterAddress::read(RegisterType::AnalogInputs, u16::MAX, 2),
            RegisterAddress::write(RegisterType::DiscreteInputs, 0, vec![1]),
            RegisterAddress {
                register_type: RegisterType::HoldingRegister,
                address: 0,
                length: 2,
                write: Some(vec![1]),
            },
        ];
        for address in cases {
            let result = queue.enqueue(1, address, ignore(), QueueOptions::new(Task::Poll));
            assert!(matches!(result, Err(ModbusError::InvalidRequest(_))));
        }

        let cached_write = queue.enqueue(
            1,
            RegisterAddress::write(RegisterType::Coils, 0, vec![1]),
            ignore(),
            QueueOptions::new(Task::Entity).with_cache(CachePolicy::CacheOnly),
        );
        assert!(matches!(cached_write, Err(ModbusError::InvalidRequest(_))));
        assert!(queue.is_empty());
    }

    #[test]
    fn last_register_is_addressable() {
        let address = RegisterAddress::read(RegisterType::Coils, u16::MAX, 1);
        assert!(address.validate().is_ok());
        assert_eq!(address.addresses().collect::<Vec<_>>(), vec![u16::MAX]);
    }

    #[test]
    fn callbacks_resolve_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let completion = callbacks(
            move |request, data| tx.send((request.address.address, data)).unwrap(),
            |_, _| ErrorAction::NotHandled,
        );
        let request = QueuedRequest {
            slave_id: 1,
            address: RegisterAddress::read(RegisterType::Coils, 4, 1),
            options: QueueOptions::new(Task::Poll),
        };
        completion.resolve(&request, vec![1]);
        assert_eq!(rx.recv().unwrap(), (4, vec![1]));
    }

    #[tokio::test]
    async fn wait_for_entries_wakes_on_enqueue() {
        let queue = RequestQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_for_entries().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        queue
            .enqueue(
                1,
                RegisterAddress::read(RegisterType::Coils, 0, 1),
                ignore(),
                QueueOptions::new(Task::Poll),
            )
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn request_reports_dropped_entries() {
        let queue = RequestQueue::new();
        let pending = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .request(
                        1,
                        RegisterAddress::read(RegisterType::Coils, 0, 1),
                        QueueOptions::new(Task::Poll),
                    )
                    .await
            })
        };
        queue.wait_for_entries().await;
        drop(queue.pop_front());
        assert_eq!(pending.await.unwrap(), Err(ModbusError::Dropped));
    }
}
