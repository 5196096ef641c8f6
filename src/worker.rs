//! The single consumer of the request queue.
//!
//! [`RtuWorker::run`] drains the entries that were queued when it started,
//! one at a time, against the transport. A second `run` while one is active
//! returns straight away, so two transport calls can never overlap.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::cache::{CleanupStats, Clock, Lookup, ModbusCache, SharedCache, SlaveStatus, SystemClock};
use crate::error::{ModbusError, Result};
use crate::queue::{
    CachePolicy, Completion, ErrorAction, QueueEntry, QueuedRequest, RegisterAddress,
    RequestQueue, Task,
};
use crate::rtu::{dispatch, Transport};

/// What one [`RtuWorker::run`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub processed: usize,
    pub resolved: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub transport_calls: usize,
    pub reconnects: usize,
}

type FinishHook = Box<dyn Fn(&RunReport) + Send + Sync>;

pub struct RtuWorker<T> {
    queue: RequestQueue,
    transport: Mutex<T>,
    cache: SharedCache,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    finished: Notify,
    on_finish: Option<FinishHook>,
}

struct RunningGuard<'a> {
    running: &'a AtomicBool,
    finished: &'a Notify,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.finished.notify_waiters();
    }
}

impl<T: Transport> RtuWorker<T> {
    pub fn new(queue: RequestQueue, transport: T, cache: SharedCache) -> Self {
        Self {
            queue,
            transport: Mutex::new(transport),
            cache,
            clock: Arc::new(SystemClock),
            running: AtomicBool::new(false),
            finished: Notify::new(),
            on_finish: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Called once at the end of every [`run`](Self::run), with the
    /// report of that run.
    pub fn on_finish(mut self, hook: impl Fn(&RunReport) + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Box::new(hook));
        self
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn cache_guard(&self) -> MutexGuard<'_, ModbusCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cleanup_cache(&self) -> CleanupStats {
        let now = self.clock.now();
        let stats = self.cache_guard().cleanup(now);
        debug!(values = stats.values, errors = stats.errors, "cache cleanup");
        stats
    }

    /// Slaves the cache has seen so far.
    pub fn slave_ids(&self) -> Vec<u8> {
        self.cache_guard().slave_ids()
    }

    pub fn status(&self, slave_id: u8) -> SlaveStatus {
        let queue_length = self.queue.len();
        self.cache_guard()
            .status(slave_id, queue_length, self.clock.now())
    }

    /// Drain the entries queued right now. Returns `None` without doing
    /// anything if another run is in progress.
    pub async fn run(&self) -> Option<RunReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("worker already running");
            return None;
        }
        let _guard = RunningGuard {
            running: &self.running,
            finished: &self.finished,
        };

        let mut transport = self.transport.lock().await;
        let snapshot = self.queue.len();
        let mut report = RunReport::default();
        for _ in 0..snapshot {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            self.process(&mut *transport, entry, &mut report).await;
        }
        drop(transport);

        debug!(?report, "queue drained");
        if let Some(hook) = &self.on_finish {
            hook(&report);
        }
        Some(report)
    }

    /// Run whenever the queue has entries. Never returns.
    pub async fn serve(&self) {
        info!("RTU worker started");
        loop {
            self.queue.wait_for_entries().await;
            let mut finished = pin!(self.finished.notified());
            finished.as_mut().enable();
            if self.run().await.is_none() {
                finished.await;
            }
        }
    }

    async fn process(&self, transport: &mut T, entry: QueueEntry, report: &mut RunReport) {
        let (request, completion) = entry.into_parts();
        report.processed += 1;
        debug!(
            slave = request.slave_id,
            register_type = %request.address.register_type,
            address = request.address.address,
            length = request.address.length,
            task = %request.options.task,
            "processing queue entry"
        );

        let outcome = match request.options.cache {
            CachePolicy::CacheOnly => match self.lookup(&request) {
                Some(outcome) => {
                    report.cache_hits += 1;
                    outcome
                }
                None => Err(ModbusError::NotFound {
                    slave_id: request.slave_id,
                    register_type: request.address.register_type,
                    address: request.address.address,
                }),
            },
            CachePolicy::ReadThrough => match self.lookup(&request) {
                Some(Ok(data)) => {
                    report.cache_hits += 1;
                    Ok(data)
                }
                _ => self.execute(transport, &request, report).await,
            },
            CachePolicy::Bypass => self.execute(transport, &request, report).await,
        };

        self.deliver(transport, &request, completion, outcome, report)
            .await;
    }

    /// `None` when some register of the range was never cached.
    fn lookup(&self, request: &QueuedRequest) -> Option<Result<Vec<u16>>> {
        match self.cache_guard().lookup(request.slave_id, &request.address) {
            Lookup::Hit(data) => Some(Ok(data)),
            Lookup::Failed(e) => Some(Err(e)),
            Lookup::Miss { address } => {
                debug!(slave = request.slave_id, address, "cache miss");
                None
            }
        }
    }

    /// Bus round trip with the retry and split policy applied.
    async fn execute(
        &self,
        transport: &mut T,
        request: &QueuedRequest,
        report: &mut RunReport,
    ) -> Result<Vec<u16>> {
        let task = request.options.task;
        let handling = request.options.error_handling;
        if !handling.retry {
            return self
                .call(transport, request.slave_id, &request.address, task, report)
                .await;
        }
        if !handling.split || request.address.length < 2 || request.address.is_write() {
            return self
                .call_with_retry(transport, request.slave_id, &request.address, task, report)
                .await;
        }

        let error = match self
            .call(transport, request.slave_id, &request.address, task, report)
            .await
        {
            Ok(data) => return Ok(data),
            Err(e) => e,
        };
        if !error.is_transport() {
            return Err(error);
        }
        debug!(slave = request.slave_id, %error, "splitting after reconnect");
        self.reconnect(transport, task, report).await?;
        self.split(transport, request, report).await
    }

    /// Read the range one register at a time. Each sub-read gets its own
    /// reconnect and re-issue; the first failure fails the whole range.
    async fn split(
        &self,
        transport: &mut T,
        request: &QueuedRequest,
        report: &mut RunReport,
    ) -> Result<Vec<u16>> {
        let mut data = Vec::with_capacity(usize::from(request.address.length));
        let mut first_error = None;
        for offset in 0..request.address.length {
            let single = request.address.single(offset);
            match self
                .call_with_retry(transport, request.slave_id, &single, Task::Splitted, report)
                .await
            {
                Ok(mut value) => data.append(&mut value),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(data),
        }
    }

    /// A transport error costs one reconnect and exactly one re-issue.
    async fn call_with_retry(
        &self,
        transport: &mut T,
        slave_id: u8,
        address: &RegisterAddress,
        task: Task,
        report: &mut RunReport,
    ) -> Result<Vec<u16>> {
        match self.call(transport, slave_id, address, task, report).await {
            Err(error) if error.is_transport() => {
                debug!(slave = slave_id, address = address.address, %error, "retrying after reconnect");
                self.reconnect(transport, task, report).await?;
                self.call(transport, slave_id, address, task, report).await
            }
            result => result,
        }
    }

    /// One transport call plus its cache and counter bookkeeping.
    async fn call(
        &self,
        transport: &mut T,
        slave_id: u8,
        address: &RegisterAddress,
        task: Task,
        report: &mut RunReport,
    ) -> Result<Vec<u16>> {
        report.transport_calls += 1;
        let result = dispatch(transport, slave_id, address).await;
        let now = self.clock.now();
        let mut cache = self.cache_guard();
        cache.count_request(slave_id, task, now);
        match result {
            Ok(read) => {
                if !address.is_write() {
                    cache.update(slave_id, address, &read.data, now);
                }
                debug!(slave = slave_id, duration = ?read.duration, "transport call succeeded");
                Ok(read.data)
            }
            Err(error) => {
                if !address.is_write() {
                    cache.update_error(slave_id, address, &error, now);
                }
                cache.record_error(slave_id, task, address, error.state(), now);
                debug!(slave = slave_id, %error, "transport call failed");
                Err(error)
            }
        }
    }

    async fn reconnect(&self, transport: &mut T, task: Task, report: &mut RunReport) -> Result<()> {
        report.reconnects += 1;
        transport.reconnect_rtu(task).await.map_err(|e| match e {
            ModbusError::Reconnect(_) => e,
            other => ModbusError::Reconnect(other.to_string()),
        })
    }

    async fn deliver(
        &self,
        transport: &mut T,
        request: &QueuedRequest,
        completion: Box<dyn Completion>,
        outcome: Result<Vec<u16>>,
        report: &mut RunReport,
    ) {
        let error = match outcome {
            Ok(data) => {
                report.resolved += 1;
                completion.resolve(request, data);
                return;
            }
            Err(error) => error,
        };

        report.failed += 1;
        let message = error.to_string();
        match completion.fail(request, error) {
            ErrorAction::HandledNoReconnect => {}
            ErrorAction::HandledReconnect => {
                if let Err(e) = self.reconnect(transport, request.options.task, report).await {
                    warn!(error = %e, "reconnect requested by producer failed");
                }
            }
            ErrorAction::NotHandled => warn!(
                slave = request.slave_id,
                register_type = %request.address.register_type,
                address = request.address.address,
                task = %request.options.task,
                error = %message,
                "queue entry failed without a handler"
            ),
        }
    }
}
