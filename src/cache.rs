//! Per-slave result cache.
//!
//! Keeps the last value (or error) seen for every register, the recent error
//! log and per-task request counters. Only the worker writes to it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;

use crate::error::{ErrorState, ModbusError};
use crate::queue::{RegisterAddress, RegisterType, Task};

/// Age at which a cached value stops protecting itself against errors and
/// becomes eligible for cleanup.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(8 * 60 * 60);

/// How long error log records are kept.
pub const DEFAULT_ERROR_RETENTION: Duration = Duration::from_secs(60 * 60);

const MAX_ERROR_RECORDS: usize = 50;

pub type SharedCache = Arc<Mutex<ModbusCache>>;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    Data(u16),
    Error(ModbusError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: CachedValue,
    pub timestamp: DateTime<Utc>,
}

impl CacheEntry {
    pub fn data(&self) -> Option<u16> {
        match self.value {
            CachedValue::Data(v) => Some(v),
            CachedValue::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ModbusError> {
        match &self.value {
            CachedValue::Data(_) => None,
            CachedValue::Error(e) => Some(e),
        }
    }
}

/// Result of looking up a whole register range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(Vec<u16>),
    Failed(ModbusError),
    Miss { address: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub task: Task,
    pub address: RegisterAddress,
    pub state: ErrorState,
}

#[derive(Debug, Clone, Copy, Default)]
struct MinuteSlot {
    hour: i64,
    count: u32,
}

/// Requests per minute of the current hour. A slot stamped with an older
/// hour is stale and restarts from zero.
#[derive(Debug, Clone)]
pub struct RequestCounter {
    slots: [MinuteSlot; 60],
}

impl Default for RequestCounter {
    fn default() -> Self {
        Self {
            slots: [MinuteSlot::default(); 60],
        }
    }
}

fn hour_of(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(3600)
}

impl RequestCounter {
    fn increment(&mut self, now: DateTime<Utc>) {
        let hour = hour_of(now);
        let slot = &mut self.slots[now.minute() as usize];
        if slot.hour != hour {
            *slot = MinuteSlot { hour, count: 0 };
        }
        slot.count += 1;
    }

    /// Count for `minute` of the hour `now` falls in.
    pub fn minute(&self, minute: u32, now: DateTime<Utc>) -> u32 {
        self.slots
            .get(minute as usize)
            .filter(|slot| slot.hour == hour_of(now))
            .map_or(0, |slot| slot.count)
    }

    /// Sum over the sixty minutes up to and including `now`.
    pub fn last_hour(&self, now: DateTime<Utc>) -> u32 {
        let hour = hour_of(now);
        let current = now.minute() as usize;
        self.slots
            .iter()
            .enumerate()
            .filter(|(minute, slot)| {
                slot.hour == hour || (slot.hour == hour - 1 && *minute > current)
            })
            .map(|(_, slot)| slot.count)
            .sum()
    }
}

#[derive(Debug, Default)]
pub struct SlaveCache {
    values: HashMap<(RegisterType, u16), CacheEntry>,
    errors: VecDeque<ErrorRecord>,
    request_count: HashMap<Task, RequestCounter>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveStatus {
    pub slave_id: u8,
    pub errors: Vec<ErrorRecord>,
    pub request_count: BTreeMap<Task, u32>,
    pub queue_length: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub values: usize,
    pub errors: usize,
}

#[derive(Debug)]
pub struct ModbusCache {
    max_age: chrono::Duration,
    error_retention: chrono::Duration,
    slaves: HashMap<u8, SlaveCache>,
}

impl Default for ModbusCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl ModbusCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age: to_chrono(max_age),
            error_retention: to_chrono(DEFAULT_ERROR_RETENTION),
            slaves: HashMap::new(),
        }
    }

    pub fn with_error_retention(mut self, retention: Duration) -> Self {
        self.error_retention = to_chrono(retention);
        self
    }

    pub fn shared(self) -> SharedCache {
        Arc::new(Mutex::new(self))
    }

    fn slave_mut(&mut self, slave_id: u8) -> &mut SlaveCache {
        self.slaves.entry(slave_id).or_default()
    }

    pub fn slave_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.slaves.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn get(&self, slave_id: u8, register_type: RegisterType, address: u16) -> Option<&CacheEntry> {
        self.slaves
            .get(&slave_id)?
            .values
            .get(&(register_type, address))
    }

    /// Store a successful read, one entry per register, replacing any error.
    pub fn update(&mut self, slave_id: u8, address: &RegisterAddress, data: &[u16], now: DateTime<Utc>) {
        let slave = self.slave_mut(slave_id);
        for (register, value) in address.addresses().zip(data.iter().copied()) {
            slave.values.insert(
                (address.register_type, register),
                CacheEntry {
                    value: CachedValue::Data(value),
                    timestamp: now,
                },
            );
        }
    }

    /// Record a failed read. A value younger than the max age survives the
    /// error untouched; anything else is replaced by the error.
    pub fn update_error(
        &mut self,
        slave_id: u8,
        address: &RegisterAddress,
        error: &ModbusError,
        now: DateTime<Utc>,
    ) {
        let max_age = self.max_age;
        let slave = self.slave_mut(slave_id);
        for register in address.addresses() {
            let key = (address.register_type, register);
            if let Some(entry) = slave.values.get(&key) {
                if entry.data().is_some() && now - entry.timestamp < max_age {
                    continue;
                }
            }
            slave.values.insert(
                key,
                CacheEntry {
                    value: CachedValue::Error(error.clone()),
                    timestamp: now,
                },
            );
        }
    }

    pub fn lookup(&self, slave_id: u8, address: &RegisterAddress) -> Lookup {
        let Some(slave) = self.slaves.get(&slave_id) else {
            return Lookup::Miss {
                address: address.address,
            };
        };
        let mut data = Vec::with_capacity(usize::from(address.length));
        let mut failure = None;
        for register in address.addresses() {
            match slave.values.get(&(address.register_type, register)) {
                None => return Lookup::Miss { address: register },
                Some(entry) => match &entry.value {
                    CachedValue::Data(v) => data.push(*v),
                    CachedValue::Error(e) => {
                        failure.get_or_insert_with(|| e.clone());
                    }
                },
            }
        }
        match failure {
            Some(e) => Lookup::Failed(e),
            None => Lookup::Hit(data),
        }
    }

    /// Drop values older than the max age and error records older than the
    /// retention period.
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> CleanupStats {
        let mut stats = CleanupStats::default();
        let max_age = self.max_age;
        let retention = self.error_retention;
        for slave in self.slaves.values_mut() {
            let before = slave.values.len();
            slave.values.retain(|_, entry| now - entry.timestamp <= max_age);
            stats.values += before - slave.values.len();

            let before = slave.errors.len();
            slave.errors.retain(|record| now - record.timestamp <= retention);
            stats.errors += before - slave.errors.len();
        }
        stats
    }

    pub fn record_error(
        &mut self,
        slave_id: u8,
        task: Task,
        address: &RegisterAddress,
        state: ErrorState,
        now: DateTime<Utc>,
    ) {
        let errors = &mut self.slave_mut(slave_id).errors;
        while errors.len() >= MAX_ERROR_RECORDS {
            errors.pop_front();
        }
        errors.push_back(ErrorRecord {
            timestamp: now,
            task,
            address: address.clone(),
            state,
        });
    }

    pub fn errors(&self, slave_id: u8) -> Vec<ErrorRecord> {
        self.slaves
            .get(&slave_id)
            .map(|s| s.errors.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count_request(&mut self, slave_id: u8, task: Task, now: DateTime<Utc>) {
        self.slave_mut(slave_id)
            .request_count
            .entry(task)
            .or_default()
            .increment(now);
    }

    pub fn request_counter(&self, slave_id: u8, task: Task) -> Option<&RequestCounter> {
        self.slaves.get(&slave_id)?.request_count.get(&task)
    }

    pub fn status(&self, slave_id: u8, queue_length: usize, now: DateTime<Utc>) -> SlaveStatus {
        let request_count = self
            .slaves
            .get(&slave_id)
            .map(|s| {
                s.request_count
                    .iter()
                    .map(|(task, counter)| (*task, counter.last_hour(now)))
                    .collect()
            })
            .unwrap_or_default();
        SlaveStatus {
            slave_id,
            errors: self.errors(slave_id),
            request_count,
            queue_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, hour, minute, 0).unwrap()
    }

    fn holding(address: u16) -> RegisterAddress {
        RegisterAddress::read(RegisterType::HoldingRegister, address, 1)
    }

    #[test]
    fn error_is_suppressed_while_value_is_fresh() {
        let mut cache = ModbusCache::new(DEFAULT_MAX_AGE);
        let e199 = holding(199);
        let t0 = at(5, 0);

        cache.update(1, &e199, &[(-199i16) as u16], t0);
        cache.update(1, &e199, &[(-201i16) as u16], t0);
        let entry = cache.get(1, RegisterType::HoldingRegister, 199).unwrap();
        assert_eq!(entry.data(), Some((-201i16) as u16));

        let error = ModbusError::Crc("Error".into());
        cache.update_error(1, &e199, &error, t0);
        let entry = cache.get(1, RegisterType::HoldingRegister, 199).unwrap();
        assert_eq!(entry.data(), Some((-201i16) as u16));
        assert!(entry.error().is_none());

        cache.update_error(1, &e199, &error, at(13, 0));
        let entry = cache.get(1, RegisterType::HoldingRegister, 199).unwrap();
        assert_eq!(entry.data(), None);
        assert_eq!(entry.error(), Some(&error));
        assert_eq!(entry.timestamp, at(13, 0));
    }

    #[test]
    fn error_without_previous_value_is_recorded() {
        let mut cache = ModbusCache::default();
        let error = ModbusError::Timeout(Duration::from_secs(1));
        cache.update_error(3, &RegisterAddress::read(RegisterType::Coils, 10, 2), &error, at(5, 0));
        assert_eq!(cache.get(3, RegisterType::Coils, 10).unwrap().error(), Some(&error));
        assert_eq!(cache.get(3, RegisterType::Coils, 11).unwrap().error(), Some(&error));
        assert!(cache.get(3, RegisterType::Coils, 12).is_none());
    }

    #[test]
    fn newer_error_replaces_older_error() {
        let mut cache = ModbusCache::default();
        let first = ModbusError::Timeout(Duration::from_secs(1));
        let second = ModbusError::Exception { code: 2 };
        cache.update_error(1, &holding(5), &first, at(5, 0));
        cache.update_error(1, &holding(5), &second, at(5, 1));
        assert_eq!(cache.get(1, RegisterType::HoldingRegister, 5).unwrap().error(), Some(&second));
    }

    #[test]
    fn cleanup_evicts_only_expired_entries() {
        let mut cache = ModbusCache::default();
        let t0 = at(18, 0);
        cache.update(1, &holding(199), &[199], t0);
        cache.update(1, &holding(200), &[200], at(5, 0));
        let stats = cache.cleanup(t0);
        assert_eq!(stats.values, 1);
        assert!(cache.get(1, RegisterType::HoldingRegister, 199).is_some());
        assert!(cache.get(1, RegisterType::HoldingRegister, 200).is_none());
    }

    #[test]
    fn slaves_are_isolated() {
        let mut cache = ModbusCache::default();
        cache.update(1, &holding(7), &[1], at(5, 0));
        cache.update(2, &holding(7), &[2], at(5, 0));
        assert_eq!(cache.get(1, RegisterType::HoldingRegister, 7).unwrap().data(), Some(1));
        assert_eq!(cache.get(2, RegisterType::HoldingRegister, 7).unwrap().data(), Some(2));
        assert!(cache.get(1, RegisterType::AnalogInputs, 7).is_none());
        assert_eq!(cache.slave_ids(), vec![1, 2]);
    }

    #[test]
    fn lookup_spans_the_whole_range() {
        let mut cache = ModbusCache::default();
        let range = RegisterAddress::read(RegisterType::AnalogInputs, 100, 3);
        cache.update(1, &range, &[1, 2, 3], at(5, 0));
        assert_eq!(cache.lookup(1, &range), Lookup::Hit(vec![1, 2, 3]));
        assert_eq!(
            cache.lookup(1, &RegisterAddress::read(RegisterType::AnalogInputs, 101, 3)),
            Lookup::Miss { address: 103 }
        );
        assert_eq!(cache.lookup(9, &range), Lookup::Miss { address: 100 });

        let error = ModbusError::Exception { code: 2 };
        cache.update_error(1, &RegisterAddress::read(RegisterType::AnalogInputs, 103, 1), &error, at(5, 0));
        assert_eq!(
            cache.lookup(1, &RegisterAddress::read(RegisterType::AnalogInputs, 102, 2)),
            Lookup::Failed(error)
        );
    }

    #[test]
    fn error_log_is_capped_and_expires() {
        let mut cache = ModbusCache::default();
        for minute in 0..55 {
            cache.record_error(1, Task::Poll, &holding(minute), ErrorState::Timeout, at(5, minute as u32));
        }
        let errors = cache.errors(1);
        assert_eq!(errors.len(), 50);
        assert_eq!(errors[0].address.address, 5);

        let stats = cache.cleanup(at(6, 30));
        // 05:30 is exactly one hour old and stays
        assert_eq!(stats.errors, 25);
        let errors = cache.errors(1);
        assert_eq!(errors.len(), 25);
        assert_eq!(errors[0].address.address, 30);
    }

    #[test]
    fn request_counter_resets_stale_minutes() {
        let mut cache = ModbusCache::default();
        cache.count_request(1, Task::Poll, at(5, 10));
        cache.count_request(1, Task::Poll, at(5, 10));
        cache.count_request(1, Task::Poll, at(5, 40));
        cache.count_request(1, Task::Entity, at(5, 40));

        let counter = cache.request_counter(1, Task::Poll).unwrap();
        assert_eq!(counter.minute(10, at(5, 59)), 2);
        assert_eq!(counter.last_hour(at(5, 59)), 3);
        // 05:10 is more than an hour before 06:20, 05:40 is not
        assert_eq!(counter.last_hour(at(6, 20)), 1);

        cache.count_request(1, Task::Poll, at(6, 10));
        let counter = cache.request_counter(1, Task::Poll).unwrap();
        assert_eq!(counter.minute(10, at(6, 10)), 1);

        let status = cache.status(1, 4, at(6, 20));
        assert_eq!(status.request_count.get(&Task::Poll), Some(&2));
        assert_eq!(status.request_count.get(&Task::Entity), Some(&1));
        assert_eq!(status.queue_length, 4);
    }

    #[test]
    fn manual_clock_moves_on_demand() {
        let clock = ManualClock::new(at(5, 0));
        assert_eq!(clock.now(), at(5, 0));
        clock.set(at(13, 0));
        assert_eq!(clock.now(), at(13, 0));
    }
}
