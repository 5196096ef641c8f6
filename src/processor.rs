//! Batches scattered single-register reads into few ranged reads.

use std::collections::BTreeMap;

use futures::future::join_all;
use tracing::debug;

use crate::error::{ModbusError, Result};
use crate::queue::{QueueOptions, RegisterAddress, RegisterType, RequestQueue};

/// Registers this far apart (or closer) are read in one request.
pub const DEFAULT_MAX_ADDRESS_DELTA: u16 = 10;

pub type RegisterKey = (RegisterType, u16);

#[derive(Debug, Clone)]
pub struct ReadProcessor {
    queue: RequestQueue,
    max_address_delta: u16,
}

impl ReadProcessor {
    pub fn new(queue: RequestQueue) -> Self {
        Self {
            queue,
            max_address_delta: DEFAULT_MAX_ADDRESS_DELTA,
        }
    }

    pub fn with_max_address_delta(mut self, delta: u16) -> Self {
        self.max_address_delta = delta;
        self
    }

    /// Sort, dedup and merge `registers` into ranged reads.
    pub fn plan(&self, registers: &[RegisterKey]) -> Vec<RegisterAddress> {
        let mut sorted = registers.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut ranges: Vec<RegisterAddress> = Vec::new();
        for (register_type, address) in sorted {
            if let Some(last) = ranges.last_mut().filter(|r| r.register_type == register_type) {
                let end = u32::from(last.address) + u32::from(last.length) - 1;
                let merged = u32::from(address) - u32::from(last.address) + 1;
                if u32::from(address) - end <= u32::from(self.max_address_delta)
                    && merged <= u32::from(register_type.max_quantity(false))
                {
                    last.length = merged as u16;
                    continue;
                }
            }
            ranges.push(RegisterAddress::read(register_type, address, 1));
        }
        ranges
    }

    /// Read `registers` from one slave. Every requested register gets its own
    /// result; a failed range fails each register in it.
    pub async fn read(
        &self,
        slave_id: u8,
        registers: &[RegisterKey],
        options: QueueOptions,
    ) -> BTreeMap<RegisterKey, Result<u16>> {
        let ranges = self.plan(registers);
        debug!(
            slave = slave_id,
            registers = registers.len(),
            requests = ranges.len(),
            "planned reads"
        );

        let results = join_all(
            ranges
                .iter()
                .map(|range| self.queue.request(slave_id, range.clone(), options)),
        )
        .await;

        let mut values = BTreeMap::new();
        for (range, result) in ranges.iter().zip(results) {
            for &(register_type, address) in registers {
                if register_type != range.register_type
                    || address < range.address
                    || u32::from(address) >= u32::from(range.address) + u32::from(range.length)
                {
                    continue;
                }
                let offset = usize::from(address - range.address);
                let value = match &result {
                    Ok(data) => data.get(offset).copied().ok_or_else(|| {
                        ModbusError::Crc(format!(
                            "short response for {register_type} {address}"
                        ))
                    }),
                    Err(e) => Err(e.clone()),
                };
                values.insert((register_type, address), value);
            }
        }
        values
    }
}
