//! Scripted transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ModbusError, Result};
use crate::queue::{RegisterAddress, RegisterType, Task};
use crate::rtu::{ReadResult, Transport, Word};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Read {
        slave_id: u8,
        register_type: RegisterType,
        address: u16,
        length: u16,
    },
    Write {
        slave_id: u8,
        register_type: RegisterType,
        address: u16,
        data: Vec<Word>,
    },
    Reconnect(Task),
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<(u8, RegisterType, u16), Word>,
    failures: VecDeque<ModbusError>,
    reconnect_failures: VecDeque<ModbusError>,
    calls: Vec<Call>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Register map plus a list of failures handed out to the next calls.
/// Clones share state, so a test can keep a handle after giving one away.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<State>>,
    yields: usize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            yields: 3,
            ..Self::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn set_value(&self, slave_id: u8, register_type: RegisterType, address: u16, value: Word) {
        self.state()
            .values
            .insert((slave_id, register_type, address), value);
    }

    pub fn value(&self, slave_id: u8, register_type: RegisterType, address: u16) -> Option<Word> {
        self.state()
            .values
            .get(&(slave_id, register_type, address))
            .copied()
    }

    /// The next read or write fails with `error`.
    pub fn fail_next(&self, error: ModbusError) {
        self.state().failures.push_back(error);
    }

    pub fn fail_next_reconnect(&self, error: ModbusError) {
        self.state().reconnect_failures.push_back(error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn reconnects(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Reconnect(_)))
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    async fn enter(&self, call: Call) -> Option<ModbusError> {
        let failure = {
            let mut state = self.state();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.calls.push(call);
            state.failures.pop_front()
        };
        // give concurrent producers a chance to overlap
        for _ in 0..self.yields {
            tokio::task::yield_now().await;
        }
        self.state().in_flight -= 1;
        failure
    }

    async fn read(
        &mut self,
        slave_id: u8,
        register_type: RegisterType,
        address: u16,
        length: u16,
    ) -> Result<ReadResult> {
        let call = Call::Read {
            slave_id,
            register_type,
            address,
            length,
        };
        if let Some(error) = self.enter(call).await {
            return Err(error);
        }
        let state = self.state();
        let data = RegisterAddress::read(register_type, address, length)
            .addresses()
            .map(|a| {
                state
                    .values
                    .get(&(slave_id, register_type, a))
                    .copied()
                    .unwrap_or_default()
            })
            .collect();
        Ok(ReadResult {
            data,
            duration: Duration::from_millis(1),
        })
    }

    async fn write(
        &mut self,
        slave_id: u8,
        register_type: RegisterType,
        address: u16,
        data: &[Word],
    ) -> Result<()> {
        let call = Call::Write {
            slave_id,
            register_type,
            address,
            data: data.to_vec(),
        };
        if let Some(error) = self.enter(call).await {
            return Err(error);
        }
        let mut state = self.state();
        for (a, value) in (address..).zip(data) {
            state.values.insert((slave_id, register_type, a), *value);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn read_holding_registers(&mut self, slave_id: u8, address: u16, length: u16) -> Result<ReadResult> {
        self.read(slave_id, RegisterType::HoldingRegister, address, length)
            .await
    }

    async fn read_coils(&mut self, slave_id: u8, address: u16, length: u16) -> Result<ReadResult> {
        self.read(slave_id, RegisterType::Coils, address, length).await
    }

    async fn read_discrete_inputs(&mut self, slave_id: u8, address: u16, length: u16) -> Result<ReadResult> {
        self.read(slave_id, RegisterType::DiscreteInputs, address, length)
            .await
    }

    async fn read_input_registers(&mut self, slave_id: u8, address: u16, length: u16) -> Result<ReadResult> {
        self.read(slave_id, RegisterType::AnalogInputs, address, length)
            .await
    }

    async fn write_holding_registers(&mut self, slave_id: u8, address: u16, data: &[Word]) -> Result<()> {
        self.write(slave_id, RegisterType::HoldingRegister, address, data)
            .await
    }

    async fn write_coils(&mut self, slave_id: u8, address: u16, data: &[Word]) -> Result<()> {
        let bits: Vec<Word> = data.iter().map(|w| Word::from(*w != 0)).collect();
        self.write(slave_id, RegisterType::Coils, address, &bits).await
    }

    async fn reconnect_rtu(&mut self, task: Task) -> Result<()> {
        let failure = {
            let mut state = self.state();
            state.calls.push(Call::Reconnect(task));
            state.reconnect_failures.pop_front()
        };
        tokio::task::yield_now().await;
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn cache_id(&self) -> String {
        "fake".to_string()
    }
}
