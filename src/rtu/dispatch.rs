use tokio::time::Instant;

use super::{ReadResult, Transport};
use crate::error::{ModbusError, Result};
use crate::queue::{RegisterAddress, RegisterType};

/// Run one request against the transport, picking the call by register type
/// and direction. Writes come back with no data.
pub(crate) async fn dispatch<T>(
    transport: &mut T,
    slave_id: u8,
    address: &RegisterAddress,
) -> Result<ReadResult>
where
    T: Transport + ?Sized,
{
    let RegisterAddress {
        register_type,
        address: start,
        length,
        ..
    } = *address;

    match (&address.write, register_type) {
        (None, RegisterType::HoldingRegister) => {
            transport.read_holding_registers(slave_id, start, length).await
        }
        (None, RegisterType::AnalogInputs) => {
            transport.read_input_registers(slave_id, start, length).await
        }
        (None, RegisterType::Coils) => transport.read_coils(slave_id, start, length).await,
        (None, RegisterType::DiscreteInputs) => {
            transport.read_discrete_inputs(slave_id, start, length).await
        }
        (Some(values), RegisterType::HoldingRegister) => {
            let started = Instant::now();
            transport
                .write_holding_registers(slave_id, start, values)
                .await?;
            Ok(written(started))
        }
        (Some(values), RegisterType::Coils) => {
            let started = Instant::now();
            transport.write_coils(slave_id, start, values).await?;
            Ok(written(started))
        }
        (Some(_), register_type) => Err(ModbusError::InvalidRequest(format!(
            "{register_type} are read-only"
        ))),
    }
}

fn written(started: Instant) -> ReadResult {
    ReadResult {
        data: Vec::new(),
        duration: started.elapsed(),
    }
}
