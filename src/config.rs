//! Command line and environment configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_serial::{DataBits, Parity, StopBits};

use crate::bridge::DEFAULT_PORT;
use crate::rtu::{ReconnectPolicy, SerialSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ParityArg {
    None,
    Odd,
    Even,
}

impl From<ParityArg> for Parity {
    fn from(parity: ParityArg) -> Self {
        match parity {
            ParityArg::None => Parity::None,
            ParityArg::Odd => Parity::Odd,
            ParityArg::Even => Parity::Even,
        }
    }
}

/// Parse an ISO 8601 duration such as `PT8H` or `PT0.5S`.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let duration = iso8601_duration::Duration::parse(value)
        .map_err(|e| format!("invalid ISO 8601 duration {value:?}: {e:?}"))?;
    duration
        .to_std()
        .ok_or_else(|| format!("duration {value:?} has no fixed length"))
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Shares one Modbus RTU line between pollers and Modbus TCP clients")]
pub struct Config {
    /// Serial device of the RTU bus
    #[arg(long, env = "RTU_SERIAL_PORT")]
    pub serial_port: String,

    #[arg(long, env = "RTU_BAUD_RATE", default_value_t = 9600)]
    pub baud_rate: u32,

    #[arg(long, env = "RTU_PARITY", value_enum, default_value_t = ParityArg::None)]
    pub parity: ParityArg,

    #[arg(long, env = "RTU_DATA_BITS", default_value_t = 8,
          value_parser = clap::value_parser!(u8).range(5..=8))]
    pub data_bits: u8,

    #[arg(long, env = "RTU_STOP_BITS", default_value_t = 1,
          value_parser = clap::value_parser!(u8).range(1..=2))]
    pub stop_bits: u8,

    /// Time a slave gets to answer
    #[arg(long, env = "RTU_RESPONSE_TIMEOUT", default_value = "PT1S", value_parser = parse_duration)]
    pub response_timeout: Duration,

    #[arg(long, env = "TCP_BRIDGE_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bridge_bind: IpAddr,

    #[arg(long, env = "TCP_BRIDGE_PORT", default_value_t = DEFAULT_PORT)]
    pub bridge_port: u16,

    /// Run without the Modbus TCP server
    #[arg(long, env = "TCP_BRIDGE_DISABLED")]
    pub bridge_disabled: bool,

    /// Age after which cached values may be replaced by errors and are evicted
    #[arg(long, env = "CACHE_MAX_AGE", default_value = "PT8H", value_parser = parse_duration)]
    pub cache_max_age: Duration,

    #[arg(long, env = "CACHE_CLEANUP_INTERVAL", default_value = "PT1H", value_parser = parse_duration)]
    pub cache_cleanup_interval: Duration,

    /// How long per-slave error records are kept
    #[arg(long, env = "ERROR_RETENTION", default_value = "PT1H", value_parser = parse_duration)]
    pub error_retention: Duration,

    #[arg(long, env = "RECONNECT_ATTEMPTS", default_value_t = 3)]
    pub reconnect_attempts: usize,

    #[arg(long, env = "RECONNECT_DELAY", default_value = "PT0.5S", value_parser = parse_duration)]
    pub reconnect_delay: Duration,
}

impl Config {
    pub fn serial_settings(&self) -> SerialSettings {
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        SerialSettings {
            path: self.serial_port.clone(),
            baud_rate: self.baud_rate,
            parity: self.parity.into(),
            data_bits,
            stop_bits,
            response_timeout: self.response_timeout,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            attempts: self.reconnect_attempts,
            delay: self.reconnect_delay,
        }
    }

    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        (!self.bridge_disabled).then(|| SocketAddr::new(self.bridge_bind, self.bridge_port))
    }
}
