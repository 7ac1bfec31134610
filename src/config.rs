//! Command line configuration.

use std::net::SocketAddr;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::ensure;

use crate::downstream::Policy;

/// Smallest pool that can hold an inbound command, a reply and a stream packet.
pub const MIN_PACKET_POOL: usize = 3;

#[derive(Debug, Parser)]
#[command(name = "glasswall")]
#[command(about = "Serve a USB mass storage device over a packet link", long_about = None)]
pub struct Config {
    /// Address the upstream side connects to.
    #[arg(long, default_value = "127.0.0.1:7411")]
    pub listen: SocketAddr,
    /// Number of link packets shared by all tasks.
    #[arg(long, default_value_t = 4)]
    pub packet_pool: usize,
    /// Serve this device instead of the first mass storage device found.
    #[arg(long, value_name = "VID:PID", value_parser = parse_device_id)]
    pub device: Option<DeviceId>,
}

/// USB vendor and product id.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceId {
    pub vendor: u16,
    pub product: u16,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.packet_pool >= MIN_PACKET_POOL,
            "--packet-pool must be at least {MIN_PACKET_POOL}, was {}",
            self.packet_pool
        );
        Ok(())
    }

    pub fn policy(&self) -> Policy {
        Policy::default()
    }
}

fn parse_hex_u16(input: &str) -> Result<u16, String> {
    let trimmed = input.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(trimmed, 16).map_err(|err| err.to_string())
}

fn parse_device_id(input: &str) -> Result<DeviceId, String> {
    let (vendor, product) = input
        .split_once(':')
        .ok_or_else(|| format!("expected VID:PID, got {input:?}"))?;
    Ok(DeviceId {
        vendor: parse_hex_u16(vendor)?,
        product: parse_hex_u16(product)?,
    })
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Config, DeviceId, parse_device_id};

    #[test]
    fn defaults_are_valid() {
        let config = Config::parse_from(["glasswall"]);
        assert_eq!(config.listen.port(), 7411);
        assert_eq!(config.packet_pool, 4);
        assert!(config.device.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn catch_tiny_pool() {
        let config = Config::parse_from(["glasswall", "--packet-pool", "2"]);
        let e = config.validate().expect_err("two packets are too few");
        assert!(e.root_cause().to_string().contains("--packet-pool"));
    }

    #[test]
    fn device_id_is_hex() {
        assert_eq!(
            parse_device_id("0781:5567"),
            Ok(DeviceId {
                vendor: 0x0781,
                product: 0x5567
            })
        );
        assert!(parse_device_id("0781").is_err());
        assert!(parse_device_id("zz:1").is_err());
    }
}
