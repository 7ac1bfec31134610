use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, WrapErr};
use tokio::net::TcpListener;
use tracing::info;

use glasswall::config::Config;
use glasswall::downstream::{Downstream, UnitDescriptor, UnitError, approve};
use glasswall::protocol::PacketPool;
use glasswall::scsi::SCSIDevice;
use glasswall::usb::{enumerate_usb_storage_devices, open_usb_device};
use glasswall::{host, link, session};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let config = Config::parse();
    config.validate()?;

    let device_info = enumerate_usb_storage_devices()
        .await?
        .find(|dev| {
            config.device.is_none_or(|id| {
                dev.vendor_id() == id.vendor && dev.product_id() == id.product
            })
        })
        .ok_or_eyre("no matching USB mass storage device found")?;
    info!(
        vendor = device_info.vendor_id(),
        product = device_info.product_id(),
        "using device"
    );
    let drive = open_usb_device(device_info).await?;
    let mut device = SCSIDevice::new(drive).await?;

    let capacity = device.read_capacity().await?;
    let unit = UnitDescriptor {
        block_count: capacity.block_count(),
        block_size: capacity.block_len,
        error: UnitError::Ok,
    };
    approve(&unit).wrap_err("refusing to serve the attached unit")?;
    info!(?unit, "unit approved");

    let pool = PacketPool::new(config.packet_pool);
    let (host, host_events) = host::spawn(device, unit, pool.clone());

    let listener = TcpListener::bind(config.listen).await?;
    info!(listen = %config.listen, "waiting for the upstream side");
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    info!(%peer, "upstream connected");

    let (link, inbound) = link::spawn(stream, pool.clone());
    let downstream = Downstream::new(link, host, config.policy());
    session::run(downstream, inbound, host_events, pool).await
}
