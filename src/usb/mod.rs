//! Interactions with USB mass storage devices
//!
//! Flash drives use the mass storage class (0x08), SCSI transparent command set subclass (0x06),
//! and the bulk-only transport protocol (0x50). That means two bulk endpoints: one for sending
//! data from the host computer to the flash drive (OUT) and one for receiving data from the
//! flash drive to the computer (IN).
//!
//! The host starts out by sending a 31-byte command block wrapper (CBW) to the drive, optionally
//! sending or receiving data depending on what command it is, and then reading a 13-byte command
//! status wrapper (CSW) containing the result of the command.
//!
//! Reference: <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>

pub mod cbw;

use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{OptionExt, bail, ensure};
use nusb::descriptors::TransferType;
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, ControlIn, ControlType, Direction, In, Out, Recipient};
use nusb::{Device, DeviceInfo, list_devices};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::scsi::command::CommandBlock;
use cbw::{CSW_SIZE, CommandBlockWrapper, CommandStatus, CommandStatusWrapper, TagGenerator};

/// https://www.usb.org/defined-class-codes
const MASS_STORAGE_USB_CLASS: u8 = 0x08;

/// Transfer buffer size for both bulk endpoints; a multiple of every bulk max packet size.
const ENDPOINT_BUFFER: usize = 4096;

/// Returns a list of every USB storage device currently connected to the host machine
pub async fn enumerate_usb_storage_devices() -> Result<impl Iterator<Item = DeviceInfo>> {
    let all_usb_devices = list_devices().await?;

    // Each USB device typically exposes one or more *interfaces* as a
    // way to interact with specific functionality of the device.
    let usb_storage_devices = all_usb_devices.filter(|dev| {
        debug!("scanning usb device: {:#?}", dev);
        dev.class() == MASS_STORAGE_USB_CLASS
            || dev
                .interfaces()
                .any(|interface| interface.class() == MASS_STORAGE_USB_CLASS)
    });
    Ok(usb_storage_devices)
}

/// Buffers data-out bytes without submitting them.
///
/// A flush submits a part-filled buffer as it is, and a short packet ends
/// the bulk transfer, so chunks must not be flushed one by one.
async fn queue_data_out<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> Result<()> {
    writer.write_all(buf).await?;
    Ok(())
}

/// Submits the tail of the data-out phase, once, before the CSW is read.
async fn end_data_out<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.flush().await?;
    Ok(())
}

/// The bulk endpoint pair of an opened mass storage interface.
pub struct USBDrive {
    bulk_write: EndpointWrite<Bulk>,
    bulk_read: EndpointRead<Bulk>,
    tags: TagGenerator,
}

/// As described by  the USB Mass Storage Class - Bulk Only Transport spec,
/// section 3.2.
///
/// LUN stands for Logical Unit Number, and it's a number
/// used as a unique identifier for a storage device or logical volume.
///
/// <https://en.wikipedia.org/wiki/Logical_unit_number>
fn max_lun_request(interface_number: u8) -> ControlIn {
    ControlIn {
        control_type: ControlType::Class,
        recipient: Recipient::Interface,
        request: 0xfe,
        value: 0,
        index: u16::from(interface_number),
        length: 1,
    }
}

/// Opens the provided USB mass storage device.
///
/// This initialization sequence follows the order
/// described here: <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>,
///
/// where the author obtained it with a USB hardware signal analyzer and reverse engineering the implementations on macos, windows, and linux
#[tracing::instrument]
pub async fn open_usb_device(device_info: DeviceInfo) -> Result<USBDrive> {
    let interface_number = device_info
        .interfaces()
        .find(|interface| interface.class() == MASS_STORAGE_USB_CLASS)
        .map(|interface| interface.interface_number())
        .unwrap_or(0);

    // 1. Claim the USB device to read and write to it
    debug!(interface_number, "opening device");
    let device: Device = device_info.open().await?;
    let interface: nusb::Interface = device.claim_interface(interface_number).await?;

    // 2. Request the maximum LUN. Some drives stall this request, which
    // means they only have one.
    match interface
        .control_in(max_lun_request(interface_number), Duration::from_millis(500))
        .await
    {
        Ok(max_lun) if max_lun.first().is_some_and(|lun| *lun > 0) => {
            warn!(max_lun = max_lun[0], "device has several LUNs, only LUN 0 is exposed");
        }
        Ok(_) => {}
        Err(error) => debug!(%error, "GET MAX LUN failed, assuming a single LUN"),
    }

    let descriptor = interface
        .descriptor()
        .ok_or_eyre("mass storage interface has no active setting")?;
    let bulk_endpoint = |direction: Direction| {
        descriptor
            .endpoints()
            .find(|ep| ep.transfer_type() == TransferType::Bulk && ep.direction() == direction)
            .map(|ep| ep.address())
    };
    let out_address = bulk_endpoint(Direction::Out).ok_or_eyre("no bulk OUT endpoint")?;
    let in_address = bulk_endpoint(Direction::In).ok_or_eyre("no bulk IN endpoint")?;
    debug!(out_address, in_address, "found bulk endpoints");

    let bulk_write = interface
        .endpoint::<Bulk, Out>(out_address)?
        .writer(ENDPOINT_BUFFER)
        .with_num_transfers(2);
    let bulk_read = interface
        .endpoint::<Bulk, In>(in_address)?
        .reader(ENDPOINT_BUFFER)
        .with_num_transfers(2);

    Ok(USBDrive {
        bulk_write,
        bulk_read,
        tags: TagGenerator::new(),
    })
}

impl USBDrive {
    /// Sends the CBW for `command`, returning the tag its CSW must carry.
    pub async fn send_cbw(&mut self, command: &CommandBlock) -> Result<u32> {
        let tag = self.tags.tag();
        let cbw = CommandBlockWrapper::new(command, tag);
        debug!(tag, opcode = command.opcode(), "sending CBW");
        self.bulk_write.write_all(cbw.as_slice()).await?;
        self.bulk_write.flush().await?;
        Ok(tag)
    }

    /// Reads exactly `buf.len()` bytes of the data-in phase.
    pub async fn read_data(&mut self, buf: &mut [u8]) -> Result<()> {
        self.bulk_read.read_exact(buf).await?;
        Ok(())
    }

    /// Queues `buf` as part of the data-out phase.
    pub async fn write_data(&mut self, buf: &[u8]) -> Result<()> {
        queue_data_out(&mut self.bulk_write, buf).await
    }

    /// Submits whatever is left of the data-out phase.
    pub async fn finish_data_out(&mut self) -> Result<()> {
        end_data_out(&mut self.bulk_write).await
    }

    /// Reads the CSW closing the command tagged `tag`.
    pub async fn receive_csw(&mut self, tag: u32) -> Result<CommandStatus> {
        let mut buf = [0; CSW_SIZE];
        self.bulk_read.read_exact(&mut buf).await?;
        let csw = CommandStatusWrapper::from_slice(&buf)?;
        let (csw_tag, status, residue) = (csw.tag, csw.status, csw.data_residue);
        ensure!(
            csw_tag == tag,
            "CSW tag {csw_tag} does not match CBW tag {tag}"
        );
        debug!(tag, ?status, residue, "received CSW");
        Ok(status)
    }

    /// Runs a whole command with an optional data-in phase, returning the data.
    pub async fn submit_cbw(&mut self, command: CommandBlock) -> Result<Vec<u8>> {
        let tag = self.send_cbw(&command).await?;
        let mut response = vec![0; command.data_transfer_len as usize];
        if !response.is_empty() {
            self.read_data(&mut response).await?;
        }
        match self.receive_csw(tag).await? {
            CommandStatus::Passed => Ok(response),
            status => bail!("command 0x{:02x} ended with {status:?}", command.opcode()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::AsyncWrite;

    use super::{end_data_out, queue_data_out};

    /// Stands in for a bulk OUT endpoint: every flush submits one transfer.
    #[derive(Default)]
    struct BulkOut {
        buffered: usize,
        transfers: Vec<usize>,
    }

    impl AsyncWrite for BulkOut {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.buffered += buf.len();
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            if self.buffered > 0 {
                let len = self.buffered;
                self.transfers.push(len);
                self.buffered = 0;
            }
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.poll_flush(cx)
        }
    }

    #[tokio::test]
    async fn data_out_chunks_form_one_transfer() {
        let mut endpoint = BulkOut::default();
        queue_data_out(&mut endpoint, &[0; 600]).await.unwrap();
        queue_data_out(&mut endpoint, &[0; 424]).await.unwrap();
        assert!(endpoint.transfers.is_empty());

        end_data_out(&mut endpoint).await.unwrap();
        assert_eq!(endpoint.transfers, [1024]);
    }
}
