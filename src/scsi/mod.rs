//! SCSI protocol and format implementation as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//!   This is an older version of the SCSI specification.
//!   It has enough information to describe almost every command we need to know,
//!   except for some information specific to block devices, which is described in the next SCSI
//!   specification linked below.
//! - SCSI Block Commands – 2 (SBC-2)
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>
//!   This is an older version of the SCSI block commands specification. It contains information
//!   about commands specific to block devices.

pub mod command;
mod command_descriptor;
pub mod response;

use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tracing::{debug, info, warn};

use crate::usb::USBDrive;
use crate::usb::cbw::CommandStatus;
use response::{ReadCapacity, Response};

/// How many times TEST UNIT READY + INQUIRY are tried while the drive spins up.
const READY_ATTEMPTS: usize = 5;

/// An abstraction over an underlying USB
/// mass storage device.
///
/// Commands are defined in the `command` module, and
/// issued to the device with the `.issue_command` method, or piecewise with
/// `begin`/`data_in`/`data_out`/`end` when the data phase is streamed.
pub struct SCSIDevice {
    drive: USBDrive,
}

impl SCSIDevice {
    /// Performs SCSI initialization on the drive,
    /// and returns a new [`SCSIDevice`].
    ///
    /// This initialization sequence follows the order
    /// described here: <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>.
    /// They are not formally documented anywhere, so the author reverse engineered from various OS implementatations.
    pub async fn new(drive: USBDrive) -> Result<Self> {
        info!("starting device configuration");
        let mut device = Self { drive };
        // 3. Keep trying the sequence of "TEST UNIT READY" followed by "INQUIRY"
        // until they both return success back-to-back
        let mut attempt = 0;
        loop {
            attempt += 1;
            match device.ready_and_identified().await {
                Ok(()) => break,
                Err(error) if attempt < READY_ATTEMPTS => {
                    warn!(attempt, %error, "drive not ready yet");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(device)
    }

    async fn ready_and_identified(&mut self) -> Result<()> {
        debug!("submitting TEST UNIT READY");
        self.test_unit_ready().await?;
        debug!("submitting INQUIRY");
        let response = self.issue_command(command::inquiry()).await?;
        let Response::Inquiry(inquiry) = response else {
            bail!("INQUIRY returned no data");
        };
        if !inquiry.is_direct_access() {
            bail!(
                "device is not a direct access block device (peripheral byte 0x{:02x})",
                inquiry.peripheral_info
            );
        }
        Ok(())
    }

    /// Issues a command to the device.
    ///
    /// This function will submit the command to the device, wait for the
    /// response, and parse it with the command's response parser.
    pub async fn issue_command(&mut self, command: command::CommandBlock) -> Result<Response> {
        let parser = command.response_parser;
        let response_bytes = self.drive.submit_cbw(command).await?;
        parser(&response_bytes)
    }

    pub async fn test_unit_ready(&mut self) -> Result<()> {
        self.drive.submit_cbw(command::test_unit_ready()).await?;
        Ok(())
    }

    pub async fn read_capacity(&mut self) -> Result<ReadCapacity> {
        match self.issue_command(command::read_capacity()).await? {
            Response::ReadCapacity(capacity) => Ok(capacity),
            _ => Err(eyre!("READ CAPACITY returned no capacity data")),
        }
    }

    pub async fn eject(&mut self) -> Result<()> {
        self.drive.submit_cbw(command::eject()).await?;
        Ok(())
    }

    /// Starts a command whose data phase the caller drives. Returns the tag to
    /// pass to [`SCSIDevice::end`].
    pub async fn begin(&mut self, command: &command::CommandBlock) -> Result<u32> {
        self.drive.send_cbw(command).await
    }

    pub async fn data_in(&mut self, buf: &mut [u8]) -> Result<()> {
        self.drive.read_data(buf).await
    }

    pub async fn data_out(&mut self, buf: &[u8]) -> Result<()> {
        self.drive.write_data(buf).await
    }

    /// Submits the queued data-out bytes; call once after the last `data_out`.
    pub async fn finish_data_out(&mut self) -> Result<()> {
        self.drive.finish_data_out().await
    }

    /// Finishes the command tagged `tag`, failing unless the device passed it.
    pub async fn end(&mut self, tag: u32) -> Result<()> {
        match self.drive.receive_csw(tag).await? {
            CommandStatus::Passed => Ok(()),
            status => bail!("command ended with {status:?}"),
        }
    }
}
