//! Per-command handlers. Every command packet from upstream enters here.

use tracing::{debug, warn};

use super::stream::WriteStream;
use super::{Completion, Downstream, HostController, Issue, Link, UnitDescriptor};
use crate::error::{HostError, ProtocolFault};
use crate::protocol::{
    BlockRange, Capacity, CommandClass, Header, MscCommand, Packet, ReplyStatus, expect_payload,
};

/// A READ or WRITE request that fits inside the unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) struct Transfer {
    pub address: u32,
    pub count: u32,
    pub bytes: u32,
}

impl Transfer {
    /// Bounds-checks `range` against `unit`. None of the sums can wrap.
    pub fn validate(range: BlockRange, unit: &UnitDescriptor) -> Result<Self, ProtocolFault> {
        let BlockRange { address, count } = range;
        let out_of_range = ProtocolFault::OutOfRange {
            address,
            count,
            block_count: unit.block_count,
        };
        let block_count = u64::from(unit.block_count);
        if address >= block_count {
            return Err(out_of_range);
        }
        // address < 2^32 here, so the sum cannot wrap. The last block of an
        // empty transfer at address 0 is -1, which counts as out of range.
        match (address + u64::from(count)).checked_sub(1) {
            Some(last) if last < block_count => {}
            _ => return Err(out_of_range),
        }
        let bytes = u64::from(count) * u64::from(unit.block_size);
        let bytes = u32::try_from(bytes).map_err(|_| ProtocolFault::TransferTooLarge { bytes })?;
        Ok(Self {
            // address < block_count, which is a u32
            address: address as u32,
            count,
            bytes,
        })
    }
}

impl<L: Link, H: HostController> Downstream<L, H> {
    pub(super) fn dispatch(&mut self, packet: Packet) -> Result<(), ProtocolFault> {
        if packet.command_class() != CommandClass::MassStorage as u8 {
            return Err(ProtocolFault::UnexpectedClass(packet.command_class()));
        }
        let command =
            MscCommand::try_from(packet.command()).map_err(ProtocolFault::UnknownCommand)?;
        debug!(?command, length16 = packet.length16(), "dispatching command");
        match command {
            MscCommand::TestUnitReady => self.test_unit_ready(packet),
            MscCommand::GetCapacity => self.get_capacity(packet),
            MscCommand::Read => self.begin_read(packet),
            MscCommand::Write if self.policy.writes_permitted => self.begin_write(packet),
            MscCommand::Write => Err(ProtocolFault::WritesDisabled),
            MscCommand::Disconnect => self.disconnect(packet),
        }
    }

    fn test_unit_ready(&mut self, packet: Packet) -> Result<(), ProtocolFault> {
        expect_payload(&packet, MscCommand::TestUnitReady, 0)?;
        self.link.release(packet);
        match self.host.test_unit_ready(Completion::UnitReady) {
            Issue::Pending => Ok(()),
            Issue::Rejected => self.unit_ready_complete(Err(HostError::Rejected)),
        }
    }

    pub(super) fn unit_ready_complete(
        &mut self,
        result: Result<(), HostError>,
    ) -> Result<(), ProtocolFault> {
        if let Err(error) = &result {
            debug!(%error, "unit not ready");
        }
        let mut reply = self.allocate_now()?;
        reply.set_status_reply(MscCommand::TestUnitReady, ReplyStatus::from(&result));
        self.reply(reply)
    }

    fn get_capacity(&mut self, mut packet: Packet) -> Result<(), ProtocolFault> {
        expect_payload(&packet, MscCommand::GetCapacity, 0)?;
        let unit = self.host.descriptor();
        Capacity {
            block_count: unit.block_count,
            block_size: unit.block_size,
        }
        .encode_into(&mut packet);
        self.reply(packet)
    }

    fn begin_read(&mut self, mut packet: Packet) -> Result<(), ProtocolFault> {
        let range = BlockRange::decode(&packet, MscCommand::Read)?;
        let transfer = Transfer::validate(range, &self.host.descriptor())?;
        debug!(?transfer, "starting read");

        packet.set_status_reply(MscCommand::Read, ReplyStatus::Error);
        let issue = self
            .host
            .read(transfer.address, transfer.count, Completion::ReadWrite);
        self.settle(packet, issue)
    }

    fn begin_write(&mut self, mut packet: Packet) -> Result<(), ProtocolFault> {
        let range = BlockRange::decode(&packet, MscCommand::Write)?;
        let transfer = Transfer::validate(range, &self.host.descriptor())?;
        debug!(?transfer, "starting write");

        if let Some(stale) = self.stream.replace(WriteStream::new(transfer.bytes)) {
            stale.finish(&mut self.link);
        }
        packet.set_status_reply(MscCommand::Write, ReplyStatus::Error);
        // The host stack cannot detect write protection, so a protected
        // device only shows up as a failed write.
        let issue = self
            .host
            .write(transfer.address, transfer.count, Completion::ReadWrite);
        self.settle(packet, issue)
    }

    /// Disposes of a READ/WRITE request packet already holding a failure reply.
    fn settle(&mut self, packet: Packet, issue: Issue) -> Result<(), ProtocolFault> {
        match issue {
            Issue::Pending => {
                self.link.release(packet);
                Ok(())
            }
            Issue::Rejected => {
                warn!(command = packet.command(), "host refused transfer");
                self.stream = None;
                self.reply(packet)
            }
        }
    }

    fn disconnect(&mut self, packet: Packet) -> Result<(), ProtocolFault> {
        expect_payload(&packet, MscCommand::Disconnect, 0)?;
        self.link.release(packet);
        if self.host.eject(Completion::Disconnect) == Issue::Rejected {
            self.disconnect_complete(Err(HostError::Rejected))?;
        }
        Ok(())
    }

    pub(super) fn disconnect_complete(
        &mut self,
        result: Result<(), HostError>,
    ) -> Result<(), ProtocolFault> {
        match result {
            Ok(()) => {
                let mut reply = self.allocate_now()?;
                reply.set_header(Header::new(
                    CommandClass::MassStorage as u8,
                    MscCommand::Disconnect as u8,
                    0,
                ));
                self.reply(reply)
            }
            Err(error) => {
                // Upstream times out on its own; nothing is retried here.
                warn!(%error, "eject failed, no reply sent");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Transfer;
    use crate::downstream::{UnitDescriptor, UnitError};
    use crate::error::ProtocolFault;
    use crate::protocol::BlockRange;

    const UNIT: UnitDescriptor = UnitDescriptor {
        block_count: 1000,
        block_size: 512,
        error: UnitError::Ok,
    };

    fn check(address: u64, count: u32, unit: &UnitDescriptor) -> Result<Transfer, ProtocolFault> {
        Transfer::validate(BlockRange { address, count }, unit)
    }

    #[test]
    fn last_block_must_lie_inside_unit() {
        assert!(matches!(
            check(998, 3, &UNIT),
            Err(ProtocolFault::OutOfRange { .. })
        ));
        assert_eq!(
            check(998, 2, &UNIT),
            Ok(Transfer {
                address: 998,
                count: 2,
                bytes: 1024
            })
        );
    }

    #[test]
    fn start_past_end_is_rejected() {
        assert!(check(1000, 1, &UNIT).is_err());
        assert!(check(u64::MAX, 1, &UNIT).is_err());
    }

    #[test]
    fn address_plus_count_does_not_wrap() {
        let unit = UnitDescriptor {
            block_count: u32::MAX - 1,
            ..UNIT
        };
        assert!(check(u64::MAX - 1, u32::MAX, &unit).is_err());
        assert!(check(10, u32::MAX, &unit).is_err());
    }

    #[test]
    fn zero_block_transfer_passes_except_at_address_zero() {
        assert_eq!(
            check(5, 0, &UNIT),
            Ok(Transfer {
                address: 5,
                count: 0,
                bytes: 0
            })
        );
        assert!(matches!(
            check(0, 0, &UNIT),
            Err(ProtocolFault::OutOfRange { .. })
        ));
        assert!(check(1000, 0, &UNIT).is_err());
    }

    #[test]
    fn byte_count_must_fit_u32() {
        let unit = UnitDescriptor {
            block_count: u32::MAX - 1,
            ..UNIT
        };
        // 2^23 blocks of 512 bytes is exactly 2^32 bytes
        assert_eq!(
            check(0, 1 << 23, &unit),
            Err(ProtocolFault::TransferTooLarge { bytes: 1 << 32 })
        );
        assert_eq!(check(0, (1 << 23) - 1, &unit).map(|t| t.bytes), Ok(u32::MAX - 511));
    }
}
