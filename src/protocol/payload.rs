//! Typed payloads for the mass storage commands.
//!
//! Each payload checks the packet length against its exact wire size before
//! any byte is interpreted.

use super::{CommandClass, HEADER_LEN_16, Header, MscCommand, Packet};
use crate::error::ProtocolFault;

/// Status byte carried by one-byte replies.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok = 0,
    Error = 1,
}

impl<E> From<&Result<(), E>> for ReplyStatus {
    fn from(result: &Result<(), E>) -> Self {
        match result {
            Ok(()) => ReplyStatus::Ok,
            Err(_) => ReplyStatus::Error,
        }
    }
}

/// Requires `packet` to carry exactly `payload_bytes` of payload.
pub(crate) fn expect_payload(
    packet: &Packet,
    command: MscCommand,
    payload_bytes: usize,
) -> Result<(), ProtocolFault> {
    let expected = HEADER_LEN_16 + (payload_bytes / 2) as u16;
    if packet.length16() != expected {
        return Err(ProtocolFault::UnexpectedLength {
            command: command.name(),
            expected,
            actual: packet.length16(),
        });
    }
    Ok(())
}

/// Block address and count of a READ or WRITE request.
///
/// Wire layout: `address: u64 LE`, `count: u32 LE`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockRange {
    pub address: u64,
    pub count: u32,
}

impl BlockRange {
    pub const WIRE_LEN: usize = 12;

    pub fn decode(packet: &Packet, command: MscCommand) -> Result<Self, ProtocolFault> {
        expect_payload(packet, command, Self::WIRE_LEN)?;
        let payload = packet.payload();
        let mut address = [0; 8];
        let mut count = [0; 4];
        address.copy_from_slice(&payload[..8]);
        count.copy_from_slice(&payload[8..12]);
        Ok(Self {
            address: u64::from_le_bytes(address),
            count: u32::from_le_bytes(count),
        })
    }

    #[cfg(test)]
    pub fn encode_into(&self, packet: &mut Packet, command: MscCommand) {
        let data = packet.data_mut();
        data[..8].copy_from_slice(&self.address.to_le_bytes());
        data[8..12].copy_from_slice(&self.count.to_le_bytes());
        packet.set_header(Header::new(
            CommandClass::MassStorage as u8,
            command as u8,
            Self::WIRE_LEN,
        ));
    }
}

/// GET CAPACITY reply payload.
///
/// Wire layout: `block_count: u32 LE`, `block_size: u32 LE`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capacity {
    pub block_count: u32,
    pub block_size: u32,
}

impl Capacity {
    pub const WIRE_LEN: usize = 8;

    pub fn encode_into(&self, packet: &mut Packet) {
        let data = packet.data_mut();
        data[..4].copy_from_slice(&self.block_count.to_le_bytes());
        data[4..8].copy_from_slice(&self.block_size.to_le_bytes());
        packet.set_header(Header::new(
            CommandClass::MassStorage as u8,
            MscCommand::GetCapacity as u8,
            Self::WIRE_LEN,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockRange, Capacity};
    use crate::error::ProtocolFault;
    use crate::protocol::{CommandClass, Header, MscCommand, PacketPool};

    #[test]
    fn capacity_reply_layout() {
        let pool = PacketPool::new(1);
        let mut packet = pool.try_checkout().unwrap();
        Capacity {
            block_count: 2048,
            block_size: 512,
        }
        .encode_into(&mut packet);
        assert_eq!(packet.length16(), 6);
        assert_eq!(packet.payload(), &[0x00, 0x08, 0, 0, 0x00, 0x02, 0, 0]);
    }

    #[test]
    fn block_range_decodes_little_endian() {
        let pool = PacketPool::new(1);
        let mut packet = pool.try_checkout().unwrap();
        packet.data_mut()[..12]
            .copy_from_slice(&[0xe6, 0x03, 0, 0, 0, 0, 0, 0, 0x02, 0, 0, 0]);
        packet.set_header(Header::new(1, MscCommand::Read as u8, 12));
        let range = BlockRange::decode(&packet, MscCommand::Read).unwrap();
        assert_eq!(
            range,
            BlockRange {
                address: 998,
                count: 2
            }
        );
    }

    #[test]
    fn block_range_rejects_short_packet() {
        let pool = PacketPool::new(1);
        let mut packet = pool.try_checkout().unwrap();
        packet.set_header(Header::new(
            CommandClass::MassStorage as u8,
            MscCommand::Read as u8,
            8,
        ));
        let e = BlockRange::decode(&packet, MscCommand::Read).expect_err("short payload");
        assert!(matches!(
            e,
            ProtocolFault::UnexpectedLength {
                expected: 8,
                actual: 6,
                ..
            }
        ));
    }
}
