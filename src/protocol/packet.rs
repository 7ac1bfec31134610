//! Packets exchanged over the link.

use color_eyre::eyre::ensure;

use super::{CommandClass, DATA_CAPACITY, HEADER_LEN, HEADER_LEN_16, MAX_LEN_16, MscCommand};

/// A validated packet header.
///
/// `length16` is always within `HEADER_LEN_16..=MAX_LEN_16`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    length16: u16,
    pub command_class: u8,
    pub command: u8,
}

impl Header {
    /// Builds a header whose payload is `payload_bytes` long, rounded up to
    /// whole link units.
    pub fn new(command_class: u8, command: u8, payload_bytes: usize) -> Self {
        assert!(payload_bytes <= DATA_CAPACITY, "payload larger than a packet");
        Self {
            length16: HEADER_LEN_16 + payload_bytes.div_ceil(2) as u16,
            command_class,
            command,
        }
    }

    /// Parses a header read off the wire.
    pub fn decode(bytes: [u8; HEADER_LEN]) -> color_eyre::Result<Self> {
        let length16 = u16::from_le_bytes([bytes[0], bytes[1]]);
        ensure!(
            (HEADER_LEN_16..=MAX_LEN_16).contains(&length16),
            "packet length field is invalid, should be in {HEADER_LEN_16}..={MAX_LEN_16}, was {length16}"
        );
        Ok(Self {
            length16,
            command_class: bytes[2],
            command: bytes[3],
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let [lo, hi] = self.length16.to_le_bytes();
        [lo, hi, self.command_class, self.command]
    }

    pub fn length16(&self) -> u16 {
        self.length16
    }

    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        usize::from(self.length16 - HEADER_LEN_16) * 2
    }
}

/// One packet checked out of a [`super::PacketPool`].
///
/// Packets are move-only: whoever holds one must either release it back to
/// the pool or hand it on to exactly one send or delivery path.
#[derive(Debug)]
pub struct Packet {
    header: Header,
    data: Box<[u8; DATA_CAPACITY]>,
}

impl Packet {
    pub(super) fn new() -> Self {
        Self {
            header: Header::new(CommandClass::Interface as u8, 0, 0),
            data: Box::new([0; DATA_CAPACITY]),
        }
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn set_header(&mut self, header: Header) {
        self.header = header;
    }

    pub fn length16(&self) -> u16 {
        self.header.length16
    }

    pub fn command_class(&self) -> u8 {
        self.header.command_class
    }

    pub fn command(&self) -> u8 {
        self.header.command
    }

    pub fn payload_len(&self) -> usize {
        self.header.payload_len()
    }

    /// The bytes covered by `length16`.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.payload_len()]
    }

    /// The whole data buffer, regardless of the current length.
    pub fn data_mut(&mut self) -> &mut [u8; DATA_CAPACITY] {
        &mut self.data
    }

    /// Turns the packet into a one-byte status reply for `command`.
    pub fn set_status_reply(&mut self, command: MscCommand, status: super::ReplyStatus) {
        self.header = Header::new(CommandClass::MassStorage as u8, command as u8, 1);
        self.data[0] = status as u8;
        self.data[1] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::Header;
    use crate::protocol::{HEADER_LEN_16, MAX_LEN_16};

    #[test]
    fn payload_rounds_up_to_link_units() {
        let header = Header::new(1, 0, 1);
        assert_eq!(header.length16(), HEADER_LEN_16 + 1);
        assert_eq!(header.payload_len(), 2);
    }

    #[test]
    fn catch_oversized_length_field() {
        let [lo, hi] = (MAX_LEN_16 + 1).to_le_bytes();
        let e = Header::decode([lo, hi, 1, 2]).expect_err("should catch oversized length");
        assert!(e.root_cause().to_string().contains("length field"));
    }

    #[test]
    fn catch_length_shorter_than_header() {
        assert!(Header::decode([1, 0, 1, 2]).is_err());
    }
}
