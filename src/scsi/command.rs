//! Representations for SCSI commands and responses.
//!
//! This module uses the term "command descriptor" to describe a struct and implementation specific
//! details behind a CDB, and uses the term "command block" to describe a "black box" containing
//! a valid CDB.
//!
//! Commands are exposed as a function that returns a [`CommandBlock`]. These functions wrap
//! the more granular `X6`/`X10`/`X16` descriptor structs.

use super::command_descriptor::*;
use crate::{
    scsi::response::{ResponseParser, inquiry_response, no_response, read_capacity_response},
    usb::cbw::CBWDirection,
};

/// Largest command block a CBW can carry.
pub const MAX_CDB_SIZE: usize = 16;

/// A serialized command block ready to be submitted
pub struct CommandBlock {
    command: [u8; MAX_CDB_SIZE],
    len: u8,
    pub direction: CBWDirection,
    pub data_transfer_len: u32,
    pub response_parser: ResponseParser,
}

impl CommandBlock {
    fn new(
        descriptor: &impl CommandDescriptor,
        direction: CBWDirection,
        data_transfer_len: u32,
        response_parser: ResponseParser,
    ) -> Self {
        let bytes = descriptor.as_slice();
        let mut command = [0; MAX_CDB_SIZE];
        command[..bytes.len()].copy_from_slice(bytes);
        Self {
            command,
            len: bytes.len() as u8,
            direction,
            data_transfer_len,
            response_parser,
        }
    }

    /// Returns the length of the underlying command block.
    ///
    /// Will never be more than 16 bytes.
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// The operation code in the first byte.
    pub fn opcode(&self) -> u8 {
        self.command[0]
    }

    /// Returns a valid command block, prepared as described by USB Mass
    /// Storage Class - Bulk Only Transport section 5.1 (CBWCB).
    pub fn get(&self) -> [u8; MAX_CDB_SIZE] {
        self.command
    }
}

/// "The TEST UNIT READY command provides a means to check if the logical unit is ready.
///
/// If the logical unit is able to accept an appropriate medium access command without
/// returning CHECK CONDITION status, this command shall return a GOOD status."
///
/// Defined in SPC2 7.25
pub fn test_unit_ready() -> CommandBlock {
    CommandBlock::new(
        &X6CommandDescriptor {
            operation_code: OpCode::TestUnitReady,
            logical_block_address: [0, 0, 0],
            misc_len: 0,
            control: 0,
        },
        CBWDirection::NonDirectional,
        0,
        no_response,
    )
}

/// "The INQUIRY command requests that information regarding parameters
/// of the target and a component logical unit be sent to the application client."
///
/// Defined in SPC2 7.3.1 table 45
pub fn inquiry() -> CommandBlock {
    CommandBlock::new(
        &X6CommandDescriptor {
            operation_code: OpCode::Inquiry,
            logical_block_address: [0, 0, 0],
            // For inquiry, is ALLOCATION LENGTH,
            // "The standard INQUIRY data shall contain at least 36 bytes"
            // (table 46)
            misc_len: 36,
            control: 0,
        },
        CBWDirection::DataIn,
        36,
        inquiry_response,
    )
}

/// "The START STOP UNIT command requests that the device server change the power
/// condition of the logical unit or load or eject the medium."
///
/// Issued with LOEJ set and START clear, which ejects the medium.
///
/// SBC-2 5.1.19
pub fn eject() -> CommandBlock {
    CommandBlock::new(
        &X6CommandDescriptor {
            operation_code: OpCode::StartStopUnit,
            logical_block_address: [0, 0, 0],
            // LOEJ (bit 1) = 1, START (bit 0) = 0
            misc_len: 0b0000_0010,
            control: 0,
        },
        CBWDirection::NonDirectional,
        0,
        no_response,
    )
}

/// "The `READ CAPACITY` command provides a means for the application client
/// to request information regarding the capacity of the block device."
///
/// SBC-2 5.1.10
pub fn read_capacity() -> CommandBlock {
    CommandBlock::new(
        &X10CommandDescriptor {
            operation_code: OpCode::ReadCapacity,
            flags: 0,
            logical_block_address: [0; 4],
            group: 0,
            misc_len: [0; 2],
            control: 0,
        },
        CBWDirection::DataIn,
        8,
        read_capacity_response,
    )
}

/// READ or WRITE of `count` blocks at `address`, `bytes` long in total.
///
/// Uses the 10 byte form when the count fits its 16-bit transfer length, and
/// the 16 byte form otherwise.
fn transfer(read: bool, address: u32, count: u32, bytes: u32) -> CommandBlock {
    let direction = if read {
        CBWDirection::DataIn
    } else {
        CBWDirection::DataOut
    };
    match u16::try_from(count) {
        Ok(count) => CommandBlock::new(
            &X10CommandDescriptor {
                operation_code: if read { OpCode::Read10 } else { OpCode::Write10 },
                flags: 0,
                logical_block_address: address.to_be_bytes(),
                group: 0,
                misc_len: count.to_be_bytes(),
                control: 0,
            },
            direction,
            bytes,
            no_response,
        ),
        Err(_) => CommandBlock::new(
            &X16CommandDescriptor {
                operation_code: if read { OpCode::Read16 } else { OpCode::Write16 },
                misc_info: 0,
                logical_block_address: u64::from(address).to_be_bytes(),
                param: count.to_be_bytes(),
                _reserved: 0,
                control: 0,
            },
            direction,
            bytes,
            no_response,
        ),
    }
}

/// SBC-2 5.1.6 / 5.1.8
pub fn read(address: u32, count: u32, bytes: u32) -> CommandBlock {
    transfer(true, address, count, bytes)
}

/// SBC-2 5.1.20 / 5.1.22
pub fn write(address: u32, count: u32, bytes: u32) -> CommandBlock {
    transfer(false, address, count, bytes)
}

#[cfg(test)]
mod tests {
    use super::{CommandBlock, read, write};
    use crate::scsi::command_descriptor::{OpCode, X6CommandDescriptor};
    use crate::scsi::response::no_response;
    use crate::usb::cbw::CBWDirection;

    #[test]
    fn validate_command_block() {
        // Ensures that a short descriptor is packed at the front, zero padded
        let cb = CommandBlock::new(
            &X6CommandDescriptor {
                operation_code: OpCode::Inquiry,
                logical_block_address: [0, 0, 0],
                misc_len: 0,
                control: 0,
            },
            CBWDirection::NonDirectional,
            0,
            no_response,
        );
        assert_eq!(cb.len(), 6);
        let mut serialized_cb = cb.get().into_iter();
        assert!(serialized_cb.next() == Some(0x12));
        assert!(serialized_cb.all(|b| b == 0));
    }

    #[test]
    fn read10_is_big_endian() {
        let cb = read(0x0102_0304, 0x0506, 0x0506 * 512);
        assert_eq!(cb.len(), 10);
        assert_eq!(
            &cb.get()[..10],
            &[0x28, 0, 0x01, 0x02, 0x03, 0x04, 0, 0x05, 0x06, 0]
        );
        assert_eq!(cb.direction, CBWDirection::DataIn);
    }

    #[test]
    fn large_write_uses_16_byte_form() {
        let cb = write(7, 0x1_0000, 0x1_0000 * 512);
        assert_eq!(cb.len(), 16);
        let bytes = cb.get();
        assert_eq!(bytes[0], 0x8A);
        assert_eq!(&bytes[2..10], &7u64.to_be_bytes());
        assert_eq!(&bytes[10..14], &0x1_0000u32.to_be_bytes());
        assert_eq!(cb.direction, CBWDirection::DataOut);
    }
}
