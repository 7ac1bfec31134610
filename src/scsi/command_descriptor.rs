//! Underlying structures that commands are issued in.
//!
//! SCSI fields are big endian on the wire, so every multi-byte field is kept
//! as a byte array filled with `to_be_bytes`.

/// Operation codes for a Command Descriptor Block, specifying what operation you want
/// to do as described in 7.1 of SPC-2.
///
/// This enum is not complete, and is intended to grow
/// as needed
#[repr(u8)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady = 0x00,
    /// SPC-2 7.3
    Inquiry = 0x12,
    /// SBC-2 5.1.19
    StartStopUnit = 0x1B,
    /// SBC-2 5.1.10, table 27
    ReadCapacity = 0x25,
    /// SBC-2 5.1.6
    Read10 = 0x28,
    /// SBC-2 5.1.20
    Write10 = 0x2A,
    /// SBC-2 5.1.8
    Read16 = 0x88,
    /// SBC-2 5.1.22
    Write16 = 0x8A,
}

/// As described in SPC-2 4.3.2 table 1, a typical CDB for 6 byte commands.
#[repr(C, packed)]
pub struct X6CommandDescriptor {
    /// This field specifies what command is being issued by the host
    /// to the drive.
    pub operation_code: OpCode,
    /// "A six-byte CDB contains a 21-bit `LOGICAL BLOCK ADDRESS` field."
    /// The last 3 bits are reserved.
    ///
    /// The use of this field varies from command to command.
    pub logical_block_address: [u8; 3],
    /// Depending on the opcode, this field is one of `TRANSFER LENGTH`,
    /// `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`.
    ///
    /// More info can be found in SCSI SPC2 4.3
    pub misc_len: u8,
    /// "The contents of the `CONTROL` field are defined in SAM-2."
    ///
    /// Zero in every command issued here.
    pub control: u8,
}

impl CommandDescriptor for X6CommandDescriptor {}

/// As described in SPC-2 4.3.2 table 2, a typical CDB for 10 byte commands.
#[repr(C, packed)]
pub struct X10CommandDescriptor {
    pub operation_code: OpCode,
    /// Command specific flags; for READ CAPACITY the lower 5 bits are the
    /// service action.
    pub flags: u8,
    pub logical_block_address: [u8; 4],
    /// Group number, zero here.
    pub group: u8,
    /// `TRANSFER LENGTH`, `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`
    pub misc_len: [u8; 2],
    pub control: u8,
}

impl CommandDescriptor for X10CommandDescriptor {}

/// "A command is communicated by sending a command descriptor block
/// to the device ...."
///
/// This struct implements the format described in
/// "SCSI Primary Commands - 2 (SPC-2)" 4.3.2 The fixed length CDB formats
/// Table 4 -- Typical CDB for 16-byte commands
#[repr(C, packed)]
pub struct X16CommandDescriptor {
    pub operation_code: OpCode,
    /// "Miscellaneous CDB information" (last 5 bits)
    pub misc_info: u8,
    /// "The logical block addresses on a logical unit or within a volume partition
    /// shall begin with block zero and be contiguous up to the last logical
    /// block of that logical unit or within that partition."
    pub logical_block_address: [u8; 8],
    /// # `TRANSFER LENGTH`
    /// "In commands that use multiple bytes for the `TRANSFER LENGTH` field, a transfer length
    /// of zero indicates that no data transfer shall take place. A value
    /// of one or greater indicates the number of blocks that shall be transferred."
    pub param: [u8; 4],
    pub _reserved: u8,
    pub control: u8,
}

impl CommandDescriptor for X16CommandDescriptor {}

pub trait CommandDescriptor: Sized {
    fn as_slice(&'_ self) -> &[u8] {
        const {
            assert!(
                std::mem::align_of::<Self>() == 1,
                "command descriptors must be packed"
            );
        };
        // SAFETY: A struct is the size of itself, and packed descriptors
        // contain no padding
        let slice: &'_ [u8] = unsafe {
            let ptr = self as *const Self as *const u8;
            std::slice::from_raw_parts(ptr, std::mem::size_of::<Self>())
        };
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_sizes() {
        assert_eq!(std::mem::size_of::<X6CommandDescriptor>(), 6);
        assert_eq!(std::mem::size_of::<X10CommandDescriptor>(), 10);
        assert_eq!(std::mem::size_of::<X16CommandDescriptor>(), 16);
    }
}
