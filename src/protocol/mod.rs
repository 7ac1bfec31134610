//! Wire format of the packet link between the downstream and upstream sides.
//!
//! Every packet starts with a four byte header:
//!
//! | Offset | Size | Field           |
//! | ------ | ---- | --------------- |
//! | 0      | 2    | `length16` (LE) |
//! | 2      | 1    | `command_class` |
//! | 3      | 1    | `command`       |
//!
//! `length16` counts 16-bit link units and includes the header itself, so a
//! header-only packet has `length16 == 2`.

mod packet;
mod payload;
mod pool;

pub use packet::{Header, Packet};
pub use payload::{BlockRange, Capacity, ReplyStatus};
pub(crate) use payload::expect_payload;
pub use pool::PacketPool;

/// Header size in link units.
pub const HEADER_LEN_16: u16 = 2;
/// Header size in bytes.
pub const HEADER_LEN: usize = HEADER_LEN_16 as usize * 2;
/// Payload bytes a packet can carry.
pub const DATA_CAPACITY: usize = 1024;
/// Largest valid `length16`.
pub const MAX_LEN_16: u16 = HEADER_LEN_16 + (DATA_CAPACITY / 2) as u16;

/// Set in `command_class` when the payload is raw stream data.
pub const DATA_FLAG: u8 = 0x80;

/// Subsystem a packet belongs to, the low seven bits of `command_class`.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandClass {
    Interface = 0x00,
    MassStorage = 0x01,
    /// Generic failure reply, header only.
    Error = 0x7F,
}

impl CommandClass {
    /// The raw `command_class` byte, with the data flag set if `data` is true.
    pub fn with_data(self, data: bool) -> u8 {
        if data { self as u8 | DATA_FLAG } else { self as u8 }
    }
}

/// Mass storage operation codes carried in the `command` byte.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MscCommand {
    TestUnitReady = 0,
    GetCapacity = 1,
    Read = 2,
    Write = 3,
    Disconnect = 4,
}

impl MscCommand {
    pub fn name(self) -> &'static str {
        match self {
            MscCommand::TestUnitReady => "test unit ready",
            MscCommand::GetCapacity => "get capacity",
            MscCommand::Read => "read",
            MscCommand::Write => "write",
            MscCommand::Disconnect => "disconnect",
        }
    }
}

impl TryFrom<u8> for MscCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0 => MscCommand::TestUnitReady,
            1 => MscCommand::GetCapacity,
            2 => MscCommand::Read,
            3 => MscCommand::Write,
            4 => MscCommand::Disconnect,
            other => return Err(other),
        })
    }
}
