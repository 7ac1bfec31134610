//! Error types shared by the command translator.
//!
//! Protocol faults are unrecoverable: they mean the link or the device can no
//! longer be trusted, and command processing stops. Host errors are ordinary
//! operational failures that get reported upstream as a failure status.

use thiserror::Error;

use crate::downstream::UnitError;

/// Malformed or out-of-bounds protocol input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolFault {
    #[error("packet class 0x{0:02x} is not a mass storage command")]
    UnexpectedClass(u8),
    #[error("unknown mass storage command 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("write command received but writes are not permitted")]
    WritesDisabled,
    #[error("{command} packet has length {actual}, expected {expected} (16-bit units)")]
    UnexpectedLength {
        command: &'static str,
        expected: u16,
        actual: u16,
    },
    #[error("blocks {address}+{count} lie outside a unit of {block_count} blocks")]
    OutOfRange {
        address: u64,
        count: u32,
        block_count: u32,
    },
    #[error("transfer of {bytes} bytes exceeds the largest representable transfer")]
    TransferTooLarge { bytes: u64 },
    #[error("stream packet has class 0x{class:02x} command 0x{command:02x}, expected write data")]
    StreamMismatch { class: u8, command: u8 },
    #[error("stream packet carries no payload")]
    EmptyStreamPacket,
    #[error("stream packet carries {bytes} bytes but only {remaining} remain")]
    StreamOverrun { bytes: usize, remaining: u32 },
    #[error("stream packet of {bytes} bytes arrived while another was still held")]
    UnsolicitedStreamPacket { bytes: usize },
    #[error("write completed with {remaining} stream bytes never delivered")]
    StreamUnderrun { remaining: u32 },
    #[error("write stream activity with no write command in progress")]
    NoActiveWrite,
    #[error("packet pool exhausted")]
    PoolExhausted,
    #[error("command processing halted by an earlier protocol fault")]
    Halted,
}

/// A host controller operation that could not be started or did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("host controller refused to start the operation")]
    Rejected,
    #[error("device reported failure")]
    Failed,
}

/// Why the gatekeeper refused to expose a unit.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("unit is in error state {0:?}")]
    UnitError(UnitError),
    #[error("unit reports {0} blocks, which is not a real medium")]
    NoMedium(u32),
    #[error("unsupported block size {0}")]
    UnsupportedBlockSize(u32),
}

/// Read data the host controller tried to push out that cannot be framed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream data length {0} is not a whole number of link units")]
    OddLength(usize),
    #[error("stream data length {0} exceeds the packet capacity")]
    TooLong(usize),
}
