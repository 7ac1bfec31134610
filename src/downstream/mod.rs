//! The downstream command translator.
//!
//! [`Downstream`] takes mass storage commands off the packet link, checks them
//! against the attached unit, and issues them to the host controller. Nothing
//! here blocks: every wait is a continuation token handed to a collaborator,
//! which later hands it back inside an [`Event`].

mod dispatch;
mod gatekeeper;
mod stream;

pub use gatekeeper::{SUPPORTED_BLOCK_SIZE, approve};

use tracing::{debug, error, warn};

use crate::error::{HostError, ProtocolFault, StreamError};
use crate::protocol::{CommandClass, DATA_CAPACITY, Header, MscCommand, Packet};
use stream::WriteStream;

/// Where a packet received over the link should go.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Receiver {
    /// The next command packet.
    Dispatch,
    /// Write payload for the write stream.
    WriteStream,
}

/// What a packet freed up by the pool is for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Allocation {
    GenericErrorReply,
}

/// Which routine a host controller operation completes into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    UnitReady,
    ReadWrite,
    Disconnect,
}

/// Immediate answer of the host controller when an operation is issued.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Issue {
    /// Accepted; the completion will arrive as an [`Event::Completed`].
    Pending,
    /// Could not be started; no completion will follow.
    Rejected,
}

/// Last error state of the unit, as tracked by the host controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnitError {
    Ok,
    NotReady,
    Unrecoverable,
}

/// Geometry and state of the attached logical unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnitDescriptor {
    pub block_count: u32,
    pub block_size: u32,
    pub error: UnitError,
}

/// The trusted packet link.
pub trait Link {
    /// Asks for the next packet; it arrives as [`Event::Received`] carrying `then`.
    fn receive(&mut self, then: Receiver);
    fn send(&mut self, packet: Packet);
    /// Asks for a free packet, arriving as [`Event::Allocated`] carrying `then`.
    fn allocate(&mut self, then: Allocation);
    /// A free packet right now, if the pool has one.
    fn allocate_now(&mut self) -> Option<Packet>;
    fn release(&mut self, packet: Packet);
}

/// The USB host controller stack driving the attached unit.
pub trait HostController {
    fn descriptor(&self) -> UnitDescriptor;
    fn test_unit_ready(&mut self, then: Completion) -> Issue;
    fn read(&mut self, address: u32, count: u32, then: Completion) -> Issue;
    fn write(&mut self, address: u32, count: u32, then: Completion) -> Issue;
    fn eject(&mut self, then: Completion) -> Issue;
    /// Hands over write payload. The host releases the packet once consumed.
    fn write_data(&mut self, packet: Packet, len: usize);
}

/// Something a collaborator finished on behalf of the core.
#[derive(Debug)]
pub enum Event {
    Received { to: Receiver, packet: Packet },
    Allocated { to: Allocation, packet: Packet },
    Completed {
        to: Completion,
        result: Result<(), HostError>,
    },
}

/// Build-time policy for which commands are served.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    pub writes_permitted: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            writes_permitted: cfg!(feature = "writes"),
        }
    }
}

/// Command processing state for the one attached unit.
pub struct Downstream<L, H> {
    link: L,
    host: H,
    policy: Policy,
    /// Present from write acceptance until its completion.
    stream: Option<WriteStream>,
    halted: bool,
}

impl<L: Link, H: HostController> Downstream<L, H> {
    pub fn new(link: L, host: H, policy: Policy) -> Self {
        Self {
            link,
            host,
            policy,
            stream: None,
            halted: false,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Starts listening for the first command.
    pub fn start(&mut self) {
        self.link.receive(Receiver::Dispatch);
    }

    /// Feeds one collaborator event into the state machine.
    ///
    /// A returned fault is final: the link or the device misbehaved and every
    /// later call fails with [`ProtocolFault::Halted`].
    pub fn handle(&mut self, event: Event) -> Result<(), ProtocolFault> {
        self.guard(|this| match event {
            Event::Received {
                to: Receiver::Dispatch,
                packet,
            } => this.dispatch(packet),
            Event::Received {
                to: Receiver::WriteStream,
                packet,
            } => this.payload_received(packet),
            Event::Allocated {
                to: Allocation::GenericErrorReply,
                packet,
            } => this.generic_error_reply(packet),
            Event::Completed {
                to: Completion::UnitReady,
                result,
            } => this.unit_ready_complete(result),
            Event::Completed {
                to: Completion::ReadWrite,
                result,
            } => this.rdwr_complete(result),
            Event::Completed {
                to: Completion::Disconnect,
                result,
            } => this.disconnect_complete(result),
        })
    }

    /// The host controller wants more write payload.
    pub fn request_stream_data(&mut self) -> Result<(), ProtocolFault> {
        self.guard(|this| {
            let stream = this.stream.as_mut().ok_or(ProtocolFault::NoActiveWrite)?;
            stream.request(&mut this.link, &mut this.host)
        })
    }

    /// Sends read data from the device upstream as a stream packet.
    ///
    /// The packet is released if `len` cannot be framed.
    pub fn put_stream_data(&mut self, mut packet: Packet, len: usize) -> Result<(), StreamError> {
        let problem = if len % 2 != 0 {
            Some(StreamError::OddLength(len))
        } else if len > DATA_CAPACITY {
            Some(StreamError::TooLong(len))
        } else {
            None
        };
        if let Some(problem) = problem {
            self.link.release(packet);
            return Err(problem);
        }
        packet.set_header(Header::new(
            CommandClass::MassStorage.with_data(true),
            MscCommand::Read as u8,
            len,
        ));
        self.link.send(packet);
        Ok(())
    }

    fn guard(
        &mut self,
        step: impl FnOnce(&mut Self) -> Result<(), ProtocolFault>,
    ) -> Result<(), ProtocolFault> {
        if self.halted {
            return Err(ProtocolFault::Halted);
        }
        let result = step(self);
        if let Err(fault) = &result {
            self.freak_out(fault);
        }
        result
    }

    fn freak_out(&mut self, fault: &ProtocolFault) {
        error!(%fault, "protocol fault, halting command processing");
        self.halted = true;
        self.stream = None;
    }

    /// Sends a reply and goes back to waiting for the next command.
    fn reply(&mut self, packet: Packet) -> Result<(), ProtocolFault> {
        debug!(
            class = packet.command_class(),
            command = packet.command(),
            length16 = packet.length16(),
            "sending reply"
        );
        self.link.send(packet);
        self.link.receive(Receiver::Dispatch);
        Ok(())
    }

    fn allocate_now(&mut self) -> Result<Packet, ProtocolFault> {
        self.link.allocate_now().ok_or(ProtocolFault::PoolExhausted)
    }

    /// Shared completion of READ and WRITE.
    fn rdwr_complete(&mut self, result: Result<(), HostError>) -> Result<(), ProtocolFault> {
        if let Some(stream) = self.stream.take() {
            let remaining = stream.finish(&mut self.link);
            if result.is_ok() && remaining != 0 {
                return Err(ProtocolFault::StreamUnderrun { remaining });
            }
        }
        match result {
            Ok(()) => {
                debug!("transfer complete");
                self.link.receive(Receiver::Dispatch);
            }
            Err(error) => {
                warn!(%error, "transfer failed");
                self.link.allocate(Allocation::GenericErrorReply);
            }
        }
        Ok(())
    }

    fn generic_error_reply(&mut self, mut packet: Packet) -> Result<(), ProtocolFault> {
        packet.set_header(Header::new(CommandClass::Error as u8, 0, 0));
        self.reply(packet)
    }
}
