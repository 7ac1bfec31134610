//! Write payload pump.
//!
//! Upstream delivers write data in packets of its own sizing, while the host
//! controller pulls bytes whenever its transfer buffer runs dry. The pump
//! keeps at most one receive in flight and at most one packet in hand, and
//! starts fetching the next packet as soon as one is handed over so link
//! latency hides behind device write latency.

use std::mem;

use tracing::{debug, trace};

use super::{HostController, Link, Receiver};
use crate::error::ProtocolFault;
use crate::protocol::{CommandClass, MscCommand, Packet};

#[derive(Debug)]
enum Slot {
    /// No receive in flight, no packet held.
    Idle,
    /// A receive is in flight.
    Fetching,
    /// A packet arrived before the host asked for it.
    Holding(Packet),
}

/// Pump state for one write command.
#[derive(Debug)]
pub(super) struct WriteStream {
    slot: Slot,
    /// The host has asked for data and not been given any yet.
    consumer_ready: bool,
    /// Payload bytes still expected for this write.
    remaining: u32,
}

impl WriteStream {
    pub fn new(bytes: u32) -> Self {
        Self {
            slot: Slot::Idle,
            consumer_ready: false,
            remaining: bytes,
        }
    }

    /// The host wants the next chunk of payload.
    pub fn request(
        &mut self,
        link: &mut impl Link,
        host: &mut impl HostController,
    ) -> Result<(), ProtocolFault> {
        self.consumer_ready = true;
        match mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Fetching => {
                // The receive already in flight will serve this request.
                self.slot = Slot::Fetching;
                Ok(())
            }
            Slot::Holding(packet) => {
                trace!("serving held packet");
                self.deliver(packet, link, host)
            }
            Slot::Idle => {
                self.slot = Slot::Fetching;
                link.receive(Receiver::WriteStream);
                Ok(())
            }
        }
    }

    /// A payload packet arrived over the link.
    pub fn received(
        &mut self,
        packet: Packet,
        link: &mut impl Link,
        host: &mut impl HostController,
    ) -> Result<(), ProtocolFault> {
        if let Slot::Holding(_) = self.slot {
            // Only one receive is ever started, so a second packet means the
            // link delivered something nobody asked for.
            return Err(ProtocolFault::UnsolicitedStreamPacket {
                bytes: packet.payload_len(),
            });
        }
        self.slot = Slot::Idle;
        if !self.consumer_ready {
            self.slot = Slot::Holding(packet);
            return Ok(());
        }
        self.deliver(packet, link, host)
    }

    fn deliver(
        &mut self,
        packet: Packet,
        link: &mut impl Link,
        host: &mut impl HostController,
    ) -> Result<(), ProtocolFault> {
        if packet.command_class() != CommandClass::MassStorage.with_data(true)
            || packet.command() != MscCommand::Write as u8
        {
            return Err(ProtocolFault::StreamMismatch {
                class: packet.command_class(),
                command: packet.command(),
            });
        }
        let len = packet.payload_len();
        if len == 0 {
            return Err(ProtocolFault::EmptyStreamPacket);
        }
        if len > self.remaining as usize {
            return Err(ProtocolFault::StreamOverrun {
                bytes: len,
                remaining: self.remaining,
            });
        }

        // len <= remaining, which is a u32
        self.remaining -= len as u32;
        self.consumer_ready = false;
        let more = self.remaining > 0;
        if more {
            self.slot = Slot::Fetching;
        }
        debug!(len, remaining = self.remaining, "delivering write payload");
        host.write_data(packet, len);
        if more {
            link.receive(Receiver::WriteStream);
        }
        Ok(())
    }

    /// Ends the stream, returning any held packet to the pool. Yields the
    /// number of bytes never delivered.
    pub fn finish(self, link: &mut impl Link) -> u32 {
        if let Slot::Holding(packet) = self.slot {
            link.release(packet);
        }
        self.remaining
    }

    #[cfg(test)]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    #[cfg(test)]
    pub fn is_holding(&self) -> bool {
        matches!(self.slot, Slot::Holding(_))
    }
}

impl<L: Link, H: HostController> super::Downstream<L, H> {
    pub(super) fn payload_received(&mut self, packet: Packet) -> Result<(), ProtocolFault> {
        let stream = self.stream.as_mut().ok_or(ProtocolFault::NoActiveWrite)?;
        stream.received(packet, &mut self.link, &mut self.host)
    }
}
