//! The host controller backend.
//!
//! A spawned task owns the [`SCSIDevice`] and runs one operation at a time.
//! [`HostHandle`] is the [`HostController`] the core talks to: it only queues
//! requests, and everything the task finishes comes back as a [`HostEvent`]
//! for the session loop to feed into the core.

mod driver;

use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::downstream::{Completion, HostController, Issue, UnitDescriptor};
use crate::error::HostError;
use crate::protocol::{Packet, PacketPool};
use crate::scsi::SCSIDevice;
use driver::Driver;

/// A unit operation as queued to the host task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Operation {
    TestUnitReady,
    Read { address: u32, count: u32 },
    Write { address: u32, count: u32 },
    Eject,
}

#[derive(Debug)]
enum Request {
    Operation { op: Operation, then: Completion },
    WriteData { packet: Packet, len: usize },
}

/// Progress reported by the host task.
#[derive(Debug)]
pub enum HostEvent {
    /// An operation finished.
    Completed {
        to: Completion,
        result: Result<(), HostError>,
    },
    /// The running WRITE needs its next payload packet.
    WantWriteData,
    /// Device data of the running READ, to go upstream.
    ReadData { packet: Packet, len: usize },
}

/// The core's side of the host task.
pub struct HostHandle {
    requests: mpsc::UnboundedSender<Request>,
    unit: watch::Receiver<UnitDescriptor>,
    pool: PacketPool,
}

/// Starts the host task for `device`, which was measured as `unit`.
pub fn spawn(
    device: SCSIDevice,
    unit: UnitDescriptor,
    pool: PacketPool,
) -> (HostHandle, mpsc::UnboundedReceiver<HostEvent>) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (unit_tx, unit_rx) = watch::channel(unit);
    let driver = Driver::new(device, pool.clone(), request_rx, event_tx, unit_tx);
    tokio::spawn(driver.run());
    let handle = HostHandle {
        requests: request_tx,
        unit: unit_rx,
        pool,
    };
    (handle, event_rx)
}

impl HostHandle {
    fn issue(&mut self, op: Operation, then: Completion) -> Issue {
        match self.requests.send(Request::Operation { op, then }) {
            Ok(()) => Issue::Pending,
            Err(_) => {
                warn!(?op, "host task is gone, rejecting operation");
                Issue::Rejected
            }
        }
    }
}

impl HostController for HostHandle {
    fn descriptor(&self) -> UnitDescriptor {
        *self.unit.borrow()
    }

    fn test_unit_ready(&mut self, then: Completion) -> Issue {
        self.issue(Operation::TestUnitReady, then)
    }

    fn read(&mut self, address: u32, count: u32, then: Completion) -> Issue {
        self.issue(Operation::Read { address, count }, then)
    }

    fn write(&mut self, address: u32, count: u32, then: Completion) -> Issue {
        self.issue(Operation::Write { address, count }, then)
    }

    fn eject(&mut self, then: Completion) -> Issue {
        self.issue(Operation::Eject, then)
    }

    fn write_data(&mut self, packet: Packet, len: usize) {
        if let Err(mpsc::error::SendError(request)) =
            self.requests.send(Request::WriteData { packet, len })
        {
            warn!("host task is gone, dropping write data");
            if let Request::WriteData { packet, .. } = request {
                self.pool.release(packet);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::{mpsc, watch};

    use super::{HostHandle, Operation, Request};
    use crate::downstream::{Completion, HostController, Issue, UnitDescriptor, UnitError};
    use crate::protocol::PacketPool;

    fn handle() -> (HostHandle, mpsc::UnboundedReceiver<Request>, PacketPool) {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (_, unit) = watch::channel(UnitDescriptor {
            block_count: 1000,
            block_size: 512,
            error: UnitError::Ok,
        });
        let pool = PacketPool::new(2);
        let handle = HostHandle {
            requests,
            unit,
            pool: pool.clone(),
        };
        (handle, request_rx, pool)
    }

    #[test]
    fn operations_are_queued() {
        let (mut host, mut requests, _pool) = handle();
        assert_eq!(host.read(5, 2, Completion::ReadWrite), Issue::Pending);
        let Ok(Request::Operation { op, then }) = requests.try_recv() else {
            panic!("expected a queued operation");
        };
        assert_eq!(op, Operation::Read { address: 5, count: 2 });
        assert_eq!(then, Completion::ReadWrite);
        assert_eq!(host.descriptor().block_count, 1000);
    }

    #[test]
    fn gone_task_rejects_and_returns_packets() {
        let (mut host, requests, pool) = handle();
        drop(requests);
        assert_eq!(host.eject(Completion::Disconnect), Issue::Rejected);

        let packet = pool.try_checkout().unwrap();
        host.write_data(packet, 0);
        assert_eq!(pool.available(), 2);
    }
}
