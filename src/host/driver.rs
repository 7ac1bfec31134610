//! The task executing unit operations against the SCSI device.

use color_eyre::Result;
use color_eyre::eyre::{OptionExt, bail, eyre};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{HostEvent, Operation, Request};
use crate::downstream::{UnitDescriptor, UnitError};
use crate::error::HostError;
use crate::protocol::{DATA_CAPACITY, PacketPool};
use crate::scsi::{SCSIDevice, command};

pub(super) struct Driver {
    device: SCSIDevice,
    pool: PacketPool,
    requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<HostEvent>,
    unit: watch::Sender<UnitDescriptor>,
}

impl Driver {
    pub(super) fn new(
        device: SCSIDevice,
        pool: PacketPool,
        requests: mpsc::UnboundedReceiver<Request>,
        events: mpsc::UnboundedSender<HostEvent>,
        unit: watch::Sender<UnitDescriptor>,
    ) -> Self {
        Self {
            device,
            pool,
            requests,
            events,
            unit,
        }
    }

    pub(super) async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            match request {
                Request::Operation { op, then } => {
                    debug!(?op, "executing");
                    let result = self.execute(op).await;
                    self.track_unit_state(op, &result);
                    let result = result.map_err(|error| {
                        warn!(?op, "operation failed: {error:#}");
                        HostError::Failed
                    });
                    if self
                        .events
                        .send(HostEvent::Completed { to: then, result })
                        .is_err()
                    {
                        break;
                    }
                }
                Request::WriteData { packet, len } => {
                    warn!(len, "write data with no WRITE running");
                    self.pool.release(packet);
                }
            }
        }
        info!("host task stopping");
    }

    async fn execute(&mut self, op: Operation) -> Result<()> {
        match op {
            Operation::TestUnitReady => self.device.test_unit_ready().await,
            Operation::Read { address, count } => self.read(address, count).await,
            Operation::Write { address, count } => self.write(address, count).await,
            Operation::Eject => self.device.eject().await,
        }
    }

    fn transfer_len(&self, count: u32) -> Result<u32> {
        count
            .checked_mul(self.unit.borrow().block_size)
            .ok_or_eyre("transfer length overflows")
    }

    /// One READ command whose data phase is forwarded packet by packet.
    async fn read(&mut self, address: u32, count: u32) -> Result<()> {
        let bytes = self.transfer_len(count)?;
        let tag = self
            .device
            .begin(&command::read(address, count, bytes))
            .await?;
        let mut left = bytes as usize;
        while left > 0 {
            let len = left.min(DATA_CAPACITY);
            let mut packet = self.pool.checkout().await;
            if let Err(error) = self.device.data_in(&mut packet.data_mut()[..len]).await {
                self.pool.release(packet);
                return Err(error);
            }
            self.events
                .send(HostEvent::ReadData { packet, len })
                .map_err(|_| eyre!("session stopped during READ"))?;
            left -= len;
        }
        self.device.end(tag).await
    }

    /// One WRITE command whose data phase is pulled from the core.
    async fn write(&mut self, address: u32, count: u32) -> Result<()> {
        let bytes = self.transfer_len(count)?;
        let tag = self
            .device
            .begin(&command::write(address, count, bytes))
            .await?;
        let mut left = bytes as usize;
        while left > 0 {
            self.events
                .send(HostEvent::WantWriteData)
                .map_err(|_| eyre!("session stopped during WRITE"))?;
            let (packet, len) = match self.requests.recv().await {
                Some(Request::WriteData { packet, len }) => (packet, len),
                Some(Request::Operation { op, .. }) => {
                    bail!("{op:?} issued while a WRITE was running")
                }
                None => bail!("host handle dropped during WRITE"),
            };
            let sent = match packet.payload().get(..len) {
                Some(data) if len <= left => self.device.data_out(data).await,
                _ => Err(eyre!("{len} bytes of write data do not fit, {left} left")),
            };
            self.pool.release(packet);
            sent?;
            left -= len;
        }
        if bytes > 0 {
            self.device.finish_data_out().await?;
        }
        self.device.end(tag).await
    }

    fn track_unit_state(&self, op: Operation, result: &Result<()>) {
        let error = match (op, result) {
            (_, Ok(())) => UnitError::Ok,
            (Operation::TestUnitReady, Err(_)) => UnitError::NotReady,
            (_, Err(_)) => UnitError::Unrecoverable,
        };
        self.unit.send_if_modified(|unit| {
            let changed = unit.error != error;
            unit.error = error;
            changed
        });
    }
}
