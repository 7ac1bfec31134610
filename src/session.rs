//! The event loop feeding link and host progress into the core.

use color_eyre::Result;
use color_eyre::eyre::bail;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::downstream::{Downstream, Event, HostController};
use crate::host::HostEvent;
use crate::link::LinkHandle;
use crate::protocol::{Packet, PacketPool};

/// Serves commands until the upstream side closes the link.
///
/// A protocol fault ends the session with that fault as the error.
pub async fn run<H: HostController>(
    mut downstream: Downstream<LinkHandle, H>,
    mut inbound: mpsc::Receiver<Result<Packet>>,
    mut host_events: mpsc::UnboundedReceiver<HostEvent>,
    pool: PacketPool,
) -> Result<()> {
    info!("session started");
    downstream.start();
    loop {
        let armed = downstream.link().is_armed();
        let waiting = downstream.link().is_waiting();
        tokio::select! {
            received = inbound.recv(), if armed => {
                let Some(received) = received else {
                    info!("link closed, ending session");
                    return Ok(());
                };
                let Some(event) = downstream.link_mut().received(received?) else {
                    continue;
                };
                downstream.handle(event)?;
            }
            packet = pool.checkout(), if waiting => {
                let Some(event) = downstream.link_mut().allocated(packet) else {
                    continue;
                };
                downstream.handle(event)?;
            }
            event = host_events.recv() => {
                let Some(event) = event else {
                    bail!("host task stopped");
                };
                match event {
                    HostEvent::Completed { to, result } => {
                        debug!(?to, ?result, "host operation complete");
                        downstream.handle(Event::Completed { to, result })?;
                    }
                    HostEvent::WantWriteData => downstream.request_stream_data()?,
                    HostEvent::ReadData { packet, len } => downstream.put_stream_data(packet, len)?,
                }
            }
        }
    }
}
