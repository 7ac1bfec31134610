//! The packet link over a byte stream.
//!
//! Packets travel as their 4-byte header followed by exactly the payload bytes
//! the header counts. A reader task frames incoming packets into pool packets,
//! a writer task serializes outgoing ones and returns them to the pool.
//! [`LinkHandle`] is the [`Link`] the core talks to.

use std::io::ErrorKind;

use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::downstream::{Allocation, Event, Link, Receiver};
use crate::protocol::{HEADER_LEN, Header, Packet, PacketPool};

/// Reads the next header, or `None` if the stream ended between packets.
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Header>> {
    let mut bytes = [0; HEADER_LEN];
    match reader.read_exact(&mut bytes).await {
        Ok(_) => Header::decode(bytes).map(Some),
        Err(error) if error.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(error) => Err(error).wrap_err("reading packet header"),
    }
}

/// Reads the payload `header` announces into `packet`.
pub async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    header: Header,
    packet: &mut Packet,
) -> Result<()> {
    let len = header.payload_len();
    reader
        .read_exact(&mut packet.data_mut()[..len])
        .await
        .wrap_err("link closed mid-packet")?;
    packet.set_header(header);
    Ok(())
}

pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    writer.write_all(&packet.header().encode()).await?;
    writer.write_all(packet.payload()).await?;
    writer.flush().await?;
    Ok(())
}

/// Splits `stream` into the link tasks.
///
/// Returns the handle for the core and the channel of received packets. The
/// channel ends when the stream does; a framing error is its last item.
pub fn spawn<S>(stream: S, pool: PacketPool) -> (LinkHandle, mpsc::Receiver<Result<Packet>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (inbound_tx, inbound_rx) = mpsc::channel(1);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_loop(reader, pool.clone(), inbound_tx));
    tokio::spawn(write_loop(writer, pool.clone(), outbound_rx));
    let handle = LinkHandle {
        pool,
        outbound: outbound_tx,
        armed: None,
        waiting: None,
    };
    (handle, inbound_rx)
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    pool: PacketPool,
    inbound: mpsc::Sender<Result<Packet>>,
) {
    loop {
        let header = match read_header(&mut reader).await {
            Ok(Some(header)) => header,
            Ok(None) => {
                info!("link stream ended");
                return;
            }
            Err(error) => {
                let _ = inbound.send(Err(error)).await;
                return;
            }
        };
        // Only take a packet once one is actually arriving.
        let mut packet = pool.checkout().await;
        if let Err(error) = read_payload(&mut reader, header, &mut packet).await {
            pool.release(packet);
            let _ = inbound.send(Err(error)).await;
            return;
        }
        debug!(
            class = header.command_class,
            command = header.command,
            length16 = header.length16(),
            "received packet"
        );
        if let Err(mpsc::error::SendError(Ok(packet))) = inbound.send(Ok(packet)).await {
            pool.release(packet);
            return;
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    pool: PacketPool,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
) {
    while let Some(packet) = outbound.recv().await {
        let written = write_packet(&mut writer, &packet).await;
        pool.release(packet);
        if let Err(error) = written {
            error!("link write failed: {error:#}");
            break;
        }
    }
    // Whatever is still queued goes back to the pool.
    outbound.close();
    while let Some(packet) = outbound.recv().await {
        pool.release(packet);
    }
}

/// The core's side of the link.
///
/// Holds at most one outstanding receive and one outstanding allocation; a
/// newer request replaces an older one.
pub struct LinkHandle {
    pool: PacketPool,
    outbound: mpsc::UnboundedSender<Packet>,
    armed: Option<Receiver>,
    waiting: Option<Allocation>,
}

impl LinkHandle {
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.is_some()
    }

    /// Pairs a received packet with the outstanding receive.
    ///
    /// With nothing armed the packet is released.
    pub fn received(&mut self, packet: Packet) -> Option<Event> {
        match self.armed.take() {
            Some(to) => Some(Event::Received { to, packet }),
            None => {
                warn!("dropping packet nobody asked for");
                self.pool.release(packet);
                None
            }
        }
    }

    /// Pairs a free packet with the outstanding allocation.
    pub fn allocated(&mut self, packet: Packet) -> Option<Event> {
        match self.waiting.take() {
            Some(to) => Some(Event::Allocated { to, packet }),
            None => {
                self.pool.release(packet);
                None
            }
        }
    }
}

impl Link for LinkHandle {
    fn receive(&mut self, then: Receiver) {
        self.armed = Some(then);
    }

    fn send(&mut self, packet: Packet) {
        if let Err(mpsc::error::SendError(packet)) = self.outbound.send(packet) {
            warn!("link writer is gone, dropping packet");
            self.pool.release(packet);
        }
    }

    fn allocate(&mut self, then: Allocation) {
        self.waiting = Some(then);
    }

    fn allocate_now(&mut self) -> Option<Packet> {
        self.pool.try_checkout()
    }

    fn release(&mut self, packet: Packet) {
        self.pool.release(packet);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::{LinkHandle, read_header, read_payload, spawn, write_packet};
    use crate::downstream::{Event, Link, Receiver};
    use crate::protocol::{Header, PacketPool};

    #[tokio::test]
    async fn packet_survives_the_wire() {
        let pool = PacketPool::new(2);
        let mut packet = pool.try_checkout().unwrap();
        packet.data_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        packet.set_header(Header::new(0x81, 3, 4));

        let (mut near, mut far) = duplex(64);
        write_packet(&mut near, &packet).await.unwrap();

        let header = read_header(&mut far).await.unwrap().unwrap();
        assert_eq!(header.length16(), 4);
        let mut received = pool.try_checkout().unwrap();
        read_payload(&mut far, header, &mut received).await.unwrap();
        assert_eq!(received.command_class(), 0x81);
        assert_eq!(received.payload(), &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn catch_oversized_length() {
        let (mut near, mut far) = duplex(64);
        near.write_all(&[0xff, 0xff, 1, 2]).await.unwrap();
        let e = read_header(&mut far)
            .await
            .expect_err("should reject the length field");
        assert!(e.root_cause().to_string().contains("length field"));
    }

    #[tokio::test]
    async fn clean_end_between_packets() {
        let (near, mut far) = duplex(64);
        drop(near);
        assert!(read_header(&mut far).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let (mut near, mut far) = duplex(64);
        near.write_all(&[4, 0, 1, 2, 0xaa]).await.unwrap();
        drop(near);
        let header = read_header(&mut far).await.unwrap().unwrap();
        let pool = PacketPool::new(1);
        let mut packet = pool.try_checkout().unwrap();
        let e = read_payload(&mut far, header, &mut packet)
            .await
            .expect_err("should notice the missing bytes");
        assert!(e.to_string().contains("mid-packet"));
    }

    #[tokio::test]
    async fn tasks_move_packets_both_ways() {
        let pool = PacketPool::new(3);
        let (near, mut far) = duplex(256);
        let (mut link, mut inbound) = spawn(near, pool.clone());

        far.write_all(&[3, 0, 1, 0, 0x2a, 0]).await.unwrap();
        let packet = inbound.recv().await.unwrap().unwrap();
        assert_eq!(packet.command(), 0);
        assert_eq!(packet.payload(), &[0x2a, 0]);

        link.send(packet);
        let mut echoed = [0; 6];
        far.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, [3, 0, 1, 0, 0x2a, 0]);
    }

    #[test]
    fn received_packet_meets_armed_receiver() {
        let pool = PacketPool::new(1);
        let (outbound, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut link = LinkHandle {
            pool: pool.clone(),
            outbound,
            armed: None,
            waiting: None,
        };

        let packet = pool.try_checkout().unwrap();
        assert!(link.received(packet).is_none());
        assert_eq!(pool.available(), 1);

        link.receive(Receiver::WriteStream);
        assert!(link.is_armed());
        let packet = pool.try_checkout().unwrap();
        let event = link.received(packet);
        assert!(matches!(
            event,
            Some(Event::Received {
                to: Receiver::WriteStream,
                ..
            })
        ));
        assert!(!link.is_armed());
    }
}
