//! The finite pool packets are checked out of.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use super::Packet;

/// A fixed number of packets shared by the link, the core and the host.
///
/// Cloning the pool hands out another reference to the same packets.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<Inner>,
}

struct Inner {
    free: Mutex<Vec<Packet>>,
    returned: Notify,
    capacity: usize,
}

impl PacketPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                free: Mutex::new((0..capacity).map(|_| Packet::new()).collect()),
                returned: Notify::new(),
                capacity,
            }),
        }
    }

    /// Number of packets currently in the pool.
    pub fn available(&self) -> usize {
        self.free().len()
    }

    /// Takes a packet if one is free right now.
    pub fn try_checkout(&self) -> Option<Packet> {
        self.free().pop()
    }

    /// Waits until a packet is free and takes it.
    pub async fn checkout(&self) -> Packet {
        loop {
            let returned = self.inner.returned.notified();
            if let Some(packet) = self.try_checkout() {
                return packet;
            }
            returned.await;
        }
    }

    pub fn release(&self, packet: Packet) {
        let mut free = self.free();
        debug_assert!(free.len() < self.inner.capacity, "packet released twice");
        free.push(packet);
        drop(free);
        self.inner.returned.notify_one();
    }

    fn free(&self) -> std::sync::MutexGuard<'_, Vec<Packet>> {
        self.inner.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::PacketPool;

    #[test]
    fn checkout_drains_and_release_refills() {
        let pool = PacketPool::new(2);
        let a = pool.try_checkout().unwrap();
        let b = pool.try_checkout().unwrap();
        assert!(pool.try_checkout().is_none());
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn checkout_waits_for_release() {
        let pool = PacketPool::new(1);
        let held = pool.try_checkout().unwrap();
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.checkout().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        pool.release(held);
        let packet = waiter.await.unwrap();
        pool.release(packet);
        assert_eq!(pool.available(), 1);
    }
}
