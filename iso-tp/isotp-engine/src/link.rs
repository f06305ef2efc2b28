//! The link boundary: async frame transport traits and an in-memory CAN bus.

use core::future::Future;

use tokio::sync::broadcast;

use crate::frame::LinkFrame;

/// Transmit half of a CAN interface.
pub trait CanTx: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Put one frame on the bus.
    fn send(&mut self, frame: &LinkFrame) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Receive half of a CAN interface.
pub trait CanRx: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Wait for the next frame. An error ends the session driver's reader.
    fn recv(&mut self) -> impl Future<Output = Result<LinkFrame, Self::Error>> + Send;
}

/// Errors of the in-memory bus.
#[derive(Debug, thiserror::Error)]
pub enum VirtualBusError {
    #[error("virtual bus closed")]
    Closed,
}

const BUS_CAPACITY: usize = 1024;

/// In-memory broadcast CAN bus.
///
/// Every attached interface sees every frame sent by the others, never its own.
#[derive(Clone)]
pub struct VirtualBus {
    sender: broadcast::Sender<(u32, LinkFrame)>,
    next_node: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            sender,
            next_node: Default::default(),
        }
    }

    /// Attach a new interface to the bus.
    pub fn attach(&self) -> (VirtualTx, VirtualRx) {
        let node = self
            .next_node
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        (
            VirtualTx {
                node,
                sender: self.sender.clone(),
            },
            VirtualRx {
                node,
                receiver: self.sender.subscribe(),
            },
        )
    }
}

/// Transmit half of a [`VirtualBus`] interface.
#[derive(Clone)]
pub struct VirtualTx {
    node: u32,
    sender: broadcast::Sender<(u32, LinkFrame)>,
}

impl VirtualTx {
    /// Send without awaiting; the bus never blocks.
    pub fn send_now(&self, frame: LinkFrame) {
        // No listener is not an error on a broadcast medium.
        let _ = self.sender.send((self.node, frame));
    }
}

impl CanTx for VirtualTx {
    type Error = VirtualBusError;

    async fn send(&mut self, frame: &LinkFrame) -> Result<(), Self::Error> {
        self.send_now(*frame);
        Ok(())
    }
}

/// Receive half of a [`VirtualBus`] interface.
pub struct VirtualRx {
    node: u32,
    receiver: broadcast::Receiver<(u32, LinkFrame)>,
}

impl CanRx for VirtualRx {
    type Error = VirtualBusError;

    async fn recv(&mut self) -> Result<LinkFrame, Self::Error> {
        loop {
            match self.receiver.recv().await {
                Ok((from, _)) if from == self.node => continue,
                Ok((_, frame)) => return Ok(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "virtual bus receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(VirtualBusError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use embedded_can::StandardId;

    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn frames_reach_other_nodes_only() {
        let bus = VirtualBus::new();
        let (mut a_tx, mut a_rx) = bus.attach();
        let (mut b_tx, mut b_rx) = bus.attach();
        let id = StandardId::new(0x7E0).unwrap();

        a_tx.send(&LinkFrame::new(id, &[1]).unwrap()).await.unwrap();
        b_tx.send(&LinkFrame::new(id, &[2]).unwrap()).await.unwrap();

        assert_eq!(b_rx.recv().await.unwrap().data(), &[1]);
        assert_eq!(a_rx.recv().await.unwrap().data(), &[2]);
    }
}
