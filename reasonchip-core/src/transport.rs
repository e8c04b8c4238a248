//! Transport-agnostic send/recv seams the broker, worker, and client sit
//! on top of. gRPC (`reasonchip-broker`) is one implementation; tests use
//! [`InMemoryTransport`].

use crate::error::ReasonChipError;
use crate::packet::Packet;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// The broker's side of a connection: it accepted this peer.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    async fn recv(&mut self) -> Result<Option<Packet>, ReasonChipError>;
    async fn send(&mut self, packet: Packet) -> Result<(), ReasonChipError>;
}

/// The worker's or client's side of a connection: it dialed the broker.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn recv(&mut self) -> Result<Option<Packet>, ReasonChipError>;
    async fn send(&mut self, packet: Packet) -> Result<(), ReasonChipError>;
}

/// An in-process duplex pair of bounded channels standing in for a real
/// connection. `InMemoryTransport::pair` hands back both ends so broker
/// and worker/client tests can run without a socket.
pub struct InMemoryTransport {
    tx: mpsc::Sender<Packet>,
    rx: mpsc::Receiver<Packet>,
}

impl InMemoryTransport {
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(buffer);
        let (tx_b, rx_b) = mpsc::channel(buffer);
        (Self { tx: tx_a, rx: rx_b }, Self { tx: tx_b, rx: rx_a })
    }
}

#[async_trait]
impl ServerTransport for InMemoryTransport {
    async fn recv(&mut self) -> Result<Option<Packet>, ReasonChipError> {
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, packet: Packet) -> Result<(), ReasonChipError> {
        self.tx.send(packet).await.map_err(|_| ReasonChipError::Disconnected("peer dropped".to_string()))
    }
}

#[async_trait]
impl ClientTransport for InMemoryTransport {
    async fn recv(&mut self) -> Result<Option<Packet>, ReasonChipError> {
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, packet: Packet) -> Result<(), ReasonChipError> {
        self.tx.send(packet).await.map_err(|_| ReasonChipError::Disconnected("peer dropped".to_string()))
    }
}
