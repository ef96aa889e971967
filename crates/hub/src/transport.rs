//! Transport seam between the command client and the radio network.
//!
//! A transport sends opaque frames to a peer and broadcasts every frame it
//! receives. The MQTT bridge is the production implementation; tests use
//! [`testing::FakeDevice`].

use std::future::Future;
use thiserror::Error;
use tokio::sync::broadcast;
use watercounter_wire::Peer;

/// Frames buffered per subscriber before the slowest one starts lagging.
pub const INBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub peer: Peer,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The frame was not accepted or not acknowledged. Retryable.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The link itself is down. Not retried.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        peer: Peer,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive every frame arriving from now on.
    fn subscribe(&self) -> broadcast::Receiver<Inbound>;
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------
