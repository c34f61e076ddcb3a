//! Byte-level communication between ranks.
//!
//! Two independent seams live here:
//!
//! - [`Transport`] connects exactly two ranks of *different* participants
//!   (one rank on each side). Connections are established through a
//!   [`ConnectionFactory`]; the only factory shipped with this crate is the
//!   in-memory [`channel::ChannelNetwork`], while socket or MPI transports
//!   are expected to be provided by the host.
//! - [`CollectiveBus`] connects the ranks *within* one participant (one
//!   master rank plus zero or more slaves) and provides the broadcast and
//!   reduction primitives the coupling core needs.
//!
//! All payloads are opaque byte frames; [`codec`] holds the encode/decode
//! helpers shared by both seams.

pub mod channel;
pub mod codec;
pub mod collective;

pub use channel::{ChannelNetwork, ChannelTransport};
pub use collective::{ChannelBus, CollectiveBus, SingleRank};

use thiserror::Error;

/// Failure at the transport seam. Peer loss is fatal for the whole run.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer connection lost")]
    PeerLost,
    #[error("connection rendezvous failed for `{0}`")]
    Rendezvous(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Handle for an asynchronously posted send.
pub trait Request: Send {
    /// Blocks until the transfer has completed.
    fn wait(&mut self) -> Result<(), TransportError>;

    /// Returns `true` once the transfer has completed, without blocking.
    fn test(&mut self) -> Result<bool, TransportError>;
}

/// Handle for an asynchronously posted receive; yields the frame on
/// completion.
pub trait ReceiveRequest: Send {
    /// Blocks until a frame has arrived.
    fn wait(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Returns the frame when one has arrived, without blocking.
    fn test(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// One established connection between a local rank and a remote rank.
///
/// Frames are delivered whole and in FIFO order per direction.
pub trait Transport: Send {
    fn is_connected(&self) -> bool;

    /// Blocking send of one frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Blocking receive of one frame.
    fn receive(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Posts a send and returns a completion handle. The frame may still be
    /// in flight when this returns.
    fn send_async(&mut self, frame: Vec<u8>) -> Result<Box<dyn Request>, TransportError>;

    /// Posts a receive and returns a handle yielding the frame.
    fn receive_async(&mut self) -> Result<Box<dyn ReceiveRequest>, TransportError>;

    fn close(&mut self);
}

/// Creates [`Transport`] connections between rank pairs of two named
/// participants. The acceptor and requester sides must use mirrored
/// arguments for a pair to rendezvous.
pub trait ConnectionFactory: Send + Sync {
    fn accept(
        &self,
        acceptor: &str,
        requester: &str,
        acceptor_rank: usize,
        requester_rank: usize,
    ) -> Result<Box<dyn Transport>, TransportError>;

    fn request(
        &self,
        acceptor: &str,
        requester: &str,
        acceptor_rank: usize,
        requester_rank: usize,
    ) -> Result<Box<dyn Transport>, TransportError>;
}
