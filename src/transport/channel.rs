//! In-memory transport backed by unbounded channels.
//!
//! A [`ChannelNetwork`] is the rendezvous point shared by every rank of both
//! participants (typically one per test process). Each rank-pair connection
//! is identified by `(acceptor, requester, acceptor_rank, requester_rank)`;
//! whichever side arrives first deposits the peer's channel endpoints, the
//! other side picks them up. Neither side blocks during establishment —
//! blocking happens on the first receive, which is where the coupling
//! protocol synchronizes anyway.

use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{ConnectionFactory, ReceiveRequest, Request, Transport, TransportError};

type Frame = Vec<u8>;
type LinkKey = (String, String, usize, usize);

struct Endpoints {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

/// Rendezvous registry for in-memory connections.
#[derive(Default)]
pub struct ChannelNetwork {
    pending: Mutex<HashMap<LinkKey, Endpoints>>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn rendezvous(&self, key: LinkKey) -> Result<ChannelTransport, TransportError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| TransportError::Rendezvous(format!("{key:?}")))?;
        if let Some(peer) = pending.remove(&key) {
            return Ok(ChannelTransport::new(peer.tx, peer.rx));
        }
        // First to arrive: create both directions, leave the peer's halves.
        let (a2b_tx, a2b_rx) = unbounded();
        let (b2a_tx, b2a_rx) = unbounded();
        pending.insert(
            key,
            Endpoints {
                tx: b2a_tx,
                rx: a2b_rx,
            },
        );
        Ok(ChannelTransport::new(a2b_tx, b2a_rx))
    }
}

impl ConnectionFactory for ChannelNetwork {
    fn accept(
        &self,
        acceptor: &str,
        requester: &str,
        acceptor_rank: usize,
        requester_rank: usize,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let key = (
            acceptor.to_string(),
            requester.to_string(),
            acceptor_rank,
            requester_rank,
        );
        Ok(Box::new(self.rendezvous(key)?))
    }

    fn request(
        &self,
        acceptor: &str,
        requester: &str,
        acceptor_rank: usize,
        requester_rank: usize,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let key = (
            acceptor.to_string(),
            requester.to_string(),
            acceptor_rank,
            requester_rank,
        );
        Ok(Box::new(self.rendezvous(key)?))
    }
}

/// One side of an in-memory connection.
pub struct ChannelTransport {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    connected: bool,
}

impl ChannelTransport {
    fn new(tx: Sender<Frame>, rx: Receiver<Frame>) -> Self {
        Self {
            tx,
            rx,
            connected: true,
        }
    }
}

impl Transport for ChannelTransport {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::PeerLost);
        }
        self.tx
            .send(frame.to_vec())
            .map_err(|_| TransportError::PeerLost)
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::PeerLost);
        }
        self.rx.recv().map_err(|_| TransportError::PeerLost)
    }

    fn send_async(&mut self, frame: Vec<u8>) -> Result<Box<dyn Request>, TransportError> {
        if !self.connected {
            return Err(TransportError::PeerLost);
        }
        self.tx.send(frame).map_err(|_| TransportError::PeerLost)?;
        // Channel sends complete on posting; the handle is already done.
        Ok(Box::new(CompletedRequest))
    }

    fn receive_async(&mut self) -> Result<Box<dyn ReceiveRequest>, TransportError> {
        if !self.connected {
            return Err(TransportError::PeerLost);
        }
        Ok(Box::new(ChannelReceiveRequest {
            rx: self.rx.clone(),
        }))
    }

    fn close(&mut self) {
        self.connected = false;
    }
}

struct CompletedRequest;

impl Request for CompletedRequest {
    fn wait(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn test(&mut self) -> Result<bool, TransportError> {
        Ok(true)
    }
}

/// Pulls the next frame from the connection's receive queue. Only one
/// receive may be outstanding per connection, or frame order between the
/// handles is unspecified.
struct ChannelReceiveRequest {
    rx: Receiver<Frame>,
}

impl ReceiveRequest for ChannelReceiveRequest {
    fn wait(&mut self) -> Result<Vec<u8>, TransportError> {
        self.rx.recv().map_err(|_| TransportError::PeerLost)
    }

    fn test(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(crossbeam_channel::TryRecvError::Empty) => Ok(None),
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                Err(TransportError::PeerLost)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_rendezvous_pairs_both_sides() {
        let net = Arc::new(ChannelNetwork::new());
        let mut a = net.accept("acc", "req", 0, 0).unwrap();
        let mut b = net.request("acc", "req", 0, 0).unwrap();

        a.send(&[1, 2, 3]).unwrap();
        assert_eq!(b.receive().unwrap(), vec![1, 2, 3]);
        b.send(&[4]).unwrap();
        assert_eq!(a.receive().unwrap(), vec![4]);
    }

    #[test]
    fn test_rank_pairs_are_independent() {
        let net = Arc::new(ChannelNetwork::new());
        let mut a0 = net.accept("acc", "req", 0, 0).unwrap();
        let mut a1 = net.accept("acc", "req", 0, 1).unwrap();
        let mut b0 = net.request("acc", "req", 0, 0).unwrap();
        let mut b1 = net.request("acc", "req", 0, 1).unwrap();

        a0.send(&[0]).unwrap();
        a1.send(&[1]).unwrap();
        assert_eq!(b0.receive().unwrap(), vec![0]);
        assert_eq!(b1.receive().unwrap(), vec![1]);
    }

    #[test]
    fn test_send_fails_after_close() {
        let net = ChannelNetwork::new();
        let mut a = net.accept("acc", "req", 0, 0).unwrap();
        a.close();
        assert!(matches!(a.send(&[0]), Err(TransportError::PeerLost)));
    }

    #[test]
    fn test_async_send_reports_completion() {
        let net = ChannelNetwork::new();
        let mut a = net.accept("acc", "req", 0, 0).unwrap();
        let mut req = a.send_async(vec![9]).unwrap();
        assert!(req.test().unwrap());
        req.wait().unwrap();
    }

    #[test]
    fn test_async_receive_yields_frame() {
        let net = ChannelNetwork::new();
        let mut a = net.accept("acc", "req", 0, 0).unwrap();
        let mut b = net.request("acc", "req", 0, 0).unwrap();

        let mut req = b.receive_async().unwrap();
        assert!(req.test().unwrap().is_none());
        a.send(&[3, 4]).unwrap();
        assert_eq!(req.wait().unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_threaded_round_trip() {
        let net = Arc::new(ChannelNetwork::new());
        let peer = Arc::clone(&net);
        let handle = std::thread::spawn(move || {
            let mut t = peer.request("acc", "req", 0, 0).unwrap();
            let frame = t.receive().unwrap();
            t.send(&frame).unwrap();
        });
        let mut t = net.accept("acc", "req", 0, 0).unwrap();
        t.send(&[7, 7]).unwrap();
        assert_eq!(t.receive().unwrap(), vec![7, 7]);
        handle.join().unwrap();
    }
}
