//! Collective operations across the ranks of one participant.
//!
//! A participant is one master rank (rank 0) plus zero or more slave ranks.
//! Every collective call must be entered by all ranks of the participant;
//! the coupling core runs the same code path on every rank, so this holds by
//! construction.

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{codec, TransportError};

/// Broadcast and reduction primitives within one participant.
pub trait CollectiveBus: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn is_master(&self) -> bool {
        self.rank() == 0
    }

    fn is_slave(&self) -> bool {
        self.rank() != 0
    }

    /// Distributes the master's frame to every rank. The input of slave
    /// ranks is ignored; every rank returns the master's frame.
    fn broadcast_bytes(&self, frame: Vec<u8>) -> Result<Vec<u8>, TransportError>;

    /// Sums the rank-local contributions and distributes the total.
    fn all_reduce_sum(&self, local: f64) -> Result<f64, TransportError>;

    fn broadcast_bool(&self, value: bool) -> Result<bool, TransportError> {
        let frame = self.broadcast_bytes(codec::encode_bool(value))?;
        codec::decode_bool(&frame)
    }

    fn broadcast_f64(&self, value: f64) -> Result<f64, TransportError> {
        let frame = self.broadcast_bytes(codec::encode_f64(value))?;
        codec::decode_f64(&frame)
    }

    fn broadcast_u64(&self, value: u64) -> Result<u64, TransportError> {
        let frame = self.broadcast_bytes(codec::encode_u64(value))?;
        codec::decode_u64(&frame)
    }

    /// Inner product of two distributed vectors: the local parts are dotted
    /// and the contributions summed across all ranks.
    fn dot(&self, a: &[f64], b: &[f64]) -> Result<f64, TransportError> {
        debug_assert_eq!(a.len(), b.len());
        let local = a.iter().zip(b).map(|(x, y)| x * y).sum();
        self.all_reduce_sum(local)
    }

    /// L2 norm of a distributed vector.
    fn l2_norm(&self, v: &[f64]) -> Result<f64, TransportError> {
        Ok(self.dot(v, v)?.sqrt())
    }
}

/// Bus for a participant running on a single rank. All collectives are
/// identities.
pub struct SingleRank;

impl CollectiveBus for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast_bytes(&self, frame: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        Ok(frame)
    }

    fn all_reduce_sum(&self, local: f64) -> Result<f64, TransportError> {
        Ok(local)
    }
}

/// Channel-backed bus connecting a master rank with its slaves.
///
/// Build one bus per rank with [`ChannelBus::create`] and move each into the
/// thread that plays that rank.
pub struct ChannelBus {
    rank: usize,
    size: usize,
    /// Master only: one link per slave, index 0 is rank 1.
    to_slaves: Vec<Sender<Vec<u8>>>,
    from_slaves: Vec<Receiver<Vec<u8>>>,
    /// Slaves only.
    to_master: Option<Sender<Vec<u8>>>,
    from_master: Option<Receiver<Vec<u8>>>,
}

impl ChannelBus {
    /// Creates the buses for a participant of `size` ranks, index = rank.
    pub fn create(size: usize) -> Vec<ChannelBus> {
        assert!(size >= 1);
        let mut to_slaves = Vec::with_capacity(size - 1);
        let mut from_slaves = Vec::with_capacity(size - 1);
        let mut slaves = Vec::with_capacity(size - 1);
        for rank in 1..size {
            let (m2s_tx, m2s_rx) = unbounded();
            let (s2m_tx, s2m_rx) = unbounded();
            to_slaves.push(m2s_tx);
            from_slaves.push(s2m_rx);
            slaves.push(ChannelBus {
                rank,
                size,
                to_slaves: Vec::new(),
                from_slaves: Vec::new(),
                to_master: Some(s2m_tx),
                from_master: Some(m2s_rx),
            });
        }
        let mut buses = vec![ChannelBus {
            rank: 0,
            size,
            to_slaves,
            from_slaves,
            to_master: None,
            from_master: None,
        }];
        buses.extend(slaves);
        buses
    }
}

impl CollectiveBus for ChannelBus {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_bytes(&self, frame: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        if self.is_master() {
            for tx in &self.to_slaves {
                tx.send(frame.clone()).map_err(|_| TransportError::PeerLost)?;
            }
            Ok(frame)
        } else {
            self.from_master
                .as_ref()
                .expect("slave bus has a master link")
                .recv()
                .map_err(|_| TransportError::PeerLost)
        }
    }

    fn all_reduce_sum(&self, local: f64) -> Result<f64, TransportError> {
        if self.is_master() {
            let mut total = local;
            for rx in &self.from_slaves {
                let frame = rx.recv().map_err(|_| TransportError::PeerLost)?;
                total += codec::decode_f64(&frame)?;
            }
            self.broadcast_f64(total)
        } else {
            self.to_master
                .as_ref()
                .expect("slave bus has a master link")
                .send(codec::encode_f64(local))
                .map_err(|_| TransportError::PeerLost)?;
            self.broadcast_f64(0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_single_rank_identities() {
        let bus = SingleRank;
        assert!(bus.is_master());
        assert!(!bus.is_slave());
        assert_eq!(bus.broadcast_f64(3.5).unwrap(), 3.5);
        assert_eq!(bus.all_reduce_sum(2.0).unwrap(), 2.0);
        assert_relative_eq!(bus.dot(&[1.0, 2.0], &[3.0, 4.0]).unwrap(), 11.0);
    }

    #[test]
    fn test_channel_bus_broadcast_and_reduce() {
        let mut buses = ChannelBus::create(3);
        let slave2 = buses.pop().unwrap();
        let slave1 = buses.pop().unwrap();
        let master = buses.pop().unwrap();

        let h1 = std::thread::spawn(move || {
            let b = slave1.broadcast_bool(false).unwrap();
            let s = slave1.all_reduce_sum(2.0).unwrap();
            (b, s)
        });
        let h2 = std::thread::spawn(move || {
            let b = slave2.broadcast_bool(false).unwrap();
            let s = slave2.all_reduce_sum(3.0).unwrap();
            (b, s)
        });

        assert!(master.broadcast_bool(true).unwrap());
        assert_eq!(master.all_reduce_sum(1.0).unwrap(), 6.0);
        assert_eq!(h1.join().unwrap(), (true, 6.0));
        assert_eq!(h2.join().unwrap(), (true, 6.0));
    }

    #[test]
    fn test_distributed_dot() {
        let mut buses = ChannelBus::create(2);
        let slave = buses.pop().unwrap();
        let master = buses.pop().unwrap();

        let h = std::thread::spawn(move || slave.dot(&[3.0], &[4.0]).unwrap());
        // Master holds [1, 2] . [1, 1], slave holds [3] . [4].
        assert_relative_eq!(master.dot(&[1.0, 2.0], &[1.0, 1.0]).unwrap(), 15.0);
        assert_relative_eq!(h.join().unwrap(), 15.0);
    }
}
