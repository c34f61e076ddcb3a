//! Data exchange between two coupled participants.
//!
//! # Architecture
//!
//! ```text
//! ParticipantLink ──► master channel (rank 0 ↔ rank 0, control plane)
//!        │
//!        └─► PointToPointExchange per mesh (rank ↔ rank, data plane)
//! ```
//!
//! A [`ParticipantLink`] combines one master-master control channel with one
//! [`PointToPointExchange`] per coupled mesh. With slaves present ("parallel
//! mode") mesh data is routed through the exchanges; a participant without
//! slaves ("coupling mode") sends mesh data over the master channel
//! directly. Scalar control values always travel the master channel and are
//! broadcast participant-locally on receipt.

pub mod point_to_point;

pub use point_to_point::PointToPointExchange;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use tracing::{debug, trace};

use crate::context::CouplingContext;
use crate::mesh::{InterfaceMesh, MeshId};
use crate::transport::{codec, ConnectionFactory, Transport};

/// Connection façade between the local participant and its coupling partner.
pub struct ParticipantLink {
    factory: Arc<dyn ConnectionFactory>,
    ctx: CouplingContext,
    /// Present on the master rank once the master connection is up.
    master_com: Option<Box<dyn Transport>>,
    exchanges: BTreeMap<MeshId, PointToPointExchange>,
    master_connected: bool,
    slaves_connected: bool,
    /// Rank count of the remote participant, learned in the master
    /// handshake and broadcast to the local slaves.
    remote_size: usize,
}

impl ParticipantLink {
    pub fn new(factory: Arc<dyn ConnectionFactory>, ctx: CouplingContext) -> Self {
        Self {
            factory,
            ctx,
            master_com: None,
            exchanges: BTreeMap::new(),
            master_connected: false,
            slaves_connected: false,
            remote_size: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.master_connected
    }

    pub fn remote_size(&self) -> usize {
        self.remote_size
    }

    /// True when this participant runs with slaves, which routes mesh data
    /// through the per-mesh exchanges.
    fn parallel_mode(&self) -> bool {
        self.ctx.bus.size() > 1
    }

    /// Registers a point-to-point exchange for `mesh`. Must happen on every
    /// rank before the slave connections are established.
    pub fn create_exchange(&mut self, mesh: Arc<InterfaceMesh>) {
        let exchange = PointToPointExchange::new(
            Arc::clone(&self.factory),
            Arc::clone(&mesh),
            self.ctx.clone(),
        );
        self.exchanges.insert(mesh.id(), exchange);
    }

    /// Accepts the master-master connection and swaps participant sizes.
    /// Only the master rank talks; the outcome is broadcast to the slaves.
    pub fn accept_master_connection(&mut self, acceptor: &str, requester: &str) -> Result<()> {
        if !self.ctx.bus.is_slave() {
            debug!(acceptor, requester, "accepting master connection");
            let mut transport = self.factory.accept(acceptor, requester, 0, 0)?;
            transport.send(&codec::encode_u64(self.ctx.bus.size() as u64))?;
            self.remote_size = codec::decode_u64(&transport.receive()?)? as usize;
            self.master_connected = transport.is_connected();
            self.master_com = Some(transport);
        }
        self.master_connected = self.ctx.bus.broadcast_bool(self.master_connected)?;
        self.remote_size = self.ctx.bus.broadcast_u64(self.remote_size as u64)? as usize;
        Ok(())
    }

    /// Requests the master-master connection; counterpart of
    /// [`Self::accept_master_connection`].
    pub fn request_master_connection(&mut self, acceptor: &str, requester: &str) -> Result<()> {
        if !self.ctx.bus.is_slave() {
            debug!(acceptor, requester, "requesting master connection");
            let mut transport = self.factory.request(acceptor, requester, 0, 0)?;
            transport.send(&codec::encode_u64(self.ctx.bus.size() as u64))?;
            self.remote_size = codec::decode_u64(&transport.receive()?)? as usize;
            self.master_connected = transport.is_connected();
            self.master_com = Some(transport);
        }
        self.master_connected = self.ctx.bus.broadcast_bool(self.master_connected)?;
        self.remote_size = self.ctx.bus.broadcast_u64(self.remote_size as u64)? as usize;
        Ok(())
    }

    /// Establishes the rank-to-rank connections of every registered mesh.
    /// All ranks participate.
    pub fn accept_slaves_connection(&mut self, acceptor: &str, requester: &str) -> Result<()> {
        self.slaves_connected = true;
        let remote_size = self.remote_size;
        for exchange in self.exchanges.values_mut() {
            exchange.accept_pre_connection(acceptor, requester, remote_size)?;
            self.slaves_connected = self.slaves_connected && exchange.is_connected();
        }
        Ok(())
    }

    /// Counterpart of [`Self::accept_slaves_connection`].
    pub fn request_slaves_connection(&mut self, acceptor: &str, requester: &str) -> Result<()> {
        self.slaves_connected = true;
        let remote_size = self.remote_size;
        for exchange in self.exchanges.values_mut() {
            exchange.request_pre_connection(acceptor, requester, remote_size)?;
            self.slaves_connected = self.slaves_connected && exchange.is_connected();
        }
        Ok(())
    }

    /// Builds the vertex routing of every registered mesh. Both sides must
    /// call this after the slave connections are up.
    pub fn complete_slaves_connection(&mut self) -> Result<()> {
        for exchange in self.exchanges.values_mut() {
            exchange.update_vertex_list()?;
        }
        Ok(())
    }

    /// Sends per-vertex data for `mesh_id`.
    pub fn send(&mut self, items: &[f64], mesh_id: MeshId, value_dimension: usize) -> Result<()> {
        if self.parallel_mode() {
            ensure!(self.slaves_connected, "slave connections not established");
            if self.ctx.sync_mode && !self.ctx.bus.is_slave() {
                self.ack_ping_send()?;
            }
            trace!(mesh_id, len = items.len(), "sending mesh data (parallel)");
            let exchange = self
                .exchanges
                .get_mut(&mesh_id)
                .with_context(|| format!("no exchange registered for mesh {mesh_id}"))?;
            exchange.send(items, value_dimension)
        } else {
            ensure!(self.master_connected, "master connection not established");
            trace!(mesh_id, len = items.len(), "sending mesh data (master channel)");
            self.master_transport()?.send(&codec::encode_f64s(items))?;
            Ok(())
        }
    }

    /// Receives per-vertex data for `mesh_id`.
    pub fn receive(
        &mut self,
        items: &mut [f64],
        mesh_id: MeshId,
        value_dimension: usize,
    ) -> Result<()> {
        if self.parallel_mode() {
            ensure!(self.slaves_connected, "slave connections not established");
            if self.ctx.sync_mode && !self.ctx.bus.is_slave() {
                self.ack_ping_receive()?;
            }
            let exchange = self
                .exchanges
                .get_mut(&mesh_id)
                .with_context(|| format!("no exchange registered for mesh {mesh_id}"))?;
            exchange.receive(items, value_dimension)
        } else {
            ensure!(self.master_connected, "master connection not established");
            let frame = self.master_transport()?.receive()?;
            let values = codec::decode_f64s(&frame)?;
            ensure!(
                values.len() == items.len(),
                "received {} values, expected {}",
                values.len(),
                items.len()
            );
            items.copy_from_slice(&values);
            Ok(())
        }
    }

    /// Sends a control-plane boolean over the master channel.
    pub fn send_bool(&mut self, item: bool) -> Result<()> {
        if !self.ctx.bus.is_slave() {
            self.master_transport()?.send(&codec::encode_bool(item))?;
        }
        Ok(())
    }

    /// Receives a control-plane boolean and broadcasts it locally.
    pub fn receive_bool(&mut self) -> Result<bool> {
        let mut item = false;
        if !self.ctx.bus.is_slave() {
            item = codec::decode_bool(&self.master_transport()?.receive()?)?;
        }
        let item = self.ctx.bus.broadcast_bool(item)?;
        trace!(item, "received control boolean");
        Ok(item)
    }

    /// Sends a control-plane scalar over the master channel.
    pub fn send_f64(&mut self, item: f64) -> Result<()> {
        if !self.ctx.bus.is_slave() {
            self.master_transport()?.send(&codec::encode_f64(item))?;
        }
        Ok(())
    }

    /// Receives a control-plane scalar and broadcasts it locally.
    pub fn receive_f64(&mut self) -> Result<f64> {
        let mut item = 0.0;
        if !self.ctx.bus.is_slave() {
            item = codec::decode_f64(&self.master_transport()?.receive()?)?;
        }
        let item = self.ctx.bus.broadcast_f64(item)?;
        trace!(item, "received control scalar");
        Ok(item)
    }

    /// Closes the master channel and all exchanges, draining pending sends.
    pub fn close_connection(&mut self) -> Result<()> {
        if !self.ctx.bus.is_slave() {
            if let Some(transport) = self.master_com.as_mut() {
                transport.close();
            }
            self.master_connected = false;
        }
        self.master_connected = self.ctx.bus.broadcast_bool(self.master_connected)?;
        for exchange in self.exchanges.values_mut() {
            exchange.close_connection()?;
        }
        self.slaves_connected = false;
        Ok(())
    }

    fn master_transport(&mut self) -> Result<&mut Box<dyn Transport>> {
        match self.master_com.as_mut() {
            Some(transport) => Ok(transport),
            None => bail!("master connection not established on this rank"),
        }
    }

    /// Three-way ack ping on the master channel, serializing the two
    /// participants around a parallel transfer. Debugging aid.
    fn ack_ping_send(&mut self) -> Result<()> {
        let transport = self.master_transport()?;
        transport.send(&codec::encode_bool(true))?;
        transport.receive()?;
        transport.send(&codec::encode_bool(true))?;
        Ok(())
    }

    fn ack_ping_receive(&mut self) -> Result<()> {
        let transport = self.master_transport()?;
        transport.receive()?;
        transport.send(&codec::encode_bool(true))?;
        transport.receive()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelNetwork;

    fn link(net: &Arc<ChannelNetwork>) -> ParticipantLink {
        let factory: Arc<dyn ConnectionFactory> = Arc::clone(net) as _;
        ParticipantLink::new(factory, CouplingContext::single_rank())
    }

    #[test]
    fn test_master_handshake_exchanges_sizes() {
        let net = Arc::new(ChannelNetwork::new());
        let mut acceptor = link(&net);
        let mut requester = link(&net);

        let handle = std::thread::spawn(move || {
            requester.request_master_connection("A", "B").unwrap();
            assert!(requester.is_connected());
            requester.remote_size()
        });
        acceptor.accept_master_connection("A", "B").unwrap();
        assert!(acceptor.is_connected());
        assert_eq!(acceptor.remote_size(), 1);
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn test_control_plane_round_trip() {
        let net = Arc::new(ChannelNetwork::new());
        let mut acceptor = link(&net);
        let mut requester = link(&net);

        let handle = std::thread::spawn(move || {
            requester.request_master_connection("A", "B").unwrap();
            requester.send_bool(true).unwrap();
            requester.send_f64(0.25).unwrap();
        });
        acceptor.accept_master_connection("A", "B").unwrap();
        assert!(acceptor.receive_bool().unwrap());
        assert_eq!(acceptor.receive_f64().unwrap(), 0.25);
        handle.join().unwrap();
    }

    #[test]
    fn test_coupling_mode_data_uses_master_channel() {
        let net = Arc::new(ChannelNetwork::new());
        let mut acceptor = link(&net);
        let mut requester = link(&net);

        let handle = std::thread::spawn(move || {
            requester.request_master_connection("A", "B").unwrap();
            requester.send(&[1.0, 2.0], 3, 1).unwrap();
        });
        acceptor.accept_master_connection("A", "B").unwrap();
        let mut out = [0.0; 2];
        acceptor.receive(&mut out, 3, 1).unwrap();
        assert_eq!(out, [1.0, 2.0]);
        handle.join().unwrap();
    }
}
