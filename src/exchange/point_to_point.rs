//! Rank-to-rank exchange of per-vertex data between two participants.
//!
//! Each side of an exchange is a set of ranks holding a partition of the
//! same interface mesh. After an all-to-all pre-connection, every rank
//! derives — deterministically, from the vertex ownership on both sides —
//! which entries of its local value array travel to which remote rank.

use std::collections::BTreeSet;

use anyhow::{ensure, Context, Result};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::context::CouplingContext;
use crate::mesh::{CommunicationMap, InterfaceMesh, MeshPartition};
use crate::transport::{codec, ConnectionFactory, ReceiveRequest, Request, Transport};

/// One established connection to a remote rank.
struct Connection {
    remote_rank: usize,
    transport: Box<dyn Transport>,
}

/// Routing entry for one remote rank: which local value-array positions are
/// gathered into (send) or scattered from (receive) the transfer buffer.
///
/// `indices` are unique within a mapping; the disjoint union over all
/// mappings covers exactly the locally owned vertices also claimed by the
/// remote side. Stable for the lifetime of the connection.
struct Mapping {
    /// Index into `connections`.
    connection: usize,
    indices: Vec<usize>,
}

/// Point-to-point exchange for one interface mesh.
pub struct PointToPointExchange {
    mesh: Arc<InterfaceMesh>,
    factory: Arc<dyn ConnectionFactory>,
    ctx: CouplingContext,
    /// One entry per reachable remote rank, ascending by remote rank.
    connections: Vec<Connection>,
    mappings: Vec<Mapping>,
    /// Posted sends not yet known to be complete.
    buffered_requests: Vec<Box<dyn Request>>,
    connected: bool,
}

impl PointToPointExchange {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        mesh: Arc<InterfaceMesh>,
        ctx: CouplingContext,
    ) -> Self {
        Self {
            mesh,
            factory,
            ctx,
            connections: Vec::new(),
            mappings: Vec::new(),
            buffered_requests: Vec::new(),
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn mesh(&self) -> &InterfaceMesh {
        &self.mesh
    }

    fn channel_name(&self, participant: &str) -> String {
        format!("{}/{}", participant, self.mesh.name())
    }

    /// Establishes connections to every rank of the requesting participant.
    pub fn accept_pre_connection(
        &mut self,
        acceptor: &str,
        requester: &str,
        remote_size: usize,
    ) -> Result<()> {
        let local_rank = self.ctx.bus.rank();
        let name = self.channel_name(acceptor);
        for remote_rank in 0..remote_size {
            let transport = self
                .factory
                .accept(&name, requester, local_rank, remote_rank)
                .with_context(|| {
                    format!("accepting connection to remote rank {remote_rank} for mesh `{}`", self.mesh.name())
                })?;
            self.connections.push(Connection {
                remote_rank,
                transport,
            });
        }
        self.connected = true;
        debug!(
            mesh = self.mesh.name(),
            rank = local_rank,
            remote_size,
            "accepted pre-connections"
        );
        Ok(())
    }

    /// Requests connections from every rank of the accepting participant.
    pub fn request_pre_connection(
        &mut self,
        acceptor: &str,
        requester: &str,
        remote_size: usize,
    ) -> Result<()> {
        let local_rank = self.ctx.bus.rank();
        let name = self.channel_name(acceptor);
        for remote_rank in 0..remote_size {
            let transport = self
                .factory
                .request(&name, requester, remote_rank, local_rank)
                .with_context(|| {
                    format!("requesting connection to remote rank {remote_rank} for mesh `{}`", self.mesh.name())
                })?;
            self.connections.push(Connection {
                remote_rank,
                transport,
            });
        }
        self.connected = true;
        debug!(
            mesh = self.mesh.name(),
            rank = local_rank,
            remote_size,
            "requested pre-connections"
        );
        Ok(())
    }

    /// Exchanges owned global vertex IDs with every connected remote rank
    /// and rebuilds the routing mappings.
    ///
    /// Both sides arrive at the same routing independently: the shared IDs
    /// of a rank pair are traversed in ascending global-ID order, so the
    /// k-th gathered entry on the sender matches the k-th scattered entry on
    /// the receiver.
    pub fn update_vertex_list(&mut self) -> Result<()> {
        ensure!(self.connected, "exchange is not connected");
        let local_rank = self.ctx.bus.rank();
        let owned = self.mesh.owned_ids(local_rank);
        let owned_wire: Vec<u64> = owned.iter().map(|&id| id as u64).collect();

        for conn in &mut self.connections {
            conn.transport.send(&codec::encode_u64s(&owned_wire))?;
        }

        self.mappings.clear();
        for (ci, conn) in self.connections.iter_mut().enumerate() {
            let frame = conn.transport.receive()?;
            let remote: BTreeSet<usize> = codec::decode_u64s(&frame)?
                .into_iter()
                .map(|id| id as usize)
                .collect();
            let mut shared: Vec<(usize, usize)> = owned
                .iter()
                .enumerate()
                .filter(|(_, id)| remote.contains(id))
                .map(|(i, &id)| (id, i))
                .collect();
            shared.sort_unstable();
            let indices: Vec<usize> = shared.into_iter().map(|(_, i)| i).collect();
            trace!(
                mesh = self.mesh.name(),
                rank = local_rank,
                remote_rank = conn.remote_rank,
                shared = indices.len(),
                "updated vertex list"
            );
            if !indices.is_empty() {
                self.mappings.push(Mapping {
                    connection: ci,
                    indices,
                });
            }
        }
        Ok(())
    }

    /// Sends the local subsets of `items` to their remote ranks.
    ///
    /// `items` holds `value_dimension` entries per locally owned vertex.
    /// The call posts one transfer per mapping without waiting; completed
    /// transfers are harvested before returning, the rest are drained by the
    /// next `send`/`receive` or by [`Self::close_connection`].
    pub fn send(&mut self, items: &[f64], value_dimension: usize) -> Result<()> {
        self.check_buffered_requests(true)?;
        let owned = self.mesh.owned_ids(self.ctx.bus.rank()).len();
        assert_eq!(
            items.len(),
            owned * value_dimension,
            "send size does not match owned vertices"
        );
        for mapping in &self.mappings {
            let mut buffer = Vec::with_capacity(mapping.indices.len() * value_dimension);
            for &i in &mapping.indices {
                buffer.extend_from_slice(&items[i * value_dimension..(i + 1) * value_dimension]);
            }
            let conn = &mut self.connections[mapping.connection];
            let request = conn.transport.send_async(codec::encode_f64s(&buffer))?;
            self.buffered_requests.push(request);
        }
        self.check_buffered_requests(false)
    }

    /// Receives the local subsets of `items` from their remote ranks.
    ///
    /// One transfer is posted per mapping; the buffers are scattered in
    /// mapping order once each transfer completes.
    pub fn receive(&mut self, items: &mut [f64], value_dimension: usize) -> Result<()> {
        self.check_buffered_requests(true)?;
        let owned = self.mesh.owned_ids(self.ctx.bus.rank()).len();
        assert_eq!(
            items.len(),
            owned * value_dimension,
            "receive size does not match owned vertices"
        );
        let mut posted: Vec<Box<dyn ReceiveRequest>> = Vec::with_capacity(self.mappings.len());
        for mapping in &self.mappings {
            let conn = &mut self.connections[mapping.connection];
            posted.push(conn.transport.receive_async()?);
        }
        for (mapping, mut request) in self.mappings.iter().zip(posted) {
            let buffer = codec::decode_f64s(&request.wait()?)?;
            assert_eq!(
                buffer.len(),
                mapping.indices.len() * value_dimension,
                "aggregated receive does not match aggregated send"
            );
            for (k, &i) in mapping.indices.iter().enumerate() {
                items[i * value_dimension..(i + 1) * value_dimension]
                    .copy_from_slice(&buffer[k * value_dimension..(k + 1) * value_dimension]);
            }
        }
        Ok(())
    }

    /// Sends one value to each connected remote rank.
    pub fn broadcast_send(&mut self, item: u64) -> Result<()> {
        for conn in &mut self.connections {
            conn.transport.send(&codec::encode_u64(item))?;
        }
        Ok(())
    }

    /// Receives one value per connected remote rank, ordered by the sender
    /// ranks recorded at connection time.
    pub fn broadcast_receive_all(&mut self) -> Result<Vec<u64>> {
        let mut received = Vec::with_capacity(self.connections.len());
        for conn in &mut self.connections {
            received.push(codec::decode_u64(&conn.transport.receive()?)?);
        }
        Ok(received)
    }

    /// Ships this rank's mesh partition to every connected remote rank.
    pub fn broadcast_send_mesh(&mut self) -> Result<()> {
        let partition = self.mesh.partition(self.ctx.bus.rank());
        let frame = codec::encode_json(&partition)?;
        for conn in &mut self.connections {
            conn.transport.send(&frame)?;
        }
        Ok(())
    }

    /// Receives one mesh partition per connected remote rank, paired with
    /// the sender rank, in connection order.
    pub fn broadcast_receive_mesh(&mut self) -> Result<Vec<(usize, MeshPartition)>> {
        let mut received = Vec::with_capacity(self.connections.len());
        for conn in &mut self.connections {
            let partition: MeshPartition = codec::decode_json(&conn.transport.receive()?)?;
            received.push((conn.remote_rank, partition));
        }
        Ok(received)
    }

    /// Ships this rank's local communication map to every connected remote
    /// rank.
    pub fn broadcast_send_comm_map(&mut self, map: &CommunicationMap) -> Result<()> {
        let frame = codec::encode_json(map)?;
        for conn in &mut self.connections {
            conn.transport.send(&frame)?;
        }
        Ok(())
    }

    /// Receives one communication map per connected remote rank, keyed by
    /// the sender rank.
    pub fn broadcast_receive_comm_map(
        &mut self,
    ) -> Result<std::collections::BTreeMap<usize, CommunicationMap>> {
        let mut received = std::collections::BTreeMap::new();
        for conn in &mut self.connections {
            let map: CommunicationMap = codec::decode_json(&conn.transport.receive()?)?;
            received.insert(conn.remote_rank, map);
        }
        Ok(received)
    }

    /// Drains pending transfers and tears the connections down.
    pub fn close_connection(&mut self) -> Result<()> {
        self.check_buffered_requests(true)?;
        for conn in &mut self.connections {
            conn.transport.close();
        }
        self.connections.clear();
        self.mappings.clear();
        self.connected = false;
        Ok(())
    }

    /// Checks posted sends for completion, dropping finished handles.
    /// With `blocking` the list is drained completely.
    fn check_buffered_requests(&mut self, blocking: bool) -> Result<()> {
        if blocking {
            for mut request in self.buffered_requests.drain(..) {
                request.wait()?;
            }
            return Ok(());
        }
        let mut still_pending = Vec::new();
        for mut request in self.buffered_requests.drain(..) {
            if !request.test()? {
                still_pending.push(request);
            }
        }
        self.buffered_requests = still_pending;
        Ok(())
    }
}
