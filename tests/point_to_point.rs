//! Multi-rank exchange scenarios: every rank of both participants runs on
//! its own thread, connected through the in-memory channel network.

use std::sync::Arc;
use std::thread;

use cosim::mesh::{InterfaceMesh, VertexDistribution};
use cosim::transport::{ChannelBus, ChannelNetwork, CollectiveBus, ConnectionFactory};
use cosim::{CouplingContext, PointToPointExchange};

fn distribution(entries: &[(usize, &[usize])]) -> VertexDistribution {
    let mut dist = VertexDistribution::new();
    for (rank, ids) in entries {
        dist.insert(*rank, ids.to_vec());
    }
    dist
}

/// Spawns one thread per rank of both participants. `left` ranks accept,
/// `right` ranks request; each closure receives its connected exchange.
fn run_participants<L, R>(
    left_mesh: InterfaceMesh,
    right_mesh: InterfaceMesh,
    left_ranks: usize,
    right_ranks: usize,
    left: L,
    right: R,
) where
    L: Fn(usize, &mut PointToPointExchange) + Send + Sync + 'static,
    R: Fn(usize, &mut PointToPointExchange) + Send + Sync + 'static,
{
    let net = Arc::new(ChannelNetwork::new());
    let left_mesh = Arc::new(left_mesh);
    let right_mesh = Arc::new(right_mesh);
    let left = Arc::new(left);
    let right = Arc::new(right);
    let mut handles = Vec::new();

    for (rank, bus) in ChannelBus::create(left_ranks).into_iter().enumerate() {
        let factory: Arc<dyn ConnectionFactory> = Arc::clone(&net) as _;
        let mesh = Arc::clone(&left_mesh);
        let body = Arc::clone(&left);
        handles.push(thread::spawn(move || {
            let ctx = CouplingContext::new(Arc::new(bus));
            let mut exchange = PointToPointExchange::new(factory, mesh, ctx);
            exchange
                .accept_pre_connection("Left", "Right", right_ranks)
                .unwrap();
            exchange.update_vertex_list().unwrap();
            body(rank, &mut exchange);
            exchange.close_connection().unwrap();
        }));
    }
    for (rank, bus) in ChannelBus::create(right_ranks).into_iter().enumerate() {
        let factory: Arc<dyn ConnectionFactory> = Arc::clone(&net) as _;
        let mesh = Arc::clone(&right_mesh);
        let body = Arc::clone(&right);
        handles.push(thread::spawn(move || {
            let ctx = CouplingContext::new(Arc::new(bus));
            let mut exchange = PointToPointExchange::new(factory, mesh, ctx);
            exchange
                .request_pre_connection("Left", "Right", left_ranks)
                .unwrap();
            exchange.update_vertex_list().unwrap();
            body(rank, &mut exchange);
            exchange.close_connection().unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_two_by_two_vertex_distribution_routing() {
    // Left rank 0 owns {0,1,2}, rank 1 owns {3,4}; right rank 0 owns {0,3},
    // rank 1 owns {1,2,4}. Sending [10,20,30] and [40,50] must deliver
    // [10,40] to right rank 0 and [20,30,50] to right rank 1.
    let left_mesh = InterfaceMesh::from_distribution(
        1,
        "surface",
        distribution(&[(0, &[0, 1, 2]), (1, &[3, 4])]),
    );
    let right_mesh = InterfaceMesh::from_distribution(
        1,
        "surface",
        distribution(&[(0, &[0, 3]), (1, &[1, 2, 4])]),
    );

    run_participants(
        left_mesh,
        right_mesh,
        2,
        2,
        |rank, exchange| {
            let values: &[f64] = if rank == 0 {
                &[10.0, 20.0, 30.0]
            } else {
                &[40.0, 50.0]
            };
            exchange.send(values, 1).unwrap();
        },
        |rank, exchange| {
            if rank == 0 {
                let mut out = [0.0; 2];
                exchange.receive(&mut out, 1).unwrap();
                assert_eq!(out, [10.0, 40.0]);
            } else {
                let mut out = [0.0; 3];
                exchange.receive(&mut out, 1).unwrap();
                assert_eq!(out, [20.0, 30.0, 50.0]);
            }
        },
    );
}

#[test]
fn test_round_trip_is_identity_on_matching_partitions() {
    // Identical distributions on both sides: y[i] == x[i] regardless of the
    // rank count.
    let dist = distribution(&[(0, &[4, 7]), (1, &[0, 2, 9])]);
    let left_mesh = InterfaceMesh::from_distribution(3, "iface", dist.clone());
    let right_mesh = InterfaceMesh::from_distribution(3, "iface", dist);

    run_participants(
        left_mesh,
        right_mesh,
        2,
        2,
        |rank, exchange| {
            let values: &[f64] = if rank == 0 {
                &[1.5, 2.5]
            } else {
                &[3.5, 4.5, 5.5]
            };
            exchange.send(values, 1).unwrap();
        },
        |rank, exchange| {
            if rank == 0 {
                let mut out = [0.0; 2];
                exchange.receive(&mut out, 1).unwrap();
                assert_eq!(out, [1.5, 2.5]);
            } else {
                let mut out = [0.0; 3];
                exchange.receive(&mut out, 1).unwrap();
                assert_eq!(out, [3.5, 4.5, 5.5]);
            }
        },
    );
}

#[test]
fn test_vector_valued_subsets() {
    // Two entries per vertex; the subset routing has to keep them together.
    let left_mesh =
        InterfaceMesh::from_distribution(2, "field", distribution(&[(0, &[0, 1])]));
    let right_mesh = InterfaceMesh::from_distribution(
        2,
        "field",
        distribution(&[(0, &[1]), (1, &[0])]),
    );

    run_participants(
        left_mesh,
        right_mesh,
        1,
        2,
        |_rank, exchange| {
            exchange.send(&[1.0, 2.0, 3.0, 4.0], 2).unwrap();
        },
        |rank, exchange| {
            let mut out = [0.0; 2];
            exchange.receive(&mut out, 2).unwrap();
            if rank == 0 {
                // Owns vertex 1.
                assert_eq!(out, [3.0, 4.0]);
            } else {
                // Owns vertex 0.
                assert_eq!(out, [1.0, 2.0]);
            }
        },
    );
}

#[test]
fn test_send_and_receive_alternate_over_many_rounds() {
    // Post order per rank pair has to be preserved across iterations.
    let dist = distribution(&[(0, &[0, 1, 2, 3])]);
    let left_mesh = InterfaceMesh::from_distribution(4, "iter", dist.clone());
    let right_mesh = InterfaceMesh::from_distribution(4, "iter", dist);

    run_participants(
        left_mesh,
        right_mesh,
        1,
        1,
        |_rank, exchange| {
            for round in 0..16 {
                let values = [round as f64; 4];
                exchange.send(&values, 1).unwrap();
                let mut back = [0.0; 4];
                exchange.receive(&mut back, 1).unwrap();
                assert_eq!(back, [round as f64 + 0.5; 4]);
            }
        },
        |_rank, exchange| {
            for round in 0..16 {
                let mut values = [0.0; 4];
                exchange.receive(&mut values, 1).unwrap();
                assert_eq!(values, [round as f64; 4]);
                values.iter_mut().for_each(|v| *v += 0.5);
                exchange.send(&values, 1).unwrap();
            }
        },
    );
}

#[test]
fn test_broadcast_receive_all_is_ordered_by_sender_rank() {
    let left_mesh = InterfaceMesh::from_distribution(
        5,
        "bc",
        distribution(&[(0, &[0]), (1, &[1]), (2, &[2])]),
    );
    let right_mesh = InterfaceMesh::from_distribution(5, "bc", distribution(&[(0, &[0, 1, 2])]));

    run_participants(
        left_mesh,
        right_mesh,
        3,
        1,
        |rank, exchange| {
            exchange.broadcast_send(100 + rank as u64).unwrap();
        },
        |_rank, exchange| {
            assert_eq!(
                exchange.broadcast_receive_all().unwrap(),
                vec![100, 101, 102]
            );
        },
    );
}

#[test]
fn test_mesh_partitions_travel_whole() {
    let left_mesh = InterfaceMesh::new(
        6,
        "geom",
        vec![
            cosim::mesh::Vertex {
                id: 0,
                coords: [0.0, 0.0, 0.0],
            },
            cosim::mesh::Vertex {
                id: 1,
                coords: [1.0, 0.0, 0.0],
            },
        ],
        vec![(0, 1)],
        distribution(&[(0, &[0, 1])]),
    );
    let right_mesh = InterfaceMesh::from_distribution(6, "geom", distribution(&[(0, &[0, 1])]));

    run_participants(
        left_mesh,
        right_mesh,
        1,
        1,
        |_rank, exchange| {
            exchange.broadcast_send_mesh().unwrap();
        },
        |_rank, exchange| {
            let received = exchange.broadcast_receive_mesh().unwrap();
            assert_eq!(received.len(), 1);
            let (sender, partition) = &received[0];
            assert_eq!(*sender, 0);
            assert_eq!(partition.vertices.len(), 2);
            assert_eq!(partition.edges, vec![(0, 1)]);
            assert_eq!(partition.vertices[1].coords, [1.0, 0.0, 0.0]);
        },
    );
}

#[test]
fn test_collective_bus_matches_exchange_topology() {
    // Sanity: the bus used by multi-rank participants reduces across all
    // ranks, which the distributed norms in the measures rely on.
    let buses = ChannelBus::create(2);
    let mut handles = Vec::new();
    for bus in buses {
        handles.push(thread::spawn(move || {
            bus.all_reduce_sum((bus.rank() + 1) as f64).unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 3.0);
    }
}
