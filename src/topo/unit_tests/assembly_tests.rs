use crate::bootstrap::LocalBootstrapGroup;
use crate::cluster::{assemble, InterServerTopo};
use crate::topo::build::build_server_from_dom;
use crate::topo::server::TopoServer;
use crate::topo::types::*;
use crate::topo::unit_tests::support::{host_dom_ranks, net_guid};
use std::thread;

const H1: u64 = 0x111;
const H2: u64 = 0x222;

/// Ranks 0/2 live on H1, ranks 1/3 on H2; both ranks of a host see the
/// identical host topology.
fn rank_topology(rank: usize) -> (u64, TopoServer) {
    let (hash, ranks) = if rank % 2 == 0 {
        (H1, [0, 2])
    } else {
        (H2, [1, 3])
    };
    let dom = host_dom_ranks(hash, &ranks, 1, 100_000);
    (hash, build_server_from_dom(&dom, hash).unwrap())
}

fn assemble_cluster(n_ranks: usize) -> Vec<(TopoServer, InterServerTopo)> {
    let group = LocalBootstrapGroup::new(n_ranks);
    let joins: Vec<_> = (0..n_ranks)
        .map(|rank| {
            let bs = group.handle(rank);
            thread::spawn(move || {
                let (_, mut local) = rank_topology(rank);
                let inter = assemble(&bs, rank, n_ranks, &mut local, None).unwrap();
                (local, inter)
            })
        })
        .collect();
    joins.into_iter().map(|j| j.join().unwrap()).collect()
}

#[test]
fn interleaved_hosts_get_first_seen_server_ids() {
    let results = assemble_cluster(4);
    for (rank, (local, inter)) in results.iter().enumerate() {
        assert_eq!(2, inter.num_servers, "rank {rank}");
        let expected_id = rank % 2;
        assert_eq!(expected_id, local.server_id, "rank {rank}");
        assert_eq!(vec![H1, H2], local.host_hashes, "rank {rank}");
    }
}

#[test]
fn host_hash_tables_are_identical_across_ranks() {
    let results = assemble_cluster(4);
    let reference = &results[0].0.host_hashes;
    for (local, _) in &results {
        assert_eq!(reference, &local.host_hashes);
    }
}

#[test]
fn every_node_id_carries_its_canonical_server_id() {
    let results = assemble_cluster(4);
    for (local, inter) in &results {
        for id in 0..inter.num_servers {
            let server = inter.server_by_id(local, id).expect("server present");
            assert_eq!(id, server.server_id);
            for kind in ALL_NODE_KINDS {
                for node in server.nodes(kind) {
                    assert_eq!(id, id_server(node.id));
                }
            }
        }
    }
}

#[test]
fn remote_servers_regain_paths_after_unflatten() {
    let results = assemble_cluster(4);
    let (local, inter) = &results[0];
    let remote_id = 1 - local.server_id;
    let remote = inter.server_by_id(local, remote_id).unwrap();
    let paths = &remote.nodes(NodeKind::Apu)[0].paths[NodeKind::Net as usize];
    assert_eq!(remote.count(NodeKind::Net), paths.len());
    assert!(paths[0].kind != PathKind::Dis);
}

#[test]
fn net_guids_map_to_their_servers() {
    let results = assemble_cluster(4);
    for (_, inter) in &results {
        assert_eq!(Some(&0), inter.net_to_server.get(&net_guid(H1, 0)));
        assert_eq!(Some(&1), inter.net_to_server.get(&net_guid(H2, 0)));
    }
}

#[test]
fn ranks_resolve_to_their_servers() {
    let results = assemble_cluster(4);
    let (local, inter) = &results[2];
    for rank in 0..4 {
        let server = inter.server_from_rank(local, rank).unwrap();
        assert_eq!((rank % 2) as usize, server.server_id);
    }
    assert!(inter.server_from_rank(local, 17).is_err());
}

#[test]
fn single_rank_cluster_reuses_the_local_server() {
    let group = LocalBootstrapGroup::new(1);
    let bs = group.handle(0);
    let dom = host_dom_ranks(H1, &[0], 1, 100_000);
    let mut local = build_server_from_dom(&dom, H1).unwrap();
    let inter = assemble(&bs, 0, 1, &mut local, None).unwrap();
    assert_eq!(1, inter.num_servers);
    assert_eq!(0, local.server_id);
    assert!(inter.server_by_id(&local, 0).is_some());
    assert_eq!(
        local.count(NodeKind::Apu),
        inter.server_by_id(&local, 0).unwrap().count(NodeKind::Apu)
    );
}
