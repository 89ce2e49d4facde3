/*
Cluster-wide topology assembly.

All ranks flatten their local server graph, exchange the images over the
bootstrap channel, and independently renumber server identities with a
first-seen walk in rank order; because the all-gather preserves slot
order, every rank derives the same canonical host-hash table. Each unique
remote image is then unflattened, renumbered and path-annotated locally.
The local server is rewritten in place, never reallocated.
*/

use crate::bootstrap::Bootstrap;
use crate::error::{Result, TopoError};
use crate::route::InterServerRoute;
use crate::topo::flat::{flatten, unflatten, FlatTopoServer};
use crate::topo::paths::compute_paths;
use crate::topo::server::{NetInfo, TopoServer};
use crate::topo::types::*;
use crate::xml::XmlNode;
use log::{debug, info};
use std::collections::HashMap;

#[derive(Debug)]
pub struct InterServerTopo {
    pub num_servers: usize,
    /// Indexed by canonical server id; the local server's slot stays
    /// empty because the caller keeps ownership of it.
    servers: Vec<Option<TopoServer>>,
    pub net_to_server: HashMap<u64, usize>,
    pub route_map: HashMap<u64, HashMap<u64, InterServerRoute>>,
}

impl InterServerTopo {
    /// The server owning canonical id `id`, with the caller-held local
    /// server filling its own slot.
    pub fn server_by_id<'a>(
        &'a self,
        local: &'a TopoServer,
        id: usize,
    ) -> Option<&'a TopoServer> {
        if id == local.server_id {
            return Some(local);
        }
        self.servers.get(id).and_then(Option::as_ref)
    }

    /// Scans every server's APUs for the given rank.
    pub fn server_from_rank<'a>(
        &'a self,
        local: &'a TopoServer,
        rank: i32,
    ) -> Result<&'a TopoServer> {
        for id in 0..self.num_servers {
            let Some(server) = self.server_by_id(local, id) else {
                continue;
            };
            if server
                .nodes(NodeKind::Apu)
                .iter()
                .any(|n| n.apu().rank == rank)
            {
                return Ok(server);
            }
        }
        Err(TopoError::not_found(format!("rank {rank} on any server")))
    }

    /// NET payload for a GUID, wherever in the cluster it lives.
    pub fn net_node<'a>(&'a self, local: &'a TopoServer, guid: u64) -> Result<&'a NetInfo> {
        let server_id = *self
            .net_to_server
            .get(&guid)
            .ok_or_else(|| TopoError::not_found(format!("net guid {guid:#x}")))?;
        let server = self
            .server_by_id(local, server_id)
            .ok_or_else(|| TopoError::internal(format!("server {server_id} missing")))?;
        server
            .nodes(NodeKind::Net)
            .iter()
            .map(|n| n.net())
            .find(|net| net.guid == guid)
            .ok_or_else(|| {
                TopoError::internal(format!("net guid {guid:#x} missing from server {server_id}"))
            })
    }

    /// Declarative route between two NICs, when the route file has one.
    pub fn route(&self, local_guid: u64, remote_guid: u64) -> Option<&InterServerRoute> {
        self.route_map.get(&local_guid)?.get(&remote_guid)
    }
}

/// Canonical server-id assignment over the gathered flat images, in rank
/// order. Returns the canonical host-hash table shared by every entry.
fn reorder_server_ids(flats: &mut [FlatTopoServer]) -> Result<Vec<u64>> {
    let mut table: Vec<u64> = Vec::new();
    for (rank, flat) in flats.iter_mut().enumerate() {
        let hash = *flat
            .host_hashes
            .get(flat.server_id as usize)
            .ok_or_else(|| {
                TopoError::internal(format!("rank {rank} image has no own host hash"))
            })?;
        let id = match table.iter().position(|h| *h == hash) {
            Some(id) => id,
            None => {
                table.push(hash);
                table.len() - 1
            }
        };
        flat.server_id = id as u32;
    }
    for flat in flats.iter_mut() {
        flat.host_hashes = table.clone();
    }
    Ok(table)
}

/// Rewrites the high half of every node id to the canonical server id.
fn renumber_node_ids(server: &mut TopoServer, server_id: usize) {
    for kind in ALL_NODE_KINDS {
        for node in server.nodes_mut(kind) {
            node.id = topo_id(server_id, id_local(node.id));
        }
    }
}

/// Runs the assembly protocol. Collective: every rank must call this with
/// the same route DOM (or none). The local server is renumbered in place
/// and referenced, not copied, by the returned cluster view.
pub fn assemble(
    bootstrap: &dyn Bootstrap,
    rank: usize,
    n_ranks: usize,
    local: &mut TopoServer,
    route_dom: Option<&XmlNode>,
) -> Result<InterServerTopo> {
    let wire = FlatTopoServer::WIRE_BYTES;
    let mut buf = vec![0u8; n_ranks * wire];
    flatten(local).encode_into(&mut buf[rank * wire..(rank + 1) * wire])?;
    bootstrap.all_gather(&mut buf, wire)?;
    bootstrap.barrier(rank, n_ranks, 0)?;

    let mut flats = Vec::with_capacity(n_ranks);
    for r in 0..n_ranks {
        flats.push(FlatTopoServer::decode(&buf[r * wire..(r + 1) * wire])?);
    }
    drop(buf);

    let local_hash = *local
        .host_hashes
        .get(local.server_id)
        .ok_or_else(|| TopoError::internal("local server has no own host hash"))?;
    let table = reorder_server_ids(&mut flats)?;
    let num_servers = table.len();
    debug!("canonicalized {num_servers} servers across {n_ranks} ranks");

    let mut servers: Vec<Option<TopoServer>> = Vec::new();
    servers.resize_with(num_servers, || None);
    let mut seen = vec![false; num_servers];
    for flat in &flats {
        let id = flat.server_id as usize;
        if seen[id] {
            continue;
        }
        seen[id] = true;
        if table[id] == local_hash {
            // This rank's own server: renumber in place.
            local.server_id = id;
            local.host_hashes = table.clone();
            renumber_node_ids(local, id);
            continue;
        }
        let mut server = unflatten(flat)?;
        renumber_node_ids(&mut server, id);
        // Paths never cross the wire; rebuild them for the remote view.
        compute_paths(&mut server);
        servers[id] = Some(server);
    }

    let mut inter = InterServerTopo {
        num_servers,
        servers,
        net_to_server: HashMap::new(),
        route_map: HashMap::new(),
    };
    for id in 0..num_servers {
        let Some(server) = inter.server_by_id(local, id) else {
            continue;
        };
        let guids: Vec<u64> = server
            .nodes(NodeKind::Net)
            .iter()
            .map(|n| n.net().guid)
            .collect();
        for guid in guids {
            debug!("net guid {guid:#x} lives on server {id}");
            inter.net_to_server.insert(guid, id);
        }
    }

    if let Some(dom) = route_dom {
        crate::route::load_routes(dom, &mut inter, local)?;
    }
    info!(
        "inter-server topology ready: {} servers, {} nets",
        inter.num_servers,
        inter.net_to_server.len()
    );
    Ok(inter)
}
