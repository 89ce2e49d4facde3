/*
All-pairs path attribution over one server graph.

For every base node, a worklist relaxation assigns each other node the
route maximizing (bandwidth, -class) lexicographically: bandwidth is the
minimum link bandwidth along the route, class the worst hop class. A PCI
hop counts as PIX, refined to PXB between two PCI switches and to PHB
when it touches a CPU. The terminal NET hop contributes LOC so that NIC
proximity keeps the PCI-side class. Unreached nodes stay DIS with zero
bandwidth.

The relaxation itself only records each node's next step toward the
base; hop lists are materialized from that settled tree, so every stored
route runs forward from its owner and ends at the destination.
*/

use crate::topo::server::{NodeRef, TopoServer};
use crate::topo::types::*;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct Path {
    pub kind: PathKind,
    pub bw: f32,
    /// Successor chain of the route, read from the owning node: the
    /// first entry is the node one hop away from the owner, the last
    /// entry is the destination itself. Empty for the self path and for
    /// disconnected pairs.
    pub hops: Vec<NodeRef>,
}

impl Path {
    pub fn disconnected() -> Self {
        Self {
            kind: PathKind::Dis,
            bw: 0.0,
            hops: Vec::new(),
        }
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }
}

/// Class contribution of one hop from `from` over `link` to `to`.
fn step_kind(from: NodeKind, to: NodeKind, link: LinkKind) -> PathKind {
    let mut kind = match link {
        // The route to a NET endpoint is classified by how the NIC is
        // reached, not by the NIC-to-port hop itself.
        LinkKind::Net => PathKind::Loc,
        LinkKind::Loc => PathKind::Loc,
        LinkKind::Cci => PathKind::Cci,
        LinkKind::Pci => PathKind::Pix,
        LinkKind::Sys => PathKind::Sys,
    };
    if from == NodeKind::Pci && to == NodeKind::Pci {
        kind = PathKind::Pxb;
    }
    if link == LinkKind::Pci && (from == NodeKind::Cpu || to == NodeKind::Cpu) {
        kind = PathKind::Phb;
    }
    kind
}

/// Fills every node's per-kind path vectors. Must run after the graph is
/// fully normalized; stale vectors from an earlier run are replaced.
pub fn compute_paths(server: &mut TopoServer) {
    let counts: Vec<usize> = ALL_NODE_KINDS.iter().map(|k| server.count(*k)).collect();

    for (d, &count) in counts.iter().enumerate() {
        for kind in ALL_NODE_KINDS {
            for node in server.nodes_mut(kind) {
                node.paths[d] = vec![Path::disconnected(); count];
            }
        }
    }

    for base_kind in ALL_NODE_KINDS {
        for base_index in 0..counts[base_kind as usize] {
            relax_from(server, NodeRef::new(base_kind, base_index));
        }
    }
}

fn relax_from(server: &mut TopoServer, base: NodeRef) {
    let d = base.kind as usize;
    let bi = base.index;
    server.node_mut(base).paths[d][bi] = Path {
        kind: PathKind::Loc,
        bw: LOC_BW,
        hops: Vec::new(),
    };

    // Every improvement rewrites the improved node's next step, so the
    // map always mirrors the current bandwidth/class values and settles
    // into a tree rooted at the base.
    let mut toward_base: HashMap<NodeRef, NodeRef> = HashMap::new();
    let mut worklist = VecDeque::from([base]);
    while let Some(u) = worklist.pop_front() {
        let u_path = server.node(u).paths[d][bi].clone();
        let u_links = server.node(u).links.clone();
        for link in u_links {
            let w = link.remote;
            if w == u {
                continue;
            }
            let cand_bw = u_path.bw.min(link.bw);
            let cand_kind = u_path.kind.max(step_kind(w.kind, u.kind, link.kind));
            let cur = &server.node(w).paths[d][bi];
            let better =
                cand_bw > cur.bw || (cand_bw == cur.bw && cand_kind < cur.kind);
            if !better {
                continue;
            }
            server.node_mut(w).paths[d][bi] = Path {
                kind: cand_kind,
                bw: cand_bw,
                hops: Vec::new(),
            };
            toward_base.insert(w, u);
            worklist.push_back(w);
        }
    }

    // Build each route forward, destination last: follow the next-step
    // chain from the owner until it reaches the base.
    let materialized: Vec<(NodeRef, Vec<NodeRef>)> = toward_base
        .keys()
        .map(|start| {
            let mut hops = Vec::new();
            let mut cursor = *start;
            while cursor != base {
                cursor = toward_base[&cursor];
                hops.push(cursor);
            }
            (*start, hops)
        })
        .collect();
    for (node, hops) in materialized {
        debug_assert_eq!(Some(&base), hops.last());
        server.node_mut(node).paths[d][bi].hops = hops;
    }
}
