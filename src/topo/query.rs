/*
Locality queries over a finished server graph.

Everything here is a pure read: the graph is built, normalized and
path-annotated before the first query runs, so concurrent callers need no
synchronization and nothing allocates beyond the returned vectors.
*/

use crate::error::{Result, TopoError};
use crate::plugin::NetPlugin;
use crate::topo::server::{NodeRef, TopoServer};
use crate::topo::types::*;
use crate::xml::XmlNode;
use log::{debug, info};

/// APU arena index for a communicator rank.
pub fn rank_to_index(server: &TopoServer, rank: i32) -> Result<usize> {
    server
        .nodes(NodeKind::Apu)
        .iter()
        .position(|n| n.apu().rank == rank)
        .ok_or_else(|| TopoError::not_found(format!("no APU with rank {rank}")))
}

/// All destination indices tied on the lexicographic (bw, class) optimum
/// of the source's path vector, plus the settled class. An empty result
/// is legal and means the destination kind is absent or unreachable.
pub fn get_local(
    server: &TopoServer,
    src: NodeRef,
    dst_kind: NodeKind,
) -> (Vec<usize>, PathKind) {
    let paths = &server.node(src).paths[dst_kind as usize];
    if paths.is_empty() {
        return (Vec::new(), PathKind::Dis);
    }
    // Settle the optimum over the full scan before collecting the tie
    // set, so the reported class can never reflect a dominated path.
    let mut max_bw = 0.0f32;
    let mut best_kind = PathKind::Dis;
    for path in paths {
        if path.bw > max_bw || (path.bw == max_bw && path.kind < best_kind) {
            max_bw = path.bw;
            best_kind = path.kind;
        }
    }
    let locals = paths
        .iter()
        .enumerate()
        .filter(|(_, p)| p.bw == max_bw && p.kind == best_kind)
        .map(|(i, _)| i)
        .collect();
    (locals, best_kind)
}

fn is_pow2(value: usize) -> bool {
    value.is_power_of_two()
}

/// Reverses the lowest log2(pow2) bits of `value`.
fn mirror_bits(value: usize, pow2: usize) -> usize {
    let mut mirror = 0;
    let mut bit = 1;
    while bit < pow2 {
        mirror <<= 1;
        if value & bit != 0 {
            mirror |= 1;
        }
        bit <<= 1;
    }
    mirror
}

fn pick_local_net(server: &TopoServer, rank: i32) -> Result<NodeRef> {
    let apu = rank_to_index(server, rank)?;
    let (locals, _) = get_local(server, NodeRef::new(NodeKind::Apu, apu), NodeKind::Net);
    if locals.is_empty() {
        return Err(TopoError::not_found(format!(
            "no local path from APU {apu} to any NET node"
        )));
    }
    debug!("found {} local nets for apu {apu}", locals.len());
    let mut net = server.nodes(NodeKind::Apu)[apu].apu().dev as usize;
    if is_pow2(locals.len()) {
        // Spread neighboring APUs across the tied NICs deterministically.
        net = mirror_bits(net, locals.len());
    }
    Ok(NodeRef::new(NodeKind::Net, locals[net % locals.len()]))
}

/// Network device index of the NIC closest to the given rank's APU.
pub fn local_net(server: &TopoServer, rank: i32) -> Result<i32> {
    let net = pick_local_net(server, rank)?;
    let dev = server.node(net).net().dev;
    debug!("local net for rank {rank} is {dev}");
    Ok(dev)
}

/// Like local_net, but hands back the NET node itself.
pub fn local_net_node(server: &TopoServer, rank: i32) -> Result<NodeRef> {
    pick_local_net(server, rank)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NicDistance {
    pub distance: PathKind,
    pub net_guid: u64,
}

/// Path class and GUID of the NIC `local_net` selects for a rank.
pub fn nic_distance(server: &TopoServer, rank: i32) -> Result<NicDistance> {
    let net_dev = local_net(server, rank)?;
    let apu = rank_to_index(server, rank)?;
    let paths = &server.nodes(NodeKind::Apu)[apu].paths[NodeKind::Net as usize];
    for (i, net) in server.nodes(NodeKind::Net).iter().enumerate() {
        if net.net().dev == net_dev {
            return Ok(NicDistance {
                distance: paths[i].kind,
                net_guid: net.net().guid,
            });
        }
    }
    Err(TopoError::internal(format!(
        "selected net device {net_dev} vanished from the graph"
    )))
}

/// Per-APU NIC override from a topology DOM: the `net` attribute of the
/// `apu` element with the matching device index.
pub fn net_from_dom(dom: &XmlNode, apu_dev: i32) -> Result<String> {
    let mut found = None;
    dom.visit(&mut |node: &XmlNode| {
        if node.name == "apu" && node.attr_parsed::<i32>("dev").ok().flatten() == Some(apu_dev) {
            found.get_or_insert_with(|| node.attr("net").map(str::to_string));
        }
    });
    match found {
        None => Err(TopoError::not_found(format!(
            "APU {apu_dev} not present in the topology DOM"
        ))),
        Some(None) => Err(TopoError::schema(format!(
            "APU {apu_dev} has no 'net' attribute in the topology DOM"
        ))),
        Some(Some(name)) => Ok(name),
    }
}

/// DOM-proximity NIC lookup: the first `net` element sharing a `cpu`
/// ancestor with the APU, falling back to the whole `system` scope.
pub fn closest_net_for_apu(dom: &XmlNode, apu_dev: i32) -> Result<Option<String>> {
    let apu_path = dom.find_path(&|n: &XmlNode| {
        n.name == "apu" && n.attr_parsed::<i32>("dev").ok().flatten() == Some(apu_dev)
    });
    let Some(apu_path) = apu_path else {
        return Ok(None);
    };
    // Walk ancestors nearest-first looking for a cpu-scoped net.
    for depth in (0..apu_path.len()).rev() {
        let ancestor = dom.node_at(&apu_path[..depth]).expect("prefix of a found path");
        if ancestor.name != "cpu" {
            continue;
        }
        if let Some(net) = ancestor.find_tag("net") {
            return Ok(Some(net.require_attr("name")?.to_string()));
        }
    }
    match dom.find_tag("net") {
        Some(net) => Ok(Some(net.require_attr("name")?.to_string())),
        None => Ok(None),
    }
}

/// NIC selection override chain: a topology-DOM `net` attribute wins,
/// then the `USENET` environment name, then (when `ENABLE_TOPO_DETECT` is
/// "TRUE") the graph-derived answer. Returns Ok(None) when nothing is
/// configured.
pub fn resolve_local_net(
    server: &TopoServer,
    rank: i32,
    apu_dev: i32,
    topo_dom: Option<&XmlNode>,
    plugin: &dyn NetPlugin,
) -> Result<Option<i32>> {
    resolve_local_net_with(
        server,
        rank,
        apu_dev,
        topo_dom,
        plugin,
        std::env::var("USENET").ok().as_deref(),
        std::env::var("ENABLE_TOPO_DETECT").as_deref() == Ok("TRUE"),
    )
}

fn resolve_local_net_with(
    server: &TopoServer,
    rank: i32,
    apu_dev: i32,
    topo_dom: Option<&XmlNode>,
    plugin: &dyn NetPlugin,
    usenet: Option<&str>,
    detect: bool,
) -> Result<Option<i32>> {
    let mut name = None;
    if let Some(dom) = topo_dom {
        name = Some(net_from_dom(dom, apu_dev)?);
        info!(
            "APU {apu_dev} uses net {} specified in the topology DOM",
            name.as_deref().unwrap_or_default()
        );
    }
    if name.is_none() {
        if let Some(forced) = usenet {
            info!("APU {apu_dev} uses net {forced} forced by USENET");
            name = Some(forced.to_string());
        }
    }
    if let Some(name) = name {
        return plugin.dev_from_name(&name).map(Some);
    }
    if detect {
        return local_net(server, rank).map(Some);
    }
    Ok(None)
}
