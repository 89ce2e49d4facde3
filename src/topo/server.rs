/*
Typed multigraph of one server's hardware.

Nodes live in one arena per kind and are addressed by (kind, index)
handles. Links hold the remote handle, never a pointer, so compacting an
arena after a removal only needs an index remap pass. Paths are attached
to nodes by compute_paths and dropped with them.
*/

use crate::cpuset::CpuSet;
use crate::error::{Result, TopoError};
use crate::topo::paths::Path;
use crate::topo::types::*;
use log::info;

/// Weak reference to a node: an index into the owning server's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub kind: NodeKind,
    pub index: usize,
}

impl NodeRef {
    pub fn new(kind: NodeKind, index: usize) -> Self {
        Self { kind, index }
    }
}

#[derive(Debug, Clone)]
pub struct Link {
    pub kind: LinkKind,
    pub bw: f32,
    pub remote: NodeRef,
}

#[derive(Debug, Clone)]
pub struct ApuInfo {
    pub dev: i32,
    pub rank: i32,
    pub vendor: i32,
}

#[derive(Debug, Clone, Default)]
pub struct CpuInfo {
    pub arch: Option<CpuArch>,
    pub vendor: Option<CpuVendor>,
    pub model: Option<CpuModel>,
    pub affinity: CpuSet,
}

#[derive(Debug, Clone, Default)]
pub struct PciInfo {
    /// vendor | device | subsystem-vendor | subsystem-device, 16 bits each.
    pub device: u64,
}

#[derive(Debug, Clone)]
pub struct NetInfo {
    pub dev: i32,
    pub guid: u64,
    pub port: i32,
    pub bw: f32,
    pub latency: f32,
    pub max_conn: i32,
}

#[derive(Debug, Clone)]
pub enum NodePayload {
    Apu(ApuInfo),
    Cpu(CpuInfo),
    Pci(PciInfo),
    Net(NetInfo),
    /// NIC, CCI and HBD nodes carry no extra state.
    Plain,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub id: u64,
    pub links: Vec<Link>,
    /// One path vector per destination kind, filled by compute_paths.
    pub paths: [Vec<Path>; NODE_KINDS],
    pub payload: NodePayload,
}

impl Node {
    pub fn apu(&self) -> &ApuInfo {
        match &self.payload {
            NodePayload::Apu(info) => info,
            _ => unreachable!("APU node carries APU payload"),
        }
    }

    pub fn apu_mut(&mut self) -> &mut ApuInfo {
        match &mut self.payload {
            NodePayload::Apu(info) => info,
            _ => unreachable!("APU node carries APU payload"),
        }
    }

    pub fn cpu(&self) -> &CpuInfo {
        match &self.payload {
            NodePayload::Cpu(info) => info,
            _ => unreachable!("CPU node carries CPU payload"),
        }
    }

    pub fn cpu_mut(&mut self) -> &mut CpuInfo {
        match &mut self.payload {
            NodePayload::Cpu(info) => info,
            _ => unreachable!("CPU node carries CPU payload"),
        }
    }

    pub fn pci(&self) -> &PciInfo {
        match &self.payload {
            NodePayload::Pci(info) => info,
            _ => unreachable!("PCI node carries PCI payload"),
        }
    }

    pub fn pci_mut(&mut self) -> &mut PciInfo {
        match &mut self.payload {
            NodePayload::Pci(info) => info,
            _ => unreachable!("PCI node carries PCI payload"),
        }
    }

    pub fn net(&self) -> &NetInfo {
        match &self.payload {
            NodePayload::Net(info) => info,
            _ => unreachable!("NET node carries NET payload"),
        }
    }

    pub fn net_mut(&mut self) -> &mut NetInfo {
        match &mut self.payload {
            NodePayload::Net(info) => info,
            _ => unreachable!("NET node carries NET payload"),
        }
    }
}

fn empty_paths() -> [Vec<Path>; NODE_KINDS] {
    Default::default()
}

/// One server's hardware graph plus the host-hash table shared with the
/// cluster assembly protocol.
#[derive(Debug, Default)]
pub struct TopoServer {
    nodes: [Vec<Node>; NODE_KINDS],
    pub server_id: usize,
    pub host_hashes: Vec<u64>,
}

impl TopoServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_hosts(&self) -> usize {
        self.host_hashes.len()
    }

    pub fn count(&self, kind: NodeKind) -> usize {
        self.nodes[kind as usize].len()
    }

    pub fn nodes(&self, kind: NodeKind) -> &[Node] {
        &self.nodes[kind as usize]
    }

    pub fn nodes_mut(&mut self, kind: NodeKind) -> &mut [Node] {
        &mut self.nodes[kind as usize]
    }

    pub fn node(&self, r: NodeRef) -> &Node {
        &self.nodes[r.kind as usize][r.index]
    }

    pub fn node_mut(&mut self, r: NodeRef) -> &mut Node {
        &mut self.nodes[r.kind as usize][r.index]
    }

    /// Records a host hash, returning its (possibly pre-existing) index.
    pub fn intern_host_hash(&mut self, hash: u64) -> Result<usize> {
        if let Some(i) = self.host_hashes.iter().position(|h| *h == hash) {
            return Ok(i);
        }
        if self.host_hashes.len() == MAX_HOSTS {
            return Err(TopoError::capacity(format!("more than {MAX_HOSTS} hosts")));
        }
        self.host_hashes.push(hash);
        Ok(self.host_hashes.len() - 1)
    }

    pub fn create_node(&mut self, kind: NodeKind, id: u64) -> Result<NodeRef> {
        let arena = &mut self.nodes[kind as usize];
        if arena.len() == MAX_NODES {
            return Err(TopoError::capacity(format!(
                "more than {MAX_NODES} nodes of kind {}",
                kind.as_str()
            )));
        }
        let index = arena.len();
        let payload = match kind {
            NodeKind::Apu => NodePayload::Apu(ApuInfo {
                dev: UNDEF,
                rank: UNDEF,
                vendor: UNDEF,
            }),
            NodeKind::Cpu => NodePayload::Cpu(CpuInfo::default()),
            NodeKind::Pci => NodePayload::Pci(PciInfo::default()),
            NodeKind::Net => NodePayload::Net(NetInfo {
                dev: UNDEF,
                guid: 0,
                port: UNDEF,
                bw: 0.0,
                latency: 0.0,
                max_conn: UNDEF,
            }),
            _ => NodePayload::Plain,
        };
        let mut links = Vec::new();
        if kind == NodeKind::Apu {
            // Every accelerator reaches itself at local bandwidth.
            links.push(Link {
                kind: LinkKind::Loc,
                bw: LOC_BW,
                remote: NodeRef::new(kind, index),
            });
        }
        arena.push(Node {
            kind,
            id,
            links,
            paths: empty_paths(),
            payload,
        });
        Ok(NodeRef::new(kind, index))
    }

    /// Raw insertion for the unflatten path, which must not re-run
    /// create_node defaults. The caller enforces the arena bound.
    pub(crate) fn push_node(&mut self, node: Node) {
        debug_assert!(self.nodes[node.kind as usize].len() < MAX_NODES);
        self.nodes[node.kind as usize].push(node);
    }

    pub fn get_node(&self, kind: NodeKind, id: u64) -> Option<NodeRef> {
        self.nodes[kind as usize]
            .iter()
            .position(|n| n.id == id)
            .map(|i| NodeRef::new(kind, i))
    }

    pub fn id_to_index(&self, kind: NodeKind, id: u64) -> Result<usize> {
        self.nodes[kind as usize]
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| {
                TopoError::internal(format!("no {} node with id {id:#x}", kind.as_str()))
            })
    }

    /// Adds a directed link, accumulating bandwidth when a link of the
    /// same class to the same remote already exists.
    pub fn connect(&mut self, from: NodeRef, to: NodeRef, kind: LinkKind, bw: f32) -> Result<()> {
        let node = self.node_mut(from);
        for link in node.links.iter_mut() {
            if link.remote == to && link.kind == kind {
                link.bw += bw;
                return Ok(());
            }
        }
        if node.links.len() == MAX_LINKS {
            return Err(TopoError::capacity(format!(
                "more than {MAX_LINKS} links on {} node",
                from.kind.as_str()
            )));
        }
        node.links.push(Link {
            kind,
            bw,
            remote: to,
        });
        Ok(())
    }

    /// Deletes a node: every surviving link to it is dropped, handles to
    /// later nodes of the same kind are shifted down, and the arena is
    /// compacted. Path vectors go stale and must be recomputed.
    pub fn remove_node(&mut self, kind: NodeKind, index: usize) -> Result<()> {
        if index >= self.nodes[kind as usize].len() {
            return Err(TopoError::internal(format!(
                "remove of {}[{index}] out of range",
                kind.as_str()
            )));
        }
        let victim = NodeRef::new(kind, index);
        for arena in self.nodes.iter_mut() {
            for node in arena.iter_mut() {
                node.links.retain(|l| l.remote != victim);
                for link in node.links.iter_mut() {
                    if link.remote.kind == kind && link.remote.index > index {
                        link.remote.index -= 1;
                    }
                }
            }
        }
        self.nodes[kind as usize].remove(index);
        Ok(())
    }

    /// Logs the topology tree rooted at each CPU node.
    pub fn log_topology(&self) {
        for i in 0..self.count(NodeKind::Cpu) {
            let mut line = String::new();
            self.log_rec(NodeRef::new(NodeKind::Cpu, i), None, &mut line, 0);
        }
        info!("==========================================");
    }

    fn log_rec(&self, r: NodeRef, prev: Option<NodeRef>, line: &mut String, offset: usize) {
        let node = self.node(r);
        line.truncate(offset);
        line.push_str(&self.node_label(node));
        info!("{line}");
        // Blank the prefix so nested lines indent under this node.
        *line = " ".repeat(offset);

        for link in &node.links {
            if link.kind == LinkKind::Loc {
                continue;
            }
            if link.kind == LinkKind::Pci && Some(link.remote) == prev {
                continue;
            }
            line.truncate(offset);
            line.push_str(&format!("+ Link[{}/{:.1}] - ", link.kind.as_str(), link.bw));
            let next_offset = line.len();
            if link.kind == LinkKind::Pci {
                self.log_rec(link.remote, Some(r), line, next_offset);
            } else {
                line.push_str(&self.node_label(self.node(link.remote)));
                info!("{line}");
            }
        }
    }

    fn node_label(&self, node: &Node) -> String {
        let srv = id_server(node.id);
        let local = id_local(node.id);
        match &node.payload {
            NodePayload::Apu(apu) => format!(
                "Node [{}/{srv:x}-{local:x} ({})]",
                node.kind.as_str(),
                apu.rank
            ),
            NodePayload::Cpu(cpu) => format!(
                "Node [{}/{srv:x}-{local:x} ({:?}/{:?}/{:?})]",
                node.kind.as_str(),
                cpu.arch,
                cpu.vendor,
                cpu.model
            ),
            NodePayload::Pci(pci) => format!(
                "Node [{}/{srv:x}-{local:x} ({:x})]",
                node.kind.as_str(),
                pci.device
            ),
            NodePayload::Net(net) => format!(
                "Node [{}/{srv:x}-{local:x} ({:x}/{}/{})]",
                node.kind.as_str(),
                net.guid,
                net.port,
                net.bw
            ),
            NodePayload::Plain => {
                format!("Node [{}/{srv:x}-{local:x}]", node.kind.as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_count(server: &TopoServer, r: NodeRef) -> usize {
        server.node(r).links.len()
    }

    #[test]
    fn apu_gets_loc_self_link() {
        let mut server = TopoServer::new();
        let apu = server.create_node(NodeKind::Apu, topo_id(0, 7)).unwrap();
        let node = server.node(apu);
        assert_eq!(1, node.links.len());
        assert_eq!(LinkKind::Loc, node.links[0].kind);
        assert_eq!(apu, node.links[0].remote);
        assert_eq!(LOC_BW, node.links[0].bw);
    }

    #[test]
    fn connect_accumulates_bandwidth_on_repeat() {
        let mut server = TopoServer::new();
        let a = server.create_node(NodeKind::Pci, 1).unwrap();
        let b = server.create_node(NodeKind::Pci, 2).unwrap();
        server.connect(a, b, LinkKind::Pci, 12.0).unwrap();
        server.connect(a, b, LinkKind::Pci, 12.0).unwrap();
        assert_eq!(1, link_count(&server, a));
        assert_eq!(24.0, server.node(a).links[0].bw);
    }

    #[test]
    fn get_node_by_id() {
        let mut server = TopoServer::new();
        server.create_node(NodeKind::Net, topo_id(0, 4)).unwrap();
        assert!(server.get_node(NodeKind::Net, topo_id(0, 4)).is_some());
        assert!(server.get_node(NodeKind::Net, topo_id(0, 5)).is_none());
    }

    #[test]
    fn remove_node_drops_links_and_remaps_indices() {
        let mut server = TopoServer::new();
        let p0 = server.create_node(NodeKind::Pci, 10).unwrap();
        let p1 = server.create_node(NodeKind::Pci, 11).unwrap();
        let p2 = server.create_node(NodeKind::Pci, 12).unwrap();
        let cpu = server.create_node(NodeKind::Cpu, 0).unwrap();
        for p in [p0, p1, p2] {
            server.connect(cpu, p, LinkKind::Pci, 12.0).unwrap();
            server.connect(p, cpu, LinkKind::Pci, 12.0).unwrap();
        }
        server.connect(p1, p2, LinkKind::Pci, 12.0).unwrap();
        server.connect(p2, p1, LinkKind::Pci, 12.0).unwrap();

        server.remove_node(NodeKind::Pci, p1.index).unwrap();

        assert_eq!(2, server.count(NodeKind::Pci));
        // cpu keeps links to the two survivors only
        assert_eq!(2, link_count(&server, cpu));
        for link in &server.node(cpu).links {
            assert!(link.remote.index < 2);
            let back = server.node(link.remote);
            assert!(back.links.iter().any(|l| l.remote == cpu));
        }
        // former p2 moved down to index 1 and lost its link to p1
        let moved = NodeRef::new(NodeKind::Pci, 1);
        assert_eq!(12, server.node(moved).id);
        assert_eq!(1, link_count(&server, moved));
    }

    #[test]
    fn remove_adjacent_nodes_with_mutual_links() {
        let mut server = TopoServer::new();
        let a = server.create_node(NodeKind::Pci, 1).unwrap();
        let b = server.create_node(NodeKind::Pci, 2).unwrap();
        let c = server.create_node(NodeKind::Pci, 3).unwrap();
        // a <-> b, b <-> c, a <-> c
        for (x, y) in [(a, b), (b, c), (a, c)] {
            server.connect(x, y, LinkKind::Pci, 1.0).unwrap();
            server.connect(y, x, LinkKind::Pci, 1.0).unwrap();
        }
        server.remove_node(NodeKind::Pci, a.index).unwrap();
        server.remove_node(NodeKind::Pci, 0).unwrap(); // former b

        assert_eq!(1, server.count(NodeKind::Pci));
        let last = server.node(NodeRef::new(NodeKind::Pci, 0));
        assert_eq!(3, last.id);
        assert!(last.links.is_empty());
    }

    #[test]
    fn node_capacity_is_enforced() {
        let mut server = TopoServer::new();
        for i in 0..MAX_NODES {
            server.create_node(NodeKind::Pci, i as u64).unwrap();
        }
        let err = server.create_node(NodeKind::Pci, 9999).unwrap_err();
        assert!(matches!(err, TopoError::Capacity(_)));
    }

    #[test]
    fn intern_host_hash_dedupes() {
        let mut server = TopoServer::new();
        assert_eq!(0, server.intern_host_hash(0xaaa).unwrap());
        assert_eq!(1, server.intern_host_hash(0xbbb).unwrap());
        assert_eq!(0, server.intern_host_hash(0xaaa).unwrap());
        assert_eq!(2, server.n_hosts());
    }
}
