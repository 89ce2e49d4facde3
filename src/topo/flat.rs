/*
Pointer-free server image and its wire form.

The cluster assembly protocol ships every rank's server graph through the
bootstrap all-gather, which deals in equal fixed-size byte slots. A
FlatTopoServer mirrors a TopoServer with plain records; encode_into lays
it out little-endian in a WIRE_BYTES slot (length-prefixed sections, zero
padding) and decode reverses it. Path vectors never cross the wire; they
are recomputed after unflatten. CPU affinity stays host-local and
re-defaults on the receiving side.
*/

use crate::error::{Result, TopoError};
use crate::topo::server::{
    ApuInfo, CpuInfo, Link, NetInfo, Node, NodePayload, NodeRef, PciInfo, TopoServer,
};
use crate::topo::types::*;
use num_traits::FromPrimitive;

#[derive(Debug, Clone, PartialEq)]
pub struct FlatLink {
    pub kind: LinkKind,
    pub bw: f32,
    pub remote: NodeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlatPayload {
    Apu {
        dev: i32,
        rank: i32,
        vendor: i32,
    },
    Cpu {
        arch: i32,
        vendor: i32,
        model: i32,
    },
    Pci {
        device: u64,
    },
    Net {
        dev: i32,
        guid: u64,
        port: i32,
        bw: f32,
        latency: f32,
        max_conn: i32,
    },
    Plain,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatNode {
    pub kind: NodeKind,
    pub id: u64,
    pub payload: FlatPayload,
    pub links: Vec<FlatLink>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlatTopoServer {
    pub server_id: u32,
    pub host_hashes: Vec<u64>,
    pub nodes: Vec<Vec<FlatNode>>,
}

/// Strips a server graph down to plain records. Links carry (kind, index)
/// handles already, so they copy verbatim; nothing here can dangle.
pub fn flatten(server: &TopoServer) -> FlatTopoServer {
    let mut flat = FlatTopoServer {
        server_id: server.server_id as u32,
        host_hashes: server.host_hashes.clone(),
        nodes: Vec::with_capacity(NODE_KINDS),
    };
    for kind in ALL_NODE_KINDS {
        let mut arena = Vec::with_capacity(server.count(kind));
        for node in server.nodes(kind) {
            let payload = match &node.payload {
                NodePayload::Apu(apu) => FlatPayload::Apu {
                    dev: apu.dev,
                    rank: apu.rank,
                    vendor: apu.vendor,
                },
                NodePayload::Cpu(cpu) => FlatPayload::Cpu {
                    arch: cpu.arch.map(|v| v as i32).unwrap_or(UNDEF),
                    vendor: cpu.vendor.map(|v| v as i32).unwrap_or(UNDEF),
                    model: cpu.model.map(|v| v as i32).unwrap_or(UNDEF),
                },
                NodePayload::Pci(pci) => FlatPayload::Pci { device: pci.device },
                NodePayload::Net(net) => FlatPayload::Net {
                    dev: net.dev,
                    guid: net.guid,
                    port: net.port,
                    bw: net.bw,
                    latency: net.latency,
                    max_conn: net.max_conn,
                },
                NodePayload::Plain => FlatPayload::Plain,
            };
            arena.push(FlatNode {
                kind,
                id: node.id,
                payload,
                links: node
                    .links
                    .iter()
                    .map(|l| FlatLink {
                        kind: l.kind,
                        bw: l.bw,
                        remote: l.remote,
                    })
                    .collect(),
            });
        }
        flat.nodes.push(arena);
    }
    flat
}

/// Rebuilds a server graph from its flat image. Paths are left empty for
/// the caller to recompute.
pub fn unflatten(flat: &FlatTopoServer) -> Result<TopoServer> {
    if flat.nodes.len() != NODE_KINDS {
        return Err(TopoError::internal("flat image with wrong kind count"));
    }
    let counts: Vec<usize> = flat.nodes.iter().map(Vec::len).collect();
    let mut server = TopoServer::new();
    server.server_id = flat.server_id as usize;
    server.host_hashes = flat.host_hashes.clone();

    for (kind, arena) in ALL_NODE_KINDS.into_iter().zip(&flat.nodes) {
        for flat_node in arena {
            let payload = match &flat_node.payload {
                FlatPayload::Apu { dev, rank, vendor } => NodePayload::Apu(ApuInfo {
                    dev: *dev,
                    rank: *rank,
                    vendor: *vendor,
                }),
                FlatPayload::Cpu {
                    arch,
                    vendor,
                    model,
                } => NodePayload::Cpu(CpuInfo {
                    arch: CpuArch::from_i32(*arch),
                    vendor: CpuVendor::from_i32(*vendor),
                    model: CpuModel::from_i32(*model),
                    affinity: Default::default(),
                }),
                FlatPayload::Pci { device } => NodePayload::Pci(PciInfo { device: *device }),
                FlatPayload::Net {
                    dev,
                    guid,
                    port,
                    bw,
                    latency,
                    max_conn,
                } => NodePayload::Net(NetInfo {
                    dev: *dev,
                    guid: *guid,
                    port: *port,
                    bw: *bw,
                    latency: *latency,
                    max_conn: *max_conn,
                }),
                FlatPayload::Plain => NodePayload::Plain,
            };
            let mut links = Vec::with_capacity(flat_node.links.len());
            for link in &flat_node.links {
                if link.remote.index >= counts[link.remote.kind as usize] {
                    return Err(TopoError::internal(format!(
                        "flat link references {}[{}] past count {}",
                        link.remote.kind.as_str(),
                        link.remote.index,
                        counts[link.remote.kind as usize]
                    )));
                }
                links.push(Link {
                    kind: link.kind,
                    bw: link.bw,
                    remote: link.remote,
                });
            }
            push_raw(&mut server, kind, flat_node.id, payload, links)?;
        }
    }
    Ok(server)
}

// Direct node insertion: unflatten must not re-run create_node defaults
// (the flat image already carries the APU self-link).
fn push_raw(
    server: &mut TopoServer,
    kind: NodeKind,
    id: u64,
    payload: NodePayload,
    links: Vec<Link>,
) -> Result<()> {
    if server.count(kind) == MAX_NODES {
        return Err(TopoError::capacity(format!(
            "more than {MAX_NODES} nodes of kind {} in flat image",
            kind.as_str()
        )));
    }
    server.push_node(Node {
        kind,
        id,
        links,
        paths: Default::default(),
        payload,
    });
    Ok(())
}

// Wire layout sizes.
const NODE_HEADER_BYTES: usize = 8; // id
const PAYLOAD_MAX_BYTES: usize = 28; // NET payload
const LINK_BYTES: usize = 1 + 4 + 1 + 4;
const NODE_MAX_BYTES: usize = NODE_HEADER_BYTES + PAYLOAD_MAX_BYTES + 4 + MAX_LINKS * LINK_BYTES;
const KIND_MAX_BYTES: usize = 4 + MAX_NODES * NODE_MAX_BYTES;

impl FlatTopoServer {
    /// Fixed wire slot size; every rank contributes exactly this many
    /// bytes to the all-gather regardless of graph population.
    pub const WIRE_BYTES: usize = 4 + 4 + 8 * MAX_HOSTS + NODE_KINDS * KIND_MAX_BYTES;

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != Self::WIRE_BYTES {
            return Err(TopoError::internal(format!(
                "wire slot is {} bytes, expected {}",
                buf.len(),
                Self::WIRE_BYTES
            )));
        }
        buf.fill(0);
        let mut w = Writer { buf, pos: 0 };
        w.put_u32(self.server_id)?;
        w.put_u32(self.host_hashes.len() as u32)?;
        for hash in &self.host_hashes {
            w.put_u64(*hash)?;
        }
        for arena in &self.nodes {
            w.put_u32(arena.len() as u32)?;
            for node in arena {
                w.put_u64(node.id)?;
                match &node.payload {
                    FlatPayload::Apu { dev, rank, vendor } => {
                        w.put_i32(*dev)?;
                        w.put_i32(*rank)?;
                        w.put_i32(*vendor)?;
                    }
                    FlatPayload::Cpu {
                        arch,
                        vendor,
                        model,
                    } => {
                        w.put_i32(*arch)?;
                        w.put_i32(*vendor)?;
                        w.put_i32(*model)?;
                    }
                    FlatPayload::Pci { device } => w.put_u64(*device)?,
                    FlatPayload::Net {
                        dev,
                        guid,
                        port,
                        bw,
                        latency,
                        max_conn,
                    } => {
                        w.put_i32(*dev)?;
                        w.put_u64(*guid)?;
                        w.put_i32(*port)?;
                        w.put_f32(*bw)?;
                        w.put_f32(*latency)?;
                        w.put_i32(*max_conn)?;
                    }
                    FlatPayload::Plain => {}
                }
                w.put_u32(node.links.len() as u32)?;
                for link in &node.links {
                    w.put_u8(link.kind as u8)?;
                    w.put_f32(link.bw)?;
                    w.put_u8(link.remote.kind as u8)?;
                    w.put_u32(link.remote.index as u32)?;
                }
            }
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<FlatTopoServer> {
        let mut r = Reader { buf, pos: 0 };
        let server_id = r.take_u32()?;
        let n_hosts = r.take_u32()? as usize;
        if n_hosts > MAX_HOSTS {
            return Err(TopoError::internal(format!("{n_hosts} hosts on the wire")));
        }
        let mut host_hashes = Vec::with_capacity(n_hosts);
        for _ in 0..n_hosts {
            host_hashes.push(r.take_u64()?);
        }
        let mut nodes = Vec::with_capacity(NODE_KINDS);
        for kind in ALL_NODE_KINDS {
            let count = r.take_u32()? as usize;
            if count > MAX_NODES {
                return Err(TopoError::internal(format!(
                    "{count} {} nodes on the wire",
                    kind.as_str()
                )));
            }
            let mut arena = Vec::with_capacity(count);
            for _ in 0..count {
                let id = r.take_u64()?;
                let payload = match kind {
                    NodeKind::Apu => FlatPayload::Apu {
                        dev: r.take_i32()?,
                        rank: r.take_i32()?,
                        vendor: r.take_i32()?,
                    },
                    NodeKind::Cpu => FlatPayload::Cpu {
                        arch: r.take_i32()?,
                        vendor: r.take_i32()?,
                        model: r.take_i32()?,
                    },
                    NodeKind::Pci => FlatPayload::Pci {
                        device: r.take_u64()?,
                    },
                    NodeKind::Net => FlatPayload::Net {
                        dev: r.take_i32()?,
                        guid: r.take_u64()?,
                        port: r.take_i32()?,
                        bw: r.take_f32()?,
                        latency: r.take_f32()?,
                        max_conn: r.take_i32()?,
                    },
                    _ => FlatPayload::Plain,
                };
                let nlinks = r.take_u32()? as usize;
                if nlinks > MAX_LINKS {
                    return Err(TopoError::internal(format!("{nlinks} links on the wire")));
                }
                let mut links = Vec::with_capacity(nlinks);
                for _ in 0..nlinks {
                    let link_kind = r.take_u8()?;
                    let bw = r.take_f32()?;
                    let remote_kind = r.take_u8()?;
                    let remote_index = r.take_u32()? as usize;
                    links.push(FlatLink {
                        kind: LinkKind::from_u8(link_kind).ok_or_else(|| {
                            TopoError::internal(format!("link kind {link_kind} on the wire"))
                        })?,
                        bw,
                        remote: NodeRef::new(
                            NodeKind::from_u8(remote_kind).ok_or_else(|| {
                                TopoError::internal(format!(
                                    "node kind {remote_kind} on the wire"
                                ))
                            })?,
                            remote_index,
                        ),
                    });
                }
                arena.push(FlatNode {
                    kind,
                    id,
                    payload,
                    links,
                });
            }
            nodes.push(arena);
        }
        Ok(FlatTopoServer {
            server_id,
            host_hashes,
            nodes,
        })
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(TopoError::internal("wire slot overflow"));
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_u8(&mut self, v: u8) -> Result<()> {
        self.put(&[v])
    }

    fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    fn put_i32(&mut self, v: i32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    fn put_f32(&mut self, v: f32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        if end > self.buf.len() {
            return Err(TopoError::internal("wire slot truncated"));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn take_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn take_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take()?))
    }
}
