use num_derive::FromPrimitive;

/// Hardware node classes of the server graph.
#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Apu = 0,
    Pci = 1,
    Cci = 2,
    Cpu = 3,
    Nic = 4,
    Net = 5,
    Hbd = 6,
}

pub const NODE_KINDS: usize = 7;

pub const ALL_NODE_KINDS: [NodeKind; NODE_KINDS] = [
    NodeKind::Apu,
    NodeKind::Pci,
    NodeKind::Cci,
    NodeKind::Cpu,
    NodeKind::Nic,
    NodeKind::Net,
    NodeKind::Hbd,
];

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Apu => "APU",
            NodeKind::Pci => "PCI",
            NodeKind::Cci => "CCI",
            NodeKind::Cpu => "CPU",
            NodeKind::Nic => "NIC",
            NodeKind::Net => "NET",
            NodeKind::Hbd => "HBD",
        }
    }
}

/// Link classes. Discriminants line up with the path classes below so a
/// link compares directly against the path lattice.
#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkKind {
    Loc = 0,
    Cci = 1,
    Pci = 3,
    Sys = 7,
    Net = 8,
}

impl LinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::Loc => "LOC",
            LinkKind::Cci => "CCI",
            LinkKind::Pci => "PCI",
            LinkKind::Sys => "SYS",
            LinkKind::Net => "NET",
        }
    }
}

/// Path classes, ordered best to worst. The class of a multi-hop route is
/// the worst (numerically largest) class along it; `Dis` means no route.
#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathKind {
    Loc = 0,
    Cci = 1,
    Ccb = 2,
    Pix = 3,
    Pxb = 4,
    Pxn = 5,
    Phb = 6,
    Sys = 7,
    Net = 8,
    Dis = 9,
}

impl PathKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathKind::Loc => "LOC",
            PathKind::Cci => "CCI",
            PathKind::Ccb => "CCB",
            PathKind::Pix => "PIX",
            PathKind::Pxb => "PXB",
            PathKind::Pxn => "PXN",
            PathKind::Phb => "PHB",
            PathKind::Sys => "SYS",
            PathKind::Net => "NET",
            PathKind::Dis => "DIS",
        }
    }
}

#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    X86 = 0,
    Arm = 1,
    Power = 2,
}

#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel = 0,
    Amd = 1,
    Zhaoxin = 2,
}

#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq)]
pub enum CpuModel {
    Skl = 0,
    Bdw = 1,
    Yongfeng = 2,
}

// Arena bounds. The host-hash table shares the node bound, as does the
// fixed wire image in flat.rs.
pub const MAX_NODES: usize = 256;
pub const MAX_LINKS: usize = 128;
pub const MAX_HOSTS: usize = MAX_NODES;
pub const MAX_ROUTE_SWITCHES: usize = 16;

/// Marker for integer device/rank/port fields that are not populated yet.
pub const UNDEF: i32 = -1;

// Link bandwidths in GB/s.
pub const LOC_BW: f32 = 5000.0;
pub const QPI_BW: f32 = 6.0;
pub const SKL_QPI_BW: f32 = 10.0;
pub const ZPI_BW: f32 = 6.0;
pub const YONGFENG_ZPI_BW: f32 = 9.0;
pub const AMD_BW: f32 = 16.0;
pub const P9_BW: f32 = 32.0;
pub const ARM_BW: f32 = 6.0;

// Node ids carry the server id in the top bits and the local id (packed
// bus-id, NUMA id or device index) in the low 48.
const SERVER_ID_SHIFT: u32 = 48;
const LOCAL_ID_MASK: u64 = (1 << SERVER_ID_SHIFT) - 1;

pub fn topo_id(server_id: usize, local_id: u64) -> u64 {
    debug_assert!(local_id <= LOCAL_ID_MASK);
    ((server_id as u64) << SERVER_ID_SHIFT) | (local_id & LOCAL_ID_MASK)
}

pub fn id_server(id: u64) -> usize {
    (id >> SERVER_ID_SHIFT) as usize
}

pub fn id_local(id: u64) -> u64 {
    id & LOCAL_ID_MASK
}
