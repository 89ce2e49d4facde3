pub mod build;
pub mod flat;
pub mod normalize;
pub mod paths;
pub mod query;
pub mod server;
pub mod types;

#[cfg(test)]
pub mod unit_tests;

pub use build::{build_server_from_dom, bus_id_to_u64};
pub use flat::{flatten, unflatten, FlatLink, FlatNode, FlatPayload, FlatTopoServer};
pub use normalize::{connect_cpus, flatten_bcm_switches};
pub use paths::{compute_paths, Path};
pub use query::{
    closest_net_for_apu, get_local, local_net, local_net_node, net_from_dom, nic_distance,
    rank_to_index, resolve_local_net, NicDistance,
};
pub use server::{
    ApuInfo, CpuInfo, Link, NetInfo, Node, NodePayload, NodeRef, PciInfo, TopoServer,
};
pub use types::{
    CpuArch, CpuModel, CpuVendor, LinkKind, NodeKind, PathKind, ALL_NODE_KINDS, LOC_BW,
    MAX_HOSTS, MAX_LINKS, MAX_NODES, MAX_ROUTE_SWITCHES, NODE_KINDS, UNDEF,
};
