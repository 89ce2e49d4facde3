/*
Topology discovery and routing core for a heterogeneous collective
communication runtime.

Given the topology DOM of one host, the crate builds a typed hardware
graph (CPUs, PCI switches, accelerators, NICs, network ports), normalizes
vendor quirks, attributes best paths between every node pair, and answers
locality queries such as "which NIC is closest to this accelerator". The
cluster layer exchanges flattened graphs over a bootstrap channel,
renumbers server identities consistently across ranks, and overlays a
declarative inter-server route model with oversubscription-aware
bandwidth estimates.

Phase order per communicator: build -> normalize -> compute paths ->
assemble. Queries are pure reads afterwards and safe to issue from
multiple threads.
*/

pub mod bootstrap;
pub mod cluster;
pub mod cpuset;
pub mod discover;
pub mod error;
pub mod plugin;
pub mod route;
pub mod topo;
pub mod xml;

pub use bootstrap::{Bootstrap, LocalBootstrap, LocalBootstrapGroup};
pub use cluster::{assemble, InterServerTopo};
pub use cpuset::CpuSet;
pub use discover::{discover_topology, PeerInfo};
pub use error::{Result, TopoError};
pub use plugin::{DeviceAdaptor, NetPlugin, NetProperties};
pub use route::{effective_bw, InterServerRoute, SwitchTier};
pub use topo::{
    build_server_from_dom, compute_paths, get_local, local_net, nic_distance, rank_to_index,
    LinkKind, NodeKind, NodeRef, PathKind, TopoServer,
};
pub use xml::XmlNode;
