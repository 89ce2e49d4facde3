/*
DOM to server-graph builder.

Walks the `system > cpu > pci*` hierarchy handed over by the XML
collaborator and materializes CPU, PCI, APU, NIC and NET nodes with their
link attributes. Normalization and path computation run at the end, so
the returned server is immediately queryable.
*/

use crate::cpuset::CpuSet;
use crate::error::{Result, TopoError};
use crate::topo::normalize::{connect_cpus, flatten_bcm_switches};
use crate::topo::paths::compute_paths;
use crate::topo::server::{NodeRef, TopoServer};
use crate::topo::types::*;
use crate::xml::{parse_u64_auto, XmlNode};
use log::{debug, info};
use phf::phf_map;

// PCI generation table: link_speed text to GT/s-derived speed points.
static PCI_SPEEDS: phf::Map<&'static str, u32> = phf_map! {
    "2.5 GT/s" => 15,
    "5 GT/s" => 30,
    "8 GT/s" => 60,
    "16 GT/s" => 120,
    "32 GT/s" => 240, // kernel 5.6 and earlier
    "2.5 GT/s PCIe" => 15,
    "5.0 GT/s PCIe" => 30,
    "8.0 GT/s PCIe" => 60,
    "16.0 GT/s PCIe" => 120,
    "32.0 GT/s PCIe" => 240,
    "64.0 GT/s PCIe" => 480,
};
const PCI_SPEED_FALLBACK: u32 = 60;

static CPU_ARCHS: phf::Map<&'static str, CpuArch> = phf_map! {
    "x86_64" => CpuArch::X86,
    "arm64" => CpuArch::Arm,
    "ppc64" => CpuArch::Power,
};

static CPU_VENDORS: phf::Map<&'static str, CpuVendor> = phf_map! {
    "GenuineIntel" => CpuVendor::Intel,
    "AuthenticAMD" => CpuVendor::Amd,
    "CentaurHauls" => CpuVendor::Zhaoxin,
    "  Shanghai  " => CpuVendor::Zhaoxin,
};

/// Packs "0000:17:00.0" into a 64-bit integer (hex digits concatenated).
pub fn bus_id_to_u64(bus_id: &str) -> Result<u64> {
    let mut value: u64 = 0;
    let mut digits = 0;
    for c in bus_id.chars() {
        match c {
            ':' | '.' => continue,
            _ => {
                let d = c
                    .to_digit(16)
                    .ok_or_else(|| TopoError::schema(format!("bad bus id '{bus_id}'")))?;
                value = (value << 4) | d as u64;
                digits += 1;
            }
        }
    }
    if digits == 0 || digits > 12 {
        return Err(TopoError::schema(format!("bad bus id '{bus_id}'")));
    }
    Ok(value)
}

/// Builds, normalizes and path-annotates one server graph from a topology
/// DOM. `local_host_hash` selects which host of the DOM this rank is on.
pub fn build_server_from_dom(dom: &XmlNode, local_host_hash: u64) -> Result<TopoServer> {
    let system = dom
        .find_tag("system")
        .ok_or_else(|| TopoError::schema("topology DOM has no <system> element"))?;
    let mut server = TopoServer::new();
    for sub in &system.subs {
        if sub.name == "cpu" {
            add_cpu(&mut server, sub)?;
        }
    }
    if let Some(id) = server
        .host_hashes
        .iter()
        .position(|h| *h == local_host_hash)
    {
        server.server_id = id;
    }

    flatten_bcm_switches(&mut server)?;
    connect_cpus(&mut server)?;
    compute_paths(&mut server);
    info!(
        "built server topology: serverId {} hosts {} apus {} nets {}",
        server.server_id,
        server.n_hosts(),
        server.count(NodeKind::Apu),
        server.count(NodeKind::Net)
    );
    Ok(server)
}

fn add_cpu(server: &mut TopoServer, xml_cpu: &XmlNode) -> Result<()> {
    let numa_id: u64 = xml_cpu.require_parsed("numaid")?;
    let host_hash = xml_cpu.attr_hex_u64("host_hash")?.unwrap_or(0);
    let server_id = server.intern_host_hash(host_hash)?;
    let cpu = server.create_node(NodeKind::Cpu, topo_id(server_id, numa_id))?;

    if let Some(raw) = xml_cpu.attr("affinity") {
        server.node_mut(cpu).cpu_mut().affinity = raw.parse::<CpuSet>()?;
    }

    let arch = CPU_ARCHS.get(xml_cpu.require_attr("arch")?).copied();
    server.node_mut(cpu).cpu_mut().arch = arch;
    if arch == Some(CpuArch::X86) {
        let vendor = CPU_VENDORS.get(xml_cpu.require_attr("vendor")?).copied();
        server.node_mut(cpu).cpu_mut().vendor = vendor;
        match vendor {
            Some(CpuVendor::Intel) => {
                let family: i64 = xml_cpu.require_parsed("familyid")?;
                let model: i64 = xml_cpu.require_parsed("modelid")?;
                server.node_mut(cpu).cpu_mut().model = Some(if family == 6 && model >= 0x55 {
                    CpuModel::Skl
                } else {
                    CpuModel::Bdw
                });
            }
            Some(CpuVendor::Zhaoxin) => {
                let family: i64 = xml_cpu.require_parsed("familyid")?;
                let model: i64 = xml_cpu.require_parsed("modelid")?;
                if family == 7 && model == 0x5B {
                    server.node_mut(cpu).cpu_mut().model = Some(CpuModel::Yongfeng);
                }
            }
            _ => {}
        }
    }

    for sub in &xml_cpu.subs {
        match sub.name.as_str() {
            "pci" => add_pci(server, sub, cpu, server_id)?,
            "nic" => {
                // CPU-attached network device, not PCI-enumerated.
                let id = topo_id(server_id, 0);
                let nic = match server.get_node(NodeKind::Nic, id) {
                    Some(nic) => nic,
                    None => {
                        let nic = server.create_node(NodeKind::Nic, id)?;
                        server.connect(cpu, nic, LinkKind::Pci, LOC_BW)?;
                        server.connect(nic, cpu, LinkKind::Pci, LOC_BW)?;
                        nic
                    }
                };
                add_nic(server, sub, nic, server_id)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn add_pci(
    server: &mut TopoServer,
    xml_pci: &XmlNode,
    parent: NodeRef,
    server_id: usize,
) -> Result<()> {
    let mut bus_id = bus_id_to_u64(xml_pci.require_attr("busid")?)?;

    let mut node = None;
    if let Some(xml_apu) = xml_pci.sub("apu") {
        let apu = server.create_node(NodeKind::Apu, topo_id(server_id, bus_id))?;
        {
            let info = server.node_mut(apu).apu_mut();
            info.dev = xml_apu.require_parsed("dev")?;
            info.rank = xml_apu.require_parsed("rank")?;
        }
        node = Some(apu);
    } else if let Some(xml_nic) = xml_pci.sub("nic") {
        // Drop the sub-device bits so multi-port variants land on one NIC.
        bus_id &= !0xf;
        let id = topo_id(server_id, bus_id);
        let nic = match server.get_node(NodeKind::Nic, id) {
            Some(nic) => nic,
            None => {
                let nic = server.create_node(NodeKind::Nic, id)?;
                node = Some(nic);
                nic
            }
        };
        add_nic(server, xml_nic, nic, server_id)?;
    } else {
        let pci = server.create_node(NodeKind::Pci, topo_id(server_id, bus_id))?;
        let mut device: u64 = 0;
        for (attr, shift) in [
            ("vendor", 48),
            ("device", 32),
            ("subsystem_vendor", 16),
            ("subsystem_device", 0),
        ] {
            if let Some(raw) = xml_pci.attr(attr) {
                let v = parse_u64_auto(raw).ok_or_else(|| {
                    TopoError::schema(format!("<pci> attribute '{attr}' = '{raw}'"))
                })?;
                device += v << shift;
            }
        }
        server.node_mut(pci).pci_mut().device = device;
        for sub in &xml_pci.subs {
            if sub.name == "pci" {
                add_pci(server, sub, pci, server_id)?;
            }
        }
        node = Some(pci);
    }

    if let Some(node) = node {
        let mut width: u32 = xml_pci.attr_or("link_width", 0)?;
        if width == 0 {
            width = 16;
        }
        let speed = xml_pci
            .attr("link_speed")
            .and_then(|s| PCI_SPEEDS.get(s).copied())
            .unwrap_or(PCI_SPEED_FALLBACK);
        let bw = width as f32 * speed as f32 / 80.0;
        server.connect(node, parent, LinkKind::Pci, bw)?;
        server.connect(parent, node, LinkKind::Pci, bw)?;
    }
    Ok(())
}

fn add_nic(
    server: &mut TopoServer,
    xml_nic: &XmlNode,
    nic: NodeRef,
    server_id: usize,
) -> Result<()> {
    for sub in &xml_nic.subs {
        if sub.name != "net" || sub.attr("dev").is_none() {
            continue;
        }
        add_net(server, sub, nic, server_id)?;
    }
    Ok(())
}

fn add_net(
    server: &mut TopoServer,
    xml_net: &XmlNode,
    nic: NodeRef,
    server_id: usize,
) -> Result<()> {
    let dev: i32 = xml_net.require_parsed("dev")?;
    let net = server.create_node(NodeKind::Net, topo_id(server_id, dev as u64))?;

    let guid = xml_net.attr_u64_auto("guid")?.unwrap_or(dev as u64);
    let mut mbps: i64 = xml_net.attr_or("speed", 0)?;
    if mbps <= 0 {
        mbps = 10_000;
    }
    let bw = mbps as f32 / 8000.0;
    {
        let info = server.node_mut(net).net_mut();
        info.dev = dev;
        info.guid = guid;
        info.bw = bw;
        info.latency = xml_net.require_parsed("latency")?;
        info.port = xml_net.require_parsed("port")?;
        info.max_conn = xml_net.require_parsed("maxConn")?;
    }
    debug!("adding net {dev} guid {guid:#x} bw {bw} GB/s");

    server.connect(nic, net, LinkKind::Net, bw)?;
    server.connect(net, nic, LinkKind::Net, bw)?;
    Ok(())
}
