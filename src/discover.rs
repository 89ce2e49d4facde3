/*
Topology DOM discovery.

Fills a topology DOM skeleton (CPU/PCI hierarchy, usually loaded via
TOPO_FILE by the XML collaborator) with what the runtime knows: dev/rank
attributes on local peers' APUs through the device adaptor, and nic/net
elements for every device the net plugin reports. Rank 0 optionally dumps
the result to TOPO_DUMP_FILE.
*/

use crate::error::{Result, TopoError};
use crate::plugin::{DeviceAdaptor, NetPlugin};
use crate::xml::{fill_apu, fill_nic, XmlNode};
use log::{info, warn};

pub const TOPO_XML_VERSION: u32 = 1;

/// Path of a prebuilt topology XML, when the deployment pins one. The XML
/// collaborator parses it into the DOM skeleton discovery then fills.
pub fn configured_topology_file() -> Option<std::path::PathBuf> {
    std::env::var_os("TOPO_FILE").map(std::path::PathBuf::from)
}

/// Identity of one communicator rank as the bootstrap layer reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub rank: i32,
    pub host_hash: u64,
    /// Packed PCI bus-id of the peer's accelerator.
    pub bus_id: u64,
}

/// Renders a packed bus-id back into "0000:00:00.0" form.
pub fn format_bus_id(bus_id: u64) -> String {
    format!(
        "{:04x}:{:02x}:{:02x}.{:x}",
        (bus_id >> 20) & 0xffff,
        (bus_id >> 12) & 0xff,
        (bus_id >> 4) & 0xff,
        bus_id & 0xf
    )
}

/// Stamps dev/rank onto the `apu` element of every peer sharing this
/// rank's host. Peers whose bus-id is not in the DOM are skipped.
pub fn annotate_local_apus(
    dom: &mut XmlNode,
    peers: &[PeerInfo],
    local_rank: usize,
    adaptor: &dyn DeviceAdaptor,
) -> Result<()> {
    let local_hash = peers
        .get(local_rank)
        .ok_or_else(|| TopoError::internal(format!("local rank {local_rank} not in peer table")))?
        .host_hash;
    for peer in peers.iter().filter(|p| p.host_hash == local_hash) {
        let bus = format_bus_id(peer.bus_id);
        let Some(apu) = fill_apu(dom, &bus) else {
            warn!("no pci element for peer bus id {bus}, skipping");
            continue;
        };
        let dev = adaptor.device_by_pci_bus_id(&bus)?;
        apu.set_attr("dev", dev);
        apu.set_attr("rank", peer.rank);
    }
    Ok(())
}

/// Attaches a `net` element for every device the plugin enumerates,
/// creating the `pci` chain from the device's PCI path as needed.
pub fn attach_net_devices(dom: &mut XmlNode, plugin: &dyn NetPlugin) -> Result<()> {
    for n in 0..plugin.devices()? {
        let props = plugin.properties(n)?;
        let nic = fill_nic(dom, &props.pci_path)?;
        let dev = n as i32;
        let dev_text = dev.to_string();
        let net = match nic
            .subs
            .iter()
            .position(|s| s.name == "net" && s.attr("dev") == Some(dev_text.as_str()))
        {
            Some(i) => &mut nic.subs[i],
            None => nic.add_sub(XmlNode::new("net")),
        };
        net.set_attr("dev", dev);
        net.set_attr("name", &props.name);
        net.set_attr("speed", props.speed_mbps);
        net.set_attr("latency", props.latency_us);
        net.set_attr("port", props.port);
        net.set_attr("guid", format!("{:#x}", props.guid));
        net.set_attr("maxConn", props.max_comms);
    }
    Ok(())
}

/// Full discovery pass over a DOM skeleton. Collective only in the sense
/// that every rank runs it; only rank 0 honors TOPO_DUMP_FILE.
pub fn discover_topology(
    dom: &mut XmlNode,
    peers: &[PeerInfo],
    local_rank: usize,
    adaptor: &dyn DeviceAdaptor,
    plugin: &dyn NetPlugin,
) -> Result<()> {
    if dom.attr("version").is_none() {
        dom.set_attr("version", TOPO_XML_VERSION);
    }
    annotate_local_apus(dom, peers, local_rank, adaptor)?;
    attach_net_devices(dom, plugin)?;

    if local_rank == 0 {
        if let Ok(path) = std::env::var("TOPO_DUMP_FILE") {
            info!("dumping topology DOM to {path}");
            let mut file = std::fs::File::create(&path)
                .map_err(|e| TopoError::internal(format!("cannot create {path}: {e}")))?;
            dom.write_xml(&mut file)
                .map_err(|e| TopoError::internal(format!("cannot write {path}: {e}")))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::NetProperties;

    struct BusOrder(Vec<String>);

    impl DeviceAdaptor for BusOrder {
        fn device_by_pci_bus_id(&self, bus_id: &str) -> Result<i32> {
            self.0
                .iter()
                .position(|b| b == bus_id)
                .map(|i| i as i32)
                .ok_or_else(|| TopoError::Adaptor(format!("unknown bus id {bus_id}")))
        }
    }

    struct TwoPorts;

    impl NetPlugin for TwoPorts {
        fn devices(&self) -> Result<usize> {
            Ok(2)
        }

        fn properties(&self, index: usize) -> Result<NetProperties> {
            Ok(NetProperties {
                name: format!("mlx5_{index}"),
                pci_path: format!("/0000:30:00.0/0000:31:00.{index}"),
                speed_mbps: 100_000,
                latency_us: 0.6,
                port: 1,
                guid: 0xa0 + index as u64,
                max_comms: 8,
            })
        }

        fn dev_from_name(&self, name: &str) -> Result<i32> {
            match name {
                "mlx5_0" => Ok(0),
                "mlx5_1" => Ok(1),
                _ => Err(TopoError::not_found(name.to_string())),
            }
        }
    }

    fn skeleton() -> XmlNode {
        XmlNode::new("system").with_sub(
            XmlNode::new("cpu")
                .with_attr("numaid", 0)
                .with_attr("host_hash", "77")
                .with_attr("arch", "x86_64")
                .with_attr("vendor", "GenuineIntel")
                .with_attr("familyid", 6)
                .with_attr("modelid", 0x55)
                .with_sub(XmlNode::new("pci").with_attr("busid", "0000:17:00.0"))
                .with_sub(XmlNode::new("pci").with_attr("busid", "0000:18:00.0")),
        )
    }

    #[test]
    fn bus_id_formatting_round_trips() {
        use crate::topo::build::bus_id_to_u64;
        for text in ["0000:17:00.0", "0001:ff:1f.7"] {
            assert_eq!(text, format_bus_id(bus_id_to_u64(text).unwrap()));
        }
    }

    #[test]
    fn annotates_only_local_peers() {
        use crate::topo::build::bus_id_to_u64;
        let mut dom = skeleton();
        let peers = vec![
            PeerInfo {
                rank: 0,
                host_hash: 0x77,
                bus_id: bus_id_to_u64("0000:17:00.0").unwrap(),
            },
            PeerInfo {
                rank: 1,
                host_hash: 0x78,
                bus_id: bus_id_to_u64("0000:18:00.0").unwrap(),
            },
        ];
        let adaptor = BusOrder(vec!["0000:17:00.0".into()]);
        annotate_local_apus(&mut dom, &peers, 0, &adaptor).unwrap();

        let cpu = dom.sub("cpu").unwrap();
        let local = cpu.subs[0].sub("apu").unwrap();
        assert_eq!(Some("0"), local.attr("dev"));
        assert_eq!(Some("0"), local.attr("rank"));
        // The remote peer's pci element stays untouched.
        assert!(cpu.subs[1].sub("apu").is_none());
    }

    #[test]
    fn attaches_plugin_devices_with_properties() {
        let mut dom = skeleton();
        attach_net_devices(&mut dom, &TwoPorts).unwrap();

        let mut nets = Vec::new();
        dom.visit(&mut |n: &XmlNode| {
            if n.name == "net" {
                nets.push((
                    n.attr("dev").unwrap().to_string(),
                    n.attr("name").unwrap().to_string(),
                    n.attr("guid").unwrap().to_string(),
                ));
            }
        });
        nets.sort();
        assert_eq!(
            vec![
                ("0".to_string(), "mlx5_0".to_string(), "0xa0".to_string()),
                ("1".to_string(), "mlx5_1".to_string(), "0xa1".to_string()),
            ],
            nets
        );

        // Running discovery twice must not duplicate elements.
        let before = dom.clone();
        attach_net_devices(&mut dom, &TwoPorts).unwrap();
        assert_eq!(before, dom);
    }

    #[test]
    fn discovered_dom_feeds_the_builder() {
        use crate::topo::build::{build_server_from_dom, bus_id_to_u64};
        let mut dom = skeleton();
        let peers = vec![PeerInfo {
            rank: 0,
            host_hash: 0x77,
            bus_id: bus_id_to_u64("0000:17:00.0").unwrap(),
        }];
        let adaptor = BusOrder(vec!["0000:17:00.0".into()]);
        discover_topology(&mut dom, &peers, 0, &adaptor, &TwoPorts).unwrap();

        let server = build_server_from_dom(&dom, 0x77).unwrap();
        assert_eq!(1, server.count(crate::topo::types::NodeKind::Apu));
        assert_eq!(2, server.count(crate::topo::types::NodeKind::Net));
    }
}
